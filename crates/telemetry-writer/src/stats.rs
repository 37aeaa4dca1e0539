// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Writer self-telemetry.
//!
//! Lossy paths (overflow, filtering, invalid records, failed sends) are
//! never reported to producers; they are counted here and can be shipped
//! as regular datapoints through [`WriterStats::to_datapoints`].

use std::sync::atomic::{AtomicU64, Ordering};

use crate::record::{Datapoint, MetricType, RecordKind};
use crate::util::now_millis;

const INTERNAL_METRIC_PREFIX: &str = "sfxagent.";

/// Counters for a single telemetry kind.
#[derive(Debug, Default)]
pub struct KindStats {
    sent: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    filtered: AtomicU64,
    invalid: AtomicU64,
    active_requests: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindStatsSnapshot {
    /// Records confirmed accepted downstream.
    pub sent: u64,
    /// Records in batches the transport rejected.
    pub failed: u64,
    /// Records evicted or refused because a buffer was full.
    pub dropped: u64,
    /// Records removed by a filter before buffering.
    pub filtered: u64,
    /// Records removed at batch formation because they could not be shipped.
    pub invalid: u64,
    pub active_requests: u64,
}

impl KindStats {
    pub(crate) fn add_sent(&self, n: usize) {
        self.sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_failed(&self, n: usize) {
        self.failed.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_dropped(&self, n: usize) {
        self.dropped.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_filtered(&self, n: usize) {
        self.filtered.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_invalid(&self, n: usize) {
        self.invalid.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn request_started(&self) {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn request_finished(&self) {
        self.active_requests.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> KindStatsSnapshot {
        KindStatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            active_requests: self.active_requests.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
pub struct WriterStats {
    pub datapoints: KindStats,
    pub events: KindStats,
    pub properties: KindStats,
    pub spans: KindStats,
    properties_deduplicated: AtomicU64,
}

impl WriterStats {
    pub fn for_kind(&self, kind: RecordKind) -> &KindStats {
        match kind {
            RecordKind::Datapoint => &self.datapoints,
            RecordKind::Event => &self.events,
            RecordKind::Property => &self.properties,
            RecordKind::Span => &self.spans,
        }
    }

    pub(crate) fn add_properties_deduplicated(&self, n: usize) {
        self.properties_deduplicated
            .fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn properties_deduplicated(&self) -> u64 {
        self.properties_deduplicated.load(Ordering::Relaxed)
    }

    /// Renders the counters as cumulative counters plus the given buffer
    /// depth gauges.
    pub fn to_datapoints(&self, buffered: &[(RecordKind, usize)]) -> Vec<Datapoint> {
        let timestamp = now_millis();
        let mut out = Vec::new();

        for kind in [
            RecordKind::Datapoint,
            RecordKind::Event,
            RecordKind::Property,
            RecordKind::Span,
        ] {
            let prefix = metric_prefix(kind);
            let s = self.for_kind(kind).snapshot();
            for (suffix, value) in [
                ("sent", s.sent),
                ("failed", s.failed),
                ("dropped", s.dropped),
                ("filtered", s.filtered),
                ("invalid", s.invalid),
            ] {
                out.push(
                    Datapoint::new(
                        format!("{INTERNAL_METRIC_PREFIX}{prefix}_{suffix}"),
                        MetricType::CumulativeCounter,
                        i64::try_from(value).unwrap_or(i64::MAX),
                    )
                    .with_timestamp(timestamp),
                );
            }
            out.push(
                Datapoint::new(
                    format!("{INTERNAL_METRIC_PREFIX}{prefix}_requests_active"),
                    MetricType::Gauge,
                    i64::try_from(s.active_requests).unwrap_or(i64::MAX),
                )
                .with_timestamp(timestamp),
            );
        }

        out.push(
            Datapoint::new(
                format!("{INTERNAL_METRIC_PREFIX}dim_updates_deduplicated"),
                MetricType::CumulativeCounter,
                i64::try_from(self.properties_deduplicated()).unwrap_or(i64::MAX),
            )
            .with_timestamp(timestamp),
        );

        for (kind, depth) in buffered {
            let prefix = metric_prefix(*kind);
            out.push(
                Datapoint::new(
                    format!("{INTERNAL_METRIC_PREFIX}{prefix}_buffered"),
                    MetricType::Gauge,
                    i64::try_from(*depth).unwrap_or(i64::MAX),
                )
                .with_timestamp(timestamp),
            );
        }

        out
    }
}

fn metric_prefix(kind: RecordKind) -> &'static str {
    match kind {
        RecordKind::Datapoint => "datapoints",
        RecordKind::Event => "events",
        RecordKind::Property => "dim_updates",
        RecordKind::Span => "trace_spans",
    }
}
