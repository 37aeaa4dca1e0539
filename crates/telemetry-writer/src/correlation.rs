// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Host to service correlation heartbeats.
//!
//! Every service seen in a trace span yields a `sf.int.service.heartbeat`
//! datapoint carrying the host identity dimensions, once per interval, until
//! the service has not been seen for `staleServiceTimeout`.
//!
//! Producers only forward service names over a bounded channel. The map of
//! active services belongs to the task running [`run_correlation_loop`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use fnv::FnvBuildHasher;
use hashbrown::{HashMap, HashSet};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::record::{Datapoint, MetricType, Span};
use crate::ring_buffer::BoundedBuffer;
use crate::util::now_millis;

pub const HEARTBEAT_METRIC: &str = "sf.int.service.heartbeat";
const SERVICE_DIMENSION: &str = "sf_hasService";
pub(crate) const SERVICE_CHANNEL_CAPACITY: usize = 1024;

/// Sees every span batch accepted by the writer.
pub trait SpanObserver: Send + Sync {
    fn observe(&self, spans: &[Span]);
}

/// Installed when correlation is disabled.
#[derive(Debug, Default)]
pub struct NoopObserver;

impl SpanObserver for NoopObserver {
    fn observe(&self, _spans: &[Span]) {}
}

/// Forwards the distinct service names of each batch to the correlation
/// task. Batches are dropped when the task falls behind.
#[derive(Debug)]
pub struct ServiceForwarder {
    tx: mpsc::Sender<Vec<String>>,
}

impl ServiceForwarder {
    pub fn new(tx: mpsc::Sender<Vec<String>>) -> Self {
        Self { tx }
    }
}

impl SpanObserver for ServiceForwarder {
    fn observe(&self, spans: &[Span]) {
        let mut seen: HashSet<&str, FnvBuildHasher> =
            HashSet::with_hasher(FnvBuildHasher::default());
        let services: Vec<String> = spans
            .iter()
            .filter(|s| !s.service.is_empty() && seen.insert(s.service.as_str()))
            .map(|s| s.service.clone())
            .collect();
        if services.is_empty() {
            return;
        }
        if let Err(e) = self.tx.try_send(services) {
            debug!("Service correlation update not forwarded: {e}");
        }
    }
}

/// Last time each service was seen.
#[derive(Debug)]
pub struct ActiveServiceTracker {
    timeout: Duration,
    host_dims: BTreeMap<String, String>,
    last_seen: HashMap<String, Instant, FnvBuildHasher>,
}

impl ActiveServiceTracker {
    pub fn new(timeout: Duration, host_dims: BTreeMap<String, String>) -> Self {
        Self {
            timeout,
            host_dims,
            last_seen: HashMap::with_hasher(FnvBuildHasher::default()),
        }
    }

    pub fn observe(&mut self, service: &str, now: Instant) {
        match self.last_seen.get_mut(service) {
            Some(seen) => *seen = now,
            None => {
                self.last_seen.insert(service.to_string(), now);
            }
        }
    }

    /// Removes services unseen for longer than the timeout and returns one
    /// heartbeat per remaining service.
    pub fn expire_and_emit(&mut self, now: Instant) -> Vec<Datapoint> {
        let timeout = self.timeout;
        let before = self.last_seen.len();
        self.last_seen
            .retain(|_, seen| now.saturating_duration_since(*seen) <= timeout);
        let expired = before - self.last_seen.len();
        if expired > 0 {
            debug!("{expired} services went stale, no longer correlated to this host");
        }

        let timestamp = now_millis();
        let mut services: Vec<&String> = self.last_seen.keys().collect();
        services.sort();
        services
            .into_iter()
            .map(|service| {
                let mut dp = Datapoint::new(HEARTBEAT_METRIC, MetricType::Gauge, 0)
                    .with_timestamp(timestamp);
                dp.dimensions = self.host_dims.clone();
                dp.dimensions
                    .insert(SERVICE_DIMENSION.to_string(), service.clone());
                dp
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }
}

/// Owns `tracker` until `cancel` fires, feeding it from `services` and
/// pushing heartbeats into `datapoints` every `interval`.
pub async fn run_correlation_loop(
    mut tracker: ActiveServiceTracker,
    mut services: mpsc::Receiver<Vec<String>>,
    interval: Duration,
    datapoints: Arc<BoundedBuffer<Datapoint>>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            Some(batch) = services.recv() => {
                let now = Instant::now();
                for service in &batch {
                    tracker.observe(service, now);
                }
            }
            _ = ticker.tick() => {
                let heartbeats = tracker.expire_and_emit(Instant::now());
                if !heartbeats.is_empty() {
                    debug!("Emitting {} service correlation heartbeats", heartbeats.len());
                    datapoints.push_many(heartbeats);
                }
            }
        }
    }
    debug!("Service correlation loop stopped");
}
