// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Writer configuration.
//!
//! Keys are camelCase so the struct can be deserialized straight out of the
//! agent's `writer:` config block. Missing keys take their defaults.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use fnv::FnvHasher;
use reqwest::Url;
use serde::{Deserialize, Deserializer};

use crate::errors::WriterError;

const DEFAULT_INGEST_URL: &str = "https://ingest.signalfx.com";
const DEFAULT_API_URL: &str = "https://api.signalfx.com";

/// Wire format for trace spans.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceExportFormat {
    /// Zipkin JSON on the ingest trace endpoint.
    #[default]
    Sfx,
    /// Protobuf SAPM. Recognized but not shipped by this writer.
    Sapm,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WriterConfig {
    /// Upper bound of datapoints (and events) per outbound request. Smaller
    /// batches go out when less is buffered.
    pub datapoint_max_batch_size: usize,
    /// Datapoints held before the oldest unsent ones get overwritten.
    pub max_datapoints_buffered: usize,
    pub trace_span_max_batch_size: usize,
    /// Deprecated alias of `max_requests`, wins when non-zero.
    pub datapoint_max_requests: usize,
    /// Concurrent requests per kind for datapoints, events and trace spans.
    pub max_requests: usize,
    pub event_send_interval_seconds: u64,
    pub properties_max_requests: usize,
    /// Pending dimension updates held before new dimensions are dropped.
    pub properties_max_buffered: usize,
    /// Debounce window, repeated updates to one dimension within it coalesce.
    pub properties_send_delay_seconds: u64,
    /// Capacity of the cache of already-sent property sets.
    pub properties_history_size: usize,
    pub log_datapoints: bool,
    pub log_events: bool,
    pub log_trace_spans: bool,
    pub log_dimension_updates: bool,
    pub log_dropped_datapoints: bool,
    pub send_trace_host_correlation_metrics: bool,
    #[serde(deserialize_with = "deserialize_duration")]
    pub stale_service_timeout: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub trace_host_correlation_metrics_interval: Duration,
    /// Spans accepted but not yet confirmed sent before the oldest get dropped.
    pub max_trace_spans_in_flight: usize,
    pub trace_export_format: TraceExportFormat,

    pub host_id_dims: BTreeMap<String, String>,
    pub global_dimensions: BTreeMap<String, String>,
    pub ingest_url: String,
    pub api_url: String,
    pub trace_endpoint_url: Option<String>,
    pub access_token: String,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            datapoint_max_batch_size: 1000,
            max_datapoints_buffered: 25_000,
            trace_span_max_batch_size: 1000,
            datapoint_max_requests: 0,
            max_requests: 10,
            event_send_interval_seconds: 1,
            properties_max_requests: 20,
            properties_max_buffered: 10_000,
            properties_send_delay_seconds: 30,
            properties_history_size: 10_000,
            log_datapoints: false,
            log_events: false,
            log_trace_spans: false,
            log_dimension_updates: false,
            log_dropped_datapoints: false,
            send_trace_host_correlation_metrics: true,
            stale_service_timeout: Duration::from_secs(5 * 60),
            trace_host_correlation_metrics_interval: Duration::from_secs(60),
            max_trace_spans_in_flight: 100_000,
            trace_export_format: TraceExportFormat::Sfx,
            host_id_dims: BTreeMap::new(),
            global_dimensions: BTreeMap::new(),
            ingest_url: DEFAULT_INGEST_URL.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            trace_endpoint_url: None,
            access_token: String::new(),
        }
    }
}

impl WriterConfig {
    /// Reconciles the deprecated `datapointMaxRequests` with `maxRequests`.
    pub fn initialize(&mut self) {
        if self.datapoint_max_requests != 0 {
            self.max_requests = self.datapoint_max_requests;
        } else {
            self.datapoint_max_requests = self.max_requests;
        }
    }

    pub fn validate(&self) -> Result<(), WriterError> {
        self.parsed_ingest_url()?;
        self.parsed_api_url()?;
        self.parsed_trace_endpoint_url()?;

        let positive = [
            ("datapointMaxBatchSize", self.datapoint_max_batch_size),
            ("maxDatapointsBuffered", self.max_datapoints_buffered),
            ("traceSpanMaxBatchSize", self.trace_span_max_batch_size),
            ("maxRequests", self.max_requests),
            ("propertiesMaxRequests", self.properties_max_requests),
            ("propertiesMaxBuffered", self.properties_max_buffered),
            ("propertiesHistorySize", self.properties_history_size),
            ("maxTraceSpansInFlight", self.max_trace_spans_in_flight),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(WriterError::InvalidConfig(format!(
                "{name} must be greater than 0"
            )));
        }

        if self.event_send_interval_seconds == 0 {
            return Err(WriterError::InvalidConfig(
                "eventSendIntervalSeconds must be greater than 0".to_string(),
            ));
        }

        if self.trace_export_format != TraceExportFormat::Sfx {
            return Err(WriterError::InvalidConfig(format!(
                "traceExportFormat {:?} is not supported, use \"sfx\"",
                self.trace_export_format
            )));
        }

        if self.send_trace_host_correlation_metrics
            && self.trace_host_correlation_metrics_interval.is_zero()
        {
            return Err(WriterError::InvalidConfig(
                "traceHostCorrelationMetricsInterval must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn parsed_ingest_url(&self) -> Result<Url, WriterError> {
        parse_url("ingestUrl", &self.ingest_url)
    }

    pub fn parsed_api_url(&self) -> Result<Url, WriterError> {
        parse_url("apiUrl", &self.api_url)
    }

    /// The explicit trace endpoint, or the ingest server's trace path.
    pub fn parsed_trace_endpoint_url(&self) -> Result<Url, WriterError> {
        match &self.trace_endpoint_url {
            Some(url) => parse_url("traceEndpointUrl", url),
            None => parse_url(
                "ingestUrl",
                &format!("{}/v1/trace", self.ingest_url.trim_end_matches('/')),
            ),
        }
    }

    pub fn send_interval(&self) -> Duration {
        Duration::from_secs(self.event_send_interval_seconds)
    }

    pub fn properties_send_delay(&self) -> Duration {
        Duration::from_secs(self.properties_send_delay_seconds)
    }

    /// Structural hash, used to decide whether a reconfiguration needs a new
    /// writer.
    pub fn config_hash(&self) -> u64 {
        let mut hasher = FnvHasher::default();
        Hash::hash(self, &mut hasher);
        hasher.finish()
    }
}

fn parse_url(name: &str, raw: &str) -> Result<Url, WriterError> {
    Url::parse(raw).map_err(|e| WriterError::InvalidConfig(format!("{name} '{raw}': {e}")))
}

/// Accepts either a number of seconds or a duration string such as `5m`,
/// `90s`, `1m30s` or `250ms`.
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Seconds(u64),
        Text(String),
    }

    match Repr::deserialize(deserializer)? {
        Repr::Seconds(secs) => Ok(Duration::from_secs(secs)),
        Repr::Text(text) => parse_duration(&text)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid duration '{text}'"))),
    }
}

pub(crate) fn parse_duration(text: &str) -> Option<Duration> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(secs) = text.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = text;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return None;
        }
        let amount: u64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];
        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "ms" => Duration::from_millis(amount),
            "s" => Duration::from_secs(amount),
            "m" => Duration::from_secs(amount.checked_mul(60)?),
            "h" => Duration::from_secs(amount.checked_mul(3600)?),
            _ => return None,
        };
        total = total.checked_add(part)?;
        rest = &rest[unit_len..];
    }
    Some(total)
}
