// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Egress seam of the pipeline.
//!
//! The batch senders only know [`BatchTransport`]. [`HttpTransport`] is the
//! stock implementation talking to the ingest and dimension APIs.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Serialize;
use tracing::debug;

use crate::config::WriterConfig;
use crate::errors::WriterError;
use crate::record::{Batch, Datapoint, MetricType, PropertyUpdate, Span, Value};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ShippingError {
    #[error("Failed to prepare payload: {0}")]
    Payload(String),

    #[error("Destination error {0:?}: {1}")]
    Destination(Option<StatusCode>, String),
}

/// Sends one batch downstream. A batch is either fully accepted or failed.
#[async_trait]
pub trait BatchTransport: Send + Sync {
    async fn send_batch(&self, batch: Batch<'_>) -> Result<(), ShippingError>;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    datapoint_url: Url,
    event_url: Url,
    trace_url: Url,
    api_url: Url,
    access_token: String,
    compression_level: Option<i32>,
}

impl HttpTransport {
    pub fn new(config: &WriterConfig) -> Result<Self, WriterError> {
        let ingest = config.parsed_ingest_url()?;
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| WriterError::InvalidConfig(format!("http client: {e}")))?;

        Ok(Self {
            client,
            datapoint_url: join_path(&ingest, &["v2", "datapoint"])?,
            event_url: join_path(&ingest, &["v2", "event"])?,
            trace_url: config.parsed_trace_endpoint_url()?,
            api_url: config.parsed_api_url()?,
            access_token: config.access_token.clone(),
            compression_level: None,
        })
    }

    /// Compresses request bodies with zstd at the given level.
    #[must_use]
    pub fn with_compression(mut self, level: i32) -> Self {
        self.compression_level = Some(level);
        self
    }

    fn encode<S: Serialize + ?Sized>(&self, body: &S) -> Result<Vec<u8>, ShippingError> {
        let json = serde_json::to_vec(body).map_err(|e| ShippingError::Payload(e.to_string()))?;
        match self.compression_level {
            Some(level) => zstd::stream::encode_all(json.as_slice(), level)
                .map_err(|e| ShippingError::Payload(format!("zstd: {e}"))),
            None => Ok(json),
        }
    }

    async fn ship(
        &self,
        method: reqwest::Method,
        url: Url,
        body: Vec<u8>,
    ) -> Result<(), ShippingError> {
        let mut request = self
            .client
            .request(method, url)
            .header("X-SF-Token", self.access_token.as_str())
            .header("Content-Type", "application/json");
        if self.compression_level.is_some() {
            request = request.header("Content-Encoding", "zstd");
        }

        let resp = request
            .body(body)
            .send()
            .await
            .map_err(|e| ShippingError::Destination(e.status(), e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let text = resp.text().await.unwrap_or_default();
        Err(ShippingError::Destination(Some(status), text))
    }

    async fn send_datapoints(&self, datapoints: &[Datapoint]) -> Result<(), ShippingError> {
        let mut body: BTreeMap<&'static str, Vec<DatapointJson<'_>>> = BTreeMap::new();
        for dp in datapoints {
            body.entry(metric_type_key(dp.metric_type))
                .or_default()
                .push(DatapointJson {
                    metric: &dp.metric,
                    value: dp.value,
                    dimensions: &dp.dimensions,
                    timestamp: dp.timestamp,
                });
        }
        let payload = self.encode(&body)?;
        self.ship(reqwest::Method::POST, self.datapoint_url.clone(), payload)
            .await
    }

    async fn send_spans(&self, spans: &[Span]) -> Result<(), ShippingError> {
        let body: Vec<ZipkinSpan<'_>> = spans.iter().map(ZipkinSpan::from).collect();
        let payload = self.encode(&body)?;
        self.ship(reqwest::Method::POST, self.trace_url.clone(), payload)
            .await
    }

    async fn send_properties(&self, updates: &[PropertyUpdate]) -> Result<(), ShippingError> {
        for update in updates {
            let url = join_path(
                &self.api_url,
                &["v2", "dimension", &update.dimension.name, &update.dimension.value],
            )
            .map_err(|e| ShippingError::Payload(e.to_string()))?;
            let payload = self.encode(&DimensionPatch::from(update))?;
            debug!("Patching dimension {}", update.dimension);
            self.ship(reqwest::Method::PATCH, url, payload).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl BatchTransport for HttpTransport {
    async fn send_batch(&self, batch: Batch<'_>) -> Result<(), ShippingError> {
        match batch {
            Batch::Datapoints(datapoints) => self.send_datapoints(datapoints).await,
            Batch::Events(events) => {
                let payload = self.encode(events)?;
                self.ship(reqwest::Method::POST, self.event_url.clone(), payload)
                    .await
            }
            Batch::Properties(updates) => self.send_properties(updates).await,
            Batch::Spans(spans) => self.send_spans(spans).await,
        }
    }
}

fn join_path(base: &Url, segments: &[&str]) -> Result<Url, WriterError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| WriterError::InvalidConfig(format!("'{base}' cannot be a base url")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn metric_type_key(metric_type: MetricType) -> &'static str {
    match metric_type {
        MetricType::Gauge => "gauge",
        MetricType::Counter => "counter",
        MetricType::CumulativeCounter => "cumulative_counter",
    }
}

#[derive(Serialize)]
struct DatapointJson<'a> {
    metric: &'a str,
    value: Value,
    dimensions: &'a BTreeMap<String, String>,
    #[serde(skip_serializing_if = "is_unset")]
    timestamp: i64,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_unset(timestamp: &i64) -> bool {
    *timestamp == 0
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ZipkinSpan<'a> {
    trace_id: &'a str,
    id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_id: Option<&'a str>,
    name: &'a str,
    timestamp: i64,
    duration: i64,
    local_endpoint: LocalEndpoint<'a>,
    tags: &'a BTreeMap<String, String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LocalEndpoint<'a> {
    service_name: &'a str,
}

impl<'a> From<&'a Span> for ZipkinSpan<'a> {
    fn from(span: &'a Span) -> Self {
        Self {
            trace_id: &span.trace_id,
            id: &span.id,
            parent_id: span.parent_id.as_deref(),
            name: &span.name,
            timestamp: span.start,
            duration: span.duration,
            local_endpoint: LocalEndpoint {
                service_name: &span.service,
            },
            tags: &span.tags,
        }
    }
}

/// A `null` custom property deletes it.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DimensionPatch<'a> {
    custom_properties: BTreeMap<&'a str, Option<&'a str>>,
    tags: Vec<&'a str>,
    tags_to_remove: Vec<&'a str>,
}

impl<'a> From<&'a PropertyUpdate> for DimensionPatch<'a> {
    fn from(update: &'a PropertyUpdate) -> Self {
        let (added, removed): (Vec<_>, Vec<_>) =
            update.tags.iter().partition(|(_, present)| **present);
        Self {
            custom_properties: update
                .properties
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_deref()))
                .collect(),
            tags: added.into_iter().map(|(t, _)| t.as_str()).collect(),
            tags_to_remove: removed.into_iter().map(|(t, _)| t.as_str()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::DimensionKey;

    fn transport() -> HttpTransport {
        HttpTransport::new(&WriterConfig {
            ingest_url: "https://ingest.example.com/".to_string(),
            api_url: "https://api.example.com".to_string(),
            ..Default::default()
        })
        .expect("default config builds a transport")
    }

    #[test]
    fn test_endpoints() {
        let t = transport();
        assert_eq!(t.datapoint_url.as_str(), "https://ingest.example.com/v2/datapoint");
        assert_eq!(t.event_url.as_str(), "https://ingest.example.com/v2/event");
        assert_eq!(t.trace_url.as_str(), "https://ingest.example.com/v1/trace");
    }

    #[test]
    fn test_dimension_path_is_escaped() {
        let t = transport();
        let url = join_path(&t.api_url, &["v2", "dimension", "kubernetes_pod_name", "a/b c"])
            .expect("url should build");
        assert_eq!(
            url.as_str(),
            "https://api.example.com/v2/dimension/kubernetes_pod_name/a%2Fb%20c"
        );
    }

    #[test]
    fn test_dimension_patch_body() {
        let update = PropertyUpdate::new(DimensionKey::new("host", "web-1"))
            .with_property("role", "frontend")
            .with_removed_property("owner")
            .with_tag("canary", true)
            .with_tag("legacy", false);
        let json = serde_json::to_value(DimensionPatch::from(&update)).expect("serializes");
        assert_eq!(
            json,
            serde_json::json!({
                "customProperties": {"owner": null, "role": "frontend"},
                "tags": ["canary"],
                "tagsToRemove": ["legacy"],
            })
        );
    }

    #[test]
    fn test_zipkin_span_shape() {
        let mut span = Span::new("abc", "def", "checkout", "GET /cart");
        span.parent_id = Some("123".to_string());
        span.start = 1_700_000_000_000_000;
        span.duration = 250;
        let json = serde_json::to_value(ZipkinSpan::from(&span)).expect("serializes");
        assert_eq!(json["traceId"], "abc");
        assert_eq!(json["parentId"], "123");
        assert_eq!(json["localEndpoint"]["serviceName"], "checkout");
        assert_eq!(json["duration"], 250);
    }

    #[test]
    fn test_compressed_payload_round_trips() {
        let t = transport().with_compression(3);
        let payload = t.encode(&vec!["a"; 64]).expect("encodes");
        let raw = zstd::stream::decode_all(payload.as_slice()).expect("decodes");
        let parsed: Vec<String> = serde_json::from_slice(&raw).expect("valid json");
        assert_eq!(parsed.len(), 64);
    }
}
