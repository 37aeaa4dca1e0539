// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Telemetry records accepted by the writer.
//!
//! Every record kind has its own buffer inside the writer. The [`Batchable`]
//! trait ties a record type to its [`RecordKind`], to the borrowed [`Batch`]
//! view handed to the transport, and to the validity check applied when a
//! batch is formed.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use fnv::FnvHasher;
use serde::Serialize;

/// Telemetry kind, used to route records and to label counters and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Datapoint,
    Event,
    Property,
    Span,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Datapoint => "datapoints",
            RecordKind::Event => "events",
            RecordKind::Property => "dimension properties",
            RecordKind::Span => "trace spans",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Gauge,
    Counter,
    CumulativeCounter,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
}

impl Value {
    fn is_finite(&self) -> bool {
        match self {
            Value::Int(_) => true,
            Value::Float(v) => v.is_finite(),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

/// A single timestamped metric observation.
#[derive(Debug, Clone, PartialEq)]
pub struct Datapoint {
    pub metric: String,
    pub dimensions: BTreeMap<String, String>,
    pub value: Value,
    pub metric_type: MetricType,
    /// Milliseconds since the unix epoch, 0 lets the ingest assign receipt time.
    pub timestamp: i64,
}

impl Datapoint {
    pub fn new(
        metric: impl Into<String>,
        metric_type: MetricType,
        value: impl Into<Value>,
    ) -> Self {
        Self {
            metric: metric.into(),
            dimensions: BTreeMap::new(),
            value: value.into(),
            metric_type,
            timestamp: 0,
        }
    }

    #[must_use]
    pub fn with_dimension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.dimensions.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Identity of a monitored entity, e.g. `host=web-1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DimensionKey {
    pub name: String,
    pub value: String,
}

impl DimensionKey {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for DimensionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.value)
    }
}

/// A change to the metadata attached to a dimension.
///
/// A property mapped to `None` is a tombstone and deletes the property
/// downstream. Tags mapped to `true` are added, `false` removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyUpdate {
    pub dimension: DimensionKey,
    pub properties: BTreeMap<String, Option<String>>,
    pub tags: BTreeMap<String, bool>,
    /// Overlay onto an already pending update for the same dimension instead
    /// of replacing it.
    pub merge_into_existing: bool,
}

impl PropertyUpdate {
    pub fn new(dimension: DimensionKey) -> Self {
        Self {
            dimension,
            properties: BTreeMap::new(),
            tags: BTreeMap::new(),
            merge_into_existing: false,
        }
    }

    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), Some(value.into()));
        self
    }

    #[must_use]
    pub fn with_removed_property(mut self, name: impl Into<String>) -> Self {
        self.properties.insert(name.into(), None);
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>, present: bool) -> Self {
        self.tags.insert(tag.into(), present);
        self
    }

    #[must_use]
    pub fn merging(mut self) -> Self {
        self.merge_into_existing = true;
        self
    }

    /// Overlays `other` onto `self`, newer values win key by key.
    pub(crate) fn merge(&mut self, other: PropertyUpdate) {
        self.properties.extend(other.properties);
        self.tags.extend(other.tags);
    }

    /// Hash of the content that would be sent, independent of the dimension.
    ///
    /// The maps are ordered so equal content always hashes equally.
    pub(crate) fn content_hash(&self) -> u64 {
        let mut hasher = FnvHasher::default();
        self.properties.hash(&mut hasher);
        self.tags.hash(&mut hasher);
        hasher.finish()
    }
}

/// A trace span. Times are in microseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct Span {
    pub trace_id: String,
    pub id: String,
    pub parent_id: Option<String>,
    pub service: String,
    pub name: String,
    pub start: i64,
    pub duration: i64,
    pub tags: BTreeMap<String, String>,
}

impl Span {
    pub fn new(
        trace_id: impl Into<String>,
        id: impl Into<String>,
        service: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            trace_id: trace_id.into(),
            id: id.into(),
            parent_id: None,
            service: service.into(),
            name: name.into(),
            start: 0,
            duration: 0,
            tags: BTreeMap::new(),
        }
    }
}

/// A discrete occurrence reported by a monitor, e.g. a container restart.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_type: String,
    pub category: String,
    pub dimensions: BTreeMap<String, String>,
    pub properties: BTreeMap<String, String>,
    pub timestamp: i64,
}

impl Event {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            category: "USER_DEFINED".to_string(),
            dimensions: BTreeMap::new(),
            properties: BTreeMap::new(),
            timestamp: 0,
        }
    }
}

/// Envelope over every record kind the writer accepts.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Datapoint(Datapoint),
    Event(Event),
    Property(PropertyUpdate),
    Span(Span),
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Datapoint(_) => RecordKind::Datapoint,
            Record::Event(_) => RecordKind::Event,
            Record::Property(_) => RecordKind::Property,
            Record::Span(_) => RecordKind::Span,
        }
    }
}

/// Borrowed view of a batch as handed to the transport.
#[derive(Debug, Clone, Copy)]
pub enum Batch<'a> {
    Datapoints(&'a [Datapoint]),
    Events(&'a [Event]),
    Properties(&'a [PropertyUpdate]),
    Spans(&'a [Span]),
}

impl Batch<'_> {
    pub fn kind(&self) -> RecordKind {
        match self {
            Batch::Datapoints(_) => RecordKind::Datapoint,
            Batch::Events(_) => RecordKind::Event,
            Batch::Properties(_) => RecordKind::Property,
            Batch::Spans(_) => RecordKind::Span,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Batch::Datapoints(r) => r.len(),
            Batch::Events(r) => r.len(),
            Batch::Properties(r) => r.len(),
            Batch::Spans(r) => r.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A record type the batch sender knows how to ship.
pub trait Batchable: fmt::Debug + Send + Sync + Sized + 'static {
    const KIND: RecordKind;

    fn as_batch(records: &[Self]) -> Batch<'_>;

    /// Records failing this check are dropped when a batch is formed.
    fn is_valid(&self) -> bool;
}

impl Batchable for Datapoint {
    const KIND: RecordKind = RecordKind::Datapoint;

    fn as_batch(records: &[Self]) -> Batch<'_> {
        Batch::Datapoints(records)
    }

    fn is_valid(&self) -> bool {
        !self.metric.is_empty() && self.value.is_finite()
    }
}

impl Batchable for Event {
    const KIND: RecordKind = RecordKind::Event;

    fn as_batch(records: &[Self]) -> Batch<'_> {
        Batch::Events(records)
    }

    fn is_valid(&self) -> bool {
        !self.event_type.is_empty()
    }
}

impl Batchable for PropertyUpdate {
    const KIND: RecordKind = RecordKind::Property;

    fn as_batch(records: &[Self]) -> Batch<'_> {
        Batch::Properties(records)
    }

    fn is_valid(&self) -> bool {
        !self.dimension.name.is_empty() && !self.dimension.value.is_empty()
    }
}

impl Batchable for Span {
    const KIND: RecordKind = RecordKind::Span;

    fn as_batch(records: &[Self]) -> Batch<'_> {
        Batch::Spans(records)
    }

    fn is_valid(&self) -> bool {
        !self.trace_id.is_empty() && !self.id.is_empty()
    }
}
