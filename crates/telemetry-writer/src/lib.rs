// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Telemetry Writer
//!
//! Egress pipeline of the host agent. Monitors hand their datapoints,
//! events, dimension property updates and trace spans to a [`Writer`], which
//! buffers them per kind and ships them in batches through a
//! [`BatchTransport`].
//!
//! ## Architecture
//!
//! - [`ring_buffer`]: overwrite-oldest buffer for datapoints and events
//! - [`property_cache`]: debounced, deduplicated dimension property updates
//! - [`span_tracker`]: drop-oldest bound on spans not yet confirmed sent
//! - [`correlation`]: service heartbeats derived from observed spans
//! - [`sender`]: batch formation and the per-kind concurrency limit
//! - [`writer`]: wiring, ingestion API and lifecycle
//!
//! Ingestion never blocks on the network and never fails. Overflow, filtered
//! and invalid records and failed sends are counted in [`WriterStats`].

#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod config;
pub mod correlation;
mod dedup;
pub mod errors;
pub mod filter;
pub mod property_cache;
pub mod record;
pub mod ring_buffer;
pub mod sender;
pub mod span_tracker;
pub mod stats;
pub mod transport;
mod util;
pub mod writer;

pub use config::{TraceExportFormat, WriterConfig};
pub use errors::WriterError;
pub use filter::{RecordFilter, WriterFilters};
pub use record::{
    Batch, Batchable, Datapoint, DimensionKey, Event, MetricType, PropertyUpdate, Record,
    RecordKind, Span, Value,
};
pub use stats::{KindStatsSnapshot, WriterStats};
pub use transport::{BatchTransport, HttpTransport, ShippingError};
pub use writer::{Writer, WriterHandle, WriterStatus};
