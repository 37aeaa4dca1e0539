// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The writer: ingestion API for monitors and lifecycle API for the agent.
//!
//! Each telemetry kind has its own buffer and its own sender loop. Producers
//! only ever take a short per-buffer lock, they never wait on the network.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex as TokioMutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WriterConfig;
use crate::correlation::{
    run_correlation_loop, ActiveServiceTracker, NoopObserver, ServiceForwarder, SpanObserver,
    SERVICE_CHANNEL_CAPACITY,
};
use crate::errors::WriterError;
use crate::filter::WriterFilters;
use crate::property_cache::PropertyCache;
use crate::record::{Datapoint, Event, PropertyUpdate, Record, RecordKind, Span};
use crate::ring_buffer::BoundedBuffer;
use crate::sender::{run_sender_loop, BatchSender, BatchSource};
use crate::span_tracker::SpanTracker;
use crate::stats::WriterStats;
use crate::transport::BatchTransport;

/// How long each loop may wait for its in-flight sends on stop.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// Debounce deadlines are checked at this period.
const PROPERTY_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
/// Every property update is its own request.
const PROPERTY_BATCH_SIZE: usize = 1;

/// Lifecycle of a [`Writer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterStatus {
    /// Built, accepting records, no loops running yet.
    Created,
    /// Sender loops are running.
    Running,
    /// Stopped for good. Records added now are never sent.
    Stopped,
}

struct Shared {
    config: WriterConfig,
    config_hash: u64,
    filters: WriterFilters,
    stats: Arc<WriterStats>,
    datapoints: Arc<BoundedBuffer<Datapoint>>,
    events: Arc<BoundedBuffer<Event>>,
    properties: Arc<PropertyCache>,
    spans: Arc<SpanTracker>,
    span_observer: Box<dyn SpanObserver>,
    datapoint_wake: Arc<Notify>,
    event_wake: Arc<Notify>,
    span_wake: Arc<Notify>,
}

struct Lifecycle {
    status: WriterStatus,
    cancel: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    correlation: Option<(ActiveServiceTracker, mpsc::Receiver<Vec<String>>)>,
}

/// Buffers telemetry from monitors and ships it in the background.
///
/// Construct with [`Writer::new`], call [`Writer::start`] once, and
/// [`Writer::stop`] on shutdown. Dropping a running writer cancels its loops.
pub struct Writer {
    shared: Arc<Shared>,
    transport: Arc<dyn BatchTransport>,
    lifecycle: TokioMutex<Lifecycle>,
}

/// Cloneable ingestion-only view of a [`Writer`].
#[derive(Clone)]
pub struct WriterHandle {
    shared: Arc<Shared>,
}

impl Writer {
    /// Builds a writer from `config`. Applies the deprecated option
    /// precedence, then rejects invalid configurations.
    pub fn new(
        mut config: WriterConfig,
        transport: Arc<dyn BatchTransport>,
        filters: WriterFilters,
    ) -> Result<Self, WriterError> {
        config.initialize();
        config.validate()?;

        let stats = Arc::new(WriterStats::default());
        let properties = PropertyCache::new(
            config.properties_send_delay(),
            config.properties_max_buffered,
            config.properties_history_size,
            Arc::clone(&stats),
        )
        .with_update_logging(config.log_dimension_updates);

        let mut correlation = None;
        let span_observer: Box<dyn SpanObserver> = if config.send_trace_host_correlation_metrics {
            let (tx, rx) = mpsc::channel(SERVICE_CHANNEL_CAPACITY);
            let tracker = ActiveServiceTracker::new(
                config.stale_service_timeout,
                config.host_id_dims.clone(),
            );
            correlation = Some((tracker, rx));
            Box::new(ServiceForwarder::new(tx))
        } else {
            Box::new(NoopObserver)
        };

        let shared = Shared {
            config_hash: config.config_hash(),
            filters,
            datapoints: Arc::new(BoundedBuffer::new("datapoint", config.max_datapoints_buffered)),
            events: Arc::new(BoundedBuffer::new("event", config.max_datapoints_buffered)),
            properties: Arc::new(properties),
            spans: Arc::new(SpanTracker::new(
                config.max_trace_spans_in_flight,
                Arc::clone(&stats),
            )),
            stats,
            span_observer,
            datapoint_wake: Arc::new(Notify::new()),
            event_wake: Arc::new(Notify::new()),
            span_wake: Arc::new(Notify::new()),
            config,
        };

        Ok(Self {
            shared: Arc::new(shared),
            transport,
            lifecycle: TokioMutex::new(Lifecycle {
                status: WriterStatus::Created,
                cancel: CancellationToken::new(),
                tasks: Vec::new(),
                correlation,
            }),
        })
    }

    /// Launches one sender loop per kind, plus the correlation loop when
    /// enabled. A writer starts at most once: any call after the first
    /// returns [`WriterError::AlreadyStarted`], including after a stop.
    pub async fn start(&self) -> Result<(), WriterError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.status != WriterStatus::Created {
            return Err(WriterError::AlreadyStarted);
        }

        let shared = &self.shared;
        let config = &shared.config;
        let interval = config.send_interval();
        let cancel = lifecycle.cancel.clone();
        let transport = &self.transport;
        let stats = &shared.stats;

        let datapoints = BatchSender::<Datapoint>::new(
            Arc::clone(transport),
            Arc::clone(stats),
            config.datapoint_max_batch_size,
            config.max_requests,
        );
        let events = BatchSender::<Event>::new(
            Arc::clone(transport),
            Arc::clone(stats),
            config.datapoint_max_batch_size,
            config.max_requests,
        );
        let spans = BatchSender::<Span>::new(
            Arc::clone(transport),
            Arc::clone(stats),
            config.trace_span_max_batch_size,
            config.max_requests,
        )
        .with_record_logging(config.log_trace_spans);
        let properties = BatchSender::<PropertyUpdate>::new(
            Arc::clone(transport),
            Arc::clone(stats),
            PROPERTY_BATCH_SIZE,
            config.properties_max_requests,
        );

        let mut tasks = vec![
            (
                "datapoint",
                tokio::spawn(run_sender_loop(
                    datapoints,
                    Arc::clone(&shared.datapoints),
                    interval,
                    Arc::clone(&shared.datapoint_wake),
                    cancel.clone(),
                    SHUTDOWN_GRACE,
                )),
            ),
            (
                "event",
                tokio::spawn(run_sender_loop(
                    events,
                    Arc::clone(&shared.events),
                    interval,
                    Arc::clone(&shared.event_wake),
                    cancel.clone(),
                    SHUTDOWN_GRACE,
                )),
            ),
            (
                "span",
                tokio::spawn(run_sender_loop(
                    spans,
                    Arc::clone(&shared.spans),
                    interval,
                    Arc::clone(&shared.span_wake),
                    cancel.clone(),
                    SHUTDOWN_GRACE,
                )),
            ),
            (
                "property",
                tokio::spawn(run_sender_loop(
                    properties,
                    Arc::clone(&shared.properties),
                    PROPERTY_SWEEP_INTERVAL,
                    Arc::new(Notify::new()),
                    cancel.clone(),
                    SHUTDOWN_GRACE,
                )),
            ),
        ];

        if let Some((tracker, rx)) = lifecycle.correlation.take() {
            tasks.push((
                "correlation",
                tokio::spawn(run_correlation_loop(
                    tracker,
                    rx,
                    config.trace_host_correlation_metrics_interval,
                    Arc::clone(&shared.datapoints),
                    cancel.clone(),
                )),
            ));
        }

        lifecycle.tasks = tasks;
        lifecycle.status = WriterStatus::Running;
        info!(
            "Writer started, sending to {} every {:?}",
            config.ingest_url, interval
        );
        Ok(())
    }

    /// Cancels every loop and waits for in-flight sends within the shutdown
    /// grace period. Records still buffered are discarded. Stopping a stopped
    /// writer is a no-op.
    pub async fn stop(&self) -> Result<(), WriterError> {
        let tasks = {
            let mut lifecycle = self.lifecycle.lock().await;
            match lifecycle.status {
                WriterStatus::Created => return Err(WriterError::NotRunning),
                WriterStatus::Stopped => return Ok(()),
                WriterStatus::Running => {}
            }
            lifecycle.status = WriterStatus::Stopped;
            lifecycle.cancel.cancel();
            std::mem::take(&mut lifecycle.tasks)
        };

        for (name, mut task) in tasks {
            match tokio::time::timeout(SHUTDOWN_GRACE + Duration::from_secs(1), &mut task).await {
                Ok(Ok(())) => debug!("{name} loop stopped"),
                Ok(Err(e)) => warn!("{name} loop ended abnormally: {e}"),
                Err(_) => {
                    warn!("{name} loop did not stop in time, aborting");
                    task.abort();
                }
            }
        }
        info!("Writer stopped");
        Ok(())
    }

    /// Current lifecycle status.
    pub async fn status(&self) -> WriterStatus {
        self.lifecycle.lock().await.status
    }

    /// A cloneable handle for producers that must not control the lifecycle.
    pub fn handle(&self) -> WriterHandle {
        WriterHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn add_datapoints<I>(&self, datapoints: I)
    where
        I: IntoIterator<Item = Datapoint>,
    {
        self.shared.add_datapoints(datapoints);
    }

    pub fn add_events<I>(&self, events: I)
    where
        I: IntoIterator<Item = Event>,
    {
        self.shared.add_events(events);
    }

    pub fn add_property(&self, update: PropertyUpdate) {
        self.shared.add_property(update);
    }

    pub fn add_spans(&self, spans: Vec<Span>) {
        self.shared.add_spans(spans);
    }

    pub fn add_record(&self, record: Record) {
        self.shared.add_record(record);
    }

    pub fn config(&self) -> &WriterConfig {
        &self.shared.config
    }

    pub fn config_hash(&self) -> u64 {
        self.shared.config_hash
    }

    pub fn stats(&self) -> &WriterStats {
        &self.shared.stats
    }

    /// Writer counters and buffer depths as datapoints.
    pub fn internal_metrics(&self) -> Vec<Datapoint> {
        self.shared.internal_metrics()
    }
}

impl Drop for Writer {
    /// A writer dropped while running cancels its loops. They still finish
    /// their in-flight sends within the shutdown grace period.
    fn drop(&mut self) {
        self.lifecycle.get_mut().cancel.cancel();
    }
}

impl WriterHandle {
    pub fn add_datapoints<I>(&self, datapoints: I)
    where
        I: IntoIterator<Item = Datapoint>,
    {
        self.shared.add_datapoints(datapoints);
    }

    pub fn add_events<I>(&self, events: I)
    where
        I: IntoIterator<Item = Event>,
    {
        self.shared.add_events(events);
    }

    pub fn add_property(&self, update: PropertyUpdate) {
        self.shared.add_property(update);
    }

    pub fn add_spans(&self, spans: Vec<Span>) {
        self.shared.add_spans(spans);
    }

    pub fn add_record(&self, record: Record) {
        self.shared.add_record(record);
    }

    pub fn internal_metrics(&self) -> Vec<Datapoint> {
        self.shared.internal_metrics()
    }
}

impl Shared {
    fn add_datapoints<I>(&self, datapoints: I)
    where
        I: IntoIterator<Item = Datapoint>,
    {
        let config = &self.config;
        let stats = &self.stats.datapoints;
        let accepted: Vec<Datapoint> = datapoints
            .into_iter()
            .filter_map(|mut dp| {
                if !self.filters.keep_datapoint(&dp) {
                    stats.add_filtered(1);
                    if config.log_dropped_datapoints {
                        info!("Dropping datapoint due to filter: {dp:?}");
                    }
                    return None;
                }
                for (key, value) in &config.global_dimensions {
                    dp.dimensions
                        .entry(key.clone())
                        .or_insert_with(|| value.clone());
                }
                if config.log_datapoints {
                    info!("Sending datapoint: {dp:?}");
                }
                Some(dp)
            })
            .collect();

        let dropped = self.datapoints.push_many(accepted);
        stats.add_dropped(dropped);
        if self.datapoints.len() >= config.datapoint_max_batch_size {
            self.datapoint_wake.notify_one();
        }
    }

    fn add_events<I>(&self, events: I)
    where
        I: IntoIterator<Item = Event>,
    {
        let events: Vec<Event> = events.into_iter().collect();
        if self.config.log_events {
            for event in &events {
                info!("Sending event: {event:?}");
            }
        }
        let dropped = self.events.push_many(events);
        self.stats.events.add_dropped(dropped);
        if self.events.len() >= self.config.datapoint_max_batch_size {
            self.event_wake.notify_one();
        }
    }

    fn add_property(&self, update: PropertyUpdate) {
        if !self.filters.keep_property(&update) {
            self.stats.properties.add_filtered(1);
            debug!("Dropping properties for {} due to filter", update.dimension);
            return;
        }
        self.properties.submit(update);
    }

    fn add_spans(&self, mut spans: Vec<Span>) {
        if spans.is_empty() {
            return;
        }
        let host_dims = &self.config.host_id_dims;
        if !host_dims.is_empty() {
            for span in &mut spans {
                if !host_dims.keys().any(|k| span.tags.contains_key(k)) {
                    span.tags
                        .extend(host_dims.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
            }
        }

        self.span_observer.observe(&spans);
        self.spans.accept_many(spans);
        if self.spans.pending() >= self.config.trace_span_max_batch_size {
            self.span_wake.notify_one();
        }
    }

    fn add_record(&self, record: Record) {
        match record {
            Record::Datapoint(dp) => self.add_datapoints([dp]),
            Record::Event(event) => self.add_events([event]),
            Record::Property(update) => self.add_property(update),
            Record::Span(span) => self.add_spans(vec![span]),
        }
    }

    fn internal_metrics(&self) -> Vec<Datapoint> {
        self.stats.to_datapoints(&[
            (RecordKind::Datapoint, self.datapoints.len()),
            (RecordKind::Event, self.events.len()),
            (RecordKind::Property, self.properties.len()),
            (RecordKind::Span, self.spans.len()),
        ])
    }
}
