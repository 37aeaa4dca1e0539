// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use telemetry_writer::{
    Batch, BatchTransport, Datapoint, Event, PropertyUpdate, ShippingError, Span, WriterConfig,
};

/// Owned copy of a batch the mock received.
#[derive(Debug, Clone)]
pub enum Sent {
    Datapoints(Vec<Datapoint>),
    Events(Vec<Event>),
    Properties(Vec<PropertyUpdate>),
    Spans(Vec<Span>),
}

/// Records every batch. Can be made slow or failing, and remembers the
/// highest number of sends it saw at once.
#[derive(Debug, Default)]
pub struct MockTransport {
    sent: Mutex<Vec<Sent>>,
    fail: AtomicBool,
    delay: Duration,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        let transport = Self::default();
        transport.fail.store(true, Ordering::SeqCst);
        transport
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().expect("lock poisoned").clone()
    }

    pub fn datapoint_batches(&self) -> Vec<Vec<Datapoint>> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Datapoints(dps) => Some(dps),
                _ => None,
            })
            .collect()
    }

    pub fn datapoints(&self) -> Vec<Datapoint> {
        self.datapoint_batches().into_iter().flatten().collect()
    }

    pub fn events(&self) -> Vec<Event> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Events(events) => Some(events),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn properties(&self) -> Vec<PropertyUpdate> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Properties(updates) => Some(updates),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn spans(&self) -> Vec<Span> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Spans(spans) => Some(spans),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BatchTransport for MockTransport {
    async fn send_batch(&self, batch: Batch<'_>) -> Result<(), ShippingError> {
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        let owned = match batch {
            Batch::Datapoints(r) => Sent::Datapoints(r.to_vec()),
            Batch::Events(r) => Sent::Events(r.to_vec()),
            Batch::Properties(r) => Sent::Properties(r.to_vec()),
            Batch::Spans(r) => Sent::Spans(r.to_vec()),
        };
        self.sent.lock().expect("lock poisoned").push(owned);

        if self.fail.load(Ordering::SeqCst) {
            Err(ShippingError::Destination(None, "mock failure".to_string()))
        } else {
            Ok(())
        }
    }
}

/// Defaults with correlation off so tests only see what they add.
pub fn test_config() -> WriterConfig {
    WriterConfig {
        send_trace_host_correlation_metrics: false,
        ..Default::default()
    }
}
