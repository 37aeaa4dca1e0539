// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounds the trace spans held by the writer.
//!
//! A span counts against `maxTraceSpansInFlight` from the moment it is
//! accepted until the batch it was drained into completes. When the bound is
//! hit the oldest span goes in acceptance order: spans on the wire stop being
//! tracked before any unsent span is dropped.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::record::Span;
use crate::sender::BatchSource;
use crate::stats::WriterStats;
use crate::util::{LogThrottle, DROP_LOG_INTERVAL};

#[derive(Debug, Default)]
struct TrackerState {
    pending: VecDeque<Span>,
    /// `(batch_id, spans still counted)` in drain order.
    sending: VecDeque<(u64, usize)>,
    sending_total: usize,
}

impl TrackerState {
    fn len(&self) -> usize {
        self.pending.len() + self.sending_total
    }

    /// Drops the oldest tracked span. Returns false when nothing is tracked.
    fn evict_oldest(&mut self) -> bool {
        if let Some(front) = self.sending.front_mut() {
            front.1 -= 1;
            self.sending_total -= 1;
            if front.1 == 0 {
                self.sending.pop_front();
            }
            return true;
        }
        self.pending.pop_front().is_some()
    }
}

/// Spans waiting to be sent or on the wire, bounded by `capacity`.
#[derive(Debug)]
pub struct SpanTracker {
    capacity: usize,
    stats: Arc<WriterStats>,
    state: Mutex<TrackerState>,
    drop_log: LogThrottle,
}

impl SpanTracker {
    pub fn new(capacity: usize, stats: Arc<WriterStats>) -> Self {
        Self {
            capacity: capacity.max(1),
            stats,
            state: Mutex::new(TrackerState::default()),
            drop_log: LogThrottle::new(DROP_LOG_INTERVAL),
        }
    }

    /// Tracks `spans`, evicting the oldest ones past capacity. Returns how
    /// many were evicted.
    pub fn accept_many<I>(&self, spans: I) -> usize
    where
        I: IntoIterator<Item = Span>,
    {
        let mut dropped = 0;
        {
            #[allow(clippy::expect_used)]
            let mut state = self.state.lock().expect("lock poisoned");
            for span in spans {
                while state.len() >= self.capacity && state.evict_oldest() {
                    dropped += 1;
                }
                state.pending.push_back(span);
            }
        }

        if dropped > 0 {
            self.stats.spans.add_dropped(dropped);
            if self.drop_log.should_log() {
                warn!(
                    "Too many trace spans in flight ({} max), dropped {dropped} oldest",
                    self.capacity
                );
            }
        }
        dropped
    }

    pub fn accept(&self, span: Span) -> usize {
        self.accept_many(std::iter::once(span))
    }

    /// Spans accepted plus spans on the wire.
    pub fn len(&self) -> usize {
        #[allow(clippy::expect_used)]
        self.state.lock().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spans in batches that have not completed yet.
    pub fn in_flight(&self) -> usize {
        #[allow(clippy::expect_used)]
        self.state.lock().expect("lock poisoned").sending_total
    }
}

impl BatchSource<Span> for SpanTracker {
    fn take_batch(&self, batch_id: u64, max: usize) -> Vec<Span> {
        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock poisoned");
        let n = max.min(state.pending.len());
        let batch: Vec<Span> = state.pending.drain(..n).collect();
        if n > 0 {
            state.sending.push_back((batch_id, n));
            state.sending_total += n;
        }
        batch
    }

    fn pending(&self) -> usize {
        #[allow(clippy::expect_used)]
        self.state.lock().expect("lock poisoned").pending.len()
    }

    fn batch_completed(&self, batch_id: u64, _records: Vec<Span>, _sent: bool) {
        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock poisoned");
        if let Some(pos) = state.sending.iter().position(|(id, _)| *id == batch_id) {
            if let Some((_, count)) = state.sending.remove(pos) {
                state.sending_total -= count;
            }
        }
    }
}
