// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Drains a record source into batches and ships them under a concurrency
//! limit.
//!
//! Each kind gets one [`BatchSender`] driven by [`run_sender_loop`]. The loop
//! wakes on its interval or when producers signal a full batch, then drains
//! the source batch by batch. A batch holds one semaphore permit until its
//! send completes, so at most `max_requests` sends are outstanding. Finished
//! sends are reported back to the source as soon as the loop sees them, also
//! between ticks.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::record::{Batchable, RecordKind};
use crate::ring_buffer::BoundedBuffer;
use crate::stats::{KindStats, WriterStats};
use crate::transport::BatchTransport;

/// Something a [`BatchSender`] can drain.
pub trait BatchSource<T>: Send + Sync {
    /// Removes up to `max` records, tagged with `batch_id`.
    fn take_batch(&self, batch_id: u64, max: usize) -> Vec<T>;

    /// Records ready to be taken.
    fn pending(&self) -> usize;

    /// Called once per tick before draining.
    fn on_tick(&self) {}

    /// Called from the sender loop when the send of `batch_id` finished.
    fn batch_completed(&self, _batch_id: u64, _records: Vec<T>, _sent: bool) {}
}

impl<T: Send> BatchSource<T> for BoundedBuffer<T> {
    fn take_batch(&self, _batch_id: u64, max: usize) -> Vec<T> {
        self.drain_up_to(max)
    }

    fn pending(&self) -> usize {
        self.len()
    }
}

/// What a [`BatchSender`] is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    /// Nothing to drain, or the last drain cycle finished.
    Idle,
    /// Holds a slot and is taking a batch from the source.
    Draining,
    /// Handed its last batch to the transport.
    Sending,
}

struct Completed<T> {
    batch_id: u64,
    records: Vec<T>,
    sent: bool,
}

/// Keeps the active request gauge honest when a send task is aborted.
struct ActiveRequest(Arc<WriterStats>, RecordKind);

impl ActiveRequest {
    fn start(stats: Arc<WriterStats>, kind: RecordKind) -> Self {
        stats.for_kind(kind).request_started();
        Self(stats, kind)
    }

    fn stats(&self) -> &KindStats {
        self.0.for_kind(self.1)
    }
}

impl Drop for ActiveRequest {
    fn drop(&mut self) {
        self.stats().request_finished();
    }
}

/// Ships batches of one record kind, at most `max_requests` at a time.
pub struct BatchSender<T: Batchable> {
    transport: Arc<dyn BatchTransport>,
    stats: Arc<WriterStats>,
    max_batch_size: usize,
    max_requests: usize,
    slots: Arc<Semaphore>,
    in_flight: JoinSet<Completed<T>>,
    next_batch_id: u64,
    state: SenderState,
    log_records: bool,
}

impl<T: Batchable> BatchSender<T> {
    /// Creates a sender. `max_batch_size` and `max_requests` are clamped to at
    /// least 1.
    pub fn new(
        transport: Arc<dyn BatchTransport>,
        stats: Arc<WriterStats>,
        max_batch_size: usize,
        max_requests: usize,
    ) -> Self {
        let max_requests = max_requests.max(1);
        Self {
            transport,
            stats,
            max_batch_size: max_batch_size.max(1),
            max_requests,
            slots: Arc::new(Semaphore::new(max_requests)),
            in_flight: JoinSet::new(),
            next_batch_id: 0,
            state: SenderState::Idle,
            log_records: false,
        }
    }

    /// Logs every record of every batch at debug level.
    #[must_use]
    pub fn with_record_logging(mut self, enabled: bool) -> Self {
        self.log_records = enabled;
        self
    }

    pub fn state(&self) -> SenderState {
        self.state
    }

    /// Sends currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.max_requests - self.slots.available_permits()
    }

    /// Runs one drain cycle. Waits for a free slot first, which blocks only
    /// the caller. Returns the number of records handed to the transport, or
    /// `None` when the source had nothing to send.
    pub async fn send_next<S>(&mut self, source: &S) -> Option<usize>
    where
        S: BatchSource<T> + ?Sized,
    {
        self.reap(source);
        if source.pending() == 0 {
            return None;
        }

        let permit = Arc::clone(&self.slots).acquire_owned().await.ok()?;
        // Nothing below awaits, so a caller dropping this future never loses
        // drained records.
        self.state = SenderState::Draining;
        self.reap(source);

        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;
        let records = source.take_batch(batch_id, self.max_batch_size);
        if records.is_empty() {
            self.state = SenderState::Idle;
            return None;
        }

        let (valid, invalid): (Vec<T>, Vec<T>) = records.into_iter().partition(T::is_valid);
        let kind_stats = self.stats.for_kind(T::KIND);
        if !invalid.is_empty() {
            kind_stats.add_invalid(invalid.len());
            debug!("Dropped {} invalid {} from batch {batch_id}", invalid.len(), T::KIND);
        }
        if valid.is_empty() {
            source.batch_completed(batch_id, invalid, false);
            self.state = SenderState::Idle;
            return Some(0);
        }

        if self.log_records {
            for record in &valid {
                debug!("Sending {}: {record:?}", T::KIND);
            }
        }

        let count = valid.len();
        let transport = Arc::clone(&self.transport);
        let active = ActiveRequest::start(Arc::clone(&self.stats), T::KIND);
        self.state = SenderState::Sending;
        self.in_flight.spawn(async move {
            let result = transport.send_batch(T::as_batch(&valid)).await;
            drop(permit);
            let sent = match result {
                Ok(()) => {
                    active.stats().add_sent(count);
                    debug!("Sent {count} {} in batch {batch_id}", T::KIND);
                    true
                }
                Err(e) => {
                    active.stats().add_failed(count);
                    error!("Failed to send {count} {}, batch dropped: {e}", T::KIND);
                    false
                }
            };
            drop(active);
            Completed {
                batch_id,
                records: valid,
                sent,
            }
        });
        Some(count)
    }

    /// Drains the source until it is empty or `cancel` fires. Returns the
    /// number of records handed to the transport.
    pub async fn flush<S>(&mut self, source: &S, cancel: &CancellationToken) -> usize
    where
        S: BatchSource<T> + ?Sized,
    {
        let mut total = 0;
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                next = self.send_next(source) => match next {
                    Some(n) => total += n,
                    None => break,
                },
            }
        }
        self.state = SenderState::Idle;
        total
    }

    /// Waits up to `grace` for outstanding sends, then aborts the rest.
    pub async fn shutdown<S>(&mut self, source: &S, grace: Duration)
    where
        S: BatchSource<T> + ?Sized,
    {
        let in_flight = &mut self.in_flight;
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = in_flight.join_next().await {
                complete(source, joined);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                "Abandoning {} in-flight {} requests after {grace:?}",
                self.in_flight.len(),
                T::KIND
            );
            self.in_flight.abort_all();
            while self.in_flight.join_next().await.is_some() {}
        }
        self.state = SenderState::Idle;
    }

    fn reap<S>(&mut self, source: &S)
    where
        S: BatchSource<T> + ?Sized,
    {
        while let Some(joined) = self.in_flight.try_join_next() {
            complete(source, joined);
        }
    }
}

fn complete<T, S>(source: &S, joined: Result<Completed<T>, JoinError>)
where
    T: Batchable,
    S: BatchSource<T> + ?Sized,
{
    match joined {
        Ok(done) => source.batch_completed(done.batch_id, done.records, done.sent),
        Err(e) => error!("{} send task failed: {e}", T::KIND),
    }
}

/// Drives one sender until `cancel` fires, then shuts it down.
///
/// Wakes every `interval` and whenever `wake` is notified. Completed sends
/// are handed back to `source` as they finish.
pub async fn run_sender_loop<T, S>(
    mut sender: BatchSender<T>,
    source: Arc<S>,
    interval: Duration,
    wake: Arc<Notify>,
    cancel: CancellationToken,
    grace: Duration,
) where
    T: Batchable,
    S: BatchSource<T> + ?Sized,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!("{} sender loop started", T::KIND);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
            () = wake.notified() => {}
            Some(joined) = sender.in_flight.join_next(), if !sender.in_flight.is_empty() => {
                complete(&*source, joined);
                continue;
            }
        }
        source.on_tick();
        sender.flush(&*source, &cancel).await;
    }

    sender.shutdown(&*source, grace).await;
    let left = source.pending();
    if left > 0 {
        debug!("{} sender loop stopped, {left} unsent records discarded", T::KIND);
    } else {
        debug!("{} sender loop stopped", T::KIND);
    }
}
