// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixed-capacity FIFO buffer that overwrites its oldest records when full.
//!
//! Producers never block on it: a full buffer evicts from the front, counts
//! the eviction and warns (rate limited). The sender drains it from the front
//! in insertion order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::warn;

use crate::util::{LogThrottle, DROP_LOG_INTERVAL};

#[derive(Debug)]
pub struct BoundedBuffer<T> {
    name: &'static str,
    capacity: usize,
    queue: Mutex<VecDeque<T>>,
    dropped: AtomicU64,
    drop_log: LogThrottle,
}

impl<T> BoundedBuffer<T> {
    /// `capacity` is clamped to at least one record.
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name,
            capacity,
            // Grows on demand, large capacities are mostly never reached.
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            dropped: AtomicU64::new(0),
            drop_log: LogThrottle::new(DROP_LOG_INTERVAL),
        }
    }

    /// Appends a record, returns how many records were overwritten.
    pub fn push(&self, record: T) -> usize {
        self.push_many(std::iter::once(record))
    }

    /// Appends records under a single lock, returns how many were
    /// overwritten.
    pub fn push_many<I>(&self, records: I) -> usize
    where
        I: IntoIterator<Item = T>,
    {
        let mut evicted = 0;
        {
            #[allow(clippy::expect_used)]
            let mut queue = self.queue.lock().expect("lock poisoned");
            for record in records {
                if queue.len() >= self.capacity {
                    queue.pop_front();
                    evicted += 1;
                }
                queue.push_back(record);
            }
        }

        if evicted > 0 {
            let total = self.dropped.fetch_add(evicted as u64, Ordering::Relaxed) + evicted as u64;
            if self.drop_log.should_log() {
                warn!(
                    "{} buffer full ({} items), overwrote {} oldest unsent records ({} total so far)",
                    self.name, self.capacity, evicted, total
                );
            }
        }
        evicted
    }

    /// Removes and returns up to `max` of the oldest records, in insertion
    /// order.
    pub fn drain_up_to(&self, max: usize) -> Vec<T> {
        #[allow(clippy::expect_used)]
        let mut queue = self.queue.lock().expect("lock poisoned");
        let n = max.min(queue.len());
        queue.drain(..n).collect()
    }

    pub fn drain_all(&self) -> Vec<T> {
        #[allow(clippy::expect_used)]
        let mut queue = self.queue.lock().expect("lock poisoned");
        std::mem::take(&mut *queue).into()
    }

    pub fn len(&self) -> usize {
        #[allow(clippy::expect_used)]
        self.queue.lock().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total records overwritten since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
