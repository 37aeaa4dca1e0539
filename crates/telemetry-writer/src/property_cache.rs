// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Debounced dimension property updates.
//!
//! Updates for one dimension coalesce for `propertiesSendDelaySeconds` after
//! the first of them arrives. Once that window closes the latest payload is
//! compared against what was last enqueued for the dimension and only sent
//! when it changed.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fnv::FnvBuildHasher;
use hashbrown::HashMap;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::dedup::DedupHistory;
use crate::record::{DimensionKey, PropertyUpdate};
use crate::sender::BatchSource;
use crate::stats::WriterStats;
use crate::util::{LogThrottle, DROP_LOG_INTERVAL};

#[derive(Debug)]
struct PendingEntry {
    update: PropertyUpdate,
    deadline: Instant,
}

#[derive(Debug)]
struct PendingState {
    pending: HashMap<DimensionKey, PendingEntry, FnvBuildHasher>,
    /// Keys by first arrival. Deadlines never move and the delay is fixed, so
    /// this is also deadline order.
    order: VecDeque<DimensionKey>,
    ready: VecDeque<PropertyUpdate>,
}

impl PendingState {
    fn len(&self) -> usize {
        self.pending.len() + self.ready.len()
    }
}

/// Debounces property updates per dimension and skips unchanged ones.
#[derive(Debug)]
pub struct PropertyCache {
    send_delay: Duration,
    capacity: usize,
    log_updates: bool,
    stats: Arc<WriterStats>,
    state: Mutex<PendingState>,
    // Only the properties loop locks this.
    history: Mutex<DedupHistory>,
    drop_log: LogThrottle,
}

impl PropertyCache {
    pub fn new(
        send_delay: Duration,
        capacity: usize,
        history_size: usize,
        stats: Arc<WriterStats>,
    ) -> Self {
        Self {
            send_delay,
            capacity: capacity.max(1),
            log_updates: false,
            stats,
            state: Mutex::new(PendingState {
                pending: HashMap::with_hasher(FnvBuildHasher::default()),
                order: VecDeque::new(),
                ready: VecDeque::new(),
            }),
            history: Mutex::new(DedupHistory::new(history_size)),
            drop_log: LogThrottle::new(DROP_LOG_INTERVAL),
        }
    }

    /// Logs every update that leaves the debounce window.
    #[must_use]
    pub fn with_update_logging(mut self, enabled: bool) -> Self {
        self.log_updates = enabled;
        self
    }

    /// Queues `update`. Returns false when it was dropped because the cache
    /// is full.
    pub fn submit(&self, update: PropertyUpdate) -> bool {
        self.submit_at(update, Instant::now())
    }

    pub(crate) fn submit_at(&self, update: PropertyUpdate, now: Instant) -> bool {
        let overflow = {
            #[allow(clippy::expect_used)]
            let mut state = self.state.lock().expect("lock poisoned");
            let at_capacity = state.len() >= self.capacity;
            match state.pending.get_mut(&update.dimension) {
                Some(entry) => {
                    if update.merge_into_existing {
                        entry.update.merge(update);
                    } else {
                        entry.update = update;
                    }
                    None
                }
                None if at_capacity => Some(update.dimension),
                None => {
                    state.order.push_back(update.dimension.clone());
                    state.pending.insert(
                        update.dimension.clone(),
                        PendingEntry {
                            update,
                            deadline: now + self.send_delay,
                        },
                    );
                    None
                }
            }
        };

        match overflow {
            None => true,
            Some(dimension) => {
                self.stats.properties.add_dropped(1);
                if self.drop_log.should_log() {
                    warn!(
                        "Dimension update buffer full ({} items), dropping update for {dimension}",
                        self.capacity
                    );
                }
                false
            }
        }
    }

    /// Moves every entry whose deadline passed out of the pending set. Entries
    /// identical to what was last enqueued for their dimension are discarded,
    /// the rest become ready to send. Returns how many became ready.
    pub fn sweep(&self, now: Instant) -> usize {
        let expired = {
            #[allow(clippy::expect_used)]
            let mut state = self.state.lock().expect("lock poisoned");
            let mut expired = Vec::new();
            while let Some(key) = state.order.front() {
                match state.pending.get(key) {
                    Some(entry) if entry.deadline > now => break,
                    _ => {}
                }
                if let Some(key) = state.order.pop_front() {
                    if let Some(entry) = state.pending.remove(&key) {
                        expired.push(entry.update);
                    }
                }
            }
            expired
        };
        if expired.is_empty() {
            return 0;
        }

        let mut fresh = Vec::with_capacity(expired.len());
        {
            #[allow(clippy::expect_used)]
            let mut history = self.history.lock().expect("lock poisoned");
            for update in expired {
                let hash = update.content_hash();
                if history.is_duplicate(&update.dimension, hash) {
                    self.stats.add_properties_deduplicated(1);
                    debug!("Skipping unchanged properties for {}", update.dimension);
                    continue;
                }
                history.record(update.dimension.clone(), hash);
                if self.log_updates {
                    info!("Sending dimension update {}: {:?}", update.dimension, update);
                }
                fresh.push(update);
            }
        }

        let n = fresh.len();
        #[allow(clippy::expect_used)]
        self.state.lock().expect("lock poisoned").ready.extend(fresh);
        n
    }

    /// Pending plus ready updates.
    pub fn len(&self) -> usize {
        #[allow(clippy::expect_used)]
        self.state.lock().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BatchSource<PropertyUpdate> for PropertyCache {
    fn take_batch(&self, _batch_id: u64, max: usize) -> Vec<PropertyUpdate> {
        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock poisoned");
        let n = max.min(state.ready.len());
        state.ready.drain(..n).collect()
    }

    fn pending(&self) -> usize {
        #[allow(clippy::expect_used)]
        self.state.lock().expect("lock poisoned").ready.len()
    }

    fn on_tick(&self) {
        self.sweep(Instant::now());
    }

    fn batch_completed(&self, _batch_id: u64, records: Vec<PropertyUpdate>, sent: bool) {
        if sent {
            return;
        }
        #[allow(clippy::expect_used)]
        let mut history = self.history.lock().expect("lock poisoned");
        for update in &records {
            if history.forget(&update.dimension, update.content_hash()) {
                debug!("Forgot failed properties for {}", update.dimension);
            }
        }
    }
}
