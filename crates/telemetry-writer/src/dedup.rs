// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use fnv::FnvBuildHasher;
use ordered_hash_map::OrderedHashMap;

use crate::record::DimensionKey;

/// LRU of the content hash last enqueued for each dimension.
///
/// The front of the map is the least recently used entry and is the one
/// evicted when a new dimension arrives at capacity.
pub(crate) struct DedupHistory {
    capacity: usize,
    entries: OrderedHashMap<DimensionKey, u64, FnvBuildHasher>,
}

impl DedupHistory {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: OrderedHashMap::with_capacity_and_hasher(
                capacity.min(4096),
                FnvBuildHasher::default(),
            ),
        }
    }

    /// True when `hash` is what was last enqueued for `key`. Marks the key as
    /// recently used either way.
    pub(crate) fn is_duplicate(&mut self, key: &DimensionKey, hash: u64) -> bool {
        match self.entries.get(key) {
            Some(&last) => {
                self.entries.move_to_back(key);
                last == hash
            }
            None => false,
        }
    }

    pub(crate) fn record(&mut self, key: DimensionKey, hash: u64) {
        if self.entries.remove(&key).is_none() && self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.insert(key, hash);
    }

    /// Drops the entry for `key` if it still holds `hash`.
    pub(crate) fn forget(&mut self, key: &DimensionKey, hash: u64) -> bool {
        if self.entries.get(key) == Some(&hash) {
            self.entries.remove(key);
            true
        } else {
            false
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

impl fmt::Debug for DedupHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DedupHistory")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}
