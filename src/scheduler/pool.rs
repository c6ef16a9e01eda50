//! A named request pool: a priority queue plus an in-flight set bounded by
//! the pool's concurrency cap.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet};

use crate::identity::ImageId;

use super::Priority;

/// Position of a queued request.
///
/// Ordered so the smallest key is the next to dispatch: highest priority
/// first, then earliest arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct QueueKey {
    priority: Reverse<Priority>,
    seq: u64,
}

impl QueueKey {
    pub(crate) fn new(priority: Priority, seq: u64) -> Self {
        Self {
            priority: Reverse(priority),
            seq,
        }
    }
}

/// Snapshot of a pool's occupancy.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub name: String,
    pub max_concurrency: usize,
    pub queued: usize,
    pub in_flight: usize,
}

pub(crate) struct Pool {
    name: String,
    max_concurrency: usize,
    queue: BTreeMap<QueueKey, ImageId>,
    in_flight: HashSet<ImageId>,
}

impl Pool {
    pub(crate) fn new(name: impl Into<String>, max_concurrency: usize) -> Self {
        Self {
            name: name.into(),
            max_concurrency,
            queue: BTreeMap::new(),
            in_flight: HashSet::new(),
        }
    }

    /// Resizing never cancels running work; a pool shrunk below its current
    /// in-flight count simply stops dispatching until loads complete.
    pub(crate) fn set_max_concurrency(&mut self, max_concurrency: usize) {
        self.max_concurrency = max_concurrency;
    }

    pub(crate) fn has_capacity(&self) -> bool {
        self.in_flight.len() < self.max_concurrency
    }

    pub(crate) fn enqueue(&mut self, key: QueueKey, id: ImageId) {
        self.queue.insert(key, id);
    }

    pub(crate) fn remove_queued(&mut self, key: &QueueKey) -> Option<ImageId> {
        self.queue.remove(key)
    }

    /// Move the next queued request to in-flight, if a slot is free.
    pub(crate) fn pop_next(&mut self) -> Option<ImageId> {
        if !self.has_capacity() {
            return None;
        }
        let (_, id) = self.queue.pop_first()?;
        self.in_flight.insert(id.clone());
        Some(id)
    }

    /// Free the slot held by `id`.
    pub(crate) fn finish(&mut self, id: &ImageId) -> bool {
        self.in_flight.remove(id)
    }

    pub(crate) fn stats(&self) -> PoolStats {
        PoolStats {
            name: self.name.clone(),
            max_concurrency: self.max_concurrency,
            queued: self.queue.len(),
            in_flight: self.in_flight.len(),
        }
    }
}
