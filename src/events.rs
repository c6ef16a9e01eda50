//! Cache and load notifications.
//!
//! Components publish to a shared [`EventBus`]; any number of subscribers
//! receive every event published after they subscribed. Publishing never
//! blocks and is dropped silently when nobody listens. A subscriber that
//! falls more than the bus capacity behind gets `RecvError::Lagged` and
//! skips ahead.

use tokio::sync::broadcast;

use crate::error::PipelineError;
use crate::identity::ImageId;

/// Events buffered per subscriber before it starts lagging.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Why an entry left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    /// Made room under the budget
    Evicted,
    /// Removed by an explicit delete
    Deleted,
    /// Dropped by a purge
    Purged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// An image or volume was stored, either new or replacing an older copy.
    EntryAdded { id: ImageId, size_in_bytes: usize },

    EntryRemoved {
        id: ImageId,
        size_in_bytes: usize,
        reason: RemovalReason,
    },

    /// A put was refused because the entry cannot fit next to the
    /// protected entries.
    CacheFull {
        id: ImageId,
        size_in_bytes: usize,
        max_bytes: usize,
    },

    /// A load gave up. Published once per load, however many callers
    /// were waiting on it.
    LoadFailed { id: ImageId, error: PipelineError },
}

impl PipelineEvent {
    pub fn id(&self) -> &ImageId {
        match self {
            PipelineEvent::EntryAdded { id, .. }
            | PipelineEvent::EntryRemoved { id, .. }
            | PipelineEvent::CacheFull { id, .. }
            | PipelineEvent::LoadFailed { id, .. } => id,
        }
    }
}

/// Broadcast channel shared by the cache and the scheduler.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
