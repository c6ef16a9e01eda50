//! Prioritized, deduplicating request scheduler.
//!
//! Load requests are queued in named pools, each with its own concurrency
//! cap. Within a pool, higher priority dispatches first and equal priority
//! keeps arrival order. Pools are independent of each other.
//!
//! # Request lifecycle
//!
//! ```text
//!            request()                dispatch               loader ok
//!   ─────────────────► Queued ─────────────────► InFlight ──────────────► Completed
//!                        │                          │    loader error
//!           last waiter  │                          ├──────────────────► Failed
//!           cancelled    ▼                          │    (after retries)
//!                    Cancelled                      │ no waiters left
//!                                                   └──────────────────► result discarded
//! ```
//!
//! At most one request exists per identity across all pools. A second
//! request for the same identity attaches another waiter and shares the
//! first request's result.
//!
//! # Result store
//!
//! On success the result goes through a [`ResultStore`] exactly once before
//! any waiter is notified. The pipeline plugs the image cache in here. The
//! store is also the first thing a request consults, under the scheduler
//! lock, so a cache hit never reaches a pool and never waits on a pending
//! load of the same identity. Uncached requests skip the final store step
//! unless a storing request joins them.

mod manager;
mod pool;
mod ticket;

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{ErrorClass, PipelineError};
use crate::identity::ImageId;
use crate::loader::LoadedImage;

pub use manager::RequestPoolManager;
pub use pool::PoolStats;
pub use ticket::{LoadTicket, WaiterToken};

/// Relative urgency within a pool. Higher dispatches first.
pub type Priority = i32;

/// Pool for loads driven by direct interaction (pan, zoom, scroll).
pub const INTERACTION_POOL: &str = "interaction";

/// Pool for thumbnail generation.
pub const THUMBNAIL_POOL: &str = "thumbnail";

/// Pool for background prefetch.
pub const PREFETCH_POOL: &str = "prefetch";

/// Default retry ceiling for transient failures.
pub const DEFAULT_RETRY_LIMIT: u32 = 1;

// =============================================================================
// Policy
// =============================================================================

/// Retry, timeout and discard policy for loads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerPolicy {
    /// Extra attempts allowed after a retriable failure
    pub retry_limit: u32,

    /// Failure classes worth retrying
    pub retriable: HashSet<ErrorClass>,

    /// Per-attempt timeout; expiry counts as a [`ErrorClass::Timeout`] failure
    pub load_timeout: Option<Duration>,

    /// Store results of loads whose waiters all cancelled while in flight
    pub cache_discarded_results: bool,
}

impl SchedulerPolicy {
    /// Whether a load that failed with `class` on attempt number `attempts`
    /// (1-based) should be tried again.
    pub fn should_retry(&self, class: ErrorClass, attempts: u32) -> bool {
        self.retriable.contains(&class) && attempts <= self.retry_limit
    }
}

impl Default for SchedulerPolicy {
    fn default() -> Self {
        Self {
            retry_limit: DEFAULT_RETRY_LIMIT,
            retriable: default_retriable_classes(),
            load_timeout: None,
            cache_discarded_results: false,
        }
    }
}

pub fn default_retriable_classes() -> HashSet<ErrorClass> {
    [ErrorClass::Network, ErrorClass::Timeout].into_iter().collect()
}

// =============================================================================
// Result Store
// =============================================================================

/// Where completed loads land before waiters are notified.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// A payload that can satisfy a request without loading.
    async fn lookup(&self, id: &ImageId) -> Option<Bytes>;

    /// Keep a successful load. The returned payload is what waiters receive.
    async fn store(&self, id: &ImageId, loaded: LoadedImage) -> Result<Bytes, PipelineError>;
}

/// A store that keeps nothing and hands payloads straight to waiters.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

#[async_trait]
impl ResultStore for PassThrough {
    async fn lookup(&self, _id: &ImageId) -> Option<Bytes> {
        None
    }

    async fn store(&self, _id: &ImageId, loaded: LoadedImage) -> Result<Bytes, PipelineError> {
        Ok(loaded.payload)
    }
}
