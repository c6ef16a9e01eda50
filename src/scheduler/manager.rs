//! Request Pool Manager.
//!
//! Owns the pools and the table of pending requests. Every state
//! transition (enqueue, dispatch, cancel, complete) happens under one
//! mutex; loaders run in spawned tasks with the lock released.
//!
//! A waiter whose ticket was dropped counts as cancelled. Closed waiters
//! are pruned before every decision that depends on interest: dispatch,
//! retry and completion. Detached (prefetch) requests stay wanted without
//! any live ticket until a waiter is cancelled explicitly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::error::{ConfigError, ErrorClass, LoadError, PipelineError};
use crate::events::{EventBus, PipelineEvent};
use crate::identity::ImageId;
use crate::loader::{LoadedImage, Loader, LoaderRegistry};

use super::pool::{Pool, PoolStats, QueueKey};
use super::ticket::{Completion, LoadTicket, WaiterToken};
use super::{PassThrough, Priority, ResultStore, SchedulerPolicy};

// =============================================================================
// Pending Requests
// =============================================================================

/// How a request treats the result store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestMode {
    /// Served from the store when possible, result stored
    Cached,
    /// Always loads, result stored
    Refresh,
    /// Served from the store when possible, result handed back unstored
    Uncached,
    /// Like `Cached`, but stays wanted after its tickets are dropped
    Detached,
}

impl RequestMode {
    fn consults_store(self) -> bool {
        self != RequestMode::Refresh
    }

    fn stores_result(self) -> bool {
        self != RequestMode::Uncached
    }

    fn is_detached(self) -> bool {
        self == RequestMode::Detached
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestState {
    Queued(QueueKey),
    InFlight,
}

/// The single outstanding load for one identity.
struct PendingRequest {
    pool: String,
    priority: Priority,
    requested_at: Instant,
    state: RequestState,
    waiters: HashMap<WaiterToken, Completion>,
    attempts: u32,
    /// Set once any waiter wants the result kept
    store_result: bool,
    /// Set by a background request; cleared by an explicit cancel
    detached: bool,
}

impl PendingRequest {
    /// Forget waiters whose tickets were dropped, then report whether
    /// anyone still wants the load.
    fn is_wanted(&mut self) -> bool {
        self.waiters.retain(|_, waiter| !waiter.is_closed());
        self.detached || !self.waiters.is_empty()
    }
}

struct SchedulerState {
    pools: HashMap<String, Pool>,
    pending: HashMap<ImageId, PendingRequest>,
    next_seq: u64,
    next_token: u64,
}

impl SchedulerState {
    fn queue_key(&mut self, priority: Priority) -> QueueKey {
        let key = QueueKey::new(priority, self.next_seq);
        self.next_seq += 1;
        key
    }

    fn new_waiter(&mut self) -> (WaiterToken, Completion, oneshot::Receiver<CompletionResult>) {
        let token = WaiterToken(self.next_token);
        self.next_token += 1;
        let (tx, rx) = oneshot::channel();
        (token, tx, rx)
    }

    /// Attach a waiter to an existing request for `id`, if there is one.
    fn attach(&mut self, id: &ImageId, mode: RequestMode) -> Option<LoadTicket> {
        if !self.pending.contains_key(id) {
            return None;
        }
        let (token, tx, rx) = self.new_waiter();
        let pending = self.pending.get_mut(id)?;
        pending.waiters.insert(token, tx);
        pending.store_result |= mode.stores_result();
        pending.detached |= mode.is_detached();
        Some(LoadTicket::waiting(id.clone(), token, rx))
    }

    /// Move queued requests into free slots. Returns the identities whose
    /// loads must now be started.
    fn dispatch(&mut self) -> Vec<ImageId> {
        let mut started = Vec::new();
        for pool in self.pools.values_mut() {
            while let Some(id) = pool.pop_next() {
                let Some(pending) = self.pending.get_mut(&id) else {
                    pool.finish(&id);
                    continue;
                };

                if !pending.is_wanted() {
                    self.pending.remove(&id);
                    pool.finish(&id);
                    debug!(id = %id, "every ticket dropped, request abandoned");
                    continue;
                }

                pending.state = RequestState::InFlight;
                debug!(
                    id = %id,
                    pool = %pending.pool,
                    priority = pending.priority,
                    queued_for = ?pending.requested_at.elapsed(),
                    "dispatching load"
                );
                started.push(id);
            }
        }
        started
    }

    /// Remove the request for `id` and free its slot.
    fn finish(&mut self, id: &ImageId) -> Option<PendingRequest> {
        let pending = self.pending.remove(id)?;
        if let Some(pool) = self.pools.get_mut(&pending.pool) {
            pool.finish(id);
        }
        Some(pending)
    }
}

type CompletionResult = Result<bytes::Bytes, PipelineError>;

// =============================================================================
// Request Pool Manager
// =============================================================================

struct Inner {
    registry: Arc<LoaderRegistry>,
    store: Arc<dyn ResultStore>,
    policy: SchedulerPolicy,
    events: EventBus,
    state: Mutex<SchedulerState>,
}

/// Schedules loads across named, concurrency-capped pools.
///
/// Cloning is cheap; clones share the same pools and pending requests.
///
/// # Example
///
/// ```ignore
/// let manager = RequestPoolManager::new(registry);
/// manager.configure_pool("interaction", 6).await?;
///
/// let ticket = manager.request("web:https://host/1.jpg".into(), "interaction", 10).await?;
/// let payload = ticket.wait().await?;
/// ```
#[derive(Clone)]
pub struct RequestPoolManager {
    inner: Arc<Inner>,
}

impl RequestPoolManager {
    /// A manager with no result store and the default policy.
    pub fn new(registry: Arc<LoaderRegistry>) -> Self {
        Self::with_store(
            registry,
            Arc::new(PassThrough),
            SchedulerPolicy::default(),
            EventBus::default(),
        )
    }

    /// A manager that keeps results in `store` and reports failed loads
    /// on `events`.
    pub fn with_store(
        registry: Arc<LoaderRegistry>,
        store: Arc<dyn ResultStore>,
        policy: SchedulerPolicy,
        events: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                store,
                policy,
                events,
                state: Mutex::new(SchedulerState {
                    pools: HashMap::new(),
                    pending: HashMap::new(),
                    next_seq: 0,
                    next_token: 0,
                }),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<LoaderRegistry> {
        &self.inner.registry
    }

    pub fn policy(&self) -> &SchedulerPolicy {
        &self.inner.policy
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Create a pool or change its concurrency cap.
    ///
    /// Shrinking a pool never interrupts running loads; it only holds back
    /// new dispatch until enough of them finish.
    pub async fn configure_pool(&self, name: &str, max_concurrency: usize) -> Result<(), ConfigError> {
        if name.is_empty() {
            return Err(ConfigError::EmptyPoolName);
        }
        if max_concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency {
                pool: name.to_string(),
            });
        }

        let started = {
            let mut state = self.inner.state.lock().await;
            match state.pools.get_mut(name) {
                Some(pool) => pool.set_max_concurrency(max_concurrency),
                None => {
                    state
                        .pools
                        .insert(name.to_string(), Pool::new(name, max_concurrency));
                }
            }
            state.dispatch()
        };
        info!(pool = name, max_concurrency, "configured request pool");

        self.spawn_loads(started);
        Ok(())
    }

    /// Ask for `id` to be loaded through `pool`.
    ///
    /// If the result store already holds `id`, the ticket is resolved
    /// immediately and no pool is involved, whichever pool was named. If a
    /// request for `id` is already pending in any pool, the returned
    /// ticket simply waits on it.
    pub async fn request(
        &self,
        id: ImageId,
        pool: &str,
        priority: Priority,
    ) -> Result<LoadTicket, PipelineError> {
        self.submit(id, pool, priority, RequestMode::Cached).await
    }

    /// Like [`request`](Self::request) but loads even when the result store
    /// already holds `id`. The stored copy keeps serving reads until the
    /// refreshed result replaces it.
    pub async fn request_refresh(
        &self,
        id: ImageId,
        pool: &str,
        priority: Priority,
    ) -> Result<LoadTicket, PipelineError> {
        self.submit(id, pool, priority, RequestMode::Refresh).await
    }

    /// Like [`request`](Self::request) but the load goes ahead even if the
    /// ticket is dropped. Only an explicit [`cancel`](Self::cancel) of the
    /// last waiter withdraws it.
    pub async fn request_detached(
        &self,
        id: ImageId,
        pool: &str,
        priority: Priority,
    ) -> Result<LoadTicket, PipelineError> {
        self.submit(id, pool, priority, RequestMode::Detached).await
    }

    /// Like [`request`](Self::request) but a load started for this request
    /// hands its result to the waiters without storing it. If a storing
    /// request joins before the load completes, the result is stored after
    /// all.
    pub async fn request_uncached(
        &self,
        id: ImageId,
        pool: &str,
        priority: Priority,
    ) -> Result<LoadTicket, PipelineError> {
        self.submit(id, pool, priority, RequestMode::Uncached).await
    }

    async fn submit(
        &self,
        id: ImageId,
        pool: &str,
        priority: Priority,
        mode: RequestMode,
    ) -> Result<LoadTicket, PipelineError> {
        let (ticket, started) = {
            let mut state = self.inner.state.lock().await;

            // Checked under the scheduler lock: a completing load stores its
            // result before giving up its pending slot. A hit never waits on
            // a pending refresh of the same identity.
            if mode.consults_store() {
                if let Some(payload) = self.inner.store.lookup(&id).await {
                    return Ok(LoadTicket::ready(id, payload));
                }
            }

            if !state.pools.contains_key(pool) {
                return Err(PipelineError::UnknownPool(pool.to_string()));
            }

            if let Some(ticket) = state.attach(&id, mode) {
                debug!(id = %id, "joined pending request");
                return Ok(ticket);
            }

            self.inner.registry.resolve(&id).await?;

            let key = state.queue_key(priority);
            let (token, tx, rx) = state.new_waiter();
            let mut waiters = HashMap::new();
            waiters.insert(token, tx);

            state.pending.insert(
                id.clone(),
                PendingRequest {
                    pool: pool.to_string(),
                    priority,
                    requested_at: Instant::now(),
                    state: RequestState::Queued(key),
                    waiters,
                    attempts: 0,
                    store_result: mode.stores_result(),
                    detached: mode.is_detached(),
                },
            );
            if let Some(target) = state.pools.get_mut(pool) {
                target.enqueue(key, id.clone());
            }

            (LoadTicket::waiting(id, token, rx), state.dispatch())
        };

        self.spawn_loads(started);
        Ok(ticket)
    }

    /// Withdraw one waiter.
    ///
    /// When the last waiter of a request that has not started is withdrawn,
    /// the request is dropped and no load is ever issued. A request already
    /// in flight runs to completion and its result is discarded if nobody
    /// is waiting by then. Dropping a ticket has the same effect, applied
    /// the next time the scheduler looks at the request. Returns `false` if
    /// the token was not waiting on `id`.
    pub async fn cancel(&self, id: &ImageId, token: WaiterToken) -> bool {
        let mut state = self.inner.state.lock().await;
        let Some(pending) = state.pending.get_mut(id) else {
            return false;
        };
        if pending.waiters.remove(&token).is_none() {
            return false;
        }

        pending.waiters.retain(|_, waiter| !waiter.is_closed());
        if pending.waiters.is_empty() {
            pending.detached = false;
            if let RequestState::Queued(key) = pending.state {
                let pool_name = pending.pool.clone();
                if let Some(pool) = state.pools.get_mut(&pool_name) {
                    pool.remove_queued(&key);
                }
                state.pending.remove(id);
                debug!(id = %id, pool = %pool_name, "cancelled queued request");
            }
        }
        true
    }

    /// Change the priority of a request that is still queued.
    ///
    /// The request is re-inserted at its new position, behind requests that
    /// already hold that priority. Returns `false` if `id` is not queued.
    pub async fn set_priority(&self, id: &ImageId, priority: Priority) -> bool {
        let started = {
            let mut state = self.inner.state.lock().await;
            let (pool_name, old_key) = match state.pending.get(id) {
                Some(PendingRequest {
                    pool,
                    state: RequestState::Queued(key),
                    ..
                }) => (pool.clone(), *key),
                _ => return false,
            };

            let new_key = state.queue_key(priority);
            if let Some(pool) = state.pools.get_mut(&pool_name) {
                pool.remove_queued(&old_key);
                pool.enqueue(new_key, id.clone());
            }
            if let Some(pending) = state.pending.get_mut(id) {
                pending.priority = priority;
                pending.state = RequestState::Queued(new_key);
            }
            state.dispatch()
        };

        self.spawn_loads(started);
        true
    }

    pub async fn pool_stats(&self, name: &str) -> Option<PoolStats> {
        let state = self.inner.state.lock().await;
        state.pools.get(name).map(Pool::stats)
    }

    /// Statistics for every pool, sorted by name.
    pub async fn all_pool_stats(&self) -> Vec<PoolStats> {
        let state = self.inner.state.lock().await;
        let mut stats: Vec<PoolStats> = state.pools.values().map(Pool::stats).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Number of identities queued or in flight.
    pub async fn pending_count(&self) -> usize {
        self.inner.state.lock().await.pending.len()
    }

    pub async fn is_pending(&self, id: &ImageId) -> bool {
        self.inner.state.lock().await.pending.contains_key(id)
    }

    // =========================================================================
    // Load execution
    // =========================================================================

    fn spawn_loads(&self, started: Vec<ImageId>) {
        for id in started {
            let manager = self.clone();
            tokio::spawn(async move { manager.run_load(id).await });
        }
    }

    async fn run_load(self, id: ImageId) {
        let outcome = match self.inner.registry.resolve(&id).await {
            Ok(loader) => self.load_with_retry(&id, loader).await,
            Err(e) => Err(e),
        };
        self.complete(&id, outcome).await;
    }

    async fn load_with_retry(
        &self,
        id: &ImageId,
        loader: Arc<dyn Loader>,
    ) -> Result<LoadedImage, PipelineError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            self.record_attempt(id, attempts).await;

            let error = match self.load_once(id, &loader).await {
                Ok(loaded) => return Ok(loaded),
                Err(error) => error,
            };

            if error.class == ErrorClass::Cancelled {
                return Err(PipelineError::Cancelled(id.clone()));
            }

            if self.inner.policy.should_retry(error.class, attempts) && self.has_interest(id).await
            {
                debug!(id = %id, attempts, error = %error, "retrying load");
                continue;
            }

            warn!(id = %id, attempts, error = %error, "load failed");
            return Err(PipelineError::LoadFailed {
                id: id.clone(),
                error,
                attempts,
            });
        }
    }

    /// One loader call, isolated in its own task so a panicking loader
    /// cannot leak a pool slot.
    async fn load_once(
        &self,
        id: &ImageId,
        loader: &Arc<dyn Loader>,
    ) -> Result<LoadedImage, LoadError> {
        let task_loader = loader.clone();
        let task_id = id.clone();
        let mut handle = tokio::spawn(async move { task_loader.load(&task_id).await });

        let joined = match self.inner.policy.load_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    handle.abort();
                    return Err(LoadError::timeout(format!(
                        "{} did not load within {:?}",
                        id, limit
                    )));
                }
            },
            None => handle.await,
        };

        joined.unwrap_or_else(|e| Err(LoadError::decode(format!("loader for {} aborted: {}", id, e))))
    }

    async fn record_attempt(&self, id: &ImageId, attempts: u32) {
        let mut state = self.inner.state.lock().await;
        if let Some(pending) = state.pending.get_mut(id) {
            pending.attempts = attempts;
        }
    }

    /// Whether anyone still wants the result of the load for `id`.
    async fn has_interest(&self, id: &ImageId) -> bool {
        let mut state = self.inner.state.lock().await;
        let Some(pending) = state.pending.get_mut(id) else {
            return false;
        };
        pending.is_wanted() || (self.inner.policy.cache_discarded_results && pending.store_result)
    }

    async fn complete(&self, id: &ImageId, outcome: Result<LoadedImage, PipelineError>) {
        if let Err(error) = &outcome {
            if !matches!(error, PipelineError::Cancelled(_)) {
                self.inner.events.publish(PipelineEvent::LoadFailed {
                    id: id.clone(),
                    error: error.clone(),
                });
            }
        }

        let store_first = {
            let mut state = self.inner.state.lock().await;
            let Some(pending) = state.pending.get_mut(id) else {
                return;
            };

            let keep = pending.is_wanted()
                || (self.inner.policy.cache_discarded_results
                    && pending.store_result
                    && outcome.is_ok());
            if !keep {
                let attempts = pending.attempts;
                state.finish(id);
                let started = state.dispatch();
                drop(state);

                debug!(id = %id, attempts, "no waiters left, discarding load result");
                self.spawn_loads(started);
                return;
            }
            pending.store_result
        };

        // The request stays pending while the result is stored, so late
        // requesters join it instead of loading again.
        let mut result = match &outcome {
            Ok(loaded) if store_first => self.inner.store.store(id, loaded.clone()).await,
            Ok(loaded) => Ok(loaded.payload.clone()),
            Err(e) => Err(e.clone()),
        };

        let (waiters, started) = {
            let mut state = self.inner.state.lock().await;
            let pending = state.finish(id);

            // A storing request joined after the decision above. Scheduler
            // then cache is the permitted lock order.
            if let (Some(pending), Ok(loaded)) = (&pending, &outcome) {
                if pending.store_result && !store_first {
                    result = self.inner.store.store(id, loaded.clone()).await;
                }
            }

            let waiters = pending.map(|pending| pending.waiters).unwrap_or_default();
            (waiters, state.dispatch())
        };

        match &result {
            Ok(payload) => debug!(
                id = %id,
                bytes = payload.len(),
                waiters = waiters.len(),
                "load completed"
            ),
            Err(e) => debug!(id = %id, error = %e, waiters = waiters.len(), "load failed"),
        }

        for (_, waiter) in waiters {
            let _ = waiter.send(result.clone());
        }

        self.spawn_loads(started);
    }
}

// =============================================================================
// Tests
// =============================================================================
