//! Cache-loader bridge.
//!
//! [`ImagePipeline`] is what viewports talk to. A request first checks the
//! cache; on a miss it goes through the request pool manager, and the
//! completed load is written to the cache once before every waiter is
//! resolved with the cached payload.
//!
//! Volumes go through the same path with identities built by
//! [`ImageId::volume`] and loaders from the registry's volume table. Cache
//! and load events are published on one [`EventBus`] shared by both halves.
//!
//! ```text
//!  load_and_cache(id)
//!        │
//!        ▼
//!   ImageCache::get ──hit──► payload
//!        │ miss
//!        ▼
//!   RequestPoolManager::request ──pending──► join existing waiters
//!        │ new
//!        ▼
//!   Pool queue ──► Loader ──► ImageCache::put ──► all waiters
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::cache::{CacheStats, CachedImage, ImageCache};
use crate::config::PipelineConfig;
use crate::error::{CacheError, ConfigError, PipelineError};
use crate::events::{EventBus, PipelineEvent};
use crate::identity::{ImageId, ResourceKind};
use crate::loader::{LoadedImage, Loader, LoaderRegistry};
use crate::scheduler::{
    LoadTicket, PoolStats, Priority, RequestPoolManager, ResultStore, SchedulerPolicy, WaiterToken,
};

// =============================================================================
// Cache as Result Store
// =============================================================================

#[async_trait]
impl ResultStore for ImageCache {
    async fn lookup(&self, id: &ImageId) -> Option<Bytes> {
        self.get(id).await.map(|entry| entry.payload)
    }

    async fn store(&self, id: &ImageId, loaded: LoadedImage) -> Result<Bytes, PipelineError> {
        let entry = self
            .put(id.clone(), loaded.payload, loaded.size_in_bytes)
            .await?;
        Ok(entry.payload)
    }
}

// =============================================================================
// Image Pipeline
// =============================================================================

/// Memory-bounded image cache fed by a prioritized, deduplicating loader
/// pipeline.
///
/// # Example
///
/// ```ignore
/// let registry = Arc::new(LoaderRegistry::new());
/// registry.register("file", Arc::new(FileLoader::new())).await;
///
/// let pipeline = ImagePipeline::from_config(&PipelineConfig::default(), registry).await?;
/// let payload = pipeline
///     .load_and_cache("file:/data/ct/slice-001.raw".into(), INTERACTION_POOL, 10)
///     .await?;
/// ```
#[derive(Clone)]
pub struct ImagePipeline {
    cache: Arc<ImageCache>,
    scheduler: RequestPoolManager,
}

impl ImagePipeline {
    /// Wire a cache and a loader registry together. No pools exist yet.
    ///
    /// Failed loads are published on the cache's event bus.
    pub fn new(cache: Arc<ImageCache>, registry: Arc<LoaderRegistry>, policy: SchedulerPolicy) -> Self {
        let events = cache.events().clone();
        let scheduler = RequestPoolManager::with_store(registry, cache.clone(), policy, events);
        Self { cache, scheduler }
    }

    /// Build a pipeline with the budget, pools and policy from `config`.
    pub async fn from_config(
        config: &PipelineConfig,
        registry: Arc<LoaderRegistry>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let cache = Arc::new(ImageCache::with_max_bytes(config.max_cache_bytes));
        let pipeline = Self::new(cache, registry, config.scheduler_policy());
        for pool in &config.pools {
            pipeline
                .configure_pool(&pool.name, pool.max_concurrency)
                .await?;
        }

        info!(
            max_cache_bytes = config.max_cache_bytes,
            pools = config.pools.len(),
            retry_limit = config.retry_limit,
            "image pipeline ready"
        );
        Ok(pipeline)
    }

    pub fn cache(&self) -> &Arc<ImageCache> {
        &self.cache
    }

    pub fn scheduler(&self) -> &RequestPoolManager {
        &self.scheduler
    }

    pub fn events(&self) -> &EventBus {
        self.cache.events()
    }

    /// Receive every cache and load event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.cache.events().subscribe()
    }

    // =========================================================================
    // Loaders and pools
    // =========================================================================

    /// Register an image `loader` for `scheme`, replacing any previous one.
    pub async fn register_loader(&self, scheme: impl Into<String>, loader: Arc<dyn Loader>) {
        self.register_for(ResourceKind::Image, scheme.into(), loader).await
    }

    /// Register a volume `loader` for `scheme`, replacing any previous one.
    pub async fn register_volume_loader(&self, scheme: impl Into<String>, loader: Arc<dyn Loader>) {
        self.register_for(ResourceKind::Volume, scheme.into(), loader).await
    }

    async fn register_for(&self, kind: ResourceKind, scheme: String, loader: Arc<dyn Loader>) {
        let registry = self.scheduler.registry();
        if registry.register_for(kind, scheme.clone(), loader).await.is_some() {
            warn!(scheme = %scheme, %kind, "replaced registered loader");
        } else {
            info!(scheme = %scheme, %kind, "registered loader");
        }
    }

    /// Image loader used for identities whose scheme has no registration.
    pub async fn set_fallback_loader(&self, loader: Arc<dyn Loader>) {
        if self.scheduler.registry().set_fallback(loader).await.is_some() {
            warn!("replaced fallback loader");
        }
    }

    /// Volume loader used for volume schemes with no registration.
    pub async fn set_volume_fallback_loader(&self, loader: Arc<dyn Loader>) {
        if self
            .scheduler
            .registry()
            .set_volume_fallback(loader)
            .await
            .is_some()
        {
            warn!("replaced volume fallback loader");
        }
    }

    pub async fn configure_pool(&self, name: &str, max_concurrency: usize) -> Result<(), ConfigError> {
        self.scheduler.configure_pool(name, max_concurrency).await
    }

    // =========================================================================
    // Loading
    // =========================================================================

    /// Return the payload for `id`, loading it through `pool` on a miss.
    ///
    /// Concurrent calls for the same identity share one load and one cache
    /// write. Once this returns `Ok`, the payload is in the cache (unless it
    /// was evicted by later activity).
    pub async fn load_and_cache(
        &self,
        id: ImageId,
        pool: &str,
        priority: Priority,
    ) -> Result<Bytes, PipelineError> {
        // A cache hit comes back as a ready ticket without touching a pool
        self.request(id, pool, priority).await?.wait().await
    }

    /// Return the payload for `id` without caching a fresh load.
    ///
    /// A cached copy is returned when there is one and a pending load of
    /// `id` is joined, so this still shares work with every other caller.
    /// A load started here hands its payload back without touching the
    /// cache.
    pub async fn load(
        &self,
        id: ImageId,
        pool: &str,
        priority: Priority,
    ) -> Result<Bytes, PipelineError> {
        self.scheduler
            .request_uncached(id, pool, priority)
            .await?
            .wait()
            .await
    }

    /// Load a volume through the volume loaders and cache it.
    pub async fn load_and_cache_volume(
        &self,
        volume_id: impl Into<Arc<str>>,
        pool: &str,
        priority: Priority,
    ) -> Result<Bytes, PipelineError> {
        self.load_and_cache(ImageId::volume(volume_id), pool, priority)
            .await
    }

    /// Like [`load_and_cache`](Self::load_and_cache) but hands back the
    /// ticket, so the caller can cancel its interest. Dropping the ticket
    /// also withdraws it.
    pub async fn request(
        &self,
        id: ImageId,
        pool: &str,
        priority: Priority,
    ) -> Result<LoadTicket, PipelineError> {
        self.scheduler.request(id, pool, priority).await
    }

    /// Reload `id` even if it is cached. The cached entry keeps serving
    /// reads until the new payload replaces it.
    pub async fn refresh(
        &self,
        id: ImageId,
        pool: &str,
        priority: Priority,
    ) -> Result<LoadTicket, PipelineError> {
        self.scheduler.request_refresh(id, pool, priority).await
    }

    /// Queue background loads for `ids`.
    ///
    /// Each identity gets its own result: one unknown scheme does not stop
    /// the rest from being queued. The loads go ahead even if the returned
    /// tickets are dropped; cancel a ticket to withdraw its load.
    pub async fn prefetch<I>(
        &self,
        ids: I,
        pool: &str,
        priority: Priority,
    ) -> Vec<Result<LoadTicket, PipelineError>>
    where
        I: IntoIterator<Item = ImageId>,
    {
        let mut tickets = Vec::new();
        for id in ids {
            tickets.push(self.scheduler.request_detached(id, pool, priority).await);
        }
        tickets
    }

    pub async fn cancel(&self, id: &ImageId, token: WaiterToken) -> bool {
        self.scheduler.cancel(id, token).await
    }

    /// Cancel the waiter behind `ticket`. Tickets resolved from the cache
    /// have nothing to cancel.
    pub async fn cancel_ticket(&self, ticket: &LoadTicket) -> bool {
        match ticket.token() {
            Some(token) => self.scheduler.cancel(ticket.id(), token).await,
            None => false,
        }
    }

    pub async fn set_priority(&self, id: &ImageId, priority: Priority) -> bool {
        self.scheduler.set_priority(id, priority).await
    }

    // =========================================================================
    // Cache access
    // =========================================================================

    pub async fn get(&self, id: &ImageId) -> Option<CachedImage> {
        self.cache.get(id).await
    }

    pub async fn get_volume(&self, volume_id: &str) -> Option<CachedImage> {
        self.cache.get_volume(volume_id).await
    }

    pub async fn has(&self, id: &ImageId) -> bool {
        self.cache.has(id).await
    }

    /// Protect `id` from eviction while it is on screen.
    pub async fn acquire(&self, id: &ImageId) -> Result<Bytes, CacheError> {
        self.cache.acquire(id).await
    }

    pub async fn release(&self, id: &ImageId) -> Result<u32, CacheError> {
        self.cache.release(id).await
    }

    pub async fn delete(&self, id: &ImageId) -> Option<CachedImage> {
        self.cache.delete(id).await
    }

    pub async fn set_max_bytes(&self, max_bytes: usize) -> Result<usize, ConfigError> {
        self.cache.set_max_bytes(max_bytes).await
    }

    pub async fn purge(&self) {
        self.cache.purge().await
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    pub async fn pool_stats(&self) -> Vec<PoolStats> {
        self.scheduler.all_pool_stats().await
    }
}

// =============================================================================
// Tests
// =============================================================================
