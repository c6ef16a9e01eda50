//! Test utilities for integration tests.
//!
//! Provides a mock loader that records every call, can hold loads until the
//! test releases them, and can be scripted to fail.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};

use image_feed::{
    ImageId, ImagePipeline, LoadError, LoadedImage, Loader, LoaderRegistry, PipelineConfig,
    PoolConfig,
};

// =============================================================================
// Tracking Mock Loader
// =============================================================================

/// A mock loader that tracks all load calls.
///
/// Payloads are `size` bytes filled with the first byte of the locator, so
/// tests can tell payloads of different identities apart.
pub struct TrackingMockLoader {
    size: usize,
    call_count: AtomicUsize,
    calls: RwLock<Vec<ImageId>>,
    gate: Semaphore,
    failures: RwLock<HashMap<ImageId, VecDeque<LoadError>>>,
}

impl TrackingMockLoader {
    /// Loads complete as soon as they start.
    pub fn new(size: usize) -> Arc<Self> {
        Arc::new(Self::with_permits(size, Semaphore::MAX_PERMITS))
    }

    /// Loads block until [`release`](Self::release) lets them through.
    pub fn gated(size: usize) -> Arc<Self> {
        Arc::new(Self::with_permits(size, 0))
    }

    fn with_permits(size: usize, permits: usize) -> Self {
        Self {
            size,
            call_count: AtomicUsize::new(0),
            calls: RwLock::new(Vec::new()),
            gate: Semaphore::new(permits),
            failures: RwLock::new(HashMap::new()),
        }
    }

    /// Make the next load of `id` fail with `error`. Queued failures are
    /// used in order.
    pub async fn fail_next(&self, id: &ImageId, error: LoadError) {
        self.failures
            .write()
            .await
            .entry(id.clone())
            .or_default()
            .push_back(error);
    }

    /// Let `n` held loads finish.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    pub async fn get_calls(&self) -> Vec<ImageId> {
        self.calls.read().await.clone()
    }

    pub async fn calls_for(&self, id: &ImageId) -> usize {
        self.calls.read().await.iter().filter(|c| *c == id).count()
    }

    /// Wait until at least `n` loads have started.
    pub async fn wait_for_calls(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.call_count() < n {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("loader was not called in time");
    }

    pub fn payload_for(&self, id: &ImageId) -> Bytes {
        let fill = id.locator().bytes().next().unwrap_or(0);
        Bytes::from(vec![fill; self.size])
    }
}

#[async_trait]
impl Loader for TrackingMockLoader {
    async fn load(&self, id: &ImageId) -> Result<LoadedImage, LoadError> {
        self.calls.write().await.push(id.clone());
        self.call_count.fetch_add(1, Ordering::SeqCst);

        self.gate
            .acquire()
            .await
            .map_err(|_| LoadError::cancelled())?
            .forget();

        if let Some(error) = self
            .failures
            .write()
            .await
            .get_mut(id)
            .and_then(|queue| queue.pop_front())
        {
            return Err(error);
        }

        Ok(LoadedImage::new(self.payload_for(id), self.size))
    }
}

// =============================================================================
// Pipeline Helpers
// =============================================================================

/// Identity served by the mock loader.
pub fn mock_id(locator: &str) -> ImageId {
    ImageId::new(format!("mock:{}", locator))
}

/// Build a pipeline with `loader` registered under `mock:`.
pub async fn pipeline_with(loader: Arc<TrackingMockLoader>, config: PipelineConfig) -> ImagePipeline {
    let registry = Arc::new(LoaderRegistry::new());
    registry.register("mock", loader).await;
    ImagePipeline::from_config(&config, registry)
        .await
        .expect("valid test config")
}

/// Config with the given budget and a single pool.
pub fn single_pool_config(max_cache_bytes: usize, pool: &str, max_concurrency: usize) -> PipelineConfig {
    PipelineConfig {
        max_cache_bytes,
        pools: vec![PoolConfig::new(pool, max_concurrency)],
        ..Default::default()
    }
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn eventually<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
