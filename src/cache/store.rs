//! Memory-bounded store for decoded image and volume buffers.
//!
//! Entries are kept in access order (an unbounded [`LruCache`] is used
//! purely for its ordering) and the budget is enforced by byte size, not
//! entry count. Entries with a non-zero reference count are protected and
//! never chosen for eviction.
//!
//! # Budget
//!
//! The sum of entry sizes never exceeds `max_bytes` unless every resident
//! entry is protected. That deficit can only arise from shrinking the
//! budget or from acquiring entries; it is paid back as soon as an entry is
//! released.
//!
//! Additions, removals and refused puts are published on the cache's
//! [`EventBus`].

use std::time::Instant;

use bytes::Bytes;
use lru::LruCache;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{CacheError, ConfigError};
use crate::events::{EventBus, PipelineEvent, RemovalReason};
use crate::identity::ImageId;

/// Default cache budget: 512MB
pub const DEFAULT_MAX_CACHE_BYTES: usize = 512 * 1024 * 1024;

// =============================================================================
// Entries
// =============================================================================

struct CacheEntry {
    payload: Bytes,
    size_in_bytes: usize,
    loaded_at: Instant,
    last_accessed_at: Instant,
    ref_count: u32,
}

impl CacheEntry {
    fn snapshot(&self, id: &ImageId) -> CachedImage {
        CachedImage {
            id: id.clone(),
            payload: self.payload.clone(),
            size_in_bytes: self.size_in_bytes,
            loaded_at: self.loaded_at,
            last_accessed_at: self.last_accessed_at,
            ref_count: self.ref_count,
        }
    }
}

/// A view of a cached entry.
///
/// The payload is a shared, read-only handle on the buffer owned by the
/// cache; holding it does not protect the entry from eviction. Use
/// [`ImageCache::acquire`] for that.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedImage {
    pub id: ImageId,
    pub payload: Bytes,
    /// Size declared by the loader, used for budget accounting
    pub size_in_bytes: usize,
    pub loaded_at: Instant,
    pub last_accessed_at: Instant,
    pub ref_count: u32,
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub entries: usize,
    /// Entries holding a volume rather than a single image
    pub volume_entries: usize,
    pub protected_entries: usize,
    pub bytes_used: usize,
    pub max_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub rejections: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

// =============================================================================
// Cache State
// =============================================================================

struct CacheState {
    /// Most recently accessed at the front, eviction candidates at the back
    entries: LruCache<ImageId, CacheEntry>,
    bytes_used: usize,
    max_bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    rejections: u64,
    events: EventBus,
}

impl CacheState {
    fn protected_bytes_excluding(&self, id: &ImageId) -> usize {
        self.entries
            .iter()
            .filter(|(key, entry)| entry.ref_count > 0 && *key != id)
            .map(|(_, entry)| entry.size_in_bytes)
            .sum()
    }

    /// Evict the least recently accessed unprotected entry.
    ///
    /// Entries never touched since insertion keep insertion order, so ties
    /// in access time fall back to the earliest load.
    fn evict_one(&mut self) -> Option<ImageId> {
        let victim = self
            .entries
            .iter()
            .rev()
            .find(|(_, entry)| entry.ref_count == 0)
            .map(|(id, _)| id.clone())?;

        let entry = self.entries.pop(&victim)?;
        self.bytes_used = self.bytes_used.saturating_sub(entry.size_in_bytes);
        self.evictions += 1;
        debug!(
            id = %victim,
            size = entry.size_in_bytes,
            bytes_used = self.bytes_used,
            "evicted cache entry"
        );
        self.events.publish(PipelineEvent::EntryRemoved {
            id: victim.clone(),
            size_in_bytes: entry.size_in_bytes,
            reason: RemovalReason::Evicted,
        });
        Some(victim)
    }

    /// Evict until usage fits `target`, or only protected entries remain.
    fn evict_down_to(&mut self, target: usize) -> usize {
        let mut evicted = 0;
        while self.bytes_used > target {
            if self.evict_one().is_none() {
                break;
            }
            evicted += 1;
        }
        evicted
    }

    fn admit(
        &mut self,
        id: ImageId,
        payload: Bytes,
        size_in_bytes: usize,
    ) -> Result<CachedImage, CacheError> {
        let protected_bytes = self.protected_bytes_excluding(&id);
        if protected_bytes.saturating_add(size_in_bytes) > self.max_bytes {
            self.rejections += 1;
            self.events.publish(PipelineEvent::CacheFull {
                id: id.clone(),
                size_in_bytes,
                max_bytes: self.max_bytes,
            });
            return Err(CacheError::OversizedEntry {
                id,
                size: size_in_bytes,
                max_bytes: self.max_bytes,
                protected_bytes,
            });
        }

        // A replaced entry keeps its holders.
        let ref_count = match self.entries.pop(&id) {
            Some(old) => {
                self.bytes_used = self.bytes_used.saturating_sub(old.size_in_bytes);
                old.ref_count
            }
            None => 0,
        };

        let room = self.max_bytes - size_in_bytes;
        self.evict_down_to(room);

        let now = Instant::now();
        let entry = CacheEntry {
            payload,
            size_in_bytes,
            loaded_at: now,
            last_accessed_at: now,
            ref_count,
        };
        let snapshot = entry.snapshot(&id);
        self.entries.put(id.clone(), entry);
        self.bytes_used += size_in_bytes;
        self.events.publish(PipelineEvent::EntryAdded { id, size_in_bytes });

        Ok(snapshot)
    }
}

// =============================================================================
// Image Cache
// =============================================================================

/// Byte-budgeted cache of decoded image and volume buffers.
///
/// All operations go through a single mutex, so a put and its evictions are
/// never observed half-applied. The cache is shared across tasks via `Arc`.
///
/// # Example
///
/// ```
/// use bytes::Bytes;
/// use image_feed::cache::ImageCache;
/// use image_feed::ImageId;
///
/// #[tokio::main]
/// async fn main() {
///     let cache = ImageCache::with_max_bytes(1024);
///     let id = ImageId::new("web:https://example.com/1.jpg");
///
///     cache.put(id.clone(), Bytes::from(vec![0u8; 100]), 100).await.unwrap();
///
///     let entry = cache.get(&id).await.unwrap();
///     assert_eq!(entry.size_in_bytes, 100);
/// }
/// ```
pub struct ImageCache {
    state: Mutex<CacheState>,
    events: EventBus,
}

impl ImageCache {
    /// Create a cache with the default budget (512MB).
    pub fn new() -> Self {
        Self::with_max_bytes(DEFAULT_MAX_CACHE_BYTES)
    }

    pub fn with_max_bytes(max_bytes: usize) -> Self {
        Self::with_events(max_bytes, EventBus::default())
    }

    /// A cache that publishes to an existing bus.
    pub fn with_events(max_bytes: usize, events: EventBus) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: LruCache::unbounded(),
                bytes_used: 0,
                max_bytes,
                hits: 0,
                misses: 0,
                evictions: 0,
                rejections: 0,
                events: events.clone(),
            }),
            events,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Look up an entry, marking it as recently accessed.
    pub async fn get(&self, id: &ImageId) -> Option<CachedImage> {
        let mut state = self.state.lock().await;
        let snapshot = state.entries.get_mut(id).map(|entry| {
            entry.last_accessed_at = Instant::now();
            entry.snapshot(id)
        });
        match snapshot {
            Some(_) => state.hits += 1,
            None => state.misses += 1,
        }
        snapshot
    }

    /// Look up a volume by its identity string.
    pub async fn get_volume(&self, volume_id: &str) -> Option<CachedImage> {
        self.get(&ImageId::volume(volume_id)).await
    }

    /// Check residency without touching access order or statistics.
    pub async fn has(&self, id: &ImageId) -> bool {
        self.state.lock().await.entries.contains(id)
    }

    /// Store a payload, evicting unprotected entries as needed.
    ///
    /// Rejected with [`CacheError::OversizedEntry`] when the payload cannot
    /// fit even after every unprotected entry is gone; in that case nothing
    /// is evicted. Storing an identity that is already cached replaces it
    /// and keeps its reference count.
    pub async fn put(
        &self,
        id: ImageId,
        payload: Bytes,
        size_in_bytes: usize,
    ) -> Result<CachedImage, CacheError> {
        let mut state = self.state.lock().await;
        state.admit(id, payload, size_in_bytes)
    }

    /// Protect an entry from eviction and return its payload.
    pub async fn acquire(&self, id: &ImageId) -> Result<Bytes, CacheError> {
        let mut state = self.state.lock().await;
        let entry = state
            .entries
            .get_mut(id)
            .ok_or_else(|| CacheError::NotCached(id.clone()))?;
        entry.ref_count += 1;
        entry.last_accessed_at = Instant::now();
        Ok(entry.payload.clone())
    }

    /// Drop one protection. Returns the remaining reference count.
    ///
    /// Releasing an entry nobody holds is [`CacheError::InvalidState`].
    pub async fn release(&self, id: &ImageId) -> Result<u32, CacheError> {
        let mut state = self.state.lock().await;
        let entry = state
            .entries
            .peek_mut(id)
            .ok_or_else(|| CacheError::NotCached(id.clone()))?;

        if entry.ref_count == 0 {
            return Err(CacheError::InvalidState {
                id: id.clone(),
                message: "release without matching acquire".to_string(),
            });
        }
        entry.ref_count -= 1;
        let remaining = entry.ref_count;

        if remaining == 0 && state.bytes_used > state.max_bytes {
            let max_bytes = state.max_bytes;
            state.evict_down_to(max_bytes);
        }

        Ok(remaining)
    }

    /// Remove an entry regardless of its reference count.
    pub async fn delete(&self, id: &ImageId) -> Option<CachedImage> {
        let mut state = self.state.lock().await;
        let entry = state.entries.pop(id)?;
        state.bytes_used = state.bytes_used.saturating_sub(entry.size_in_bytes);
        state.events.publish(PipelineEvent::EntryRemoved {
            id: id.clone(),
            size_in_bytes: entry.size_in_bytes,
            reason: RemovalReason::Deleted,
        });
        Some(entry.snapshot(id))
    }

    /// Change the budget, evicting unprotected entries down to it.
    ///
    /// Returns the number of entries evicted. When only protected entries
    /// remain, usage may stay above the new budget until they are released.
    pub async fn set_max_bytes(&self, max_bytes: usize) -> Result<usize, ConfigError> {
        if max_bytes == 0 {
            return Err(ConfigError::ZeroBudget);
        }
        let mut state = self.state.lock().await;
        state.max_bytes = max_bytes;
        let evicted = state.evict_down_to(max_bytes);
        if state.bytes_used > max_bytes {
            debug!(
                bytes_used = state.bytes_used,
                max_bytes, "cache over budget, remaining entries are protected"
            );
        }
        Ok(evicted)
    }

    /// Drop every entry, protected or not.
    pub async fn purge(&self) {
        let mut state = self.state.lock().await;
        while let Some((id, entry)) = state.entries.pop_lru() {
            state.events.publish(PipelineEvent::EntryRemoved {
                id,
                size_in_bytes: entry.size_in_bytes,
                reason: RemovalReason::Purged,
            });
        }
        state.bytes_used = 0;
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.entries.is_empty()
    }

    /// Total bytes currently accounted to resident entries.
    pub async fn usage(&self) -> usize {
        self.state.lock().await.bytes_used
    }

    pub async fn max_bytes(&self) -> usize {
        self.state.lock().await.max_bytes
    }

    pub async fn stats(&self) -> CacheStats {
        let state = self.state.lock().await;
        CacheStats {
            entries: state.entries.len(),
            volume_entries: state.entries.iter().filter(|(id, _)| id.is_volume()).count(),
            protected_entries: state
                .entries
                .iter()
                .filter(|(_, entry)| entry.ref_count > 0)
                .count(),
            bytes_used: state.bytes_used,
            max_bytes: state.max_bytes,
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            rejections: state.rejections,
        }
    }
}

impl Default for ImageCache {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
