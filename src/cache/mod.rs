//! Memory-resident cache of decoded images and volumes.
//!
//! The cache is the single shared mutable resource of the pipeline. Every
//! component reads and writes entries through [`ImageCache`]'s contract
//! (get, has, put, acquire, release, delete, set_max_bytes, purge); nothing
//! else holds the entry storage.
//!
//! # Eviction
//!
//! When a put needs room, the least recently accessed entry with a zero
//! reference count is evicted, one at a time, until the new entry fits.
//! Entries acquired by a viewport are never evicted.
//!
//! ```text
//!   most recent ──────────────────────────────► least recent
//!   [ d ]  [ a* ]  [ c ]  [ b* ]  [ e ]
//!                                   ▲ evicted first
//!   * = acquired (protected)
//! ```

mod store;

pub use store::{CacheStats, CachedImage, ImageCache, DEFAULT_MAX_CACHE_BYTES};
