//! # image-feed
//!
//! Feeds a medical image viewer: a memory-bounded cache of decoded
//! image/volume buffers in front of a prioritized, deduplicating load
//! pipeline.
//!
//! Many viewports ask for overlapping data with different urgency
//! (interactive pan/zoom, thumbnails, background prefetch). The pipeline
//! guarantees that each identity is loaded at most once at a time, that
//! every caller asking for it gets the same result, and that the result is
//! written to the cache exactly once.
//!
//! ## Features
//!
//! - **Byte-budgeted cache**: LRU eviction among unprotected entries, with
//!   acquire/release protection for data on screen
//! - **Request pools**: named queues with independent concurrency caps,
//!   ordered by priority then arrival
//! - **Dedup**: concurrent requests for one identity share one load
//! - **Retry policy**: transient failures (network, timeout) retried up to
//!   a limit, permanent ones (decode, format) reported immediately
//! - **Pluggable loaders**: registered per identity scheme (`file:`, `s3:`,
//!   anything implementing [`Loader`]), with separate tables for images
//!   and volumes
//! - **Events**: cache additions, removals, refused puts and failed loads
//!   broadcast to any number of subscribers
//!
//! ## Architecture
//!
//! - [`loader`] - Loader trait, scheme registry and built-in loaders
//! - [`scheduler`] - Request pool manager
//! - [`cache`] - Image cache
//! - [`pipeline`] - Cache-loader bridge
//! - [`events`] - Cache and load notifications
//! - [`config`] - Configuration file and CLI types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use image_feed::{FileLoader, ImagePipeline, LoaderRegistry, PipelineConfig, INTERACTION_POOL};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = Arc::new(LoaderRegistry::new());
//!     registry.register("file", Arc::new(FileLoader::new())).await;
//!
//!     let pipeline = ImagePipeline::from_config(&PipelineConfig::default(), registry).await?;
//!     let payload = pipeline
//!         .load_and_cache("file:/data/ct/slice-001.raw".into(), INTERACTION_POOL, 10)
//!         .await?;
//!     println!("loaded {} bytes", payload.len());
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod identity;
pub mod loader;
pub mod pipeline;
pub mod scheduler;

// Re-export commonly used types
pub use cache::{CacheStats, CachedImage, ImageCache, DEFAULT_MAX_CACHE_BYTES};
pub use config::{parse_pool_spec, parse_size, Cli, Command, LoadArgs, PipelineConfig, PoolConfig};
pub use error::{CacheError, ConfigError, ErrorClass, LoadError, PipelineError};
pub use events::{EventBus, PipelineEvent, RemovalReason};
pub use identity::{ImageId, ResourceKind};
pub use loader::{create_s3_client, FileLoader, FnLoader, LoadedImage, Loader, LoaderRegistry, S3Loader};
pub use pipeline::ImagePipeline;
pub use scheduler::{
    LoadTicket, PassThrough, PoolStats, Priority, RequestPoolManager, ResultStore,
    SchedulerPolicy, WaiterToken, INTERACTION_POOL, PREFETCH_POOL, THUMBNAIL_POOL,
};
