//! image-feed - load images through the cache pipeline from the command line.
//!
//! Builds a pipeline with the file loader (and the S3 loader when a bucket
//! is configured), loads the requested identities concurrently and reports
//! per-identity results plus cache and pool statistics.

use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use image_feed::{
    config::{Cli, Command, LoadArgs},
    create_s3_client, FileLoader, ImagePipeline, LoaderRegistry, PipelineEvent, ResourceKind,
    S3Loader,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.into_command() {
        Command::Load(args) => run_load(args).await,
    }
}

// =============================================================================
// Load Command
// =============================================================================

async fn run_load(args: LoadArgs) -> ExitCode {
    init_logging(args.verbose);

    let config = match args.pipeline_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    info!("Configuration:");
    info!("  Cache budget: {} bytes", config.max_cache_bytes);
    for pool in &config.pools {
        info!("  Pool {}: {} concurrent", pool.name, pool.max_concurrency);
    }
    info!("  Retry limit: {}", config.retry_limit);
    if config.cache_discarded_results {
        info!("  Discarded results: cached");
    }

    let registry = build_registry(&args).await;
    let pipeline = match ImagePipeline::from_config(&config, registry).await {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    spawn_event_log(pipeline.subscribe());

    let ids = args.image_ids();
    let kind = if args.volume { "volume" } else { "image" };
    info!("Loading {} {}(s) via pool {}", ids.len(), kind, args.pool);

    let started = Instant::now();
    let mut handles = Vec::with_capacity(ids.len());
    for id in ids {
        let pipeline = pipeline.clone();
        let pool = args.pool.clone();
        let priority = args.priority;
        let no_cache = args.no_cache;
        handles.push(tokio::spawn(async move {
            let result = if no_cache {
                pipeline.load(id.clone(), &pool, priority).await
            } else {
                pipeline.load_and_cache(id.clone(), &pool, priority).await
            };
            (id, result)
        }));
    }

    let mut failures = 0usize;
    for handle in handles {
        match handle.await {
            Ok((id, Ok(payload))) => info!("  {} -> {} bytes", id, payload.len()),
            Ok((id, Err(e))) => {
                failures += 1;
                warn!("  {} -> {}", id, e);
            }
            Err(e) => {
                failures += 1;
                error!("  load task failed: {}", e);
            }
        }
    }

    report_stats(&pipeline, started).await;

    if failures > 0 {
        error!("{} load(s) failed", failures);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

/// Register the file loader, and the S3 loader when a bucket is set.
///
/// Both serve raw bytes, so they are registered for images and volumes.
async fn build_registry(args: &LoadArgs) -> Arc<LoaderRegistry> {
    let registry = Arc::new(LoaderRegistry::new());

    let file_loader = Arc::new(match &args.file_root {
        Some(root) => FileLoader::with_root(root),
        None => FileLoader::new(),
    });
    for kind in [ResourceKind::Image, ResourceKind::Volume] {
        registry.register_for(kind, "file", file_loader.clone()).await;
    }

    if let Some(ref bucket) = args.s3_bucket {
        let client = create_s3_client(args.s3_endpoint.as_deref(), &args.s3_region).await;
        let mut loader = S3Loader::new(client, bucket.clone());
        if let Some(ref prefix) = args.s3_prefix {
            loader = loader.with_prefix(prefix.clone());
        }
        let loader = Arc::new(loader);
        for kind in [ResourceKind::Image, ResourceKind::Volume] {
            registry.register_for(kind, "s3", loader.clone()).await;
        }
        info!("  S3 bucket: {} ({})", bucket, args.s3_region);
        if let Some(ref endpoint) = args.s3_endpoint {
            info!("  S3 endpoint: {}", endpoint);
        }
    }

    registry
}

/// Log cache and load events as they happen.
fn spawn_event_log(mut events: broadcast::Receiver<PipelineEvent>) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(PipelineEvent::EntryAdded { id, size_in_bytes }) => {
                    debug!(id = %id, size_in_bytes, "cached");
                }
                Ok(PipelineEvent::EntryRemoved {
                    id,
                    size_in_bytes,
                    reason,
                }) => debug!(id = %id, size_in_bytes, ?reason, "removed from cache"),
                Ok(PipelineEvent::CacheFull {
                    id,
                    size_in_bytes,
                    max_bytes,
                }) => warn!(id = %id, size_in_bytes, max_bytes, "cache full"),
                Ok(PipelineEvent::LoadFailed { id, error }) => {
                    debug!(id = %id, error = %error, "load failed");
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event log lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

async fn report_stats(pipeline: &ImagePipeline, started: Instant) {
    let cache = pipeline.cache_stats().await;
    info!("");
    info!("Finished in {:?}", started.elapsed());
    info!(
        "  Cache: {} entries ({} volumes), {}/{} bytes, {} hits, {} misses, {} evictions, {} rejections",
        cache.entries,
        cache.volume_entries,
        cache.bytes_used,
        cache.max_bytes,
        cache.hits,
        cache.misses,
        cache.evictions,
        cache.rejections
    );
    for pool in pipeline.pool_stats().await {
        info!(
            "  Pool {}: {} queued, {} in flight (max {})",
            pool.name, pool.queued, pool.in_flight, pool.max_concurrency
        );
    }
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "image_feed=debug"
    } else {
        "image_feed=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
