//! Cache behavior under pipeline load.
//!
//! Tests verify:
//! - Displayed (acquired) images survive eviction pressure from new loads
//! - Least recently accessed images are evicted first
//! - Budget holds across long load sequences

use std::time::Duration;

use image_feed::{CacheError, ImageCache, ImageId, PipelineError, INTERACTION_POOL, PREFETCH_POOL};

use super::test_utils::{mock_id, pipeline_with, single_pool_config, TrackingMockLoader};

#[tokio::test]
async fn test_round_trip_updates_access_time() {
    let cache = ImageCache::with_max_bytes(1024);
    let id = ImageId::new("web:https://pacs/slice-1");
    let payload = bytes::Bytes::from_static(b"pixels");

    let stored = cache.put(id.clone(), payload.clone(), 6).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let fetched = cache.get(&id).await.unwrap();

    assert_eq!(fetched.payload, payload);
    assert_eq!(fetched.loaded_at, stored.loaded_at);
    assert!(fetched.last_accessed_at > stored.last_accessed_at);
}

#[tokio::test]
async fn test_least_recently_accessed_evicted_by_load() {
    let loader = TrackingMockLoader::new(100);
    let pipeline = pipeline_with(loader.clone(), single_pool_config(200, INTERACTION_POOL, 2)).await;

    let a = mock_id("a");
    let b = mock_id("b");
    pipeline.load_and_cache(a.clone(), INTERACTION_POOL, 0).await.unwrap();
    pipeline.load_and_cache(b.clone(), INTERACTION_POOL, 0).await.unwrap();

    // Touch a then b so a is the older access
    pipeline.get(&a).await.unwrap();
    pipeline.get(&b).await.unwrap();

    pipeline.load_and_cache(mock_id("c"), INTERACTION_POOL, 0).await.unwrap();

    assert!(!pipeline.has(&a).await);
    assert!(pipeline.has(&b).await);
    assert!(pipeline.has(&mock_id("c")).await);
    assert_eq!(pipeline.cache_stats().await.evictions, 1);
}

#[tokio::test]
async fn test_displayed_image_survives_prefetch_flood() {
    let loader = TrackingMockLoader::new(100);
    let pipeline = pipeline_with(loader.clone(), single_pool_config(300, PREFETCH_POOL, 2)).await;

    let on_screen = mock_id("on-screen");
    pipeline.load_and_cache(on_screen.clone(), PREFETCH_POOL, 0).await.unwrap();
    pipeline.acquire(&on_screen).await.unwrap();

    for i in 0..20 {
        pipeline
            .load_and_cache(mock_id(&format!("prefetch-{}", i)), PREFETCH_POOL, -1)
            .await
            .unwrap();
        let stats = pipeline.cache_stats().await;
        assert!(stats.bytes_used <= stats.max_bytes);
        assert!(pipeline.has(&on_screen).await);
    }

    assert_eq!(pipeline.release(&on_screen).await.unwrap(), 0);
}

#[tokio::test]
async fn test_load_rejected_while_protected_entries_fill_budget() {
    let loader = TrackingMockLoader::new(100);
    let pipeline = pipeline_with(loader.clone(), single_pool_config(200, INTERACTION_POOL, 1)).await;

    for name in ["left", "right"] {
        let id = mock_id(name);
        pipeline.load_and_cache(id.clone(), INTERACTION_POOL, 0).await.unwrap();
        pipeline.acquire(&id).await.unwrap();
    }

    let err = pipeline
        .load_and_cache(mock_id("third"), INTERACTION_POOL, 0)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Cache(CacheError::OversizedEntry { .. })
    ));

    // Free one viewport and the load goes through
    pipeline.release(&mock_id("left")).await.unwrap();
    pipeline
        .load_and_cache(mock_id("third"), INTERACTION_POOL, 0)
        .await
        .unwrap();
    assert!(!pipeline.has(&mock_id("left")).await);
    assert!(pipeline.has(&mock_id("right")).await);
}

#[tokio::test]
async fn test_shrunk_budget_with_protected_deficit() {
    let loader = TrackingMockLoader::new(100);
    let pipeline = pipeline_with(loader.clone(), single_pool_config(1000, INTERACTION_POOL, 4)).await;

    for i in 0..5 {
        pipeline
            .load_and_cache(mock_id(&i.to_string()), INTERACTION_POOL, 0)
            .await
            .unwrap();
    }
    pipeline.acquire(&mock_id("0")).await.unwrap();
    pipeline.acquire(&mock_id("1")).await.unwrap();

    pipeline.set_max_bytes(150).await.unwrap();
    let stats = pipeline.cache_stats().await;
    assert_eq!(stats.entries, 2);
    assert_eq!(stats.bytes_used, 200);
    assert_eq!(stats.protected_entries, 2);

    // Releasing brings usage back under the new budget
    pipeline.release(&mock_id("0")).await.unwrap();
    let stats = pipeline.cache_stats().await;
    assert!(stats.bytes_used <= 150);
    assert!(pipeline.has(&mock_id("1")).await);
}

#[tokio::test]
async fn test_budget_holds_over_long_sequence() {
    let loader = TrackingMockLoader::new(0);
    let cache = ImageCache::with_max_bytes(1000);

    // Deterministic pseudo-random sizes and operations
    let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
    let mut next = || {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        seed
    };

    let mut protected: Vec<ImageId> = Vec::new();
    for step in 0..500 {
        let roll = next();
        let id = mock_id(&format!("{}", roll % 40));
        match roll % 5 {
            0 if protected.len() < 3 => {
                if cache.acquire(&id).await.is_ok() {
                    protected.push(id);
                }
            }
            1 if !protected.is_empty() => {
                let id = protected.remove((roll as usize / 5) % protected.len());
                cache.release(&id).await.unwrap();
            }
            2 => {
                cache.delete(&id).await;
                protected.retain(|p| p != &id);
            }
            _ => {
                let size = (next() % 400) as usize + 1;
                let _ = cache.put(id, loader.payload_for(&mock_id("x")), size).await;
            }
        }

        let stats = cache.stats().await;
        if stats.bytes_used > stats.max_bytes {
            assert_eq!(
                stats.entries, stats.protected_entries,
                "over budget with unprotected entries at step {}",
                step
            );
        }
    }
}

#[tokio::test]
async fn test_deleted_entry_is_reloaded() {
    let loader = TrackingMockLoader::new(10);
    let pipeline = pipeline_with(loader.clone(), single_pool_config(1000, INTERACTION_POOL, 1)).await;
    let id = mock_id("invalidated");

    pipeline.load_and_cache(id.clone(), INTERACTION_POOL, 0).await.unwrap();
    pipeline.acquire(&id).await.unwrap();
    assert!(pipeline.delete(&id).await.is_some());

    assert_eq!(
        pipeline.release(&id).await,
        Err(CacheError::NotCached(id.clone()))
    );

    pipeline.load_and_cache(id.clone(), INTERACTION_POOL, 0).await.unwrap();
    assert_eq!(loader.calls_for(&id).await, 2);
}

#[tokio::test]
async fn test_purge_then_reload() {
    let loader = TrackingMockLoader::new(10);
    let pipeline = pipeline_with(loader.clone(), single_pool_config(1000, INTERACTION_POOL, 1)).await;

    for i in 0..3 {
        let id = mock_id(&i.to_string());
        pipeline.load_and_cache(id.clone(), INTERACTION_POOL, 0).await.unwrap();
        pipeline.acquire(&id).await.unwrap();
    }
    pipeline.purge().await;

    let stats = pipeline.cache_stats().await;
    assert_eq!(stats.entries, 0);
    assert_eq!(stats.bytes_used, 0);

    pipeline.load_and_cache(mock_id("0"), INTERACTION_POOL, 0).await.unwrap();
    assert_eq!(loader.call_count(), 4);
}
