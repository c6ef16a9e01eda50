//! Request pool manager tests through the public API.
//!
//! Tests verify:
//! - Priority and FIFO ordering within a pool
//! - Concurrency caps hold under load, including after a pool is resized
//! - Pools are independent of each other

use std::sync::Arc;
use std::time::Duration;

use image_feed::{
    EventBus, LoaderRegistry, PassThrough, PipelineConfig, PoolConfig, RequestPoolManager,
    SchedulerPolicy, INTERACTION_POOL, PREFETCH_POOL, THUMBNAIL_POOL,
};

use super::test_utils::{mock_id, pipeline_with, single_pool_config, TrackingMockLoader};

async fn manager(loader: Arc<TrackingMockLoader>, pools: &[(&str, usize)]) -> RequestPoolManager {
    let registry = Arc::new(LoaderRegistry::new());
    registry.register("mock", loader).await;
    let manager = RequestPoolManager::with_store(
        registry,
        Arc::new(PassThrough),
        SchedulerPolicy::default(),
        EventBus::default(),
    );
    for (name, max) in pools {
        manager.configure_pool(name, *max).await.unwrap();
    }
    manager
}

#[tokio::test]
async fn test_priority_beats_arrival_order() {
    let loader = TrackingMockLoader::gated(1);
    let pipeline = pipeline_with(loader.clone(), single_pool_config(1024, PREFETCH_POOL, 1)).await;

    let blocker = pipeline.request(mock_id("blocker"), PREFETCH_POOL, 0).await.unwrap();
    loader.wait_for_calls(1).await;

    // Arrive as [priority 1, priority 5]
    let low = pipeline.request(mock_id("low"), PREFETCH_POOL, 1).await.unwrap();
    let high = pipeline.request(mock_id("high"), PREFETCH_POOL, 5).await.unwrap();

    loader.release(3);
    for ticket in [blocker, low, high] {
        ticket.wait().await.unwrap();
    }

    assert_eq!(
        loader.get_calls().await,
        vec![mock_id("blocker"), mock_id("high"), mock_id("low")]
    );
}

#[tokio::test]
async fn test_mixed_priorities_drain_in_order() {
    let loader = TrackingMockLoader::gated(1);
    let pipeline = pipeline_with(loader.clone(), single_pool_config(1024, THUMBNAIL_POOL, 1)).await;

    let mut tickets = vec![pipeline.request(mock_id("blocker"), THUMBNAIL_POOL, 0).await.unwrap()];
    loader.wait_for_calls(1).await;

    for (name, priority) in [("a", 2), ("b", 7), ("c", 2), ("d", -1), ("e", 7)] {
        tickets.push(pipeline.request(mock_id(name), THUMBNAIL_POOL, priority).await.unwrap());
    }

    loader.release(tickets.len());
    for ticket in tickets {
        ticket.wait().await.unwrap();
    }

    let order: Vec<_> = ["blocker", "b", "e", "a", "c", "d"].iter().map(|n| mock_id(n)).collect();
    assert_eq!(loader.get_calls().await, order);
}

#[tokio::test]
async fn test_in_flight_never_exceeds_cap() {
    let loader = TrackingMockLoader::gated(1);
    let manager = manager(loader.clone(), &[(PREFETCH_POOL, 3)]).await;

    let mut tickets = Vec::new();
    for i in 0..10 {
        tickets.push(manager.request(mock_id(&i.to_string()), PREFETCH_POOL, 0).await.unwrap());
    }

    for done in 0..10 {
        let stats = manager.pool_stats(PREFETCH_POOL).await.unwrap();
        assert!(stats.in_flight <= 3, "in flight {} after {} done", stats.in_flight, done);
        loader.release(1);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    for ticket in tickets {
        ticket.wait().await.unwrap();
    }
    assert_eq!(loader.call_count(), 10);
}

#[tokio::test]
async fn test_shrinking_pool_keeps_running_loads() {
    let loader = TrackingMockLoader::gated(1);
    let manager = manager(loader.clone(), &[(INTERACTION_POOL, 3)]).await;

    let mut tickets = Vec::new();
    for i in 0..5 {
        tickets.push(manager.request(mock_id(&i.to_string()), INTERACTION_POOL, 0).await.unwrap());
    }
    loader.wait_for_calls(3).await;

    manager.configure_pool(INTERACTION_POOL, 1).await.unwrap();
    let stats = manager.pool_stats(INTERACTION_POOL).await.unwrap();
    assert_eq!(stats.in_flight, 3);
    assert_eq!(stats.max_concurrency, 1);

    // Two of the three running loads finish; still at or above the new cap
    loader.release(2);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(loader.call_count(), 3);

    loader.release(3);
    for ticket in tickets {
        ticket.wait().await.unwrap();
    }
    assert_eq!(loader.call_count(), 5);
}

#[tokio::test]
async fn test_saturated_pool_does_not_block_other_pools() {
    let blocked = TrackingMockLoader::gated(1);
    let config = PipelineConfig {
        pools: vec![
            PoolConfig::new(INTERACTION_POOL, 1),
            PoolConfig::new(PREFETCH_POOL, 1),
        ],
        ..Default::default()
    };
    let pipeline = pipeline_with(blocked.clone(), config).await;

    let stuck = pipeline.request(mock_id("stuck"), INTERACTION_POOL, 100).await.unwrap();
    let queued = pipeline.request(mock_id("queued"), INTERACTION_POOL, 100).await.unwrap();
    let background = pipeline.request(mock_id("background"), PREFETCH_POOL, -100).await.unwrap();
    blocked.wait_for_calls(2).await;

    let calls = blocked.get_calls().await;
    assert!(calls.contains(&mock_id("background")));
    assert!(!calls.contains(&mock_id("queued")));

    blocked.release(3);
    for ticket in [stuck, queued, background] {
        ticket.wait().await.unwrap();
    }
}

#[tokio::test]
async fn test_dedup_across_pools_uses_first_pool() {
    let loader = TrackingMockLoader::gated(1);
    let manager = manager(loader.clone(), &[(INTERACTION_POOL, 1), (PREFETCH_POOL, 1)]).await;

    let first = manager.request(mock_id("a"), PREFETCH_POOL, 0).await.unwrap();
    let second = manager.request(mock_id("a"), INTERACTION_POOL, 50).await.unwrap();
    loader.wait_for_calls(1).await;

    assert_eq!(manager.pool_stats(PREFETCH_POOL).await.unwrap().in_flight, 1);
    assert_eq!(manager.pool_stats(INTERACTION_POOL).await.unwrap().in_flight, 0);
    assert_eq!(manager.pending_count().await, 1);

    loader.release(1);
    assert_eq!(first.wait().await.unwrap(), second.wait().await.unwrap());
    assert_eq!(loader.call_count(), 1);
}

#[tokio::test]
async fn test_raising_priority_of_queued_request() {
    let loader = TrackingMockLoader::gated(1);
    let manager = manager(loader.clone(), &[(PREFETCH_POOL, 1)]).await;

    let blocker = manager.request(mock_id("blocker"), PREFETCH_POOL, 0).await.unwrap();
    loader.wait_for_calls(1).await;
    let a = manager.request(mock_id("a"), PREFETCH_POOL, 3).await.unwrap();
    let b = manager.request(mock_id("b"), PREFETCH_POOL, 3).await.unwrap();

    // Now on screen: b jumps ahead
    assert!(manager.set_priority(&mock_id("b"), 9).await);

    loader.release(3);
    for ticket in [blocker, a, b] {
        ticket.wait().await.unwrap();
    }
    assert_eq!(
        loader.get_calls().await,
        vec![mock_id("blocker"), mock_id("b"), mock_id("a")]
    );
}
