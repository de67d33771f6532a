use std::time::Duration;

use coalescer::config::StoreConfig;
use coalescer::slot::MemoryStore;
use coalescer::{CacheStatus, HitKind, Request};

use crate::utils::*;

const CHUNKS: &[&str] = &["first ", "second ", "third"];

#[tokio::test]
async fn test_sequential_miss_then_hits() {
    let fetch = ChunkedFetch::immediate("hello");
    let (store, log) = store_with(MemoryStore::new(), fetch.clone(), StoreConfig::default());

    let (request, buffer, handle) = spawn_get(&store, "/hello");
    assert_eq!(handle.await.unwrap().unwrap(), CacheStatus::Miss);
    assert_eq!(buffer.text(), "hello");
    assert!(buffer.is_shutdown());
    assert_eq!(
        log.names_for(&request),
        [
            "bucket:new",
            "bucket:lock",
            "miss",
            "bucket:unlock",
            "bucket:release",
            "bucket:destroy"
        ]
    );

    for _ in 0..5 {
        let (request, buffer, handle) = spawn_get(&store, "/hello");
        assert_eq!(
            handle.await.unwrap().unwrap(),
            CacheStatus::Hit(HitKind::Classic)
        );
        assert_eq!(buffer.text(), "hello");
        assert_eq!(
            log.names_for(&request),
            ["bucket:new", "hit", "bucket:release", "bucket:destroy"]
        );
    }

    assert_eq!(fetch.calls(), 1);
    assert_eq!(log.count("miss"), 1);
    assert_eq!(log.hits(HitKind::Classic), 5);
    assert_eq!(store.live_buckets(), 0);
    log.assert_balanced();
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_requests_fetch_once() {
    let fetch = ChunkedFetch::new(CHUNKS, Duration::from_millis(10));
    let (store, log) = store_with(MemoryStore::new(), fetch.clone(), StoreConfig::default());

    let mut buffers = Vec::new();
    let mut handles = Vec::new();
    for _ in 0..20 {
        let (_, buffer, handle) = spawn_get(&store, "/popular");
        buffers.push(buffer);
        handles.push(handle);
    }

    let results = join_all(handles).await;
    assert_eq!(fetch.calls(), 1);

    let misses = results
        .iter()
        .filter(|r| matches!(r, Ok(CacheStatus::Miss)))
        .count();
    assert_eq!(misses, 1);
    assert!(results.iter().all(|r| r.is_ok()), "{results:?}");

    for buffer in &buffers {
        assert_eq!(buffer.text(), fetch.body());
    }
    assert_eq!(store.live_buckets(), 0);
    log.assert_balanced();
}

#[tokio::test(start_paused = true)]
async fn test_hot_and_deferred_waiters() {
    let fetch = ChunkedFetch::new(CHUNKS, Duration::from_millis(100));
    let slots = SlowLock::new(MemoryStore::new(), Duration::from_millis(100));
    let (store, log) = store_with(slots, fetch.clone(), StoreConfig::default());

    // t=0: the first request locks the key and waits for its slot until t=100
    let (_, first_buffer, first) = spawn_get(&store, "/scenario");

    // t=10: these queue up before the slot is acquired and join the broadcast
    tokio::time::sleep(Duration::from_millis(10)).await;
    let mut hot = Vec::new();
    for _ in 0..5 {
        hot.push(spawn_get(&store, "/scenario"));
    }

    // t=150: the fetch is streaming, these wait for it to complete
    tokio::time::sleep(Duration::from_millis(140)).await;
    let mut deferred = Vec::new();
    for _ in 0..5 {
        deferred.push(spawn_get(&store, "/scenario"));
    }

    assert_eq!(first.await.unwrap().unwrap(), CacheStatus::Miss);
    assert_eq!(first_buffer.text(), fetch.body());

    for (_, buffer, handle) in hot {
        assert_eq!(
            handle.await.unwrap().unwrap(),
            CacheStatus::Hit(HitKind::Hot)
        );
        assert_eq!(buffer.text(), fetch.body());
    }

    for (request, buffer, handle) in deferred {
        assert_eq!(
            handle.await.unwrap().unwrap(),
            CacheStatus::Hit(HitKind::Deferred)
        );
        assert_eq!(buffer.text(), fetch.body());
        // deferred requests start over once the key is unlocked
        assert_eq!(
            log.names_for(&request),
            [
                "bucket:get",
                "bucket:locked",
                "bucket:pending",
                "bucket:release",
                "bucket:new",
                "hit",
                "bucket:release",
                "bucket:destroy"
            ]
        );
    }

    assert_eq!(fetch.calls(), 1);
    assert_eq!(log.count("miss"), 1);
    assert_eq!(log.hits(HitKind::Hot), 5);
    assert_eq!(log.hits(HitKind::Deferred), 5);
    assert_eq!(log.hits(HitKind::Classic), 0);
    assert_eq!(store.live_buckets(), 0);
    log.assert_balanced();
}

#[tokio::test(start_paused = true)]
async fn test_fan_out_capacity() {
    let fetch = ChunkedFetch::new(CHUNKS, Duration::from_millis(100));
    let slots = SlowLock::new(MemoryStore::new(), Duration::from_millis(100));
    let config = StoreConfig {
        max_pending: 4,
        ..Default::default()
    };
    let (store, log) = store_with(slots, fetch.clone(), config);

    let (_, _, first) = spawn_get(&store, "/capacity");

    let mut waiting = Vec::new();
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(1)).await;
        waiting.push(spawn_get(&store, "/capacity"));
    }

    assert_eq!(first.await.unwrap().unwrap(), CacheStatus::Miss);

    // the storage slot and the driving request use up half of the capacity
    let mut statuses = Vec::new();
    for (_, buffer, handle) in waiting {
        statuses.push(handle.await.unwrap().unwrap());
        assert_eq!(buffer.text(), fetch.body());
    }
    assert_eq!(
        statuses,
        [
            CacheStatus::Hit(HitKind::Hot),
            CacheStatus::Hit(HitKind::Hot),
            CacheStatus::Hit(HitKind::Deferred),
            CacheStatus::Hit(HitKind::Deferred),
            CacheStatus::Hit(HitKind::Deferred),
        ]
    );

    assert_eq!(fetch.calls(), 1);
    assert_eq!(store.live_buckets(), 0);
    log.assert_balanced();
}

#[tokio::test(start_paused = true)]
async fn test_waiters_are_served_in_arrival_order() {
    let fetch = ChunkedFetch::new(CHUNKS, Duration::from_millis(100));
    let slots = SlowLock::new(MemoryStore::new(), Duration::from_millis(100));
    let (store, log) = store_with(slots, fetch.clone(), StoreConfig::default());

    let (_, _, first) = spawn_get(&store, "/fifo");

    let mut requests = Vec::new();
    let mut handles = Vec::new();
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(1)).await;
        let (request, _, handle) = spawn_get(&store, "/fifo");
        requests.push(request);
        handles.push(handle);
    }

    first.await.unwrap().unwrap();
    join_all(handles).await;

    let queued: Vec<_> = log
        .records()
        .into_iter()
        .filter(|r| r.name == "bucket:pending")
        .map(|r| r.request.id())
        .collect();
    let served: Vec<_> = log
        .records()
        .into_iter()
        .filter(|r| r.hit == Some(HitKind::Hot))
        .map(|r| r.request.id())
        .collect();
    let arrived: Vec<_> = requests.iter().map(Request::id).collect();

    assert_eq!(queued, arrived);
    assert_eq!(served, arrived);
}

#[tokio::test(start_paused = true)]
async fn test_reference_counts() {
    let fetch = ChunkedFetch::new(CHUNKS, Duration::from_millis(100));
    let slots = SlowLock::new(MemoryStore::new(), Duration::from_millis(100));
    let (store, log) = store_with(slots, fetch.clone(), StoreConfig::default());

    let (request, _, first) = spawn_get(&store, "/refs");
    let mut handles = Vec::new();
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(1)).await;
        handles.push(spawn_get(&store, "/refs").2);
    }

    // the driver and three waiters hold a reference each
    let stats = store.bucket_stats(request.key()).unwrap();
    assert_eq!(stats.ref_count, 4);
    assert_eq!(stats.queued, 3);
    assert!(stats.locked);
    assert!(!stats.sealed);

    // once attached to the broadcast, the waiters no longer need the bucket
    tokio::time::sleep(Duration::from_millis(150)).await;
    let stats = store.bucket_stats(request.key()).unwrap();
    assert_eq!(stats.ref_count, 1);
    assert_eq!(stats.queued, 0);
    assert!(stats.locked);

    first.await.unwrap().unwrap();
    join_all(handles).await;
    assert!(store.bucket_stats(request.key()).is_none());
    assert_eq!(log.count("bucket:get"), 3);
    assert_eq!(log.count("bucket:release"), 4);
    log.assert_balanced();
}

#[tokio::test(start_paused = true)]
async fn test_keys_are_independent() {
    let fetch = ChunkedFetch::new(CHUNKS, Duration::from_millis(10));
    let (store, log) = store_with(MemoryStore::new(), fetch.clone(), StoreConfig::default());

    let mut handles = Vec::new();
    for uri in ["/a", "/b", "/c", "/a", "/b", "/c"] {
        handles.push(spawn_get(&store, uri).2);
    }
    let results = join_all(handles).await;

    assert_eq!(fetch.calls(), 3);
    assert_eq!(log.count("miss"), 3);
    assert!(results.iter().all(|r| r.is_ok()));
    log.assert_balanced();
}

#[tokio::test(start_paused = true)]
async fn test_dropped_caller_does_not_leak() {
    let fetch = ChunkedFetch::new(CHUNKS, Duration::from_millis(100));
    let slots = MemoryStore::new();
    let (store, log) = store_with(slots.clone(), fetch.clone(), StoreConfig::default());

    let request = Request::new("/dropped");
    let get = store.get(request.clone(), SharedBuffer::new().boxed());
    // give up on the request while it is streaming
    let _ = tokio::time::timeout(Duration::from_millis(150), get).await;

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(fetch.calls(), 1);
    assert!(store.bucket_stats(request.key()).is_none());
    assert_eq!(slots.get_bytes(request.key()).unwrap(), fetch.body());
    log.assert_balanced();
}
