use std::time::Duration;

use coalescer::config::StoreConfig;
use coalescer::slot::{FileStore, shard_path};
use coalescer::{CacheStatus, HitKind, Request};

use crate::utils::*;

#[tokio::test]
async fn test_file_store_end_to_end() {
    let cache_dir = tempdir();
    let slots = FileStore::new(cache_dir.path(), FileStore::DEFAULT_DEPTH).unwrap();
    let fetch = ChunkedFetch::new(&["stored ", "on ", "disk"], Duration::from_millis(20));
    let (store, log) = store_with(slots.clone(), fetch.clone(), StoreConfig::default());

    let mut requests = Vec::new();
    for _ in 0..10 {
        requests.push(spawn_get(&store, "/files/large.bin"));
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let mut misses = 0;
    for (_, buffer, handle) in requests {
        if handle.await.unwrap().unwrap() == CacheStatus::Miss {
            misses += 1;
        }
        assert_eq!(buffer.text(), "stored on disk");
    }
    assert_eq!(misses, 1);
    assert_eq!(fetch.calls(), 1);

    let request = Request::new("/files/large.bin");
    let path = cache_dir
        .path()
        .join(shard_path(request.key().as_str(), FileStore::DEFAULT_DEPTH));
    assert_eq!(path, slots.path_for(request.key()));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "stored on disk");

    // nothing is left behind in the staging directory
    let staged = std::fs::read_dir(cache_dir.path().join("tmp")).unwrap().count();
    assert_eq!(staged, 0);

    let (_, buffer, handle) = spawn_get(&store, "/files/large.bin");
    assert_eq!(
        handle.await.unwrap().unwrap(),
        CacheStatus::Hit(HitKind::Classic)
    );
    assert_eq!(buffer.text(), "stored on disk");
    assert_eq!(fetch.calls(), 1);
    assert_eq!(store.live_buckets(), 0);
    log.assert_balanced();
}

#[tokio::test]
async fn test_file_store_survives_restart() {
    let cache_dir = tempdir();
    let fetch = ChunkedFetch::immediate("persistent");

    {
        let slots = FileStore::new(cache_dir.path(), 2).unwrap();
        let (store, _) = store_with(slots, fetch.clone(), StoreConfig::default());
        let (_, _, handle) = spawn_get(&store, "/persistent");
        assert_eq!(handle.await.unwrap().unwrap(), CacheStatus::Miss);
    }

    // a fresh store over the same directory sees the stored resource
    let slots = FileStore::new(cache_dir.path(), 2).unwrap();
    let (store, _) = store_with(slots, fetch.clone(), StoreConfig::default());
    let (_, buffer, handle) = spawn_get(&store, "/persistent");
    assert_eq!(
        handle.await.unwrap().unwrap(),
        CacheStatus::Hit(HitKind::Classic)
    );
    assert_eq!(buffer.text(), "persistent");
    assert_eq!(fetch.calls(), 1);
}

#[tokio::test]
async fn test_failed_fetch_leaves_no_file() {
    let cache_dir = tempdir();
    let slots = FileStore::new(cache_dir.path(), FileStore::DEFAULT_DEPTH).unwrap();
    let (store, _) = store_with(
        slots.clone(),
        FailingFetch::new(Duration::from_millis(10)),
        StoreConfig::default(),
    );

    let (request, _, handle) = spawn_get(&store, "/broken");
    assert!(handle.await.unwrap().is_err());

    assert!(!slots.path_for(request.key()).exists());
    let staged = std::fs::read_dir(cache_dir.path().join("tmp")).unwrap().count();
    assert_eq!(staged, 0);
}
