use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWrite;

use coalescer::config::StoreConfig;
use coalescer::slot::MemoryStore;
use coalescer::{
    BroadcastSink, BucketKey, CacheStatus, EventSink, Fetch, HitKind, ReadSlot, Request,
    SlotStore, Store, StoreError, StoreEvent, WriteSlot,
};

pub use coalescer_test::{BrokenPipe, SharedBuffer, setup, tempdir};

/// Builds a store on top of `slots` with an attached [`EventLog`].
pub fn store_with(
    slots: impl SlotStore,
    fetch: impl Fetch,
    config: StoreConfig,
) -> (Store, Arc<EventLog>) {
    setup();
    let log = Arc::new(EventLog::default());
    let store = Store::builder(slots)
        .config(config)
        .fetch(fetch)
        .event_sink(log.clone())
        .build();
    (store, log)
}

/// Spawns a request for `uri` in the background.
pub fn spawn_get(
    store: &Store,
    uri: &str,
) -> (
    Request,
    SharedBuffer,
    tokio::task::JoinHandle<Result<CacheStatus, StoreError>>,
) {
    let request = Request::new(uri);
    let buffer = SharedBuffer::new();
    let handle = tokio::spawn({
        let store = store.clone();
        let request = request.clone();
        let sink = buffer.boxed();
        async move { store.get(request, sink).await }
    });
    (request, buffer, handle)
}

/// Waits for all spawned requests and returns their results in spawn order.
pub async fn join_all(
    handles: Vec<tokio::task::JoinHandle<Result<CacheStatus, StoreError>>>,
) -> Vec<Result<CacheStatus, StoreError>> {
    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        results.push(handle.await.unwrap());
    }
    results
}

/// A recorded store event.
#[derive(Clone, Debug)]
pub struct Record {
    pub name: &'static str,
    pub request: Request,
    pub ref_count: Option<usize>,
    pub hit: Option<HitKind>,
    pub status: Option<u16>,
}

/// An [`EventSink`] recording every event it receives.
#[derive(Debug, Default)]
pub struct EventLog {
    records: Mutex<Vec<Record>>,
}

impl EventSink for EventLog {
    fn emit(&self, event: &StoreEvent<'_>) {
        let (ref_count, hit, status) = match event {
            StoreEvent::Bucket { bucket, .. } | StoreEvent::Miss { bucket, .. } => {
                (Some(bucket.ref_count()), None, None)
            }
            StoreEvent::Hit { bucket, kind, .. } => (Some(bucket.ref_count()), Some(*kind), None),
            StoreEvent::Error { error, .. } => (None, None, Some(error.status_code())),
        };

        self.records.lock().unwrap().push(Record {
            name: event.name(),
            request: event.request().clone(),
            ref_count,
            hit,
            status,
        });
    }
}

impl EventLog {
    pub fn records(&self) -> Vec<Record> {
        self.records.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.records().iter().map(|r| r.name).collect()
    }

    /// The names of all events emitted on behalf of `request`.
    pub fn names_for(&self, request: &Request) -> Vec<&'static str> {
        self.records()
            .iter()
            .filter(|r| r.request.id() == request.id())
            .map(|r| r.name)
            .collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.records().iter().filter(|r| r.name == name).count()
    }

    pub fn hits(&self, kind: HitKind) -> usize {
        self.records()
            .iter()
            .filter(|r| r.hit == Some(kind))
            .count()
    }

    /// Checks that every acquired bucket reference has been released exactly once.
    pub fn assert_references_released(&self) {
        assert_eq!(
            self.count("bucket:new") + self.count("bucket:get"),
            self.count("bucket:release"),
            "{:?}",
            self.names()
        );
    }

    /// Checks that every created bucket has been destroyed again.
    pub fn assert_balanced(&self) {
        self.assert_references_released();
        assert_eq!(
            self.count("bucket:new"),
            self.count("bucket:destroy"),
            "{:?}",
            self.names()
        );
    }
}

/// A fetch streaming a fixed list of chunks, pausing before each.
#[derive(Clone, Debug)]
pub struct ChunkedFetch {
    chunks: Vec<&'static str>,
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl ChunkedFetch {
    pub fn new(chunks: &[&'static str], delay: Duration) -> Self {
        Self {
            chunks: chunks.to_vec(),
            delay,
            calls: Default::default(),
        }
    }

    /// A fetch producing `payload` without delay.
    pub fn immediate(payload: &'static str) -> Self {
        Self::new(&[payload], Duration::ZERO)
    }

    pub fn body(&self) -> String {
        self.chunks.concat()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetch for ChunkedFetch {
    async fn fetch(&self, _request: &Request, sink: &mut BroadcastSink) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        for chunk in &self.chunks {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            sink.write(*chunk).await?;
        }
        Ok(())
    }
}

/// A fetch that writes some data, then fails.
#[derive(Clone, Debug)]
pub struct FailingFetch {
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl FailingFetch {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: Default::default(),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetch for FailingFetch {
    async fn fetch(&self, _request: &Request, sink: &mut BroadcastSink) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        sink.write("partial").await?;
        tokio::time::sleep(self.delay).await;
        anyhow::bail!("upstream exploded")
    }
}

/// A fetch that panics midway.
#[derive(Clone, Copy, Debug)]
pub struct PanickingFetch;

#[async_trait]
impl Fetch for PanickingFetch {
    async fn fetch(&self, _request: &Request, sink: &mut BroadcastSink) -> anyhow::Result<()> {
        sink.write("partial").await?;
        panic!("fetch blew up");
    }
}

/// A slot store whose lookups always fail.
#[derive(Clone, Debug, Default)]
pub struct FailingLookup(pub MemoryStore);

#[async_trait]
impl SlotStore for FailingLookup {
    async fn get(&self, _key: &BucketKey) -> io::Result<Option<ReadSlot>> {
        Err(io::Error::other("lookup failed"))
    }

    async fn lock(&self, key: &BucketKey) -> io::Result<Box<dyn WriteSlot>> {
        self.0.lock(key).await
    }
}

/// A slot store that fails to provide writable slots, after a delay.
#[derive(Clone, Debug, Default)]
pub struct FailingLock {
    pub inner: MemoryStore,
    pub delay: Duration,
    pub attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl SlotStore for FailingLock {
    async fn get(&self, key: &BucketKey) -> io::Result<Option<ReadSlot>> {
        self.inner.get(key).await
    }

    async fn lock(&self, _key: &BucketKey) -> io::Result<Box<dyn WriteSlot>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Err(io::Error::other("disk full"))
    }
}

/// A slot store whose writable slots reject every write until it is repaired.
#[derive(Clone, Debug)]
pub struct FailingWrite {
    pub inner: MemoryStore,
    broken: Arc<AtomicBool>,
}

impl FailingWrite {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            broken: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Lets all further writes go through to the inner store.
    pub fn repair(&self) {
        self.broken.store(false, Ordering::SeqCst);
    }
}

impl Default for FailingWrite {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SlotStore for FailingWrite {
    async fn get(&self, key: &BucketKey) -> io::Result<Option<ReadSlot>> {
        self.inner.get(key).await
    }

    async fn lock(&self, key: &BucketKey) -> io::Result<Box<dyn WriteSlot>> {
        if self.broken.load(Ordering::SeqCst) {
            return Ok(Box::new(BrokenSlot));
        }
        self.inner.lock(key).await
    }
}

struct BrokenSlot;

impl AsyncWrite for BrokenSlot {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::other("read-only file system")))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl WriteSlot for BrokenSlot {
    async fn commit(self: Box<Self>) -> io::Result<()> {
        Err(io::Error::other("read-only file system"))
    }
}

/// A slot store that takes a while to provide writable slots.
#[derive(Clone, Debug, Default)]
pub struct SlowLock {
    pub inner: MemoryStore,
    pub delay: Duration,
}

impl SlowLock {
    pub fn new(inner: MemoryStore, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl SlotStore for SlowLock {
    async fn get(&self, key: &BucketKey) -> io::Result<Option<ReadSlot>> {
        self.inner.get(key).await
    }

    async fn lock(&self, key: &BucketKey) -> io::Result<Box<dyn WriteSlot>> {
        tokio::time::sleep(self.delay).await;
        self.inner.lock(key).await
    }
}
