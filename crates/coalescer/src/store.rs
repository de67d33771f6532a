use std::fmt;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;

use crate::broadcast::{BroadcastSink, pump};
use crate::bucket::{Bucket, BucketStats, Waiter, Wakeup};
use crate::config::{Config, StoreConfig};
use crate::error::{StatusClass, StoreError};
use crate::events::{BucketEvent, EventSink, Events, StoreEvent};
use crate::fetch::Fetch;
use crate::key::{BucketKey, Request};
use crate::registry::Registry;
use crate::slot::{Backend, ReadSlot, SlotStore};

/// The destination of a response.
pub type ResponseSink = Box<dyn AsyncWrite + Send + Unpin>;

/// How a cache hit was served.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HitKind {
    /// Read from storage.
    Classic,
    /// Attached to the broadcast of a running fetch.
    Hot,
    /// Read from storage after waiting for a running fetch to complete.
    Deferred,
}

impl HitKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Classic => "classic",
            Self::Hot => "hot",
            Self::Deferred => "deferred",
        }
    }

    /// The hit subtype, `None` for classic hits.
    pub fn subtype(self) -> Option<&'static str> {
        match self {
            Self::Classic => None,
            Self::Hot => Some("hot"),
            Self::Deferred => Some("deferred"),
        }
    }
}

/// The outcome of a successful [`Store::get`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CacheStatus {
    /// The request drove the fetch of the resource.
    Miss,
    /// The request was served without fetching.
    Hit(HitKind),
}

impl CacheStatus {
    pub fn is_hit(self) -> bool {
        matches!(self, Self::Hit(_))
    }

    /// The value of a cache status response header, `hit` or `miss`.
    pub fn header_value(self) -> &'static str {
        match self {
            Self::Miss => "miss",
            Self::Hit(_) => "hit",
        }
    }

    /// The value of a hit type response header, only present for hot and deferred hits.
    pub fn hit_type_header_value(self) -> Option<&'static str> {
        match self {
            Self::Miss => None,
            Self::Hit(kind) => kind.subtype(),
        }
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.hit_type_header_value() {
            Some(subtype) => write!(f, "{} ({subtype})", self.header_value()),
            None => f.write_str(self.header_value()),
        }
    }
}

/// How a fill ended.
enum FillOutcome {
    Stored,
    WriteFailed,
    FetchFailed(String),
}

/// Where a request goes after looking at its bucket.
enum Next {
    Wait(oneshot::Receiver<Wakeup>),
    Deliver(ReadSlot, HitKind),
    Drive(Arc<dyn Fetch>),
}

/// Builds a [`Store`].
pub struct StoreBuilder {
    slots: Arc<dyn SlotStore>,
    config: StoreConfig,
    fetch: Option<Arc<dyn Fetch>>,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl StoreBuilder {
    pub fn new(slots: impl SlotStore) -> Self {
        Self {
            slots: Arc::new(slots),
            config: StoreConfig::default(),
            fetch: None,
            sinks: Vec::new(),
        }
    }

    /// Creates a builder for the backend and engine settings in `config`.
    pub fn from_config(config: &Config) -> io::Result<Self> {
        let backend = Backend::from_config(&config.backend)?;
        tracing::debug!("Using {} cache backend", backend.name());
        Ok(Self::new(backend).config(config.store))
    }

    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the fetch used for requests that do not bring their own.
    pub fn fetch(mut self, fetch: impl Fetch) -> Self {
        self.fetch = Some(Arc::new(fetch));
        self
    }

    /// Registers a sink receiving all store events.
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn build(self) -> Store {
        Store {
            inner: Arc::new(StoreInner {
                config: self.config,
                slots: self.slots,
                fetch: self.fetch,
                events: Events::new(self.sinks),
                registry: Mutex::new(Registry::default()),
            }),
        }
    }
}

struct StoreInner {
    config: StoreConfig,
    slots: Arc<dyn SlotStore>,
    fetch: Option<Arc<dyn Fetch>>,
    events: Events,
    registry: Mutex<Registry>,
}

/// A request-coalescing cache in front of a [`SlotStore`].
///
/// Requests for a key that is not stored yet are coalesced: the first one runs the [`Fetch`],
/// all others are either attached to its broadcast or served from storage once it is done.
/// Cloning is cheap, clones share the same registry.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    pub fn builder(slots: impl SlotStore) -> StoreBuilder {
        StoreBuilder::new(slots)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Returns a snapshot of the bucket for `key`, if one is live.
    pub fn bucket_stats(&self, key: &BucketKey) -> Option<BucketStats> {
        self.registry().get(key).map(Bucket::stats)
    }

    /// The number of buckets in the registry, including retained failed ones.
    pub fn live_buckets(&self) -> usize {
        self.registry().len()
    }

    /// Serves `request` into `sink` using the store's default fetch.
    ///
    /// The request runs to completion in the background even if the returned future is dropped.
    pub async fn get(
        &self,
        request: Request,
        sink: ResponseSink,
    ) -> Result<CacheStatus, StoreError> {
        self.spawn_serve(request, sink, None).await
    }

    /// Serves `request` into `sink`, fetching with `fetch` should the request drive a fetch.
    pub async fn get_with(
        &self,
        request: Request,
        sink: ResponseSink,
        fetch: Arc<dyn Fetch>,
    ) -> Result<CacheStatus, StoreError> {
        self.spawn_serve(request, sink, Some(fetch)).await
    }

    async fn spawn_serve(
        &self,
        request: Request,
        sink: ResponseSink,
        fetch: Option<Arc<dyn Fetch>>,
    ) -> Result<CacheStatus, StoreError> {
        metric!(counter("store.access") += 1);
        let handle = tokio::spawn(self.clone().serve(request, sink, fetch));
        handle
            .await
            .map_err(|error| StoreError::Internal(format!("cache request failed: {error}")))?
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn serve(
        self,
        request: Request,
        mut sink: ResponseSink,
        fetch: Option<Arc<dyn Fetch>>,
    ) -> Result<CacheStatus, StoreError> {
        let events = &self.inner.events;
        let mut deferred = false;

        loop {
            {
                let mut registry = self.registry();
                let bucket = registry.acquire(&request, events);
                if bucket.is_sealed() {
                    events.bucket(BucketEvent::Sealed, &request, bucket);
                    return Err(self.reject(&mut registry, &request, StoreError::Sealed));
                }
            }

            let lookup = self.inner.slots.get(request.key()).await;

            let next = {
                let mut registry = self.registry();
                let slot = match lookup {
                    Ok(slot) => slot,
                    Err(error) => {
                        let error = StoreError::LookupFailed(error);
                        return Err(self.reject(&mut registry, &request, error));
                    }
                };
                let Some(bucket) = registry.get_mut(request.key()) else {
                    return Err(self.report(&request, missing_bucket(&request)));
                };

                if bucket.is_sealed() {
                    events.bucket(BucketEvent::Sealed, &request, bucket);
                    return Err(self.reject(&mut registry, &request, StoreError::Sealed));
                } else if bucket.is_locked() {
                    events.bucket(BucketEvent::Locked, &request, bucket);
                    let (wake, wakeup) = oneshot::channel();
                    let waiter = Waiter {
                        request: request.clone(),
                        wake,
                    };
                    bucket.enqueue(waiter, events);
                    Next::Wait(wakeup)
                } else if let Some(slot) = slot {
                    let kind = if deferred {
                        HitKind::Deferred
                    } else {
                        HitKind::Classic
                    };
                    self.record_hit(&request, bucket, kind);
                    registry.release(&request, events);
                    Next::Deliver(slot, kind)
                } else {
                    match fetch.clone().or_else(|| self.inner.fetch.clone()) {
                        Some(fetch) => {
                            bucket.lock(&request, events);
                            Next::Drive(fetch)
                        }
                        None => {
                            return Err(self.reject(&mut registry, &request, StoreError::NoFetch));
                        }
                    }
                }
            };

            let wakeup = match next {
                Next::Deliver(slot, kind) => {
                    return self.deliver(&request, slot, &mut sink, kind).await;
                }
                Next::Drive(fetch) => return self.drive(request, sink, fetch).await,
                Next::Wait(wakeup) => wakeup,
            };

            match wakeup.await {
                Ok(Wakeup::Hot(feed)) => {
                    return match pump(feed, &mut sink).await {
                        Ok(_) => Ok(CacheStatus::Hit(HitKind::Hot)),
                        Err(error) => Err(self.report(&request, error)),
                    };
                }
                Ok(Wakeup::Deferred) => {
                    tracing::trace!(request.id = %request.id(), "Retrying deferred request");
                    deferred = true;
                }
                Err(_) => {
                    let error = StoreError::Internal("dropped from the lock queue".into());
                    let mut registry = self.registry();
                    return Err(self.reject(&mut registry, &request, error));
                }
            }
        }
    }

    /// Pipes a stored resource into the response.
    async fn deliver(
        &self,
        request: &Request,
        mut slot: ReadSlot,
        sink: &mut ResponseSink,
        kind: HitKind,
    ) -> Result<CacheStatus, StoreError> {
        let result = async {
            tokio::io::copy(&mut slot, sink).await?;
            sink.shutdown().await
        }
        .await;

        match result {
            Ok(()) => Ok(CacheStatus::Hit(kind)),
            Err(error) => Err(self.report(request, StoreError::DeliveryFailed(error))),
        }
    }

    /// Runs the fetch for a key that `request` has locked, and serves `request` from it.
    async fn drive(
        &self,
        request: Request,
        mut sink: ResponseSink,
        fetch: Arc<dyn Fetch>,
    ) -> Result<CacheStatus, StoreError> {
        let events = &self.inner.events;

        let slot = match self.inner.slots.lock(request.key()).await {
            Ok(slot) => slot,
            Err(error) => {
                let error = self.report(&request, StoreError::LockFailed(error));
                self.settle(&request, false);
                return Err(error);
            }
        };

        let (mut broadcast, feed) = BroadcastSink::new(slot, self.inner.config.max_pending);
        {
            let mut registry = self.registry();
            let waiters = match registry.get_mut(request.key()) {
                Some(bucket) => {
                    events.emit(&StoreEvent::Miss {
                        request: &request,
                        bucket,
                    });
                    bucket.drain_queue(broadcast.available())
                }
                None => Vec::new(),
            };
            metric!(counter("store.miss") += 1);
            tracing::debug!(request.uri = request.uri(), key = %request.key(), "Cache miss");

            for waiter in waiters {
                if let Some(bucket) = registry.get(request.key()) {
                    self.record_hit(&waiter.request, bucket, HitKind::Hot);
                }
                registry.release(&waiter.request, events);
                waiter.wake.send(Wakeup::Hot(broadcast.subscribe())).ok();
            }
        }

        tokio::spawn(self.clone().fill(request.clone(), fetch, broadcast));

        match pump(feed, &mut sink).await {
            Ok(_) => Ok(CacheStatus::Miss),
            Err(error) => Err(self.report(&request, error)),
        }
    }

    /// Runs `fetch` into `broadcast`, then settles the lock of `request`.
    async fn fill(self, request: Request, fetch: Arc<dyn Fetch>, mut broadcast: BroadcastSink) {
        let result = AssertUnwindSafe(fetch.fetch(&request, &mut broadcast))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(anyhow::anyhow!("fetch panicked")));

        let outcome = match result {
            Ok(()) => {
                let size = broadcast.bytes_written();
                match broadcast.commit().await {
                    Ok(()) => {
                        metric!(counter("store.write") += 1, "status" => "ok");
                        metric!(size("store.write.size") = size);
                        FillOutcome::Stored
                    }
                    Err(error) => {
                        tracing::error!(
                            key = %request.key(),
                            error = &error as &dyn std::error::Error,
                            "Failed to store fetched resource"
                        );
                        metric!(counter("store.write") += 1, "status" => "failed");
                        FillOutcome::WriteFailed
                    }
                }
            }
            Err(error) => {
                tracing::warn!(request.uri = request.uri(), "Fetch failed: {:#}", error);
                broadcast.abort();
                metric!(counter("store.write") += 1, "status" => "aborted");
                FillOutcome::FetchFailed(format!("{error:#}"))
            }
        };

        // only storage failures count toward sealing
        self.settle(&request, matches!(outcome, FillOutcome::WriteFailed));

        match outcome {
            FillOutcome::FetchFailed(reason) => broadcast.fail(&reason).await,
            FillOutcome::Stored | FillOutcome::WriteFailed => broadcast.end().await,
        }
    }

    /// Releases the lock `request` holds on its key.
    ///
    /// A failed write counts against the bucket and seals it once it failed too often. All
    /// requests still queued are sent back to start over.
    fn settle(&self, request: &Request, write_failed: bool) {
        let events = &self.inner.events;
        let mut registry = self.registry();
        let Some(bucket) = registry.get_mut(request.key()) else {
            tracing::error!(key = %request.key(), "Settled a bucket that does not exist");
            return;
        };

        let waiters = bucket.drain_queue(usize::MAX);
        if write_failed {
            let write_errors = bucket.record_write_error();
            if write_errors > self.inner.config.write_retries {
                tracing::warn!(
                    key = %request.key(),
                    write_errors,
                    "Sealing cache bucket after repeated write failures"
                );
                bucket.seal(request, events);
                metric!(counter("store.bucket.sealed") += 1);
            }
        }

        for waiter in waiters {
            registry.release(&waiter.request, events);
            waiter.wake.send(Wakeup::Deferred).ok();
        }
        registry.unlock(request, events);
    }

    fn record_hit(&self, request: &Request, bucket: &Bucket, kind: HitKind) {
        metric!(counter("store.hit") += 1, "type" => kind.as_str());
        tracing::debug!(request.uri = request.uri(), kind = kind.as_str(), "Cache hit");
        self.inner.events.emit(&StoreEvent::Hit {
            request,
            bucket,
            kind,
        });
    }

    /// Reports a failed request.
    fn report(&self, request: &Request, error: StoreError) -> StoreError {
        let status = error.status();
        metric!(counter("store.error") += 1, "status" => status.as_str());
        match status {
            StatusClass::NotFound => {
                tracing::debug!(request.uri = request.uri(), "Cache request failed: {}", error);
            }
            StatusClass::ServerError => {
                tracing::error!(
                    request.uri = request.uri(),
                    error = &error as &dyn std::error::Error,
                    "Cache request failed"
                );
            }
        }
        self.inner.events.emit(&StoreEvent::Error {
            request,
            error: &error,
        });
        error
    }

    /// Reports a failed request and drops its bucket reference.
    fn reject(&self, registry: &mut Registry, request: &Request, error: StoreError) -> StoreError {
        let error = self.report(request, error);
        registry.release(request, &self.inner.events);
        error
    }
}

fn missing_bucket(request: &Request) -> StoreError {
    StoreError::Internal(format!("no bucket for key {}", request.key()))
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("config", &self.inner.config)
            .field("fetch", &self.inner.fetch.is_some())
            .field("events", &self.inner.events)
            .field("live_buckets", &self.live_buckets())
            .finish()
    }
}
