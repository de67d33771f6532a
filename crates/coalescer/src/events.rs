use std::fmt;
use std::sync::Arc;

use crate::bucket::Bucket;
use crate::error::StoreError;
use crate::key::Request;
use crate::store::HitKind;

/// A state transition of a [`Bucket`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BucketEvent {
    /// A bucket was created for a key.
    New,
    /// An existing bucket gained a reference.
    Get,
    /// A bucket lost a reference.
    Release,
    /// A bucket was removed from the registry.
    Destroy,
    /// A request found the bucket locked.
    Locked,
    /// The bucket was locked for a fetch.
    Lock,
    /// A request was queued behind the lock.
    Pending,
    /// The lock was released.
    Unlock,
    /// The bucket was sealed.
    Seal,
    /// A request was rejected because the bucket is sealed.
    Sealed,
}

impl BucketEvent {
    /// The event name, for example `bucket:new`.
    pub fn name(self) -> &'static str {
        match self {
            Self::New => "bucket:new",
            Self::Get => "bucket:get",
            Self::Release => "bucket:release",
            Self::Destroy => "bucket:destroy",
            Self::Locked => "bucket:locked",
            Self::Lock => "bucket:lock",
            Self::Pending => "bucket:pending",
            Self::Unlock => "bucket:unlock",
            Self::Seal => "bucket:seal",
            Self::Sealed => "bucket:sealed",
        }
    }
}

impl fmt::Display for BucketEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An observable event of a [`Store`](crate::Store).
#[derive(Debug)]
pub enum StoreEvent<'a> {
    /// A bucket changed state on behalf of a request.
    Bucket {
        event: BucketEvent,
        request: &'a Request,
        bucket: &'a Bucket,
    },
    /// The request drives the fetch for its key.
    Miss {
        request: &'a Request,
        bucket: &'a Bucket,
    },
    /// The request is served without fetching.
    Hit {
        request: &'a Request,
        bucket: &'a Bucket,
        kind: HitKind,
    },
    /// The request failed.
    Error {
        request: &'a Request,
        error: &'a StoreError,
    },
}

impl StoreEvent<'_> {
    /// The event name, one of the `bucket:*` names, `miss`, `hit` or `error`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Bucket { event, .. } => event.name(),
            Self::Miss { .. } => "miss",
            Self::Hit { .. } => "hit",
            Self::Error { .. } => "error",
        }
    }

    pub fn request(&self) -> &Request {
        match self {
            Self::Bucket { request, .. }
            | Self::Miss { request, .. }
            | Self::Hit { request, .. }
            | Self::Error { request, .. } => request,
        }
    }
}

/// Receives the events of a [`Store`](crate::Store).
///
/// Events are delivered synchronously while the registry lock is held, so implementations must
/// return quickly and must not call back into the store.
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, event: &StoreEvent<'_>);
}

/// An [`EventSink`] that logs every event at `trace` level.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingEvents;

impl EventSink for TracingEvents {
    fn emit(&self, event: &StoreEvent<'_>) {
        let request = event.request();
        match event {
            StoreEvent::Bucket { bucket, .. } | StoreEvent::Miss { bucket, .. } => {
                tracing::trace!(
                    request.id = %request.id(),
                    key = %bucket.key(),
                    ref_count = bucket.ref_count(),
                    write_errors = bucket.write_errors(),
                    "{}",
                    event.name()
                );
            }
            StoreEvent::Hit { bucket, kind, .. } => {
                tracing::trace!(
                    request.id = %request.id(),
                    key = %bucket.key(),
                    kind = kind.as_str(),
                    "hit"
                );
            }
            StoreEvent::Error { error, .. } => {
                tracing::trace!(
                    request.id = %request.id(),
                    status = error.status_code(),
                    "error: {}",
                    error
                );
            }
        }
    }
}

/// The set of sinks a store reports to.
#[derive(Clone, Default)]
pub(crate) struct Events {
    sinks: Arc<[Arc<dyn EventSink>]>,
}

impl Events {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self {
            sinks: sinks.into(),
        }
    }

    pub fn emit(&self, event: &StoreEvent<'_>) {
        for sink in self.sinks.iter() {
            sink.emit(event);
        }
    }

    pub fn bucket(&self, event: BucketEvent, request: &Request, bucket: &Bucket) {
        self.emit(&StoreEvent::Bucket {
            event,
            request,
            bucket,
        });
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Events")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}
