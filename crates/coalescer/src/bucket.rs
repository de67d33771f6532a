use std::collections::VecDeque;
use std::fmt;
use std::mem;

use tokio::sync::oneshot;

use crate::broadcast::Feed;
use crate::events::{BucketEvent, Events};
use crate::key::{BucketKey, Request};

/// How a queued waiter is resumed.
#[derive(Debug)]
pub(crate) enum Wakeup {
    /// The waiter is attached to the running broadcast and reads the fetched bytes from it.
    Hot(Feed),
    /// The waiter has to start over once the key is unlocked.
    Deferred,
}

/// A request waiting for the fetch of a locked key to make progress.
#[derive(Debug)]
pub(crate) struct Waiter {
    pub request: Request,
    pub wake: oneshot::Sender<Wakeup>,
}

#[derive(Debug, Default)]
enum LockState {
    #[default]
    Unlocked,
    Locked(VecDeque<Waiter>),
    Sealed,
}

/// The coordination record of a single key.
///
/// Buckets live in the registry of a [`Store`](crate::Store) and are handed out to
/// [`EventSink`](crate::EventSink)s as part of every bucket event. All mutations happen while the
/// registry lock is held.
pub struct Bucket {
    key: BucketKey,
    ref_count: usize,
    write_errors: u32,
    state: LockState,
}

impl Bucket {
    pub(crate) fn new(key: BucketKey) -> Self {
        Self {
            key,
            ref_count: 1,
            write_errors: 0,
            state: LockState::Unlocked,
        }
    }

    pub fn key(&self) -> &BucketKey {
        &self.key
    }

    /// The number of in-flight operations holding a reference to this bucket.
    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    /// The number of failed storage writes for this key.
    pub fn write_errors(&self) -> u32 {
        self.write_errors
    }

    pub fn is_locked(&self) -> bool {
        matches!(self.state, LockState::Locked(_))
    }

    /// A sealed bucket permanently rejects its key.
    pub fn is_sealed(&self) -> bool {
        matches!(self.state, LockState::Sealed)
    }

    /// The number of requests waiting for the lock to be released.
    pub fn queued(&self) -> usize {
        match &self.state {
            LockState::Locked(queue) => queue.len(),
            _ => 0,
        }
    }

    /// Takes a point-in-time snapshot of this bucket.
    pub fn stats(&self) -> BucketStats {
        BucketStats {
            ref_count: self.ref_count,
            write_errors: self.write_errors,
            queued: self.queued(),
            locked: self.is_locked(),
            sealed: self.is_sealed(),
        }
    }

    pub(crate) fn acquire(&mut self) {
        self.ref_count += 1;
    }

    /// Drops one reference, returning `true` if this was the last one.
    pub(crate) fn release(&mut self) -> bool {
        debug_assert!(self.ref_count > 0, "released unreferenced bucket {}", self.key);
        self.ref_count = self.ref_count.saturating_sub(1);
        self.ref_count == 0
    }

    /// Whether the registry may drop this bucket.
    pub(crate) fn is_disposable(&self) -> bool {
        self.ref_count == 0 && self.write_errors == 0
    }

    pub(crate) fn record_write_error(&mut self) -> u32 {
        self.write_errors += 1;
        self.write_errors
    }

    /// Locks the key on behalf of `request`.
    ///
    /// Locking a sealed bucket does nothing. The bucket must not be locked already.
    pub(crate) fn lock(&mut self, request: &Request, events: &Events) {
        debug_assert!(!self.is_locked(), "locked bucket {} twice", self.key);
        match self.state {
            LockState::Unlocked => {
                self.state = LockState::Locked(VecDeque::new());
                events.bucket(BucketEvent::Lock, request, self);
            }
            LockState::Locked(_) => {
                tracing::warn!(key = %self.key, "Attempted to lock an already locked bucket");
            }
            LockState::Sealed => {}
        }
    }

    /// Appends a waiter to the lock queue.
    ///
    /// The bucket must be locked; waiters enqueued on anything else are dropped, which resolves
    /// their wakeup channel as closed.
    pub(crate) fn enqueue(&mut self, waiter: Waiter, events: &Events) {
        let request = waiter.request.clone();
        match &mut self.state {
            LockState::Locked(queue) => queue.push_back(waiter),
            _ => {
                tracing::error!(key = %self.key, "Attempted to enqueue on an unlocked bucket");
                return;
            }
        }
        events.bucket(BucketEvent::Pending, &request, self);
    }

    /// Removes up to `limit` waiters from the head of the queue, in arrival order.
    pub(crate) fn drain_queue(&mut self, limit: usize) -> Vec<Waiter> {
        match &mut self.state {
            LockState::Locked(queue) => {
                let count = limit.min(queue.len());
                queue.drain(..count).collect()
            }
            _ => Vec::new(),
        }
    }

    pub(crate) fn unlock(&mut self, request: &Request, events: &Events) {
        if let LockState::Locked(queue) = &self.state {
            debug_assert!(queue.is_empty(), "unlocked bucket with queued waiters");
            self.state = LockState::Unlocked;
        }
        events.bucket(BucketEvent::Unlock, request, self);
    }

    /// Seals the bucket for good.
    ///
    /// Waiters still queued at this point are dropped.
    pub(crate) fn seal(&mut self, request: &Request, events: &Events) {
        if let LockState::Locked(queue) = mem::replace(&mut self.state, LockState::Sealed) {
            debug_assert!(queue.is_empty(), "sealed bucket with queued waiters");
        }
        events.bucket(BucketEvent::Seal, request, self);
    }
}

impl fmt::Debug for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bucket")
            .field("key", &self.key)
            .field("ref_count", &self.ref_count)
            .field("write_errors", &self.write_errors)
            .field("locked", &self.is_locked())
            .field("sealed", &self.is_sealed())
            .field("queued", &self.queued())
            .finish()
    }
}

/// A snapshot of the state of a [`Bucket`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BucketStats {
    pub ref_count: usize,
    pub write_errors: u32,
    pub queued: usize,
    pub locked: bool,
    pub sealed: bool,
}
