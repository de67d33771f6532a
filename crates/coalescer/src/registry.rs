use std::collections::HashMap;
use std::collections::hash_map::Entry;

use crate::bucket::Bucket;
use crate::events::{BucketEvent, Events};
use crate::key::{BucketKey, Request};

/// The map of live buckets of one store.
///
/// Every successful [`acquire`](Self::acquire) must be paired with exactly one
/// [`release`](Self::release) or [`unlock`](Self::unlock).
#[derive(Debug, Default)]
pub(crate) struct Registry {
    buckets: HashMap<BucketKey, Bucket>,
}

impl Registry {
    /// Returns the bucket for the request's key, creating it if needed, and takes a reference.
    pub fn acquire(&mut self, request: &Request, events: &Events) -> &mut Bucket {
        let live = self.buckets.len();
        match self.buckets.entry(request.key().clone()) {
            Entry::Occupied(entry) => {
                let bucket = entry.into_mut();
                bucket.acquire();
                events.bucket(BucketEvent::Get, request, bucket);
                bucket
            }
            Entry::Vacant(entry) => {
                metric!(gauge("store.buckets") = live as u64 + 1);
                let bucket = entry.insert(Bucket::new(request.key().clone()));
                events.bucket(BucketEvent::New, request, bucket);
                bucket
            }
        }
    }

    pub fn get(&self, key: &BucketKey) -> Option<&Bucket> {
        self.buckets.get(key)
    }

    pub fn get_mut(&mut self, key: &BucketKey) -> Option<&mut Bucket> {
        self.buckets.get_mut(key)
    }

    /// Drops the request's reference, destroying the bucket once it is unreferenced.
    ///
    /// Buckets with recorded write errors are kept around at zero references.
    pub fn release(&mut self, request: &Request, events: &Events) {
        let Some(bucket) = self.buckets.get_mut(request.key()) else {
            tracing::error!(key = %request.key(), "Released a bucket that does not exist");
            return;
        };

        bucket.release();
        events.bucket(BucketEvent::Release, request, bucket);

        if !bucket.is_disposable() {
            return;
        }
        if let Some(bucket) = self.buckets.remove(request.key()) {
            metric!(gauge("store.buckets") = self.buckets.len() as u64);
            events.bucket(BucketEvent::Destroy, request, &bucket);
        }
    }

    /// Unlocks the bucket and drops the reference of the request that locked it.
    pub fn unlock(&mut self, request: &Request, events: &Events) {
        if let Some(bucket) = self.buckets.get_mut(request.key()) {
            bucket.unlock(request, events);
        }
        self.release(request, events);
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }
}
