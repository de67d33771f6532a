//! # Coalescer
//!
//! A request-coalescing cache layer that sits in front of an expensive or remote data source.
//!
//! For every request key, concurrently arriving requests for the same uncached resource trigger
//! **at most one** fetch-and-store operation. The bytes produced by that single fetch are fanned
//! out to every request that was waiting for them, and once stored the resource is served
//! straight from storage.
//!
//! ## Buckets and the Registry
//!
//! Each key is tracked by a [`Bucket`], which is owned by the registry of one [`Store`]. A bucket
//! counts the operations currently referencing it, carries the lock state of the key
//! (`Unlocked`, `Locked` with a FIFO queue of waiters, or `Sealed`), and the number of storage
//! writes that failed for that key. A bucket is destroyed once nothing references it anymore,
//! unless it has accumulated write failures, in which case it stays resident so that failures
//! add up across requests. Once the number of failures exceeds
//! [`StoreConfig::write_retries`](config::StoreConfig::write_retries), the bucket is sealed and
//! the key is rejected for the lifetime of the store.
//!
//! ## Hit classification
//!
//! Every successful request is classified as a [`CacheStatus`]:
//!
//! - `miss`: the request drove the fetch.
//! - `hit`: the request was served from storage (a "classic" hit).
//! - `hit (hot)`: the request arrived while the key was locked, and was attached to the live
//!   [`BroadcastSink`] of the running fetch.
//! - `hit (deferred)`: the request arrived while the fetch was already streaming, and was
//!   re-run against storage once the key was unlocked.
//!
//! ## Storage
//!
//! Physical I/O is delegated to a [`SlotStore`]. The [`FileStore`](slot::FileStore) shards keys
//! into a balanced directory tree, the [`MemoryStore`](slot::MemoryStore) keeps everything in
//! memory. [`Backend`] picks one of them from [`Config`](config::Config).
//!
//! ## Observability
//!
//! Lifecycle events (`bucket:new`, `miss`, `hit`, `error`, …) are delivered synchronously to
//! registered [`EventSink`]s. Metrics are reported through the [`metric!`] macro once
//! [`metrics::configure_statsd`] has been called.

#[macro_use]
pub mod metrics;

mod broadcast;
mod bucket;
pub mod config;
mod error;
mod events;
mod fetch;
mod key;
pub mod logging;
mod registry;
pub mod slot;
mod store;

pub use broadcast::BroadcastSink;
pub use bucket::{Bucket, BucketStats};
pub use error::{StatusClass, StoreError};
pub use events::{BucketEvent, EventSink, StoreEvent, TracingEvents};
pub use fetch::{Fetch, FetchFn};
pub use key::{BucketKey, Request};
pub use slot::{Backend, ReadSlot, SlotStore, WriteSlot};
pub use store::{CacheStatus, HitKind, ResponseSink, Store, StoreBuilder};
