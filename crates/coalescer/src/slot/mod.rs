//! Physical storage of cached resources.
//!
//! A [`SlotStore`] answers two questions for a key: "is there a readable slot?" and "give me a
//! writable slot". The store never deals with coordination, that is entirely the job of the
//! [`Store`](crate::Store) in front of it.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::BackendConfig;
use crate::key::BucketKey;

mod file;
mod memory;

pub use file::{FileStore, shard_path};
pub use memory::MemoryStore;

/// A readable slot, streaming a stored resource.
pub type ReadSlot = Box<dyn AsyncRead + Send + Unpin>;

/// A writable slot for one key.
///
/// Data written to the slot must not become visible to [`SlotStore::get`] before
/// [`commit`](WriteSlot::commit) succeeds. Dropping the slot without committing discards it.
#[async_trait]
pub trait WriteSlot: AsyncWrite + Send + Unpin {
    /// Finishes the write and makes the slot readable.
    async fn commit(self: Box<Self>) -> io::Result<()>;
}

/// Storage for cached resources.
#[async_trait]
pub trait SlotStore: Send + Sync + 'static {
    /// Looks up the stored resource for `key`.
    ///
    /// Returns `Ok(None)` if nothing is stored.
    async fn get(&self, key: &BucketKey) -> io::Result<Option<ReadSlot>>;

    /// Opens a writable slot for `key`.
    async fn lock(&self, key: &BucketKey) -> io::Result<Box<dyn WriteSlot>>;
}

/// One of the built-in slot stores.
#[derive(Clone, Debug)]
pub enum Backend {
    File(FileStore),
    Memory(MemoryStore),
}

impl Backend {
    /// Creates the backend described by `config`.
    ///
    /// For the file backend, this creates the root directory.
    pub fn from_config(config: &BackendConfig) -> io::Result<Self> {
        Ok(match config {
            BackendConfig::File(file) => Self::File(FileStore::new(&file.root, file.depth)?),
            BackendConfig::Memory => Self::Memory(MemoryStore::new()),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::File(_) => "file",
            Self::Memory(_) => "memory",
        }
    }
}

#[async_trait]
impl SlotStore for Backend {
    async fn get(&self, key: &BucketKey) -> io::Result<Option<ReadSlot>> {
        match self {
            Self::File(store) => store.get(key).await,
            Self::Memory(store) => store.get(key).await,
        }
    }

    async fn lock(&self, key: &BucketKey) -> io::Result<Box<dyn WriteSlot>> {
        match self {
            Self::File(store) => store.lock(key).await,
            Self::Memory(store) => store.lock(key).await,
        }
    }
}
