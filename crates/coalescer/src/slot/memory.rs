use std::collections::HashMap;
use std::io::{self, Cursor};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWrite;

use super::{ReadSlot, SlotStore, WriteSlot};
use crate::key::BucketKey;

type Entries = Arc<Mutex<HashMap<BucketKey, Bytes>>>;

/// A [`SlotStore`] keeping every resource in memory.
///
/// Clones share the same entries.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    entries: Entries,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `contents` for `key` directly.
    pub fn insert(&self, key: BucketKey, contents: impl Into<Bytes>) {
        self.entries().insert(key, contents.into());
    }

    /// Returns the stored contents of `key`.
    pub fn get_bytes(&self, key: &BucketKey) -> Option<Bytes> {
        self.entries().get(key).cloned()
    }

    pub fn remove(&self, key: &BucketKey) -> Option<Bytes> {
        self.entries().remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<BucketKey, Bytes>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl SlotStore for MemoryStore {
    async fn get(&self, key: &BucketKey) -> io::Result<Option<ReadSlot>> {
        Ok(self
            .get_bytes(key)
            .map(|contents| Box::new(Cursor::new(contents)) as ReadSlot))
    }

    async fn lock(&self, key: &BucketKey) -> io::Result<Box<dyn WriteSlot>> {
        Ok(Box::new(MemorySlot {
            key: key.clone(),
            buffer: Vec::new(),
            entries: Arc::clone(&self.entries),
        }))
    }
}

struct MemorySlot {
    key: BucketKey,
    buffer: Vec<u8>,
    entries: Entries,
}

impl AsyncWrite for MemorySlot {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.buffer.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl WriteSlot for MemorySlot {
    async fn commit(self: Box<Self>) -> io::Result<()> {
        let MemorySlot {
            key,
            buffer,
            entries,
        } = *self;
        entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, buffer.into());
        Ok(())
    }
}
