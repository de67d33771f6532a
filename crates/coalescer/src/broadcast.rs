use std::fmt;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;

use crate::error::StoreError;
use crate::slot::WriteSlot;

/// The number of chunks buffered per destination before the fetch is slowed down.
const FEED_BUFFER: usize = 16;

#[derive(Debug)]
pub(crate) enum Frame {
    Data(Bytes),
    End,
    Failed(Arc<str>),
}

/// The receiving end of one broadcast destination.
pub(crate) type Feed = mpsc::Receiver<Frame>;

/// The sink a [`Fetch`](crate::Fetch) writes the resource into.
///
/// Every chunk written to the sink is forwarded to the storage slot of the key and to all
/// requests that are waiting for the resource. A destination that fails or goes away is dropped
/// from the broadcast without affecting the others.
pub struct BroadcastSink {
    storage: Option<Box<dyn WriteSlot>>,
    storage_error: Option<io::Error>,
    feeds: Vec<mpsc::Sender<Frame>>,
    capacity: usize,
    bytes_written: u64,
}

impl BroadcastSink {
    /// Creates a broadcast into `storage`, along with the feed of the request driving it.
    ///
    /// `capacity` is the maximum number of destinations, including the storage slot and the
    /// driving request.
    pub(crate) fn new(storage: Box<dyn WriteSlot>, capacity: usize) -> (Self, Feed) {
        let (sender, feed) = mpsc::channel(FEED_BUFFER);
        let sink = Self {
            storage: Some(storage),
            storage_error: None,
            feeds: vec![sender],
            capacity,
            bytes_written: 0,
        };
        (sink, feed)
    }

    /// The number of destinations that can still be attached.
    pub(crate) fn available(&self) -> usize {
        self.capacity.saturating_sub(self.destinations())
    }

    /// Attaches another destination.
    ///
    /// Callers check [`available`](Self::available) first, the capacity is not enforced here.
    pub(crate) fn subscribe(&mut self) -> Feed {
        let (sender, feed) = mpsc::channel(FEED_BUFFER);
        self.feeds.push(sender);
        feed
    }

    /// The number of live destinations.
    pub fn destinations(&self) -> usize {
        self.feeds.len() + usize::from(self.storage.is_some())
    }

    /// The total number of bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Writes a chunk to all destinations.
    ///
    /// This fails only once no destination is left to write to.
    pub async fn write(&mut self, chunk: impl Into<Bytes>) -> io::Result<()> {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return Ok(());
        }
        self.bytes_written += chunk.len() as u64;

        if let Some(slot) = self.storage.as_mut() {
            if let Err(error) = slot.write_all(&chunk).await {
                tracing::error!(
                    error = &error as &dyn std::error::Error,
                    "Failed to write to cache slot"
                );
                self.storage = None;
                self.storage_error = Some(error);
            }
        }

        let mut live = Vec::with_capacity(self.feeds.len());
        for feed in self.feeds.drain(..) {
            if feed.send(Frame::Data(chunk.clone())).await.is_ok() {
                live.push(feed);
            }
        }
        self.feeds = live;

        if self.destinations() == 0 {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "all broadcast destinations are gone",
            ));
        }
        Ok(())
    }

    /// Streams everything from `reader` into the broadcast, returning the number of bytes copied.
    pub async fn copy_from<R>(&mut self, reader: R) -> io::Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut stream = ReaderStream::new(reader);
        let mut copied = 0;
        while let Some(chunk) = stream.next().await.transpose()? {
            copied += chunk.len() as u64;
            self.write(chunk).await?;
        }
        Ok(copied)
    }

    /// Commits the storage slot.
    ///
    /// Fails if the slot failed at any point during the broadcast.
    pub(crate) async fn commit(&mut self) -> io::Result<()> {
        if let Some(error) = self.storage_error.take() {
            return Err(error);
        }
        match self.storage.take() {
            Some(slot) => slot.commit().await,
            None => Err(io::Error::other("cache slot already closed")),
        }
    }

    /// Discards the storage slot without committing it.
    pub(crate) fn abort(&mut self) {
        self.storage = None;
    }

    /// Completes the broadcast for all attached requests.
    pub(crate) async fn end(self) {
        for feed in self.feeds {
            feed.send(Frame::End).await.ok();
        }
    }

    /// Fails the broadcast for all attached requests.
    pub(crate) async fn fail(self, reason: &str) {
        let reason: Arc<str> = reason.into();
        for feed in self.feeds {
            feed.send(Frame::Failed(reason.clone())).await.ok();
        }
    }
}

impl fmt::Debug for BroadcastSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastSink")
            .field("storage", &self.storage.is_some())
            .field("feeds", &self.feeds.len())
            .field("capacity", &self.capacity)
            .field("bytes_written", &self.bytes_written)
            .finish()
    }
}

/// Copies the broadcast received on `feed` into `sink` until the broadcast completes.
pub(crate) async fn pump<W>(mut feed: Feed, sink: &mut W) -> Result<u64, StoreError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut written = 0;
    while let Some(frame) = feed.recv().await {
        match frame {
            Frame::Data(chunk) => {
                sink.write_all(&chunk)
                    .await
                    .map_err(StoreError::DeliveryFailed)?;
                written += chunk.len() as u64;
            }
            Frame::End => {
                sink.shutdown().await.map_err(StoreError::DeliveryFailed)?;
                return Ok(written);
            }
            Frame::Failed(reason) => return Err(StoreError::FetchFailed(reason.to_string())),
        }
    }
    Err(StoreError::Internal("broadcast ended unexpectedly".into()))
}
