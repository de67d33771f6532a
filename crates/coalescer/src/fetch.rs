use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::broadcast::BroadcastSink;
use crate::key::Request;

/// Produces a resource that is not cached yet.
///
/// A fetch streams the resource into the given [`BroadcastSink`] and returns `Ok(())` once it is
/// complete. Returning an error fails every request waiting for this fetch, and discards
/// whatever was written so far.
#[async_trait]
pub trait Fetch: Send + Sync + 'static {
    async fn fetch(&self, request: &Request, sink: &mut BroadcastSink) -> anyhow::Result<()>;
}

#[async_trait]
impl<T: Fetch + ?Sized> Fetch for Arc<T> {
    async fn fetch(&self, request: &Request, sink: &mut BroadcastSink) -> anyhow::Result<()> {
        (**self).fetch(request, sink).await
    }
}

/// A [`Fetch`] from a closure producing the whole resource at once.
///
/// ```
/// # use bytes::Bytes;
/// # use coalescer::{FetchFn, Request};
/// let fetch = FetchFn(|request: Request| async move {
///     anyhow::Ok(Bytes::from(format!("contents of {}", request.uri())))
/// });
/// ```
#[derive(Clone, Copy, Debug)]
pub struct FetchFn<F>(pub F);

#[async_trait]
impl<F, Fut> Fetch for FetchFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Bytes>> + Send + 'static,
{
    async fn fetch(&self, request: &Request, sink: &mut BroadcastSink) -> anyhow::Result<()> {
        let contents = (self.0)(request.clone()).await?;
        sink.write(contents).await?;
        Ok(())
    }
}
