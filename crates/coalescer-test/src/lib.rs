//! Helpers for testing the coalescer and its command line host.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. When dropped too early, the file store will recreate the
//!    directory lazily and leak it. Assign it to a variable in the test function
//!    (e.g. `let _cache_dir = coalescer_test::tempdir()`).
//!
//!  - When using an [`Upstream`], make sure that it is held until all requests to it have been
//!    made. The server stops serving once it is dropped.

use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use axum::Router;
use axum::extract::{OriginalUri, Path, Request};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::routing::get;
use tokio::io::AsyncWrite;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;
use url::Url;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the coalescer crates and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("coalescer=trace,coalescer_cli=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`into_path`](TempDir::into_path) is called. Use it as a guard to automatically clean up after
/// tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// An in-memory response sink that can be inspected after it has been handed off.
///
/// Clones share the same buffer.
#[derive(Clone, Debug, Default)]
pub struct SharedBuffer {
    contents: Arc<Mutex<Vec<u8>>>,
    shutdown: Arc<Mutex<bool>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a boxed clone of this buffer, ready to be used as a response sink.
    pub fn boxed(&self) -> Box<dyn AsyncWrite + Send + Unpin> {
        Box::new(self.clone())
    }

    pub fn contents(&self) -> Vec<u8> {
        self.contents.lock().unwrap().clone()
    }

    /// The contents as UTF-8, panicking on invalid data.
    pub fn text(&self) -> String {
        String::from_utf8(self.contents()).unwrap()
    }

    /// Whether the writer has been shut down, which marks a complete response.
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.lock().unwrap()
    }
}

impl AsyncWrite for SharedBuffer {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.contents.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        *self.shutdown.lock().unwrap() = true;
        Poll::Ready(Ok(()))
    }
}

/// A response sink whose client hung up: every write fails with [`io::ErrorKind::BrokenPipe`].
#[derive(Clone, Copy, Debug, Default)]
pub struct BrokenPipe;

impl BrokenPipe {
    pub fn boxed() -> Box<dyn AsyncWrite + Send + Unpin> {
        Box::new(Self)
    }
}

impl AsyncWrite for BrokenPipe {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
    }
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
}

impl Server {
    /// Serves `router` on an ephemeral port of the loopback interface.
    pub fn new(router: Router) -> Self {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = std::net::TcpListener::bind(addr).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// An upstream origin for fetch tests that counts the requests it receives.
///
/// Routes:
///
///  - `/files/*path`: responds with `contents of {path}`.
///  - `/delay/:time/*path`: waits for the given humantime duration, then responds like
///    `/files`.
///  - `/status/:code`: responds with an empty body and the given status code.
pub struct Upstream {
    server: Server,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl Upstream {
    pub fn new() -> Self {
        let hits = Arc::new(Mutex::new(BTreeMap::new()));

        let counter = {
            let hits = hits.clone();
            move |OriginalUri(uri): OriginalUri, request: Request, next: Next| {
                let hits = hits.clone();
                async move {
                    *hits.lock().unwrap().entry(uri.path().to_owned()).or_default() += 1;
                    next.run(request).await
                }
            }
        };

        let router = Router::new()
            .route(
                "/files/*path",
                get(|Path(path): Path<String>| async move { format!("contents of {path}") }),
            )
            .route(
                "/delay/:time/*path",
                get(|Path((time, path)): Path<(String, String)>| async move {
                    let duration = humantime::parse_duration(&time).unwrap();
                    tokio::time::sleep(duration).await;
                    format!("contents of {path}")
                }),
            )
            .route(
                "/status/:code",
                get(|Path(code): Path<u16>| async move {
                    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                }),
            )
            .layer(middleware::from_fn(counter));

        Self {
            server: Server::new(router),
            hits,
        }
    }

    /// The base URL of this upstream, with a trailing slash.
    pub fn base_url(&self) -> Url {
        self.server.url("/")
    }

    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }

    /// Returns the number of requests received for `path`.
    pub fn hits(&self, path: &str) -> usize {
        self.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    /// Returns the number of requests received for all paths.
    pub fn total_hits(&self) -> usize {
        self.hits.lock().unwrap().values().sum()
    }
}

impl Default for Upstream {
    fn default() -> Self {
        Self::new()
    }
}
