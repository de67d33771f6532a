//! Fetching uncached resources from an HTTP upstream.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use coalescer::config::FetchConfig;
use coalescer::{BroadcastSink, Fetch, Request, metric};
use futures::StreamExt;
use reqwest::Client;
use url::Url;

/// The user agent sent along with upstream requests.
const USER_AGENT: &str = concat!("coalescer/", env!("CARGO_PKG_VERSION"));

/// A [`Fetch`] that resolves request URIs against an upstream base URL.
#[derive(Clone, Debug)]
pub struct HttpFetch {
    client: Client,
    upstream: Url,
}

impl HttpFetch {
    pub fn new(mut upstream: Url, timeout: Duration) -> Result<Self> {
        // without the trailing slash, joining would replace the last path segment
        if !upstream.path().ends_with('/') {
            let path = format!("{}/", upstream.path());
            upstream.set_path(&path);
        }

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .context("failed to build the HTTP client")?;

        Ok(Self { client, upstream })
    }

    /// Creates the fetch for the configured upstream, if there is one.
    pub fn from_config(config: &FetchConfig) -> Result<Option<Self>> {
        let Some(upstream) = &config.upstream else {
            return Ok(None);
        };
        let upstream = Url::parse(upstream).context("invalid upstream URL")?;
        Self::new(upstream, config.timeout).map(Some)
    }

    /// The upstream URL for a request URI.
    pub fn url_for(&self, uri: &str) -> Result<Url> {
        self.upstream
            .join(uri.trim_start_matches('/'))
            .with_context(|| format!("invalid request URI `{uri}`"))
    }
}

#[async_trait]
impl Fetch for HttpFetch {
    async fn fetch(&self, request: &Request, sink: &mut BroadcastSink) -> Result<()> {
        let url = self.url_for(request.uri())?;
        tracing::debug!("Fetching `{}`", url);

        let response = self.client.get(url.clone()).send().await;
        let response = match response.and_then(|response| response.error_for_status()) {
            Ok(response) => response,
            Err(error) => {
                metric!(counter("fetch.upstream") += 1, "status" => "failed");
                return Err(error).with_context(|| format!("failed to fetch `{url}`"));
            }
        };
        metric!(counter("fetch.upstream") += 1, "status" => "ok");

        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.with_context(|| format!("failed to read body of `{url}`"))?;
            sink.write(chunk).await?;
        }

        Ok(())
    }
}
