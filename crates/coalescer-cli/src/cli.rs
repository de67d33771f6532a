//! Exposes the command line application.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use coalescer::config::{BackendConfig, Config};
use coalescer::logging;
use coalescer::metrics;
use coalescer::slot::shard_path;
use coalescer::{Request, ResponseSink, Store, StoreBuilder, TracingEvents};
use futures::future;

use crate::fetch::HttpFetch;

/// Coalescer commands.
#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Request resources through the cache.
    ///
    /// Prints one line per request with its cache status, or the error it failed with.
    Get {
        /// The request URIs, resolved against the configured upstream.
        #[arg(required = true, value_name = "URI")]
        uris: Vec<String>,

        /// How many concurrent requests to issue for every URI.
        #[arg(long, short = 'n', default_value_t = 1)]
        concurrency: usize,

        /// A directory to write the responses to, instead of discarding them.
        #[arg(long, short, value_name = "DIR")]
        output: Option<PathBuf>,
    },

    /// Print the location of a URI in the file backend.
    Path {
        #[arg(value_name = "URI")]
        uri: String,
    },
}

/// A request-coalescing cache in front of an HTTP upstream.
#[derive(Clone, Debug, Parser)]
#[command(bin_name = "coalescer", version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    // SAFETY: No other threads have been spawned at this point.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(ref tag) = config.metrics.hostname_tag {
            if let Some(name) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(tag.clone(), name);
            }
        }
        metrics::configure_statsd(&config.metrics.prefix, statsd, tags)
            .context("failed to configure metrics")?;
    }

    match cli.command {
        Command::Get {
            uris,
            concurrency,
            output,
        } => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .thread_name("coalescer")
                .build()
                .context("failed to start the runtime")?;
            runtime.block_on(get(config, uris, concurrency, output.as_deref()))
        }
        Command::Path { uri } => {
            println!("{}", resource_path(&config, &uri)?.display());
            Ok(())
        }
    }
}

/// The file backend location of the resource for `uri`.
fn resource_path(config: &Config, uri: &str) -> Result<PathBuf> {
    let BackendConfig::File(ref file) = config.backend else {
        bail!("the configured backend does not store files");
    };
    let request = Request::new(uri);
    Ok(file
        .root
        .join(shard_path(request.key().as_str(), file.depth)))
}

async fn get(
    config: Config,
    uris: Vec<String>,
    concurrency: usize,
    output: Option<&Path>,
) -> Result<()> {
    let mut builder = StoreBuilder::from_config(&config)
        .context("failed to set up the cache backend")?
        .event_sink(Arc::new(TracingEvents));
    match HttpFetch::from_config(&config.fetch)? {
        Some(fetch) => builder = builder.fetch(fetch),
        None => tracing::warn!("No upstream configured, uncached requests will fail"),
    }
    let store = builder.build();

    if let Some(dir) = output {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create `{}`", dir.display()))?;
    }

    let requests = uris
        .iter()
        .flat_map(|uri| std::iter::repeat_n(uri, concurrency.max(1)))
        .map(|uri| run_request(&store, Request::new(uri.as_str()), output));
    let lines = future::join_all(requests).await;

    let mut failed = 0;
    for (line, ok) in &lines {
        println!("{line}");
        if !ok {
            failed += 1;
        }
    }

    if failed > 0 {
        bail!("{failed} of {} requests failed", lines.len());
    }
    Ok(())
}

/// Runs one request and formats its outcome as a line of output.
async fn run_request(store: &Store, request: Request, output: Option<&Path>) -> (String, bool) {
    let destination = output.map(|dir| dir.join(request.id().to_string()));
    let sink: ResponseSink = match &destination {
        Some(path) => match tokio::fs::File::create(path).await {
            Ok(file) => Box::new(file),
            Err(error) => {
                let line = format!(
                    "{}\terror: failed to create {}: {error}",
                    request.uri(),
                    path.display()
                );
                return (line, false);
            }
        },
        None => Box::new(tokio::io::sink()),
    };

    let uri = request.uri().to_owned();
    match store.get(request, sink).await {
        Ok(status) => {
            let line = match destination {
                Some(path) => format!("{uri}\t{status}\t{}", path.display()),
                None => format!("{uri}\t{status}"),
            };
            (line, true)
        }
        Err(error) => {
            let line = format!("{uri}\terror {}: {error}", error.status_code());
            (line, false)
        }
    }
}
