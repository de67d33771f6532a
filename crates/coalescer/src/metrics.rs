//! Statsd reporting for the cache.
//!
//! Nothing is sent until [`configure_statsd`] installs a client. Use the [`metric!`](crate::metric)
//! macro to emit counters, gauges and sizes.
use std::collections::BTreeMap;
use std::io;
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::OnceLock;

use cadence::{Metric, MetricBuilder, StatsdClient, UdpMetricSink};

static CLIENT: OnceLock<MetricsClient> = OnceLock::new();

#[doc(hidden)]
pub mod prelude {
    pub use cadence::prelude::*;
}

/// A statsd client that attaches the configured global tags to every metric.
#[derive(Debug)]
pub struct MetricsClient {
    pub statsd: StatsdClient,
    global_tags: BTreeMap<String, String>,
}

impl MetricsClient {
    /// Adds the global tags to `metric` and sends it.
    pub fn send<'a, T>(&'a self, metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        self.global_tags
            .iter()
            .fold(metric, |metric, (key, value)| metric.with_tag(key, value))
            .send()
    }
}

/// Starts reporting metrics to the statsd server at `host`.
///
/// Fails if `host` does not resolve, or if a client was configured before.
pub fn configure_statsd<A: ToSocketAddrs>(
    prefix: &str,
    host: A,
    global_tags: BTreeMap<String, String>,
) -> io::Result<()> {
    let addrs: Vec<_> = host.to_socket_addrs()?.collect();
    let Some(addr) = addrs.first() else {
        return Err(io::Error::other("statsd host did not resolve"));
    };
    tracing::info!("Reporting metrics to statsd at {}", addr);

    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_nonblocking(true)?;
    let sink = UdpMetricSink::from(&addrs[..], socket).map_err(io::Error::other)?;
    let client = MetricsClient {
        statsd: StatsdClient::from_sink(prefix, sink),
        global_tags,
    };

    CLIENT
        .set(client)
        .map_err(|_| io::Error::other("metrics are already configured"))
}

/// Calls `f` with the statsd client, if one is configured.
#[inline(always)]
pub fn with_client<F>(f: F)
where
    F: FnOnce(&MetricsClient),
{
    if let Some(client) = CLIENT.get() {
        f(client);
    }
}

/// Emits a metric, with optional `"tag" => value` pairs.
///
/// Supports `counter(name) += n`, `gauge(name) = n` and `size(name) = bytes`. Sizes are sent as
/// statsd timers.
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metrics::with_client(|client| {
            use $crate::metrics::prelude::*;
            client.send(client.statsd.count_with_tags($id, $value)$(.with_tag($k, $v))*);
        })
    };

    (gauge($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metrics::with_client(|client| {
            use $crate::metrics::prelude::*;
            client.send(client.statsd.gauge_with_tags($id, $value)$(.with_tag($k, $v))*);
        })
    };

    (size($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metrics::with_client(|client| {
            use $crate::metrics::prelude::*;
            client.send(client.statsd.time_with_tags($id, $value)$(.with_tag($k, $v))*);
        })
    };
}
