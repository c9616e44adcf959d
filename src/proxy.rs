//! DNS proxy orchestration.
//!
//! Opens the stores, binds the listener and runs the proxy server.

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::cache::CacheStore;
use crate::error::ProxyError;
use crate::filter::ExclusionList;
use crate::forwarder::{DEFAULT_UPSTREAM_PORT, Forwarder};
use crate::rating::{RatingStore, UpstreamSeed};
use crate::resolver::Resolver;
use crate::transport::udp::UdpTransport;

/// Configuration for the DNS proxy.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Local address to bind (e.g., 127.0.0.1:53)
    pub bind_addr: SocketAddr,
    /// SQLite URL holding both the cache and the upstream ratings
    pub database_url: String,
    /// Bound on every upstream send/receive and every client reply
    pub timeout: Duration,
    /// How often the idle listener checks for shutdown
    pub poll_interval: Duration,
    /// Port used for upstreams configured without one
    pub upstream_port: u16,
    /// Seeds for an empty rating table; empty means the built-in list
    pub upstreams: Vec<UpstreamSeed>,
    /// Addresses matching any of these are never cached
    pub exclude_patterns: Vec<String>,
    pub max_in_flight: Option<usize>,
    /// Zero disables the periodic stats line
    pub stats_interval: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 53)),
            database_url: "sqlite:rankdns.sqlite".to_string(),
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(15),
            upstream_port: DEFAULT_UPSTREAM_PORT,
            upstreams: Vec::new(),
            exclude_patterns: Vec::new(),
            max_in_flight: None,
            stats_interval: Duration::from_secs(60),
        }
    }
}

/// A bound proxy, ready to serve.
pub struct Proxy {
    transport: UdpTransport,
    resolver: Arc<Resolver>,
    stats_interval: Duration,
}

impl Proxy {
    /// Open the stores and bind the listener.
    pub async fn bind(config: ProxyConfig) -> Result<Self, ProxyError> {
        let exclusions = ExclusionList::new(&config.exclude_patterns)?;
        let cache = CacheStore::open(&config.database_url, exclusions).await?;
        let ratings = RatingStore::open(&config.database_url, &config.upstreams).await?;

        let forwarder = Forwarder::new(Arc::new(ratings), config.timeout, config.upstream_port);
        let resolver = Arc::new(Resolver::new(Arc::new(cache), forwarder));

        let transport = UdpTransport::bind(config.bind_addr)
            .await?
            .with_timeouts(config.timeout, config.poll_interval)
            .with_max_in_flight(config.max_in_flight);

        Ok(Self {
            transport,
            resolver,
            stats_interval: config.stats_interval,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    /// Serve until `shutdown` completes, then release the listening socket.
    pub async fn serve<F>(self, shutdown: F) -> Result<(), ProxyError>
    where
        F: Future<Output = ()>,
    {
        let upstreams = self.resolver.upstream_count().await?;
        let addr = self.transport.local_addr()?;
        let cached = self.resolver.cache_len().await?;
        info!(
            addr = %addr,
            upstreams,
            cached,
            "DNS proxy listening"
        );

        let stats_task = (!self.stats_interval.is_zero())
            .then(|| tokio::spawn(log_stats(self.resolver.clone(), self.stats_interval)));

        self.transport.run(self.resolver.clone(), shutdown).await;

        if let Some(task) = stats_task {
            task.abort();
        }
        info!("DNS proxy stopped");
        Ok(())
    }
}

/// Print a stats line every `period`.
async fn log_stats(resolver: Arc<Resolver>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await; // Skip first immediate tick
    loop {
        interval.tick().await;
        let stats = resolver.stats_snapshot_and_reset();
        let cache_len = match resolver.cache_len().await {
            Ok(len) => len,
            Err(e) => {
                warn!(error = %e, "Cache size unavailable");
                0
            }
        };
        let (top_upstream, top_answers) = stats.top_upstream.unwrap_or_default();
        info!(
            cache = cache_len,
            requests = stats.requests,
            cached = stats.cached,
            forwarded = stats.forwarded,
            failed = stats.failed,
            dropped = stats.dropped,
            avg_response_ms = %format!("{:.2}", stats.avg_response_ms),
            top_upstream = %top_upstream,
            top_answers,
            "Proxy stats"
        );
    }
}

/// Run the DNS proxy until Ctrl-C.
pub async fn run(config: ProxyConfig) -> Result<(), ProxyError> {
    let proxy = Proxy::bind(config).await?;
    proxy
        .serve(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Shutdown signal received"),
                Err(e) => {
                    error!(error = %e, "Cannot listen for shutdown signal");
                    std::future::pending::<()>().await;
                }
            }
        })
        .await
}
