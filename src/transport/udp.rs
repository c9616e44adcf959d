//! UDP transport for DNS queries.
//!
//! One listening socket; every datagram is resolved in its own task so a slow
//! upstream never holds up other clients. Replies go back through the shared
//! listening socket.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use crate::resolver::{Answer, Resolution, Resolver};

use super::MAX_DNS_PACKET_SIZE;

const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// UDP transport for the DNS proxy.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    send_timeout: Duration,
    poll_interval: Duration,
    limiter: Option<Arc<Semaphore>>,
}

impl UdpTransport {
    /// Bind the listening socket on `addr`.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);

        Ok(Self {
            socket,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            limiter: None,
        })
    }

    /// `send_timeout` bounds each reply to a client; `poll_interval` is how
    /// long the receive loop waits before checking for shutdown again.
    pub fn with_timeouts(mut self, send_timeout: Duration, poll_interval: Duration) -> Self {
        self.send_timeout = send_timeout;
        self.poll_interval = poll_interval;
        self
    }

    /// Cap the number of requests handled at once. `None` means unbounded.
    pub fn with_max_in_flight(mut self, max_in_flight: Option<usize>) -> Self {
        self.limiter = max_in_flight
            .filter(|max| *max > 0)
            .map(|max| Arc::new(Semaphore::new(max)));
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive queries until `shutdown` completes.
    ///
    /// Requests already spawned keep running and may still reply after this
    /// returns.
    pub async fn run<F>(self, resolver: Arc<Resolver>, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut buf = [0u8; MAX_DNS_PACKET_SIZE];

        loop {
            let received = tokio::select! {
                _ = &mut shutdown => break,
                received = timeout(self.poll_interval, self.socket.recv_from(&mut buf)) => received,
            };

            let (len, src) = match received {
                Err(_) => {
                    trace!("No datagram within poll interval");
                    continue;
                }
                // ICMP port unreachable from an earlier reply, not a listener fault
                Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Ok(Err(e)) => {
                    error!(error = %e, "UDP recv error");
                    continue;
                }
                Ok(Ok(r)) => r,
            };

            // A saturated listener must still see shutdown
            let permit = match &self.limiter {
                Some(limiter) => tokio::select! {
                    _ = &mut shutdown => break,
                    permit = limiter.clone().acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                },
                None => None,
            };

            tokio::spawn(handle_query(
                self.socket.clone(),
                resolver.clone(),
                buf[..len].to_vec(),
                src,
                self.send_timeout,
                permit,
            ));
        }

        info!("UDP listener stopped");
    }
}

/// Resolve one datagram and send the answer back to `client`.
async fn handle_query(
    socket: Arc<UdpSocket>,
    resolver: Arc<Resolver>,
    packet: Vec<u8>,
    client: SocketAddr,
    send_timeout: Duration,
    _permit: Option<OwnedSemaphorePermit>,
) {
    let start_time = Instant::now();
    info!(client = %client, bytes = packet.len(), "Request received");

    let answer = match resolver.resolve(&packet).await {
        Ok(answer) => answer,
        Err(e) => {
            resolver.stats().record_dropped();
            warn!(client = %client, error = %e, "Request dropped");
            return;
        }
    };

    let elapsed_ms = start_time.elapsed().as_secs_f64() * 1000.0;
    record_stats(&resolver, &answer, elapsed_ms);

    if answer.payload.is_empty() {
        info!(client = %client, domain = %answer.domain, "No answer to send");
        return;
    }

    match timeout(send_timeout, socket.send_to(&answer.payload, client)).await {
        Ok(Ok(_)) => {
            info!(
                client = %client,
                domain = %answer.domain,
                cached = answer.is_cached(),
                answers = answer.records().map_or(0, |records| records.len()),
                total_ms = elapsed_ms,
                "Response sent"
            );
            if let Some(records) = answer.records() {
                debug!(domain = %answer.domain, records = %records, "Answer records");
            }
        }
        Ok(Err(e)) => warn!(client = %client, error = %e, "UDP response error"),
        Err(_) => warn!(client = %client, "UDP response timed out"),
    }
}

fn record_stats(resolver: &Resolver, answer: &Answer, elapsed_ms: f64) {
    let stats = resolver.stats();
    match &answer.resolution {
        Resolution::Cached(_) => stats.record_cached(elapsed_ms),
        Resolution::Forwarded { upstream, .. } | Resolution::Relayed { upstream } => {
            stats.record_forwarded(elapsed_ms, upstream)
        }
        Resolution::Failed => stats.record_failed(elapsed_ms),
    }
}
