//! Upstream forwarding with rating feedback.
//!
//! Each attempt asks the rating store for the current best upstream, sends
//! the raw query over a fresh UDP socket and scores the outcome: latency on
//! a reply, previous score plus [`FAILURE_PENALTY`] on any failure.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::dns::DnsResponse;
use crate::error::{ProxyError, WireError};
use crate::rating::RatingStore;
use crate::record::UpstreamCandidate;
use crate::transport::MAX_DNS_PACKET_SIZE;

/// Score added to an upstream each time it fails.
pub const FAILURE_PENALTY: f64 = 0.1;

pub const DEFAULT_UPSTREAM_PORT: u16 = 53;

/// Candidates fetched per selection; only the first is used.
const SELECTION_WINDOW: usize = 2;

/// A validated upstream answer.
#[derive(Debug, Clone)]
pub struct UpstreamReply {
    pub upstream: UpstreamCandidate,
    pub raw: Vec<u8>,
    pub response: DnsResponse,
    pub latency: Duration,
    pub attempts: usize,
}

/// Why a received reply was not accepted.
#[derive(Debug, Error)]
enum Rejection {
    #[error("empty reply")]
    Empty,

    #[error("malformed reply: {0}")]
    Malformed(#[from] WireError),

    #[error("reply id {got:#06x} does not match query id {expected:#06x}")]
    IdMismatch { expected: u16, got: u16 },

    #[error("reply carries no answer data")]
    NoAnswer,
}

/// Sends queries to the best-rated upstream, retrying across the pool.
pub struct Forwarder {
    ratings: Arc<RatingStore>,
    timeout: Duration,
    upstream_port: u16,
}

impl Forwarder {
    pub fn new(ratings: Arc<RatingStore>, timeout: Duration, upstream_port: u16) -> Self {
        Self {
            ratings,
            timeout,
            upstream_port,
        }
    }

    pub fn ratings(&self) -> &Arc<RatingStore> {
        &self.ratings
    }

    /// Forward `query` until some upstream gives a usable reply.
    ///
    /// Makes at most one attempt per configured upstream. When all fail, the
    /// error carries the last reply received, if any.
    pub async fn forward(&self, query: &[u8]) -> Result<UpstreamReply, ProxyError> {
        let query_id = query
            .get(0..2)
            .map(|id| u16::from_be_bytes([id[0], id[1]]))
            .ok_or(WireError::Truncated(query.len()))?;

        let attempts = self.ratings.count().await?;
        let mut last_reply = None;

        for attempt in 1..=attempts {
            let Some(candidate) = self.ratings.best(SELECTION_WINDOW).await?.into_iter().next()
            else {
                break;
            };

            let started = Instant::now();
            match self.exchange(&candidate, query).await {
                Ok(raw) => {
                    let latency = started.elapsed();
                    self.ratings
                        .update(&candidate.ip, latency.as_secs_f64())
                        .await?;

                    match validate(&raw, query_id) {
                        Ok(response) => {
                            debug!(
                                upstream = %candidate.name,
                                ip = %candidate.ip,
                                attempt,
                                latency_ms = latency.as_secs_f64() * 1000.0,
                                "Upstream answered"
                            );
                            return Ok(UpstreamReply {
                                upstream: candidate,
                                raw,
                                response,
                                latency,
                                attempts: attempt,
                            });
                        }
                        Err(reason) => {
                            warn!(upstream = %candidate.name, ip = %candidate.ip, attempt, %reason, "Upstream reply rejected");
                            if !raw.is_empty() {
                                last_reply = Some(raw);
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(upstream = %candidate.name, ip = %candidate.ip, attempt, error = %e, "Upstream attempt failed");
                }
            }

            self.ratings
                .update(&candidate.ip, candidate.score + FAILURE_PENALTY)
                .await?;
        }

        if attempts == 0 {
            return Err(ProxyError::NoUpstreams);
        }
        Err(ProxyError::UpstreamLookupFailure {
            attempts,
            last_reply,
        })
    }

    /// One send/receive round trip with a single upstream.
    async fn exchange(&self, candidate: &UpstreamCandidate, query: &[u8]) -> io::Result<Vec<u8>> {
        let addr = candidate.socket_addr(self.upstream_port).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid upstream address {}", candidate.ip),
            )
        })?;

        let bind_addr: SocketAddr = if addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(addr).await?;

        timeout(self.timeout, socket.send(query))
            .await
            .map_err(|_| timed_out("send", addr))??;

        let mut buf = vec![0u8; MAX_DNS_PACKET_SIZE];
        let len = timeout(self.timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| timed_out("receive", addr))??;
        buf.truncate(len);

        Ok(buf)
    }
}

fn validate(raw: &[u8], query_id: u16) -> Result<DnsResponse, Rejection> {
    if raw.is_empty() {
        return Err(Rejection::Empty);
    }
    let response = DnsResponse::parse(raw)?;
    if response.id != query_id {
        return Err(Rejection::IdMismatch {
            expected: query_id,
            got: response.id,
        });
    }
    if !response.answers.iter().any(|answer| !answer.rdata.is_empty()) {
        return Err(Rejection::NoAnswer);
    }
    Ok(response)
}

fn timed_out(stage: &str, addr: SocketAddr) -> io::Error {
    io::Error::new(
        io::ErrorKind::TimedOut,
        format!("{} to {} timed out", stage, addr),
    )
}
