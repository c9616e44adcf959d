//! DNS query resolution logic.
//!
//! Handles the per-request pipeline:
//! 1. Parse the question (standard queries only)
//! 2. Cache lookup
//! 3. On a miss, forward to the best-rated upstream and store its answers
//! 4. Encode the reply for the client
//!
//! Transports handle the actual I/O, the resolver handles decisions.

use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, warn};

use crate::cache::CacheStore;
use crate::dns::{DnsQuery, DnsResponse};
use crate::error::ProxyError;
use crate::forwarder::{Forwarder, UpstreamReply};
use crate::record::{Record, RecordSet};
use crate::stats::{Stats, StatsSnapshot};

/// How a query was answered.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Served from the cache.
    Cached(RecordSet),
    /// Fetched from an upstream; the reply was rebuilt from its records.
    Forwarded { records: RecordSet, upstream: String },
    /// Upstream reply relayed as received, nothing in it could be cached.
    Relayed { upstream: String },
    /// No upstream produced a usable reply.
    Failed,
}

/// Bytes to send back to the client, with how they were obtained.
///
/// An empty payload means nothing should be sent.
#[derive(Debug, Clone)]
pub struct Answer {
    pub domain: String,
    pub payload: Vec<u8>,
    pub resolution: Resolution,
}

impl Answer {
    pub fn is_cached(&self) -> bool {
        matches!(self.resolution, Resolution::Cached(_))
    }

    /// Records the payload was built from, if any.
    pub fn records(&self) -> Option<&RecordSet> {
        match &self.resolution {
            Resolution::Cached(records) | Resolution::Forwarded { records, .. } => Some(records),
            _ => None,
        }
    }
}

/// Resolver handles DNS query processing decisions.
///
/// Shared by every request task; the stores it holds do their own locking.
pub struct Resolver {
    cache: Arc<CacheStore>,
    forwarder: Forwarder,
    stats: Stats,
}

impl Resolver {
    pub fn new(cache: Arc<CacheStore>, forwarder: Forwarder) -> Self {
        Self {
            cache,
            forwarder,
            stats: Stats::new(),
        }
    }

    /// Resolve one raw query packet.
    ///
    /// Fails only for malformed queries and store errors. Upstream failure is
    /// an [`Answer`] carrying the last failure reply, or nothing.
    pub async fn resolve(&self, packet: &[u8]) -> Result<Answer, ProxyError> {
        let query = DnsQuery::parse(packet)?;

        let cached = self.cache.find(&query.domain).await?.answering(query.qtype);
        let now = SystemTime::now();
        if cached.is_valid_at(now) {
            let payload = encode_answer(&query, &cached, now);
            return Ok(Answer {
                domain: query.domain,
                payload,
                resolution: Resolution::Cached(cached),
            });
        }

        let reply = match self.forwarder.forward(packet).await {
            Ok(reply) => reply,
            Err(ProxyError::UpstreamLookupFailure {
                attempts,
                last_reply,
            }) => {
                warn!(domain = %query.domain, attempts, "Upstream lookup failed");
                return Ok(Answer {
                    domain: query.domain,
                    payload: last_reply.unwrap_or_default(),
                    resolution: Resolution::Failed,
                });
            }
            Err(e) => return Err(e),
        };

        let records = records_from_reply(&query.domain, &reply);
        for record in &records {
            self.cache
                .add(
                    &record.domain,
                    &record.ip,
                    record.record_type,
                    record.record_class,
                    record.ttl,
                    &record.source_upstream,
                )
                .await?;
        }

        let upstream = reply.upstream.name;
        let now = SystemTime::now();
        if records.is_valid_at(now) {
            let payload = encode_answer(&query, &records, now);
            Ok(Answer {
                domain: query.domain,
                payload,
                resolution: Resolution::Forwarded { records, upstream },
            })
        } else {
            debug!(domain = %query.domain, upstream = %upstream, "Relaying upstream reply as received");
            Ok(Answer {
                domain: query.domain,
                payload: reply.raw,
                resolution: Resolution::Relayed { upstream },
            })
        }
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn stats_snapshot_and_reset(&self) -> StatsSnapshot {
        self.stats.snapshot_and_reset()
    }

    /// Returns the number of live cache rows.
    pub async fn cache_len(&self) -> Result<u64, ProxyError> {
        self.cache.len().await
    }

    pub async fn upstream_count(&self) -> Result<usize, ProxyError> {
        self.forwarder.ratings().count().await
    }
}

/// Turn every supported answer into a record owned by the queried domain.
fn records_from_reply(domain: &str, reply: &UpstreamReply) -> RecordSet {
    reply
        .response
        .answers
        .iter()
        .filter(|answer| answer.rtype.is_supported())
        .filter_map(|answer| match answer.data_text() {
            Ok(text) => Some(Record::new(
                domain,
                text,
                answer.rtype,
                answer.class,
                answer.ttl,
                reply.upstream.name.as_str(),
            )),
            Err(e) => {
                debug!(domain, rtype = %answer.rtype, error = %e, "Skipping undecodable answer");
                None
            }
        })
        .collect()
}

/// Build the client reply, one answer per record with the TTL left at `now`.
fn encode_answer(query: &DnsQuery, records: &RecordSet, now: SystemTime) -> Vec<u8> {
    let mut response = DnsResponse::answering(query);
    for record in records {
        if let Err(e) = response.push_record(record, now) {
            warn!(domain = %record.domain, error = %e, "Skipping unencodable record");
        }
    }
    response.to_bytes()
}
