//! Transport layer for the DNS proxy.
//!
//! Receives DNS queries from clients over UDP and hands each one to the
//! resolver in its own task.

pub mod udp;

/// Maximum size of a DNS packet (with some headroom).
pub const MAX_DNS_PACKET_SIZE: usize = 4096;
