//! rankdns - a caching DNS proxy that forwards to the best-rated upstream.
//!
//! This library exposes the wire codec, stores and proxy pieces for
//! benchmarking and testing.

pub mod cache;
pub mod config;
pub mod db;
pub mod dns;
pub mod error;
pub mod filter;
pub mod forwarder;
pub mod proxy;
pub mod rating;
pub mod record;
pub mod resolver;
pub mod stats;
pub mod transport;

pub use error::{ProxyError, WireError};
pub use proxy::{Proxy, ProxyConfig};
