//! Error types for wire decoding and request handling.

use std::io;

use thiserror::Error;

/// Failure to decode or encode a DNS message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("packet truncated at offset {0}")]
    Truncated(usize),

    #[error("packet is not a query")]
    NotQuery,

    #[error("packet is not a response")]
    NotResponse,

    #[error("unsupported opcode {0}")]
    UnsupportedOpcode(u8),

    #[error("message carries no question")]
    NoQuestion,

    #[error("invalid label at offset {0}")]
    InvalidLabel(usize),

    #[error("compression pointer loop at offset {0}")]
    PointerLoop(usize),

    #[error("invalid {rtype} data: {value}")]
    InvalidRdata { rtype: String, value: String },
}

/// Errors surfaced by the proxy pipeline.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("malformed query: {0}")]
    MalformedQuery(#[from] WireError),

    /// Every candidate was tried and none produced a usable reply.
    #[error("no upstream answered after {attempts} attempts")]
    UpstreamLookupFailure {
        attempts: usize,
        last_reply: Option<Vec<u8>>,
    },

    #[error("no upstream servers configured")]
    NoUpstreams,

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("invalid exclusion pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: Box<fancy_regex::Error>,
    },

    #[error("configuration error: {0}")]
    Config(String),
}
