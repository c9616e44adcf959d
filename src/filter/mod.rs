//! Address filtering for the cache.
//!
//! Answers whose address matches a configured pattern (private or loopback
//! ranges, for example) are served but never stored.

mod exclusion;

pub use exclusion::ExclusionList;
