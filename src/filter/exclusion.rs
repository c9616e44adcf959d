//! Exclusion patterns checked before every cache insert.

use fancy_regex::Regex;

use crate::error::ProxyError;

/// A set of address patterns that must never be cached.
///
/// Patterns are anchored at the start of the address text, so `10\.` only
/// matches addresses beginning with `10.`.
#[derive(Debug, Clone, Default)]
pub struct ExclusionList {
    patterns: Vec<Regex>,
}

impl ExclusionList {
    /// Compile the given patterns; fails on the first invalid one.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, ProxyError> {
        let patterns = patterns
            .iter()
            .map(|pattern| {
                let pattern = pattern.as_ref();
                Regex::new(&format!("^(?:{})", pattern)).map_err(|e| ProxyError::InvalidPattern {
                    pattern: pattern.to_string(),
                    source: Box::new(e),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { patterns })
    }

    /// Check if an address matches any pattern.
    pub fn is_excluded(&self, ip: &str) -> bool {
        self.patterns
            .iter()
            .any(|pattern| pattern.is_match(ip).unwrap_or(false))
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn private_ranges() -> ExclusionList {
        ExclusionList::new(&[r"127\.", r"10\.", r"192\.168\."]).unwrap()
    }

    #[test]
    fn new_compiles_patterns() {
        assert_eq!(private_ranges().len(), 3);
        assert!(ExclusionList::default().is_empty());
    }

    #[test]
    fn is_excluded_matches_prefix() {
        let list = private_ranges();

        assert!(list.is_excluded("127.0.0.1"));
        assert!(list.is_excluded("10.1.2.3"));
        assert!(list.is_excluded("192.168.0.10"));
    }

    #[test]
    fn is_excluded_is_anchored_at_start() {
        let list = private_ranges();

        assert!(!list.is_excluded("93.184.216.34"));
        assert!(!list.is_excluded("8.10.1.1"));
        assert!(!list.is_excluded("1.127.0.0"));
    }

    #[test]
    fn empty_list_excludes_nothing() {
        assert!(!ExclusionList::default().is_excluded("127.0.0.1"));
    }

    #[test]
    fn new_rejects_invalid_pattern() {
        let err = ExclusionList::new(&["(unclosed"]).unwrap_err();

        assert!(matches!(err, ProxyError::InvalidPattern { ref pattern, .. } if pattern == "(unclosed"));
    }
}
