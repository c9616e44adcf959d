//! Cached answer records and upstream candidates.
//!
//! Values here are snapshots: the stores hand out copies and never keep a
//! link back to the rows they were read from.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, SystemTime};

use crate::dns::{QTYPE_ANY, RecordClass, RecordType, clamp_ttl, text_to_rdata};

/// One answer entry for a domain.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub domain: String,
    /// Textual record data; an address for A/AAAA, a name for CNAME/NS/PTR,
    /// `"<preference> <exchange>"` for MX.
    pub ip: String,
    pub record_type: RecordType,
    pub record_class: RecordClass,
    /// TTL as advertised by the upstream.
    pub ttl: u32,
    pub expires_at: SystemTime,
    pub source_upstream: String,
}

impl Record {
    /// Create a record that expires `ttl` seconds from now. TTLs above
    /// `i32::MAX` count as zero.
    pub fn new(
        domain: impl Into<String>,
        ip: impl Into<String>,
        record_type: RecordType,
        record_class: RecordClass,
        ttl: u32,
        source_upstream: impl Into<String>,
    ) -> Self {
        let ttl = clamp_ttl(ttl);
        Self {
            domain: domain.into(),
            ip: ip.into(),
            record_type,
            record_class,
            ttl,
            expires_at: SystemTime::now() + Duration::from_secs(u64::from(ttl)),
            source_upstream: source_upstream.into(),
        }
    }

    pub fn remaining_ttl(&self) -> u32 {
        self.remaining_ttl_at(SystemTime::now())
    }

    /// Seconds left at `now`, zero once expired.
    pub fn remaining_ttl_at(&self, now: SystemTime) -> u32 {
        self.expires_at
            .duration_since(now)
            .map(|left| left.as_secs().min(u64::from(u32::MAX)) as u32)
            .unwrap_or(0)
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(SystemTime::now())
    }

    pub fn is_valid_at(&self, now: SystemTime) -> bool {
        !self.domain.is_empty()
            && text_to_rdata(self.record_type, &self.ip).is_ok()
            && self.expires_at > now
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} ttl={}s left={}s via {}",
            self.domain,
            self.record_class,
            self.record_type,
            self.ip,
            self.ttl,
            self.remaining_ttl(),
            self.source_upstream
        )
    }
}

/// Every record found for one domain, in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordSet {
    records: Vec<Record>,
}

impl RecordSet {
    pub fn new(records: Vec<Record>) -> Self {
        Self { records }
    }

    /// Valid when at least one record is.
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(SystemTime::now())
    }

    pub fn is_valid_at(&self, now: SystemTime) -> bool {
        self.records.iter().any(|record| record.is_valid_at(now))
    }

    /// Records that answer a question of type `qtype`.
    ///
    /// Empty unless some record has exactly that type; CNAME records then
    /// ride along. An ANY question takes everything.
    pub fn answering(&self, qtype: RecordType) -> RecordSet {
        if qtype == RecordType::Other(QTYPE_ANY) {
            return self.clone();
        }
        if !self.records.iter().any(|record| record.record_type == qtype) {
            return RecordSet::default();
        }
        self.records
            .iter()
            .filter(|record| record.record_type == qtype || record.record_type == RecordType::Cname)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.records.iter()
    }
}

impl FromIterator<Record> for RecordSet {
    fn from_iter<I: IntoIterator<Item = Record>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a RecordSet {
    type Item = &'a Record;
    type IntoIter = std::slice::Iter<'a, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

impl fmt::Display for RecordSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, record) in self.records.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", record)?;
        }
        Ok(())
    }
}

/// An upstream resolver and its current rating; lower scores rank first.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamCandidate {
    pub name: String,
    /// `ip` or `ip:port`.
    pub ip: String,
    pub score: f64,
}

impl UpstreamCandidate {
    /// Resolve the address, using `default_port` when none is given.
    pub fn socket_addr(&self, default_port: u16) -> Option<SocketAddr> {
        if let Ok(addr) = self.ip.parse::<SocketAddr>() {
            return Some(addr);
        }
        self.ip
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, default_port))
    }
}

impl fmt::Display for UpstreamCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) score={:.4}", self.name, self.ip, self.score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn a_record(domain: &str, ip: &str, ttl: u32) -> Record {
        Record::new(domain, ip, RecordType::A, RecordClass::In, ttl, "test")
    }

    #[test]
    fn record_is_valid_with_future_expiry() {
        assert!(a_record("example.com", "93.184.216.34", 300).is_valid());
    }

    #[test]
    fn record_invalid_when_empty_domain_bad_address_or_expired() {
        assert!(!a_record("", "93.184.216.34", 300).is_valid());
        assert!(!a_record("example.com", "not-an-ip", 300).is_valid());

        let record = a_record("example.com", "93.184.216.34", 300);
        assert!(!record.is_valid_at(record.expires_at));
    }

    #[test]
    fn remaining_ttl_counts_down_and_clamps() {
        let record = a_record("example.com", "93.184.216.34", 300);

        let later = record.expires_at - Duration::from_secs(100);
        assert_eq!(record.remaining_ttl_at(later), 100);
        assert_eq!(record.remaining_ttl_at(record.expires_at + Duration::from_secs(1)), 0);
        assert!(record.remaining_ttl() <= 300);
    }

    #[test]
    fn ttl_with_top_bit_set_expires_immediately() {
        let record = a_record("example.com", "93.184.216.34", u32::MAX);

        assert_eq!(record.ttl, 0);
        assert_eq!(record.remaining_ttl(), 0);
        assert!(!record.is_valid());
    }

    #[test]
    fn record_set_valid_if_any_record_valid() {
        let set = RecordSet::new(vec![
            a_record("example.com", "bogus", 300),
            a_record("example.com", "93.184.216.34", 300),
        ]);
        assert!(set.is_valid());

        assert!(!RecordSet::default().is_valid());
        assert!(!RecordSet::new(vec![a_record("example.com", "bogus", 300)]).is_valid());
    }

    #[test]
    fn answering_keeps_matching_types_and_cnames() {
        let set = RecordSet::new(vec![
            a_record("example.com", "93.184.216.34", 300),
            Record::new("example.com", "2001:db8::1", RecordType::Aaaa, RecordClass::In, 300, "t"),
            Record::new("example.com", "edge.example.net", RecordType::Cname, RecordClass::In, 300, "t"),
        ]);

        let aaaa = set.answering(RecordType::Aaaa);
        let types: Vec<_> = aaaa.iter().map(|r| r.record_type).collect();
        assert_eq!(types, vec![RecordType::Aaaa, RecordType::Cname]);

        assert_eq!(set.answering(RecordType::Other(255)).len(), 3);
        assert_eq!(set.answering(RecordType::Cname).len(), 1);
        assert!(set.answering(RecordType::Mx).is_empty());
    }

    #[test]
    fn candidate_socket_addr_accepts_bare_ip_or_ip_port() {
        let bare = UpstreamCandidate {
            name: "Google".into(),
            ip: "8.8.8.8".into(),
            score: 0.0,
        };
        assert_eq!(bare.socket_addr(53), Some("8.8.8.8:53".parse().unwrap()));

        let with_port = UpstreamCandidate {
            ip: "127.0.0.1:5300".into(),
            ..bare.clone()
        };
        assert_eq!(with_port.socket_addr(53), Some("127.0.0.1:5300".parse().unwrap()));

        let broken = UpstreamCandidate {
            ip: "dns.google".into(),
            ..bare
        };
        assert_eq!(broken.socket_addr(53), None);
    }
}
