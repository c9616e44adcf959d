//! DNS message parsing and construction.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::time::SystemTime;

use crate::error::WireError;
use crate::record::Record;

pub const HEADER_LEN: usize = 12;

const FLAG_QR: u16 = 0x8000;
const FLAG_RD: u16 = 0x0100;
const FLAG_RA: u16 = 0x0080;
const OPCODE_QUERY: u8 = 0;

const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 253;
const MAX_POINTER_HOPS: usize = 32;

/// QTYPE asking for every record of a name.
pub const QTYPE_ANY: u16 = 255;

/// Resource record type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    A,
    Ns,
    Cname,
    Ptr,
    Mx,
    Aaaa,
    Other(u16),
}

impl RecordType {
    pub fn from_code(code: u16) -> Self {
        match code {
            1 => Self::A,
            2 => Self::Ns,
            5 => Self::Cname,
            12 => Self::Ptr,
            15 => Self::Mx,
            28 => Self::Aaaa,
            other => Self::Other(other),
        }
    }

    pub fn code(self) -> u16 {
        match self {
            Self::A => 1,
            Self::Ns => 2,
            Self::Cname => 5,
            Self::Ptr => 12,
            Self::Mx => 15,
            Self::Aaaa => 28,
            Self::Other(code) => code,
        }
    }

    /// Whether answers of this type can be turned into cacheable records.
    pub fn is_supported(self) -> bool {
        !matches!(self, Self::Other(_))
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => f.write_str("A"),
            Self::Ns => f.write_str("NS"),
            Self::Cname => f.write_str("CNAME"),
            Self::Ptr => f.write_str("PTR"),
            Self::Mx => f.write_str("MX"),
            Self::Aaaa => f.write_str("AAAA"),
            Self::Other(code) => write!(f, "TYPE{}", code),
        }
    }
}

impl FromStr for RecordType {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        match upper.as_str() {
            "A" => Ok(Self::A),
            "NS" => Ok(Self::Ns),
            "CNAME" => Ok(Self::Cname),
            "PTR" => Ok(Self::Ptr),
            "MX" => Ok(Self::Mx),
            "AAAA" => Ok(Self::Aaaa),
            _ => upper
                .strip_prefix("TYPE")
                .and_then(|code| code.parse().ok())
                .map(Self::from_code)
                .ok_or_else(|| invalid_rdata("type", s)),
        }
    }
}

/// Resource record class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordClass {
    In,
    Ch,
    Hs,
    Other(u16),
}

impl RecordClass {
    pub fn from_code(code: u16) -> Self {
        match code {
            1 => Self::In,
            3 => Self::Ch,
            4 => Self::Hs,
            other => Self::Other(other),
        }
    }

    pub fn code(self) -> u16 {
        match self {
            Self::In => 1,
            Self::Ch => 3,
            Self::Hs => 4,
            Self::Other(code) => code,
        }
    }
}

impl fmt::Display for RecordClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::In => f.write_str("IN"),
            Self::Ch => f.write_str("CH"),
            Self::Hs => f.write_str("HS"),
            Self::Other(code) => write!(f, "CLASS{}", code),
        }
    }
}

impl FromStr for RecordClass {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        match upper.as_str() {
            "IN" => Ok(Self::In),
            "CH" => Ok(Self::Ch),
            "HS" => Ok(Self::Hs),
            _ => upper
                .strip_prefix("CLASS")
                .and_then(|code| code.parse().ok())
                .map(Self::from_code)
                .ok_or_else(|| invalid_rdata("class", s)),
        }
    }
}

/// A parsed DNS query.
#[derive(Debug, Clone)]
pub struct DnsQuery {
    pub id: u16,
    pub flags: u16,
    /// Question name with the client's casing, echoed back in replies.
    pub qname: String,
    /// Lower-cased `qname`, used as the cache key.
    pub domain: String,
    pub qtype: RecordType,
    pub qclass: RecordClass,
}

impl DnsQuery {
    /// Parse a standard query from raw bytes.
    ///
    /// Anything but opcode QUERY is rejected before the question is touched.
    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < HEADER_LEN {
            return Err(WireError::Truncated(data.len()));
        }

        let id = read_u16(data, 0)?;
        let flags = read_u16(data, 2)?;

        let opcode = ((flags >> 11) & 0x0F) as u8;
        if opcode != OPCODE_QUERY {
            return Err(WireError::UnsupportedOpcode(opcode));
        }
        if flags & FLAG_QR != 0 {
            return Err(WireError::NotQuery);
        }
        if read_u16(data, 4)? == 0 {
            return Err(WireError::NoQuestion);
        }

        let (qname, pos) = read_name(data, HEADER_LEN)?;
        let qtype = read_u16(data, pos)?;
        let qclass = read_u16(data, pos + 2)?;

        Ok(Self {
            id,
            flags,
            domain: qname.to_ascii_lowercase(),
            qname,
            qtype: RecordType::from_code(qtype),
            qclass: RecordClass::from_code(qclass),
        })
    }

    pub fn recursion_desired(&self) -> bool {
        self.flags & FLAG_RD != 0
    }
}

/// A DNS message as seen on the answer path.
#[derive(Debug, Clone)]
pub struct DnsResponse {
    pub id: u16,
    pub flags: u16,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
}

/// A DNS question section entry.
#[derive(Debug, Clone)]
pub struct DnsQuestion {
    pub domain: String,
    pub qtype: RecordType,
    pub qclass: RecordClass,
}

/// A DNS resource record with uncompressed RDATA.
#[derive(Debug, Clone)]
pub struct DnsRecord {
    pub name: String,
    pub rtype: RecordType,
    pub class: RecordClass,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

impl DnsRecord {
    /// Textual form of the RDATA, as stored in the cache.
    pub fn data_text(&self) -> Result<String, WireError> {
        rdata_to_text(self.rtype, &self.rdata)
    }
}

impl DnsResponse {
    /// Empty answer for `query`: same id and question, RD echoed, RA set.
    pub fn answering(query: &DnsQuery) -> Self {
        let mut flags = FLAG_QR | FLAG_RA;
        if query.recursion_desired() {
            flags |= FLAG_RD;
        }

        Self {
            id: query.id,
            flags,
            questions: vec![DnsQuestion {
                domain: query.qname.clone(),
                qtype: query.qtype,
                qclass: query.qclass,
            }],
            answers: Vec::new(),
        }
    }

    /// Append a cached record, with its TTL taken as the time left at `now`.
    pub fn push_record(&mut self, record: &Record, now: SystemTime) -> Result<(), WireError> {
        let rdata = text_to_rdata(record.record_type, &record.ip)?;
        self.answers.push(DnsRecord {
            name: record.domain.clone(),
            rtype: record.record_type,
            class: record.record_class,
            ttl: record.remaining_ttl_at(now),
            rdata,
        });
        Ok(())
    }

    pub fn is_response(&self) -> bool {
        self.flags & FLAG_QR != 0
    }

    pub fn rcode(&self) -> u8 {
        (self.flags & 0x000F) as u8
    }

    /// Parse a response: header, questions and the answer section.
    ///
    /// Authority and additional sections are left undecoded.
    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < HEADER_LEN {
            return Err(WireError::Truncated(data.len()));
        }

        let id = read_u16(data, 0)?;
        let flags = read_u16(data, 2)?;
        if flags & FLAG_QR == 0 {
            return Err(WireError::NotResponse);
        }
        let qdcount = read_u16(data, 4)? as usize;
        let ancount = read_u16(data, 6)? as usize;

        let mut pos = HEADER_LEN;
        let mut questions = Vec::with_capacity(qdcount);
        for _ in 0..qdcount {
            let (domain, next) = read_name(data, pos)?;
            questions.push(DnsQuestion {
                domain: domain.to_ascii_lowercase(),
                qtype: RecordType::from_code(read_u16(data, next)?),
                qclass: RecordClass::from_code(read_u16(data, next + 2)?),
            });
            pos = next + 4;
        }

        let mut answers = Vec::with_capacity(ancount);
        for _ in 0..ancount {
            let (name, next) = read_name(data, pos)?;
            let rtype = RecordType::from_code(read_u16(data, next)?);
            let class = RecordClass::from_code(read_u16(data, next + 2)?);
            let ttl = clamp_ttl(read_u32(data, next + 4)?);
            let rdlength = read_u16(data, next + 8)? as usize;

            let start = next + 10;
            let end = start + rdlength;
            if end > data.len() {
                return Err(WireError::Truncated(start));
            }

            answers.push(DnsRecord {
                name: name.to_ascii_lowercase(),
                rtype,
                class,
                ttl,
                rdata: decompress_rdata(data, rtype, start, end)?,
            });
            pos = end;
        }

        Ok(Self {
            id,
            flags,
            questions,
            answers,
        })
    }

    /// Encode the response to wire format bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(512);

        // Header
        data.extend_from_slice(&self.id.to_be_bytes());
        data.extend_from_slice(&self.flags.to_be_bytes());
        data.extend_from_slice(&(self.questions.len() as u16).to_be_bytes());
        data.extend_from_slice(&(self.answers.len() as u16).to_be_bytes());
        data.extend_from_slice(&[0x00, 0x00]); // NSCOUNT
        data.extend_from_slice(&[0x00, 0x00]); // ARCOUNT

        for q in &self.questions {
            encode_name(&mut data, &q.domain);
            data.extend_from_slice(&q.qtype.code().to_be_bytes());
            data.extend_from_slice(&q.qclass.code().to_be_bytes());
        }

        for a in &self.answers {
            // Pointer to the first question's name at offset 12
            if self
                .questions
                .first()
                .is_some_and(|q| q.domain.eq_ignore_ascii_case(&a.name))
            {
                data.extend_from_slice(&[0xC0, 0x0C]);
            } else {
                encode_name(&mut data, &a.name);
            }
            data.extend_from_slice(&a.rtype.code().to_be_bytes());
            data.extend_from_slice(&a.class.code().to_be_bytes());
            data.extend_from_slice(&a.ttl.to_be_bytes());
            data.extend_from_slice(&(a.rdata.len() as u16).to_be_bytes());
            data.extend_from_slice(&a.rdata);
        }

        data
    }
}

/// Check a name in presentation form (no trailing dot).
pub fn is_valid_domain(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .split('.')
            .all(|label| !label.is_empty() && label.len() <= MAX_LABEL_LEN)
}

/// Render RDATA in its textual form.
pub fn rdata_to_text(rtype: RecordType, rdata: &[u8]) -> Result<String, WireError> {
    match rtype {
        RecordType::A => {
            let octets: [u8; 4] = rdata.try_into().map_err(|_| raw_rdata(rtype, rdata))?;
            Ok(Ipv4Addr::from(octets).to_string())
        }
        RecordType::Aaaa => {
            let octets: [u8; 16] = rdata.try_into().map_err(|_| raw_rdata(rtype, rdata))?;
            Ok(Ipv6Addr::from(octets).to_string())
        }
        RecordType::Cname | RecordType::Ns | RecordType::Ptr => {
            let (name, end) = read_name(rdata, 0)?;
            if end != rdata.len() || name.is_empty() {
                return Err(raw_rdata(rtype, rdata));
            }
            Ok(name.to_ascii_lowercase())
        }
        RecordType::Mx => {
            let preference = read_u16(rdata, 0)?;
            let (exchange, end) = read_name(rdata, 2)?;
            if end != rdata.len() || exchange.is_empty() {
                return Err(raw_rdata(rtype, rdata));
            }
            Ok(format!("{} {}", preference, exchange.to_ascii_lowercase()))
        }
        RecordType::Other(_) => Err(raw_rdata(rtype, rdata)),
    }
}

/// Encode textual data back to RDATA; fails if the text is not valid for `rtype`.
pub fn text_to_rdata(rtype: RecordType, text: &str) -> Result<Vec<u8>, WireError> {
    let invalid = || invalid_rdata(&rtype.to_string(), text);

    match rtype {
        RecordType::A => Ipv4Addr::from_str(text)
            .map(|ip| ip.octets().to_vec())
            .map_err(|_| invalid()),
        RecordType::Aaaa => Ipv6Addr::from_str(text)
            .map(|ip| ip.octets().to_vec())
            .map_err(|_| invalid()),
        RecordType::Cname | RecordType::Ns | RecordType::Ptr => {
            if !is_valid_domain(text) {
                return Err(invalid());
            }
            let mut rdata = Vec::with_capacity(text.len() + 2);
            encode_name(&mut rdata, text);
            Ok(rdata)
        }
        RecordType::Mx => {
            let (preference, exchange) = text.split_once(' ').ok_or_else(invalid)?;
            let preference: u16 = preference.parse().map_err(|_| invalid())?;
            if !is_valid_domain(exchange) {
                return Err(invalid());
            }
            let mut rdata = Vec::with_capacity(exchange.len() + 4);
            rdata.extend_from_slice(&preference.to_be_bytes());
            encode_name(&mut rdata, exchange);
            Ok(rdata)
        }
        RecordType::Other(_) => Err(invalid()),
    }
}

fn encode_name(buf: &mut Vec<u8>, domain: &str) {
    for label in domain.split('.').filter(|label| !label.is_empty()) {
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);
}

/// Read a possibly compressed name starting at `start`.
///
/// Returns the name as sent, without trailing dot, and the offset just past
/// the name in the original byte stream.
fn read_name(data: &[u8], start: usize) -> Result<(String, usize), WireError> {
    let mut labels: Vec<String> = Vec::new();
    let mut pos = start;
    let mut resume = None;
    let mut hops = 0;
    let mut name_len = 0;

    loop {
        let len = *data.get(pos).ok_or(WireError::Truncated(pos))?;
        match len & 0xC0 {
            0x00 if len == 0 => {
                pos += 1;
                break;
            }
            0x00 => {
                let end = pos + 1 + len as usize;
                let bytes = data.get(pos + 1..end).ok_or(WireError::Truncated(pos))?;
                if bytes.contains(&b'.') {
                    return Err(WireError::InvalidLabel(pos));
                }
                let label = std::str::from_utf8(bytes).map_err(|_| WireError::InvalidLabel(pos))?;
                name_len += bytes.len() + 1;
                if name_len > MAX_NAME_LEN + 1 {
                    return Err(WireError::InvalidLabel(pos));
                }
                labels.push(label.to_string());
                pos = end;
            }
            0xC0 => {
                let low = *data.get(pos + 1).ok_or(WireError::Truncated(pos + 1))?;
                resume.get_or_insert(pos + 2);
                hops += 1;
                if hops > MAX_POINTER_HOPS {
                    return Err(WireError::PointerLoop(pos));
                }
                pos = (((len & 0x3F) as usize) << 8) | low as usize;
            }
            _ => return Err(WireError::InvalidLabel(pos)),
        }
    }

    Ok((labels.join("."), resume.unwrap_or(pos)))
}

/// Copy RDATA out of the message, expanding compressed names.
///
/// A name in the RDATA must end exactly at `end`; reading past the declared
/// length would borrow bytes from the next record.
fn decompress_rdata(
    data: &[u8],
    rtype: RecordType,
    start: usize,
    end: usize,
) -> Result<Vec<u8>, WireError> {
    let name_ending_at_end = |from: usize| -> Result<String, WireError> {
        match read_name(&data[..end], from) {
            Ok((name, next)) if next == end && !name.is_empty() => Ok(name.to_ascii_lowercase()),
            _ => Err(raw_rdata(rtype, &data[start..end])),
        }
    };

    match rtype {
        RecordType::Cname | RecordType::Ns | RecordType::Ptr => {
            let name = name_ending_at_end(start)?;
            let mut rdata = Vec::with_capacity(name.len() + 2);
            encode_name(&mut rdata, &name);
            Ok(rdata)
        }
        RecordType::Mx => {
            if end - start < 3 {
                return Err(raw_rdata(rtype, &data[start..end]));
            }
            let exchange = name_ending_at_end(start + 2)?;
            let mut rdata = Vec::with_capacity(exchange.len() + 4);
            rdata.extend_from_slice(&data[start..start + 2]);
            encode_name(&mut rdata, &exchange);
            Ok(rdata)
        }
        _ => Ok(data[start..end].to_vec()),
    }
}

/// TTLs with the top bit set count as zero (RFC 2181 section 8).
pub(crate) fn clamp_ttl(ttl: u32) -> u32 {
    if ttl > i32::MAX as u32 { 0 } else { ttl }
}

fn read_u16(data: &[u8], pos: usize) -> Result<u16, WireError> {
    data.get(pos..pos + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or(WireError::Truncated(pos))
}

fn read_u32(data: &[u8], pos: usize) -> Result<u32, WireError> {
    data.get(pos..pos + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(WireError::Truncated(pos))
}

fn invalid_rdata(rtype: &str, value: &str) -> WireError {
    WireError::InvalidRdata {
        rtype: rtype.to_string(),
        value: value.to_string(),
    }
}

fn raw_rdata(rtype: RecordType, rdata: &[u8]) -> WireError {
    invalid_rdata(&rtype.to_string(), &format!("{:02x?}", rdata))
}
