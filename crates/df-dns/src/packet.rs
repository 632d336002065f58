//! DNS wire format parser and serializer (RFC 1035, RFC 6891 OPT only).
//!
//! Replies are shaped for strict firewall resolvers: the transaction id and
//! question are echoed, QR/AA/RD/RA are always set, at most one answer is
//! carried (TTL 300) and an OPT record advertising a 4096-byte payload is
//! appended when the client sent one.

use thiserror::Error;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::records::{DnsRecord, RData, RecordClass, RecordType};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DnsParseError {
    #[error("Packet truncated at offset {0}")]
    Truncated(usize),
    #[error("Name compression loop detected")]
    CompressionLoop,
    #[error("Invalid UTF-8 in name")]
    InvalidUtf8,
    #[error("Packet too short: {0} bytes")]
    TooShort(usize),
    #[error("Name too long (exceeds 255 bytes)")]
    NameTooLong,
    #[error("Label too long: {0} bytes (max 63)")]
    LabelTooLong(usize),
    #[error("Message is a response, not a query")]
    NotAQuery,
    #[error("Query carries no question")]
    NoQuestion,
}

pub const RCODE_NOERROR: u8 = 0;
pub const RCODE_NXDOMAIN: u8 = 3;
pub const RCODE_NOTIMP: u8 = 4;

/// TTL of every synthesized answer
pub const ANSWER_TTL: u32 = 300;
/// UDP payload size acknowledged in our OPT record
pub const EDNS_UDP_PAYLOAD: u16 = 4096;
/// UDP payload size advertised to upstream resolvers
const UPSTREAM_UDP_PAYLOAD: u16 = 1232;

const FLAG_QR: u16 = 0x8000;
const FLAG_AA: u16 = 0x0400;
const FLAG_RD: u16 = 0x0100;
const FLAG_RA: u16 = 0x0080;

const HEADER_LEN: usize = 12;
/// Compression pointer to the question name, which always starts right after the header
const QUESTION_NAME_POINTER: [u8; 2] = [0xC0, HEADER_LEN as u8];

/// Parsed DNS header (12 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsHeader {
    pub id: u16,
    pub flags: u16,
    pub qd_count: u16,
    pub an_count: u16,
    pub ns_count: u16,
    pub ar_count: u16,
}

impl DnsHeader {
    pub fn is_response(&self) -> bool {
        self.flags & FLAG_QR != 0
    }
    pub fn is_authoritative(&self) -> bool {
        self.flags & FLAG_AA != 0
    }
    pub fn recursion_desired(&self) -> bool {
        self.flags & FLAG_RD != 0
    }
    pub fn recursion_available(&self) -> bool {
        self.flags & FLAG_RA != 0
    }
    pub fn rcode(&self) -> u8 {
        (self.flags & 0xF) as u8
    }
}

/// The question of a query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    /// Fully qualified, lowercase, dot-terminated (`example.com.`)
    pub name: String,
    pub qtype: RecordType,
    pub qclass: RecordClass,
}

/// A parsed client query
#[derive(Debug, Clone)]
pub struct DnsQuery {
    pub header: DnsHeader,
    pub question: DnsQuestion,
    /// Question section exactly as received (echoed in replies, original case kept)
    pub raw_question_bytes: Vec<u8>,
    /// UDP payload size from the client's OPT record, if it sent one
    pub edns_payload: Option<u16>,
}

/// Parse a DNS name with pointer compression support.
/// Returns (name without the root dot, offset just past the name).
pub fn parse_name(buf: &[u8], mut offset: usize) -> Result<(String, usize), DnsParseError> {
    let mut name = String::with_capacity(64);
    let mut jumped = false;
    let mut end_offset = 0;
    let mut jumps = 0;
    const MAX_JUMPS: usize = 10;

    loop {
        let len = *buf.get(offset).ok_or(DnsParseError::Truncated(offset))? as usize;

        if len & 0xC0 == 0xC0 {
            let low = *buf.get(offset + 1).ok_or(DnsParseError::Truncated(offset))? as usize;
            if !jumped {
                end_offset = offset + 2;
            }
            offset = ((len & 0x3F) << 8) | low;
            jumped = true;
            jumps += 1;
            if jumps > MAX_JUMPS {
                return Err(DnsParseError::CompressionLoop);
            }
            continue;
        }

        if len == 0 {
            if !jumped {
                end_offset = offset + 1;
            }
            break;
        }

        if len > 63 {
            return Err(DnsParseError::LabelTooLong(len));
        }

        offset += 1;
        let label = buf
            .get(offset..offset + len)
            .ok_or(DnsParseError::Truncated(offset))?;
        let label = std::str::from_utf8(label).map_err(|_| DnsParseError::InvalidUtf8)?;

        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(label);
        offset += len;

        if name.len() > 253 {
            return Err(DnsParseError::NameTooLong);
        }
    }

    Ok((name, end_offset))
}

/// Encode a name into wire labels. A trailing root dot is optional.
pub fn encode_name(name: &str, buf: &mut Vec<u8>) {
    let name = name.strip_suffix('.').unwrap_or(name);
    if name.is_empty() {
        buf.push(0);
        return;
    }
    for label in name.split('.') {
        let len = label.len().min(63);
        buf.push(len as u8);
        buf.extend_from_slice(&label.as_bytes()[..len]);
    }
    buf.push(0);
}

fn read_u16(buf: &[u8], offset: usize) -> Result<u16, DnsParseError> {
    buf.get(offset..offset + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or(DnsParseError::Truncated(offset))
}

fn read_u32(buf: &[u8], offset: usize) -> Result<u32, DnsParseError> {
    buf.get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(DnsParseError::Truncated(offset))
}

fn parse_header(buf: &[u8]) -> Result<DnsHeader, DnsParseError> {
    if buf.len() < HEADER_LEN {
        return Err(DnsParseError::TooShort(buf.len()));
    }
    Ok(DnsHeader {
        id: read_u16(buf, 0)?,
        flags: read_u16(buf, 2)?,
        qd_count: read_u16(buf, 4)?,
        an_count: read_u16(buf, 6)?,
        ns_count: read_u16(buf, 8)?,
        ar_count: read_u16(buf, 10)?,
    })
}

/// Parse a client query. Only the first question is kept.
pub fn parse_query(buf: &[u8]) -> Result<DnsQuery, DnsParseError> {
    let header = parse_header(buf)?;
    if header.is_response() {
        return Err(DnsParseError::NotAQuery);
    }
    if header.qd_count == 0 {
        return Err(DnsParseError::NoQuestion);
    }

    let (name, offset) = parse_name(buf, HEADER_LEN)?;
    let qtype = RecordType::from_u16(read_u16(buf, offset)?);
    let qclass = RecordClass::from_u16(read_u16(buf, offset + 2)?);
    let question_end = offset + 4;

    // The additional section is best effort: a broken trailer only loses EDNS
    let edns_payload = find_opt_payload(buf, &header, question_end).ok().flatten();

    Ok(DnsQuery {
        question: DnsQuestion {
            name: format!("{}.", name.to_lowercase()),
            qtype,
            qclass,
        },
        raw_question_bytes: buf[HEADER_LEN..question_end].to_vec(),
        edns_payload,
        header,
    })
}

/// Skip to the additional section and return the OPT record's payload size.
fn find_opt_payload(
    buf: &[u8],
    header: &DnsHeader,
    mut offset: usize,
) -> Result<Option<u16>, DnsParseError> {
    for _ in 1..header.qd_count {
        let (_, end) = parse_name(buf, offset)?;
        offset = end + 4;
    }
    for _ in 0..(header.an_count as usize + header.ns_count as usize) {
        offset = skip_record(buf, offset)?;
    }
    for _ in 0..header.ar_count {
        let (_, end) = parse_name(buf, offset)?;
        if RecordType::from_u16(read_u16(buf, end)?) == RecordType::OPT {
            return Ok(Some(read_u16(buf, end + 2)?));
        }
        offset = skip_record(buf, offset)?;
    }
    Ok(None)
}

fn skip_record(buf: &[u8], offset: usize) -> Result<usize, DnsParseError> {
    let (_, end) = parse_name(buf, offset)?;
    let rdlength = read_u16(buf, end + 8)? as usize;
    let next = end + 10 + rdlength;
    if next > buf.len() {
        return Err(DnsParseError::Truncated(end));
    }
    Ok(next)
}

/// Build the reply to `query`: zero or one answer, the given rcode, and an
/// OPT record when the client advertised EDNS.
pub fn build_reply(query: &DnsQuery, answer: Option<&DnsRecord>, rcode: u8) -> Vec<u8> {
    let mut buf = Vec::with_capacity(128);

    buf.extend_from_slice(&query.header.id.to_be_bytes());
    let flags: u16 = FLAG_QR | FLAG_AA | FLAG_RD | FLAG_RA | (rcode as u16 & 0xF);
    buf.extend_from_slice(&flags.to_be_bytes());

    buf.extend_from_slice(&1u16.to_be_bytes()); // QD
    buf.extend_from_slice(&(answer.is_some() as u16).to_be_bytes()); // AN
    buf.extend_from_slice(&0u16.to_be_bytes()); // NS
    buf.extend_from_slice(&(query.edns_payload.is_some() as u16).to_be_bytes()); // AR

    buf.extend_from_slice(&query.raw_question_bytes);

    if let Some(record) = answer {
        buf.extend_from_slice(&QUESTION_NAME_POINTER);
        buf.extend_from_slice(&record.rtype.to_u16().to_be_bytes());
        buf.extend_from_slice(&record.class.to_u16().to_be_bytes());
        buf.extend_from_slice(&record.ttl.to_be_bytes());
        encode_rdata(&record.rdata, &mut buf);
    }

    if query.edns_payload.is_some() {
        encode_opt(EDNS_UDP_PAYLOAD, &mut buf);
    }

    buf
}

/// Build a recursive single-question query for an upstream resolver.
pub fn build_query(id: u16, name: &str, qtype: RecordType) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);

    buf.extend_from_slice(&id.to_be_bytes());
    buf.extend_from_slice(&FLAG_RD.to_be_bytes());
    buf.extend_from_slice(&1u16.to_be_bytes()); // QD
    buf.extend_from_slice(&0u16.to_be_bytes()); // AN
    buf.extend_from_slice(&0u16.to_be_bytes()); // NS
    buf.extend_from_slice(&1u16.to_be_bytes()); // AR = OPT

    encode_name(name, &mut buf);
    buf.extend_from_slice(&qtype.to_u16().to_be_bytes());
    buf.extend_from_slice(&RecordClass::IN.to_u16().to_be_bytes());

    encode_opt(UPSTREAM_UDP_PAYLOAD, &mut buf);
    buf
}

/// OPT pseudo-record: root name, TYPE 41, CLASS = payload size, no flags, no options.
fn encode_opt(payload: u16, buf: &mut Vec<u8>) {
    buf.push(0x00);
    buf.extend_from_slice(&RecordType::OPT.to_u16().to_be_bytes());
    buf.extend_from_slice(&payload.to_be_bytes());
    buf.extend_from_slice(&0u32.to_be_bytes());
    buf.extend_from_slice(&0u16.to_be_bytes());
}

/// Upstream response: header plus answer records (OPT filtered out).
pub struct ParsedResponse {
    pub header: DnsHeader,
    pub answers: Vec<DnsRecord>,
}

pub fn parse_response(buf: &[u8]) -> Result<ParsedResponse, DnsParseError> {
    let header = parse_header(buf)?;
    let mut offset = HEADER_LEN;

    for _ in 0..header.qd_count {
        let (_, end) = parse_name(buf, offset)?;
        offset = end + 4;
    }

    let mut answers = Vec::with_capacity(header.an_count as usize);
    for _ in 0..header.an_count {
        let (name, end) = parse_name(buf, offset)?;
        let rtype = RecordType::from_u16(read_u16(buf, end)?);
        let class = RecordClass::from_u16(read_u16(buf, end + 2)?);
        let ttl = read_u32(buf, end + 4)?;
        let rdlength = read_u16(buf, end + 8)? as usize;
        let rdata_start = end + 10;
        if rdata_start + rdlength > buf.len() {
            return Err(DnsParseError::Truncated(rdata_start));
        }
        offset = rdata_start + rdlength;

        if rtype == RecordType::OPT {
            continue;
        }

        answers.push(DnsRecord {
            name: name.to_lowercase(),
            rtype,
            class,
            ttl,
            rdata: parse_rdata(buf, rdata_start, rdlength, rtype)?,
        });
    }

    Ok(ParsedResponse { header, answers })
}

fn parse_rdata(
    buf: &[u8],
    offset: usize,
    rdlength: usize,
    rtype: RecordType,
) -> Result<RData, DnsParseError> {
    let raw = &buf[offset..offset + rdlength];
    match rtype {
        RecordType::A if rdlength == 4 => Ok(RData::A(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]))),
        RecordType::AAAA if rdlength == 16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(raw);
            Ok(RData::AAAA(Ipv6Addr::from(octets)))
        }
        RecordType::CNAME => Ok(RData::CNAME(parse_name(buf, offset)?.0)),
        RecordType::PTR => Ok(RData::PTR(parse_name(buf, offset)?.0)),
        _ => Ok(RData::Raw(raw.to_vec())),
    }
}

fn encode_rdata(rdata: &RData, buf: &mut Vec<u8>) {
    match rdata {
        RData::A(ip) => {
            buf.extend_from_slice(&4u16.to_be_bytes());
            buf.extend_from_slice(&ip.octets());
        }
        RData::AAAA(ip) => {
            buf.extend_from_slice(&16u16.to_be_bytes());
            buf.extend_from_slice(&ip.octets());
        }
        RData::CNAME(name) | RData::PTR(name) => {
            let mut rdata_buf = Vec::new();
            encode_name(name, &mut rdata_buf);
            buf.extend_from_slice(&(rdata_buf.len() as u16).to_be_bytes());
            buf.extend_from_slice(&rdata_buf);
        }
        RData::Raw(data) => {
            buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
            buf.extend_from_slice(data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query_bytes(id: u16, name: &str, qtype: u16, edns: bool) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&id.to_be_bytes());
        buf.extend_from_slice(&[0x01, 0x00]); // RD
        buf.extend_from_slice(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x00]);
        buf.extend_from_slice(&(edns as u16).to_be_bytes());
        encode_name(name, &mut buf);
        buf.extend_from_slice(&qtype.to_be_bytes());
        buf.extend_from_slice(&[0x00, 0x01]);
        if edns {
            encode_opt(1232, &mut buf);
        }
        buf
    }

    #[test]
    fn test_encode_decode_name() {
        let mut buf = Vec::new();
        encode_name("www.example.com.", &mut buf);
        assert_eq!(buf, b"\x03www\x07example\x03com\x00");

        let (name, end) = parse_name(&buf, 0).unwrap();
        assert_eq!(name, "www.example.com");
        assert_eq!(end, buf.len());
    }

    #[test]
    fn test_encode_root_name() {
        let mut buf = Vec::new();
        encode_name(".", &mut buf);
        assert_eq!(buf, b"\x00");
    }

    #[test]
    fn test_parse_name_with_pointer() {
        let mut buf = Vec::new();
        encode_name("example.com", &mut buf);
        let ptr_offset = buf.len();
        buf.extend_from_slice(&[0xC0, 0x00]);

        let (name, end) = parse_name(&buf, ptr_offset).unwrap();
        assert_eq!(name, "example.com");
        assert_eq!(end, ptr_offset + 2);
    }

    #[test]
    fn test_parse_name_compression_loop() {
        let buf = [0xC0, 0x00];
        assert_eq!(parse_name(&buf, 0), Err(DnsParseError::CompressionLoop));
    }

    #[test]
    fn test_parse_query() {
        let buf = query_bytes(0x1234, "Example.COM", 1, false);
        let query = parse_query(&buf).unwrap();
        assert_eq!(query.header.id, 0x1234);
        assert!(query.header.recursion_desired());
        assert_eq!(query.question.name, "example.com.");
        assert_eq!(query.question.qtype, RecordType::A);
        assert_eq!(query.question.qclass, RecordClass::IN);
        assert_eq!(query.edns_payload, None);
    }

    #[test]
    fn test_parse_query_with_opt() {
        let buf = query_bytes(7, "example.com", 28, true);
        let query = parse_query(&buf).unwrap();
        assert_eq!(query.question.qtype, RecordType::AAAA);
        assert_eq!(query.edns_payload, Some(1232));
    }

    #[test]
    fn test_rejects_malformed_input() {
        assert_eq!(parse_query(&[0u8; 5]).unwrap_err(), DnsParseError::TooShort(5));

        let mut response = query_bytes(1, "example.com", 1, false);
        response[2] |= 0x80;
        assert_eq!(parse_query(&response).unwrap_err(), DnsParseError::NotAQuery);

        let mut empty = query_bytes(1, "example.com", 1, false);
        empty[5] = 0;
        assert_eq!(parse_query(&empty).unwrap_err(), DnsParseError::NoQuestion);

        let truncated = query_bytes(1, "example.com", 1, false);
        assert!(matches!(
            parse_query(&truncated[..truncated.len() - 3]),
            Err(DnsParseError::Truncated(_))
        ));
    }

    #[test]
    fn test_reply_shape_with_answer() {
        let query = parse_query(&query_bytes(0xBEEF, "Example.com", 1, true)).unwrap();
        let record = DnsRecord::a("example.com.", Ipv4Addr::new(93, 184, 216, 34), ANSWER_TTL);
        let reply = build_reply(&query, Some(&record), RCODE_NOERROR);

        assert_eq!(&reply[0..2], &[0xBE, 0xEF]);
        // QR AA RD RA, rcode 0
        assert_eq!(&reply[2..4], &[0x85, 0x80]);
        assert_eq!(&reply[4..12], &[0, 1, 0, 1, 0, 0, 0, 1]);
        // Question echoed with its original case
        let qlen = query.raw_question_bytes.len();
        assert_eq!(&reply[12..12 + qlen], query.raw_question_bytes.as_slice());
        assert_eq!(&reply[13..20], b"Example");

        let answer = &reply[12 + qlen..];
        assert_eq!(&answer[0..2], &[0xC0, 0x0C]);
        assert_eq!(&answer[2..4], &[0x00, 0x01]); // A
        assert_eq!(&answer[4..6], &[0x00, 0x01]); // IN
        assert_eq!(&answer[6..10], &300u32.to_be_bytes());
        assert_eq!(&answer[10..12], &[0x00, 0x04]);
        assert_eq!(&answer[12..16], &[93, 184, 216, 34]);
        // OPT: root, TYPE 41, CLASS 4096, TTL 0, RDLEN 0
        assert_eq!(&answer[16..], &[0x00, 0x00, 0x29, 0x10, 0x00, 0, 0, 0, 0, 0, 0]);

        let parsed = parse_response(&reply).unwrap();
        assert!(parsed.header.is_authoritative());
        assert!(parsed.header.recursion_available());
        assert_eq!(parsed.answers.len(), 1);
        assert_eq!(parsed.answers[0].name, "example.com");
        assert_eq!(parsed.answers[0].rdata, RData::A(Ipv4Addr::new(93, 184, 216, 34)));
    }

    #[test]
    fn test_error_reply_without_edns() {
        let query = parse_query(&query_bytes(9, "example.com", 255, false)).unwrap();
        let reply = build_reply(&query, None, RCODE_NOTIMP);

        let header = parse_header(&reply).unwrap();
        assert_eq!(header.id, 9);
        assert_eq!(header.rcode(), RCODE_NOTIMP);
        assert_eq!((header.qd_count, header.an_count, header.ar_count), (1, 0, 0));
        assert_eq!(reply.len(), 12 + query.raw_question_bytes.len());
    }

    #[test]
    fn test_ptr_reply() {
        let query = parse_query(&query_bytes(3, "1.0.0.10.in-addr.arpa", 12, false)).unwrap();
        let record = DnsRecord::ptr(&query.question.name, "fw.local", ANSWER_TTL);
        let reply = build_reply(&query, Some(&record), RCODE_NOERROR);

        let parsed = parse_response(&reply).unwrap();
        assert_eq!(parsed.answers[0].name, "1.0.0.10.in-addr.arpa");
        assert_eq!(parsed.answers[0].rdata, RData::PTR("fw.local".to_string()));
        assert_eq!(parsed.answers[0].ttl, 300);
    }

    #[test]
    fn test_build_upstream_query() {
        let buf = build_query(0x4242, "example.com.", RecordType::AAAA);
        let header = parse_header(&buf).unwrap();
        assert_eq!(header.id, 0x4242);
        assert!(header.recursion_desired());
        assert!(!header.is_response());

        let query = parse_query(&buf).unwrap();
        assert_eq!(query.question.name, "example.com.");
        assert_eq!(query.question.qtype, RecordType::AAAA);
        assert_eq!(query.edns_payload, Some(1232));
    }

    #[test]
    fn test_parse_response_with_cname_chain() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&[0x00, 0x01, 0x81, 0x80, 0, 1, 0, 2, 0, 0, 0, 0]);
        encode_name("www.example.com", &mut buf);
        buf.extend_from_slice(&[0, 1, 0, 1]);
        // CNAME www.example.com -> edge.example.net
        buf.extend_from_slice(&[0xC0, 0x0C, 0, 5, 0, 1, 0, 0, 0, 60]);
        let mut target = Vec::new();
        encode_name("edge.example.net", &mut target);
        buf.extend_from_slice(&(target.len() as u16).to_be_bytes());
        buf.extend_from_slice(&target);
        // A edge.example.net
        buf.extend_from_slice(&[0xC0, 0x0C, 0, 1, 0, 1, 0, 0, 0, 60, 0, 4, 1, 2, 3, 4]);

        let parsed = parse_response(&buf).unwrap();
        assert_eq!(parsed.answers.len(), 2);
        assert_eq!(parsed.answers[0].rdata, RData::CNAME("edge.example.net".to_string()));
        assert_eq!(parsed.answers[1].rdata, RData::A(Ipv4Addr::new(1, 2, 3, 4)));
    }
}
