//! Minimal DNS message codec.
//!
//! Only what the filtering listener needs: read the header and first
//! question of a query, list the A/AAAA addresses in a response, and build
//! small responses (error codes, one synthetic A record). Upstream answers
//! are relayed as raw bytes and never re-encoded.

use super::error::{DnsError, DnsResult};
use bytes::{BufMut, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Fixed DNS header length.
pub const HEADER_LEN: usize = 12;

/// Record type A.
pub const TYPE_A: u16 = 1;
/// Record type AAAA.
pub const TYPE_AAAA: u16 = 28;
/// Class IN.
pub const CLASS_IN: u16 = 1;

/// TTL of synthesized records, in seconds.
pub const SYNTHETIC_TTL: u32 = 60;

const MAX_NAME_LEN: usize = 255;
const MAX_POINTER_HOPS: usize = 16;

/// Response codes used by the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Rcode {
    /// No error.
    NoError = 0,
    /// Query could not be parsed.
    FormErr = 1,
    /// Upstream failure or timeout.
    ServFail = 2,
    /// Name does not exist (or resolves into a blocked range).
    NxDomain = 3,
    /// Policy refused to answer.
    Refused = 5,
}

/// First question of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    /// Query name, lowercase, without trailing dot.
    pub name: String,
    /// Query type.
    pub qtype: u16,
    /// Query class.
    pub qclass: u16,
}

/// Parsed view of an incoming query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    /// Transaction id.
    pub id: u16,
    /// Raw header flags.
    pub flags: u16,
    /// First question, if the message has one.
    pub question: Option<Question>,
    /// Wire bytes of the first question (name, type, class).
    question_wire: Vec<u8>,
}

impl Query {
    /// Parse a query's header and first question.
    pub fn parse(msg: &[u8]) -> DnsResult<Self> {
        if msg.len() < HEADER_LEN {
            return Err(DnsError::Malformed("message shorter than header"));
        }
        let id = read_u16(msg, 0)?;
        let flags = read_u16(msg, 2)?;
        let qdcount = read_u16(msg, 4)?;

        if qdcount == 0 {
            return Ok(Self {
                id,
                flags,
                question: None,
                question_wire: Vec::new(),
            });
        }

        let (name, offset) = read_name(msg, HEADER_LEN)?;
        let qtype = read_u16(msg, offset)?;
        let qclass = read_u16(msg, offset + 2)?;
        let end = offset + 4;

        Ok(Self {
            id,
            flags,
            question: Some(Question { name, qtype, qclass }),
            question_wire: msg[HEADER_LEN..end].to_vec(),
        })
    }

    /// Build a response echoing this query's id, opcode, RD bit and question.
    pub fn response(&self, rcode: Rcode) -> Vec<u8> {
        self.response_with_answers(rcode, &[])
    }

    /// Response carrying one A record for the question name.
    pub fn a_record_response(&self, addr: Ipv4Addr) -> Vec<u8> {
        let mut answer = BytesMut::with_capacity(16);
        // Compression pointer to the question name at offset 12
        answer.put_u16(0xC000 | HEADER_LEN as u16);
        answer.put_u16(TYPE_A);
        answer.put_u16(CLASS_IN);
        answer.put_u32(SYNTHETIC_TTL);
        answer.put_u16(4);
        answer.put_slice(&addr.octets());
        self.response_with_answers(Rcode::NoError, &[answer.to_vec()])
    }

    fn response_with_answers(&self, rcode: Rcode, answers: &[Vec<u8>]) -> Vec<u8> {
        let opcode = self.flags & 0x7800;
        let rd = self.flags & 0x0100;
        let flags = 0x8000 | opcode | rd | 0x0080 | rcode as u16;
        let has_question = self.question.is_some();

        let mut out = BytesMut::with_capacity(HEADER_LEN + self.question_wire.len() + 16);
        out.put_u16(self.id);
        out.put_u16(flags);
        out.put_u16(u16::from(has_question));
        out.put_u16(if has_question { answers.len() as u16 } else { 0 });
        out.put_u16(0);
        out.put_u16(0);
        if has_question {
            out.put_slice(&self.question_wire);
            for answer in answers {
                out.put_slice(answer);
            }
        }
        out.to_vec()
    }
}

/// Transaction id of a message, if it has a header.
pub fn message_id(msg: &[u8]) -> Option<u16> {
    read_u16(msg, 0).ok().filter(|_| msg.len() >= HEADER_LEN)
}

/// Header-only error response for messages whose question could not be parsed.
pub fn header_only_response(msg: &[u8], rcode: Rcode) -> Option<Vec<u8>> {
    let id = message_id(msg)?;
    let flags = read_u16(msg, 2).ok()?;
    let query = Query {
        id,
        flags,
        question: None,
        question_wire: Vec::new(),
    };
    Some(query.response(rcode))
}

/// Addresses carried by A and AAAA records in the answer section.
pub fn answer_addresses(msg: &[u8]) -> DnsResult<Vec<IpAddr>> {
    if msg.len() < HEADER_LEN {
        return Err(DnsError::Malformed("message shorter than header"));
    }
    let qdcount = read_u16(msg, 4)?;
    let ancount = read_u16(msg, 6)?;

    let mut offset = HEADER_LEN;
    for _ in 0..qdcount {
        offset = skip_name(msg, offset)? + 4;
    }

    let mut addrs = Vec::new();
    for _ in 0..ancount {
        offset = skip_name(msg, offset)?;
        let rtype = read_u16(msg, offset)?;
        let rdlen = read_u16(msg, offset + 8)? as usize;
        let rdata_start = offset + 10;
        let rdata = msg
            .get(rdata_start..rdata_start + rdlen)
            .ok_or(DnsError::Malformed("record data out of bounds"))?;

        match (rtype, rdlen) {
            (TYPE_A, 4) => {
                let octets: [u8; 4] = rdata.try_into().map_err(|_| DnsError::Malformed("bad A record"))?;
                addrs.push(IpAddr::V4(Ipv4Addr::from(octets)));
            }
            (TYPE_AAAA, 16) => {
                let octets: [u8; 16] = rdata.try_into().map_err(|_| DnsError::Malformed("bad AAAA record"))?;
                addrs.push(IpAddr::V6(Ipv6Addr::from(octets)));
            }
            _ => {}
        }
        offset = rdata_start + rdlen;
    }
    Ok(addrs)
}

fn read_u16(msg: &[u8], offset: usize) -> DnsResult<u16> {
    msg.get(offset..offset + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or(DnsError::Malformed("truncated message"))
}

/// Read a possibly compressed name; returns it and the offset just past it.
fn read_name(msg: &[u8], start: usize) -> DnsResult<(String, usize)> {
    let mut labels: Vec<String> = Vec::new();
    let mut offset = start;
    let mut end = None;
    let mut hops = 0;
    let mut total = 0;

    loop {
        let len = *msg
            .get(offset)
            .ok_or(DnsError::Malformed("truncated name"))? as usize;
        match len & 0xC0 {
            0x00 => {
                if len == 0 {
                    break;
                }
                let label = msg
                    .get(offset + 1..offset + 1 + len)
                    .ok_or(DnsError::Malformed("truncated label"))?;
                total += len + 1;
                if total > MAX_NAME_LEN {
                    return Err(DnsError::Malformed("name too long"));
                }
                labels.push(decode_label(label)?);
                offset += 1 + len;
            }
            0xC0 => {
                let pointer = (read_u16(msg, offset)? & 0x3FFF) as usize;
                if end.is_none() {
                    end = Some(offset + 2);
                }
                hops += 1;
                if hops > MAX_POINTER_HOPS {
                    return Err(DnsError::Malformed("compression loop"));
                }
                offset = pointer;
            }
            _ => return Err(DnsError::Malformed("unsupported label type")),
        }
    }

    Ok((labels.join("."), end.unwrap_or(offset + 1)))
}

/// One label as checked against the allowlist. A `.` inside a label or a
/// non-printable byte would make the checked name differ from the one
/// forwarded upstream.
fn decode_label(label: &[u8]) -> DnsResult<String> {
    if label.iter().any(|&b| b == b'.' || !b.is_ascii_graphic()) {
        return Err(DnsError::Malformed("invalid label character"));
    }
    Ok(label.iter().map(|&b| b.to_ascii_lowercase() as char).collect())
}

fn skip_name(msg: &[u8], start: usize) -> DnsResult<usize> {
    let mut offset = start;
    loop {
        let len = *msg
            .get(offset)
            .ok_or(DnsError::Malformed("truncated name"))? as usize;
        match len & 0xC0 {
            0x00 if len == 0 => return Ok(offset + 1),
            0x00 => offset += 1 + len,
            0xC0 => return Ok(offset + 2),
            _ => return Err(DnsError::Malformed("unsupported label type")),
        }
    }
}

/// Encode a standard recursive query. Used by tests and diagnostics.
pub fn encode_query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(HEADER_LEN + name.len() + 6);
    out.put_u16(id);
    out.put_u16(0x0100);
    out.put_u16(1);
    out.put_u16(0);
    out.put_u16(0);
    out.put_u16(0);
    for label in name.trim_end_matches('.').split('.').filter(|l| !l.is_empty()) {
        out.put_u8(label.len() as u8);
        out.put_slice(label.as_bytes());
    }
    out.put_u8(0);
    out.put_u16(qtype);
    out.put_u16(CLASS_IN);
    out.to_vec()
}

/// Response code of a message.
pub fn rcode_of(msg: &[u8]) -> Option<u8> {
    msg.get(3).map(|b| b & 0x0F)
}
