use std::net::Ipv4Addr;

use thiserror::Error;

pub const DNS_HEADER_LEN: usize = 12;
pub const MAX_DATAGRAM_LEN: usize = 512;
pub const ANSWER_TTL_SECS: u32 = 60;

// QR=1, RD=1, RA=1, NOERROR.
const RESPONSE_FLAGS: u16 = 0x8180;
// Pointer to the question name at offset 12.
const NAME_POINTER: [u8; 2] = [0xC0, 0x0C];
const TYPE_A: u16 = 1;
const CLASS_IN: u16 = 1;
const ANSWER_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DnsError {
    #[error("datagram shorter than the {DNS_HEADER_LEN}-byte header")]
    TruncatedHeader,
    #[error("query carries no question")]
    NoQuestion,
    #[error("question section is truncated")]
    BadQuestion,
    #[error("response would exceed {MAX_DATAGRAM_LEN} bytes")]
    OversizeResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsHeader {
    pub id: u16,
    pub flags: u16,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl DnsHeader {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DnsError> {
        if bytes.len() < DNS_HEADER_LEN {
            return Err(DnsError::TruncatedHeader);
        }
        let field = |offset: usize| u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
        Ok(Self {
            id: field(0),
            flags: field(2),
            qdcount: field(4),
            ancount: field(6),
            nscount: field(8),
            arcount: field(10),
        })
    }

    pub fn to_bytes(&self) -> [u8; DNS_HEADER_LEN] {
        let fields = [
            self.id,
            self.flags,
            self.qdcount,
            self.ancount,
            self.nscount,
            self.arcount,
        ];
        let mut out = [0u8; DNS_HEADER_LEN];
        for (chunk, field) in out.chunks_exact_mut(2).zip(fields) {
            chunk.copy_from_slice(&field.to_be_bytes());
        }
        out
    }
}

// Any error means the caller drops the datagram without a reply.
pub fn captive_response(query: &[u8], addr: Ipv4Addr) -> Result<Vec<u8>, DnsError> {
    let header = DnsHeader::from_bytes(query)?;
    if header.qdcount == 0 {
        return Err(DnsError::NoQuestion);
    }

    let question_end = question_end(query)?;
    if question_end + ANSWER_LEN > MAX_DATAGRAM_LEN {
        return Err(DnsError::OversizeResponse);
    }

    let reply_header = DnsHeader {
        id: header.id,
        flags: RESPONSE_FLAGS,
        qdcount: 1,
        ancount: 1,
        nscount: 0,
        arcount: 0,
    };

    let mut out = Vec::with_capacity(question_end + ANSWER_LEN);
    out.extend_from_slice(&reply_header.to_bytes());
    out.extend_from_slice(&query[DNS_HEADER_LEN..question_end]);
    out.extend_from_slice(&NAME_POINTER);
    out.extend_from_slice(&TYPE_A.to_be_bytes());
    out.extend_from_slice(&CLASS_IN.to_be_bytes());
    out.extend_from_slice(&ANSWER_TTL_SECS.to_be_bytes());
    out.extend_from_slice(&(addr.octets().len() as u16).to_be_bytes());
    out.extend_from_slice(&addr.octets());
    Ok(out)
}

// Offset one past the first question's QCLASS.
fn question_end(query: &[u8]) -> Result<usize, DnsError> {
    let mut pos = DNS_HEADER_LEN;
    loop {
        let len = *query.get(pos).ok_or(DnsError::BadQuestion)? as usize;
        pos += 1;
        if len == 0 {
            break;
        }
        if len & 0xC0 == 0xC0 {
            // Compression pointer ends the name after one more byte.
            if pos >= query.len() {
                return Err(DnsError::BadQuestion);
            }
            pos += 1;
            break;
        }
        pos += len;
        if pos > query.len() {
            return Err(DnsError::BadQuestion);
        }
    }

    pos += 4; // QTYPE + QCLASS
    if pos > query.len() {
        return Err(DnsError::BadQuestion);
    }
    Ok(pos)
}
