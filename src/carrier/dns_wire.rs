// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Minimal DNS message encode/decode: one question, one TXT answer. The
//! fixed 12-byte header is a zerocopy struct, matching the teacher's use of
//! zerocopy for fixed-layout wire segments; the variable-length question
//! and answer sections are walked by hand.

use bytes::{BufMut, Bytes, BytesMut};
use zerocopy::{BigEndian, FromBytes, Immutable, IntoBytes, KnownLayout, U16};

use crate::error::TunnelError;

const QTYPE_TXT: u16 = 0x0010;
const QCLASS_IN: u16 = 0x0001;
const FLAG_RD: u16 = 0x0100;

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Debug, Clone, Copy)]
#[repr(C)]
struct DnsHeader {
    id: U16<BigEndian>,
    flags: U16<BigEndian>,
    qdcount: U16<BigEndian>,
    ancount: U16<BigEndian>,
    nscount: U16<BigEndian>,
    arcount: U16<BigEndian>,
}

/// The validated result of parsing one DNS response datagram: header
/// counters (for the caller to check against `spec.md` §4.6's acceptance
/// rules) and the concatenated TXT character-string bytes of the first
/// answer, if any.
pub struct DnsResponse {
    pub rcode: u8,
    pub qdcount: u16,
    pub ancount: u16,
    pub txt_rdata: Vec<u8>,
}

/// Builds a recursion-desired DNS query for one TXT question named `name`.
pub fn encode_query(txid: u16, name: &str) -> Bytes {
    let header = DnsHeader {
        id: U16::new(txid),
        flags: U16::new(FLAG_RD),
        qdcount: U16::new(1),
        ancount: U16::new(0),
        nscount: U16::new(0),
        arcount: U16::new(0),
    };

    let mut buf = BytesMut::with_capacity(64);
    buf.put_slice(header.as_bytes());
    put_qname(&mut buf, name);
    buf.put_u16(QTYPE_TXT);
    buf.put_u16(QCLASS_IN);
    buf.freeze()
}

fn put_qname(buf: &mut BytesMut, name: &str) {
    for label in name.split('.').filter(|l| !l.is_empty()) {
        buf.put_u8(label.len() as u8);
        buf.put_slice(label.as_bytes());
    }
    buf.put_u8(0);
}

/// Parses a DNS response datagram, validating just enough structure to
/// extract the header counters and (if present) the first answer's TXT
/// rdata. Any structural problem is a transient carrier error.
pub fn parse_response(bytes: &[u8]) -> Result<DnsResponse, TunnelError> {
    let (header, _) = DnsHeader::read_from_prefix(bytes)
        .map_err(|_| TunnelError::Transient("DNS message shorter than header".into()))?;

    let rcode = (header.flags.get() & 0x000F) as u8;
    let qdcount = header.qdcount.get();
    let ancount = header.ancount.get();

    let mut pos = 12usize;
    for _ in 0..qdcount {
        pos = skip_name(bytes, pos)?;
        pos = require_len(bytes, pos, 4)?; // qtype + qclass
    }

    if ancount == 0 {
        return Ok(DnsResponse {
            rcode,
            qdcount,
            ancount,
            txt_rdata: Vec::new(),
        });
    }

    pos = skip_name(bytes, pos)?;
    let (rtype, rclass, rdlength, data_start) = read_rr_head(bytes, pos)?;
    pos = require_len(bytes, data_start, rdlength)?;
    let rdata = &bytes[data_start..pos];

    if rtype != QTYPE_TXT || rclass != QCLASS_IN {
        return Err(TunnelError::Transient("answer is not a TXT/IN record".into()));
    }

    Ok(DnsResponse {
        rcode,
        qdcount,
        ancount,
        txt_rdata: decode_character_strings(rdata)?,
    })
}

fn require_len(bytes: &[u8], pos: usize, needed: usize) -> Result<usize, TunnelError> {
    let end = pos
        .checked_add(needed)
        .ok_or_else(|| TunnelError::Transient("DNS message length overflow".into()))?;
    if end > bytes.len() {
        return Err(TunnelError::Transient("DNS message truncated".into()));
    }
    Ok(end)
}

/// Skips a name at `pos`: a sequence of length-prefixed labels terminated by
/// a zero-length label, or a compression pointer (`0xC0` high bits). The
/// target of a pointer is never followed — callers here never need the
/// decoded name, only its end position.
fn skip_name(bytes: &[u8], mut pos: usize) -> Result<usize, TunnelError> {
    loop {
        if pos >= bytes.len() {
            return Err(TunnelError::Transient("DNS name runs past message end".into()));
        }
        let len = bytes[pos];
        if len == 0 {
            return Ok(pos + 1);
        }
        if len & 0xC0 == 0xC0 {
            require_len(bytes, pos, 2)?;
            return Ok(pos + 2);
        }
        pos = require_len(bytes, pos, 1 + len as usize)?;
    }
}

fn read_rr_head(bytes: &[u8], pos: usize) -> Result<(u16, u16, usize, usize), TunnelError> {
    let end = require_len(bytes, pos, 10)?;
    let rtype = u16::from_be_bytes([bytes[pos], bytes[pos + 1]]);
    let rclass = u16::from_be_bytes([bytes[pos + 2], bytes[pos + 3]]);
    let rdlength = u16::from_be_bytes([bytes[pos + 8], bytes[pos + 9]]) as usize;
    Ok((rtype, rclass, rdlength, end))
}

fn decode_character_strings(rdata: &[u8]) -> Result<Vec<u8>, TunnelError> {
    let mut out = Vec::with_capacity(rdata.len());
    let mut pos = 0usize;
    while pos < rdata.len() {
        let len = rdata[pos] as usize;
        let end = require_len(rdata, pos + 1, len)?;
        out.extend_from_slice(&rdata[pos + 1..end]);
        pos = end;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_character_string(buf: &mut BytesMut, s: &[u8]) {
        buf.put_u8(s.len() as u8);
        buf.put_slice(s);
    }

    fn build_txt_response(txid: u16, qname: &str, rdata_strings: &[&[u8]]) -> Bytes {
        let header = DnsHeader {
            id: U16::new(txid),
            flags: U16::new(0x8180), // QR=1, RD=1, RA=1, RCODE=0
            qdcount: U16::new(1),
            ancount: U16::new(1),
            nscount: U16::new(0),
            arcount: U16::new(0),
        };
        let mut buf = BytesMut::new();
        buf.put_slice(header.as_bytes());
        put_qname(&mut buf, qname);
        buf.put_u16(QTYPE_TXT);
        buf.put_u16(QCLASS_IN);

        // Answer: name = pointer to question's qname at offset 12.
        buf.put_u16(0xC00C);
        buf.put_u16(QTYPE_TXT);
        buf.put_u16(QCLASS_IN);
        buf.put_u32(0); // ttl
        let mut rdata = BytesMut::new();
        for s in rdata_strings {
            put_character_string(&mut rdata, s);
        }
        buf.put_u16(rdata.len() as u16);
        buf.put_slice(&rdata);

        buf.freeze()
    }

    #[test]
    fn query_encodes_expected_fields() {
        let q = encode_query(0x1234, "ab.x.example");
        assert_eq!(&q[0..2], &[0x12, 0x34]);
        assert_eq!(&q[4..6], &[0x00, 0x01]); // qdcount
    }

    #[test]
    fn response_round_trips_through_parse() {
        let datagram = build_txt_response(0x1234, "ab.x.example", &[b"deadbeef"]);
        let parsed = parse_response(&datagram).expect("parse");
        assert_eq!(parsed.rcode, 0);
        assert_eq!(parsed.qdcount, 1);
        assert_eq!(parsed.ancount, 1);
        assert_eq!(parsed.txt_rdata, b"deadbeef");
    }

    #[test]
    fn response_concatenates_multiple_character_strings() {
        let datagram = build_txt_response(1, "x.example", &[b"dead", b"beef"]);
        let parsed = parse_response(&datagram).expect("parse");
        assert_eq!(parsed.txt_rdata, b"deadbeef");
    }

    #[test]
    fn truncated_message_is_rejected() {
        assert!(parse_response(&[0u8; 4]).is_err());
    }
}
