//! Just enough of the DNS wire format for filtering queries and reading answers.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, Bytes, BytesMut};

/// Fixed header size.
pub const HEADER_LEN: usize = 12;

/// Maximum compression pointers followed while reading one name.
pub const MAX_COMPRESSION_DEPTH: usize = 10;

pub const TYPE_A: u16 = 1;
pub const TYPE_AAAA: u16 = 28;
const CLASS_IN: u16 = 1;

const FLAG_QR: u16 = 0x8000;
const FLAG_AA: u16 = 0x0400;
const FLAG_RD: u16 = 0x0100;
const FLAG_RA: u16 = 0x0080;
const RCODE_NXDOMAIN: u16 = 3;

/// The first question of a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: u16,
    /// Offset just past QTYPE and QCLASS.
    pub end: usize,
}

fn read_u16(packet: &[u8], offset: usize) -> Option<u16> {
    let bytes = packet.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_u32(packet: &[u8], offset: usize) -> Option<u32> {
    let bytes = packet.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Read a possibly compressed name starting at `offset`.
///
/// Returns the dotted name and the offset just past the name at its original
/// position.
pub fn read_name(packet: &[u8], offset: usize) -> Option<(String, usize)> {
    let mut labels: Vec<String> = Vec::new();
    let mut pos = offset;
    let mut resume = None;
    let mut jumps = 0;

    loop {
        let len = *packet.get(pos)? as usize;
        if len == 0 {
            pos += 1;
            break;
        }
        if len & 0xC0 == 0xC0 {
            jumps += 1;
            if jumps > MAX_COMPRESSION_DEPTH {
                return None;
            }
            let pointer = (read_u16(packet, pos)? & 0x3FFF) as usize;
            resume.get_or_insert(pos + 2);
            pos = pointer;
            continue;
        }
        if len & 0xC0 != 0 {
            return None;
        }
        let label = packet.get(pos + 1..pos + 1 + len)?;
        labels.push(String::from_utf8_lossy(label).into_owned());
        pos += 1 + len;
    }

    Some((labels.join("."), resume.unwrap_or(pos)))
}

/// Parse the first question of a query. Returns `None` for packets that are
/// too short, responses, or queries without a question.
pub fn parse_query(packet: &[u8]) -> Option<Question> {
    if packet.len() < HEADER_LEN {
        return None;
    }
    let flags = read_u16(packet, 2)?;
    let qdcount = read_u16(packet, 4)?;
    if flags & FLAG_QR != 0 || qdcount == 0 {
        return None;
    }
    let (name, after_name) = read_name(packet, HEADER_LEN)?;
    let qtype = read_u16(packet, after_name)?;
    read_u16(packet, after_name + 2)?;
    Some(Question {
        name,
        qtype,
        end: after_name + 4,
    })
}

/// Build an authoritative NXDOMAIN answer echoing the query's ID and question.
pub fn nxdomain(query: &[u8], question: &Question) -> Bytes {
    let id = read_u16(query, 0).unwrap_or(0);
    let rd = read_u16(query, 2).unwrap_or(0) & FLAG_RD;

    let mut out = BytesMut::with_capacity(question.end);
    out.put_u16(id);
    out.put_u16(FLAG_QR | FLAG_AA | rd | FLAG_RA | RCODE_NXDOMAIN);
    out.put_u16(1);
    out.put_u16(0);
    out.put_u16(0);
    out.put_u16(0);
    out.put_slice(&query[HEADER_LEN..question.end]);
    out.freeze()
}

/// Encode a single-question recursive query.
pub fn encode_query(id: u16, name: &str, qtype: u16) -> Bytes {
    let mut out = BytesMut::with_capacity(HEADER_LEN + name.len() + 6);
    out.put_u16(id);
    out.put_u16(FLAG_RD);
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
    out.freeze()
}

/// Response code of a message.
pub fn rcode(packet: &[u8]) -> Option<u16> {
    read_u16(packet, 2).map(|flags| flags & 0x000F)
}

/// Addresses carried by a response, labelled with the question name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsAnswer {
    pub name: String,
    pub addrs: Vec<IpAddr>,
}

/// Extract A and AAAA records from a response. CNAME chains are attributed
/// to the name that was asked for.
pub fn parse_answers(packet: &[u8]) -> Option<DnsAnswer> {
    let flags = read_u16(packet, 2)?;
    if flags & FLAG_QR == 0 {
        return None;
    }
    let qdcount = read_u16(packet, 4)?;
    let ancount = read_u16(packet, 6)?;

    let mut pos = HEADER_LEN;
    let mut name = String::new();
    for i in 0..qdcount {
        let (qname, after) = read_name(packet, pos)?;
        if i == 0 {
            name = qname;
        }
        pos = after + 4;
    }

    let mut addrs = Vec::new();
    for _ in 0..ancount {
        let (_, after) = read_name(packet, pos)?;
        let rtype = read_u16(packet, after)?;
        read_u32(packet, after + 4)?;
        let rdlen = read_u16(packet, after + 8)? as usize;
        let rdata = packet.get(after + 10..after + 10 + rdlen)?;
        match (rtype, rdlen) {
            (TYPE_A, 4) => addrs.push(IpAddr::V4(Ipv4Addr::new(
                rdata[0], rdata[1], rdata[2], rdata[3],
            ))),
            (TYPE_AAAA, 16) => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata);
                addrs.push(IpAddr::V6(Ipv6Addr::from(octets)));
            }
            _ => {}
        }
        pos = after + 10 + rdlen;
    }

    Some(DnsAnswer {
        name: name.to_ascii_lowercase(),
        addrs,
    })
}
