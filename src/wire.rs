//! DNS wire format: query construction and answer parsing
//!
//! Builds query packets by hand (header, QNAME label encoding) and walks
//! answer sections, following compression pointers where servers use them.
//! Only the record types the tunnel cares about are decoded: TXT answers as
//! concatenated character-strings, CNAME answers as the decompressed target
//! name, NULL answers as raw RDATA.

use thiserror::Error;

pub const QTYPE_A: u16 = 1;
pub const QTYPE_CNAME: u16 = 5;
pub const QTYPE_NULL: u16 = 10;
pub const QTYPE_TXT: u16 = 16;
pub const QCLASS_IN: u16 = 1;

/// Maximum bytes in a single DNS label (RFC 1035)
pub const MAX_LABEL_LEN: usize = 63;

/// Maximum length of a presentation-format name
pub const MAX_NAME_LEN: usize = 253;

/// DNS message header length
pub const HEADER_LEN: usize = 12;

/// Wire format errors
#[derive(Debug, Error)]
pub enum WireError {
    #[error("name too long: {0} bytes")]
    NameTooLong(usize),

    #[error("label too long: {0} bytes")]
    LabelTooLong(usize),

    #[error("packet too short: {0} bytes")]
    Truncated(usize),

    #[error("malformed packet: {0}")]
    Malformed(&'static str),
}

/// A decoded answer record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RData {
    /// TXT character-strings, concatenated in record order
    Txt(Vec<u8>),
    /// CNAME target in presentation format
    Cname(String),
    /// NULL RDATA, verbatim
    Null(Vec<u8>),
    /// Any record type the tunnel does not decode
    Other(u16),
}

/// A parsed DNS response
#[derive(Debug, Clone)]
pub struct Response {
    pub id: u16,
    pub rcode: u8,
    pub answers: Vec<RData>,
}

/// Build a standard recursive query for `name` with the given QTYPE.
///
/// # Errors
///
/// Fails if the name or one of its labels exceeds the RFC 1035 limits.
pub fn build_query(id: u16, name: &str, qtype: u16) -> Result<Vec<u8>, WireError> {
    if name.len() > MAX_NAME_LEN {
        return Err(WireError::NameTooLong(name.len()));
    }

    let mut packet = Vec::with_capacity(HEADER_LEN + name.len() + 6);

    // Header
    packet.extend_from_slice(&id.to_be_bytes());
    packet.extend_from_slice(&[0x01, 0x00]); // Flags: standard query, RD
    packet.extend_from_slice(&[0x00, 0x01]); // QDCOUNT: 1
    packet.extend_from_slice(&[0x00, 0x00]); // ANCOUNT
    packet.extend_from_slice(&[0x00, 0x00]); // NSCOUNT
    packet.extend_from_slice(&[0x00, 0x00]); // ARCOUNT

    // Question
    for label in name.split('.').filter(|l| !l.is_empty()) {
        if label.len() > MAX_LABEL_LEN {
            return Err(WireError::LabelTooLong(label.len()));
        }
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);

    packet.extend_from_slice(&qtype.to_be_bytes());
    packet.extend_from_slice(&QCLASS_IN.to_be_bytes());

    Ok(packet)
}

/// Parse a DNS response: header, question skip, answer walk.
pub fn parse_response(packet: &[u8]) -> Result<Response, WireError> {
    if packet.len() < HEADER_LEN {
        return Err(WireError::Truncated(packet.len()));
    }

    let id = u16::from_be_bytes([packet[0], packet[1]]);
    let flags = u16::from_be_bytes([packet[2], packet[3]]);
    if flags & 0x8000 == 0 {
        return Err(WireError::Malformed("not a response"));
    }
    let rcode = (flags & 0x000f) as u8;
    let qdcount = u16::from_be_bytes([packet[4], packet[5]]);
    let ancount = u16::from_be_bytes([packet[6], packet[7]]);

    // Skip the echoed question section
    let mut pos = HEADER_LEN;
    for _ in 0..qdcount {
        pos = skip_name(packet, pos)?;
        pos = pos
            .checked_add(4) // QTYPE + QCLASS
            .filter(|p| *p <= packet.len())
            .ok_or(WireError::Malformed("question overflow"))?;
    }

    let mut answers = Vec::with_capacity(ancount as usize);
    for _ in 0..ancount {
        let (_, next) = read_name(packet, pos)?;
        pos = next;

        let fixed = packet
            .get(pos..pos + 10)
            .ok_or(WireError::Malformed("record header overflow"))?;
        let rtype = u16::from_be_bytes([fixed[0], fixed[1]]);
        let rdlen = u16::from_be_bytes([fixed[8], fixed[9]]) as usize;
        pos += 10;

        let rdata_start = pos;
        let rdata_end = pos
            .checked_add(rdlen)
            .filter(|p| *p <= packet.len())
            .ok_or(WireError::Malformed("rdata overflow"))?;
        let rdata = &packet[rdata_start..rdata_end];

        answers.push(match rtype {
            QTYPE_TXT => RData::Txt(decode_txt(rdata)?),
            QTYPE_CNAME => {
                let (target, _) = read_name(packet, rdata_start)?;
                RData::Cname(target)
            }
            QTYPE_NULL => RData::Null(rdata.to_vec()),
            other => RData::Other(other),
        });

        pos = rdata_end;
    }

    Ok(Response { id, rcode, answers })
}

/// Concatenate the character-strings of a TXT RDATA.
fn decode_txt(rdata: &[u8]) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::with_capacity(rdata.len());
    let mut pos = 0;
    while pos < rdata.len() {
        let len = rdata[pos] as usize;
        pos += 1;
        let chunk = rdata
            .get(pos..pos + len)
            .ok_or(WireError::Malformed("TXT string overflow"))?;
        out.extend_from_slice(chunk);
        pos += len;
    }
    Ok(out)
}

/// Read a possibly-compressed name starting at `offset`.
///
/// Returns the presentation-format name and the offset just past the name in
/// the original (non-pointer) position.
pub fn read_name(packet: &[u8], offset: usize) -> Result<(String, usize), WireError> {
    let mut labels: Vec<String> = Vec::new();
    let mut cursor = offset;
    let mut resume = None;
    let mut jumps = 0usize;

    loop {
        let len = *packet
            .get(cursor)
            .ok_or(WireError::Malformed("name overflow"))? as usize;

        if len == 0 {
            let consumed = resume.unwrap_or(cursor + 1);
            return Ok((labels.join("."), consumed));
        }

        if len & 0xc0 == 0xc0 {
            let lo = *packet
                .get(cursor + 1)
                .ok_or(WireError::Malformed("pointer overflow"))? as usize;
            let ptr = ((len & 0x3f) << 8) | lo;
            if ptr >= packet.len() {
                return Err(WireError::Malformed("pointer out of bounds"));
            }
            if resume.is_none() {
                resume = Some(cursor + 2);
            }
            cursor = ptr;
            jumps += 1;
            if jumps > packet.len() {
                return Err(WireError::Malformed("compression loop"));
            }
            continue;
        }

        if len & 0xc0 != 0 {
            return Err(WireError::Malformed("bad label length"));
        }

        let start = cursor + 1;
        let end = start + len;
        let bytes = packet
            .get(start..end)
            .ok_or(WireError::Malformed("label overflow"))?;
        labels.push(String::from_utf8_lossy(bytes).into_owned());
        cursor = end;
    }
}

/// Advance past a name without decoding it.
fn skip_name(packet: &[u8], offset: usize) -> Result<usize, WireError> {
    let mut pos = offset;
    loop {
        let len = *packet
            .get(pos)
            .ok_or(WireError::Malformed("name overflow"))? as usize;
        if len == 0 {
            return Ok(pos + 1);
        }
        if len & 0xc0 == 0xc0 {
            return Ok(pos + 2);
        }
        pos += 1 + len;
    }
}
