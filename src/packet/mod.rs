//! Fixed-offset IPv4/UDP/DNS decoding for frames read off the tun device.
//!
//! Only the shape emitted by a plain resolver stub is understood: a 20-byte
//! IPv4 header without options, an 8-byte UDP header, a 12-byte DNS header and
//! an uncompressed question name. Anything else is classified as passthrough
//! instead of being parsed at the wrong offsets.

pub mod builder;
pub mod checksum;

pub use builder::{build_response_frame, BuildError};

use smallvec::SmallVec;
use std::net::Ipv4Addr;
use thiserror::Error;

pub const IPV4_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;
pub const DNS_HEADER_LEN: usize = 12;
/// IPv4 + UDP, i.e. the offset of the DNS header.
pub const MIN_HEADER_LEN: usize = IPV4_HEADER_LEN + UDP_HEADER_LEN;
/// Offset of the first question label.
pub const QUESTION_OFFSET: usize = MIN_HEADER_LEN + DNS_HEADER_LEN;
/// A candidate needs at least one byte of question data.
pub const MIN_CANDIDATE_LEN: usize = QUESTION_OFFSET + 1;

pub const PROTO_UDP: u8 = 17;
pub const DNS_PORT: u16 = 53;

const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 255;
const POINTER_MASK: u8 = 0xC0;
const FLAG_MORE_FRAGMENTS: u16 = 0x2000;
const FRAGMENT_OFFSET_MASK: u16 = 0x1FFF;

/// Header fields of an IPv4/UDP frame, read at fixed offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedHeader {
    pub protocol: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    /// IPv4 identification, echoed in the reply.
    pub identification: u16,
    /// IPv4 total length field.
    pub total_len: u16,
    /// IPv4 header length in bytes (always 20 for accepted frames).
    pub header_len: u8,
    /// UDP length field (header + payload).
    pub udp_len: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassthroughReason {
    TooShort,
    NotIpv4(u8),
    /// IHL other than 5; the fixed offsets would be wrong.
    IpOptions,
    Fragment,
    LengthMismatch,
    NotUdp(u8),
    NotDnsPort(u16),
}

impl PassthroughReason {
    pub fn description(&self) -> &'static str {
        match self {
            Self::TooShort => "frame too short",
            Self::NotIpv4(_) => "not IPv4",
            Self::IpOptions => "IPv4 options present",
            Self::Fragment => "IPv4 fragment",
            Self::LengthMismatch => "length fields disagree with frame",
            Self::NotUdp(_) => "not UDP",
            Self::NotDnsPort(_) => "not addressed to port 53",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Passthrough(PassthroughReason),
    DnsCandidate(ParsedHeader),
}

impl Classification {
    pub fn is_dns_candidate(&self) -> bool {
        matches!(self, Self::DnsCandidate(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("frame is not a UDP/53 DNS candidate ({})", .0.description())]
    NotDnsCandidate(PassthroughReason),
    #[error("question name truncated at offset {0}")]
    Truncated(usize),
    #[error("compressed question name at offset {0}")]
    Compressed(usize),
    #[error("invalid label length {length} at offset {offset}")]
    InvalidLabelLength { offset: usize, length: u8 },
    #[error("label at offset {0} is not valid text")]
    InvalidText(usize),
    #[error("question name longer than 255 bytes")]
    NameTooLong,
}

/// Decides whether `frame` is an IPv4/UDP datagram bound for port 53.
///
/// Never reads past `frame` and never fails: anything that does not match the
/// fixed layout comes back as [`Classification::Passthrough`].
pub fn classify(frame: &[u8]) -> Classification {
    match read_header(frame) {
        Ok(header) => Classification::DnsCandidate(header),
        Err(reason) => Classification::Passthrough(reason),
    }
}

fn read_header(frame: &[u8]) -> Result<ParsedHeader, PassthroughReason> {
    let header = ParsedHeader::parse(frame)?;
    if header.dst_port != DNS_PORT {
        return Err(PassthroughReason::NotDnsPort(header.dst_port));
    }
    if usize::from(header.total_len) < MIN_CANDIDATE_LEN
        || usize::from(header.udp_len) < UDP_HEADER_LEN + DNS_HEADER_LEN + 1
    {
        return Err(PassthroughReason::TooShort);
    }
    Ok(header)
}

impl ParsedHeader {
    /// Reads the IPv4 and UDP headers of `frame` regardless of port.
    pub fn parse(frame: &[u8]) -> Result<Self, PassthroughReason> {
        if frame.len() < MIN_HEADER_LEN {
            return Err(PassthroughReason::TooShort);
        }
        let version = frame[0] >> 4;
        if version != 4 {
            return Err(PassthroughReason::NotIpv4(version));
        }
        let header_len = (frame[0] & 0x0F) * 4;
        if usize::from(header_len) != IPV4_HEADER_LEN {
            return Err(PassthroughReason::IpOptions);
        }
        let total_len = u16::from_be_bytes([frame[2], frame[3]]);
        if usize::from(total_len) < MIN_HEADER_LEN || usize::from(total_len) > frame.len() {
            return Err(PassthroughReason::LengthMismatch);
        }
        let fragment = u16::from_be_bytes([frame[6], frame[7]]);
        if fragment & FLAG_MORE_FRAGMENTS != 0 || fragment & FRAGMENT_OFFSET_MASK != 0 {
            return Err(PassthroughReason::Fragment);
        }
        let protocol = frame[9];
        if protocol != PROTO_UDP {
            return Err(PassthroughReason::NotUdp(protocol));
        }
        let udp_len = u16::from_be_bytes([frame[24], frame[25]]);
        if usize::from(udp_len) < UDP_HEADER_LEN
            || IPV4_HEADER_LEN + usize::from(udp_len) > usize::from(total_len)
        {
            return Err(PassthroughReason::LengthMismatch);
        }
        Ok(Self {
            protocol,
            src: Ipv4Addr::new(frame[12], frame[13], frame[14], frame[15]),
            dst: Ipv4Addr::new(frame[16], frame[17], frame[18], frame[19]),
            src_port: u16::from_be_bytes([frame[20], frame[21]]),
            dst_port: u16::from_be_bytes([frame[22], frame[23]]),
            identification: u16::from_be_bytes([frame[4], frame[5]]),
            total_len,
            header_len,
            udp_len,
        })
    }

    /// The DNS message carried by `frame`, bounded by the UDP length field.
    pub fn dns_payload<'a>(&self, frame: &'a [u8]) -> &'a [u8] {
        let start = usize::from(self.header_len) + UDP_HEADER_LEN;
        let end = (usize::from(self.header_len) + usize::from(self.udp_len)).min(frame.len());
        frame.get(start..end).unwrap_or(&[])
    }
}

/// Returns the dot-joined question name of a UDP/53 frame.
pub fn extract_query_name(frame: &[u8]) -> Result<String, QueryError> {
    let header = match classify(frame) {
        Classification::DnsCandidate(header) => header,
        Classification::Passthrough(reason) => return Err(QueryError::NotDnsCandidate(reason)),
    };
    let (name, _) = read_question_name(header.dns_payload(frame))?;
    Ok(name)
}

/// Walks the uncompressed question name that starts right after the DNS
/// header. Returns the name and the offset just past its terminator, both
/// relative to `message`.
pub(crate) fn read_question_name(message: &[u8]) -> Result<(String, usize), QueryError> {
    let mut labels: SmallVec<[&str; 8]> = SmallVec::new();
    let mut offset = DNS_HEADER_LEN;
    let mut encoded_len = 0usize;
    loop {
        let Some(&length) = message.get(offset) else {
            return Err(QueryError::Truncated(offset));
        };
        if length == 0 {
            offset += 1;
            break;
        }
        if length & POINTER_MASK == POINTER_MASK {
            return Err(QueryError::Compressed(offset));
        }
        if usize::from(length) > MAX_LABEL_LEN {
            return Err(QueryError::InvalidLabelLength { offset, length });
        }
        let start = offset + 1;
        let end = start + usize::from(length);
        let Some(bytes) = message.get(start..end) else {
            return Err(QueryError::Truncated(offset));
        };
        encoded_len += 1 + bytes.len();
        if encoded_len + 1 > MAX_NAME_LEN {
            return Err(QueryError::NameTooLong);
        }
        let label = std::str::from_utf8(bytes).map_err(|_| QueryError::InvalidText(start))?;
        labels.push(label);
        offset = end;
    }
    Ok((labels.join("."), offset))
}

/// One intercepted query, owned by the task that forwards it.
#[derive(Debug, Clone)]
pub struct DnsQuery {
    pub name: String,
    /// QTYPE, when the question carries one.
    pub qtype: Option<u16>,
    pub id: u16,
    pub header: ParsedHeader,
    /// The DNS message exactly as the application sent it.
    pub request: Vec<u8>,
}

impl DnsQuery {
    pub fn from_frame(frame: &[u8]) -> Result<Self, QueryError> {
        let header = match classify(frame) {
            Classification::DnsCandidate(header) => header,
            Classification::Passthrough(reason) => return Err(QueryError::NotDnsCandidate(reason)),
        };
        Self::from_candidate(header, frame)
    }

    /// Decodes the question of a frame `classify` already accepted.
    pub fn from_candidate(header: ParsedHeader, frame: &[u8]) -> Result<Self, QueryError> {
        let message = header.dns_payload(frame);
        let (name, end) = read_question_name(message)?;
        let qtype = message
            .get(end..end + 2)
            .map(|raw| u16::from_be_bytes([raw[0], raw[1]]));
        Ok(Self {
            name,
            qtype,
            id: u16::from_be_bytes([message[0], message[1]]),
            header,
            request: message.to_vec(),
        })
    }
}

/// Mnemonic for common QTYPE values, used in log lines.
pub fn qtype_label(qtype: u16) -> &'static str {
    match qtype {
        1 => "A",
        2 => "NS",
        5 => "CNAME",
        6 => "SOA",
        12 => "PTR",
        15 => "MX",
        16 => "TXT",
        28 => "AAAA",
        33 => "SRV",
        64 => "SVCB",
        65 => "HTTPS",
        255 => "ANY",
        _ => "OTHER",
    }
}

#[cfg(test)]
pub(crate) mod testing;

#[cfg(test)]
mod tests;
