//! Rebuilds IPv4/UDP reply frames around upstream DNS answers.

use super::checksum;
use super::{ParsedHeader, IPV4_HEADER_LEN, MIN_HEADER_LEN, PROTO_UDP, UDP_HEADER_LEN};
use thiserror::Error;

const DEFAULT_TTL: u8 = 64;
const FLAG_DONT_FRAGMENT: u16 = 0x4000;
/// Largest UDP payload an IPv4 total-length field can describe.
pub const MAX_UDP_PAYLOAD: usize = u16::MAX as usize - MIN_HEADER_LEN;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("upstream answer is empty")]
    EmptyAnswer,
    #[error("answer of {len} bytes exceeds the {max}-byte UDP payload limit")]
    AnswerTooLarge { len: usize, max: usize },
    #[error("original frame carried protocol {0}, not UDP")]
    NotUdp(u8),
}

/// Builds the frame delivered back to the querying application: addresses
/// and ports of `original` swapped, `answer` as the UDP payload, both length
/// fields and both checksums recomputed.
///
/// `max_payload` is the largest DNS message the tun path can carry, normally
/// `mtu - 28`.
pub fn build_response_frame(
    original: &ParsedHeader,
    answer: &[u8],
    max_payload: usize,
) -> Result<Vec<u8>, BuildError> {
    if original.protocol != PROTO_UDP {
        return Err(BuildError::NotUdp(original.protocol));
    }
    if answer.is_empty() {
        return Err(BuildError::EmptyAnswer);
    }
    let max = max_payload.min(MAX_UDP_PAYLOAD);
    if answer.len() > max {
        return Err(BuildError::AnswerTooLarge {
            len: answer.len(),
            max,
        });
    }

    // The reply travels resolver -> application.
    let src = original.dst;
    let dst = original.src;
    let udp_len = UDP_HEADER_LEN + answer.len();
    let total_len = IPV4_HEADER_LEN + udp_len;
    let mut frame = vec![0u8; total_len];

    frame[0] = 0x45;
    frame[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    frame[4..6].copy_from_slice(&original.identification.to_be_bytes());
    frame[6..8].copy_from_slice(&FLAG_DONT_FRAGMENT.to_be_bytes());
    frame[8] = DEFAULT_TTL;
    frame[9] = PROTO_UDP;
    frame[12..16].copy_from_slice(&src.octets());
    frame[16..20].copy_from_slice(&dst.octets());

    let udp = IPV4_HEADER_LEN;
    frame[udp..udp + 2].copy_from_slice(&original.dst_port.to_be_bytes());
    frame[udp + 2..udp + 4].copy_from_slice(&original.src_port.to_be_bytes());
    frame[udp + 4..udp + 6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    frame[udp + UDP_HEADER_LEN..].copy_from_slice(answer);

    let udp_checksum = checksum::udp_ipv4(src, dst, &frame[udp..]);
    frame[udp + 6..udp + 8].copy_from_slice(&udp_checksum.to_be_bytes());

    let ip_checksum = checksum::ipv4_header(&frame[..IPV4_HEADER_LEN]);
    frame[10..12].copy_from_slice(&ip_checksum.to_be_bytes());

    Ok(frame)
}
