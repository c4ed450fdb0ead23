//! Internet checksums for the frames the rewriter emits.

use std::net::Ipv4Addr;

use super::PROTO_UDP;

/// Adds `bytes` as big-endian 16-bit words to a running 32-bit sum.
fn accumulate(mut sum: u32, bytes: &[u8]) -> u32 {
    let mut words = bytes.chunks_exact(2);
    for word in &mut words {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([word[0], word[1]])));
    }
    if let Some(&last) = words.remainder().first() {
        sum = sum.wrapping_add(u32::from(last) << 8);
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Ones' complement checksum over `bytes`.
pub fn ones_complement(bytes: &[u8]) -> u16 {
    fold(accumulate(0, bytes))
}

/// IPv4 header checksum. The checksum field inside `header` must be zero.
pub fn ipv4_header(header: &[u8]) -> u16 {
    ones_complement(header)
}

/// UDP checksum over the IPv4 pseudo-header and `datagram` (UDP header with a
/// zeroed checksum field, followed by the payload).
///
/// A computed value of zero is returned as `0xFFFF`; zero on the wire means
/// "no checksum".
pub fn udp_ipv4(src: Ipv4Addr, dst: Ipv4Addr, datagram: &[u8]) -> u16 {
    let mut sum = accumulate(0, &src.octets());
    sum = accumulate(sum, &dst.octets());
    sum = sum.wrapping_add(u32::from(PROTO_UDP));
    sum = sum.wrapping_add(datagram.len() as u32);
    match fold(accumulate(sum, datagram)) {
        0 => 0xFFFF,
        value => value,
    }
}
