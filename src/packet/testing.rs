//! Frame and message builders shared by the unit tests.

use super::checksum;
use std::net::Ipv4Addr;

pub(crate) const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
pub(crate) const TUN_DNS: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
pub(crate) const CLIENT_PORT: u16 = 40_123;

pub(crate) fn encode_name(name: &str) -> Vec<u8> {
    let mut encoded = Vec::new();
    for label in name.split('.').filter(|label| !label.is_empty()) {
        encoded.push(label.len() as u8);
        encoded.extend_from_slice(label.as_bytes());
    }
    encoded.push(0);
    encoded
}

/// Standard recursive query with one question.
pub(crate) fn dns_query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
    let mut message = Vec::new();
    message.extend_from_slice(&id.to_be_bytes());
    message.extend_from_slice(&[0x01, 0x00]); // RD
    message.extend_from_slice(&[0x00, 0x01]); // qdcount
    message.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    message.extend_from_slice(&encode_name(name));
    message.extend_from_slice(&qtype.to_be_bytes());
    message.extend_from_slice(&[0x00, 0x01]); // IN
    message
}

/// Answers `query` with a single A record pointing back at the question name.
pub(crate) fn dns_answer(query: &[u8], address: Ipv4Addr) -> Vec<u8> {
    let mut message = query.to_vec();
    message[2] = 0x81;
    message[3] = 0x80;
    message[6..8].copy_from_slice(&1u16.to_be_bytes()); // ancount
    message.extend_from_slice(&[0xC0, 0x0C]); // name -> question
    message.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]); // A, IN
    message.extend_from_slice(&300u32.to_be_bytes());
    message.extend_from_slice(&4u16.to_be_bytes());
    message.extend_from_slice(&address.octets());
    message
}

pub(crate) fn ipv4_frame(
    protocol: u8,
    src: Ipv4Addr,
    src_port: u16,
    dst: Ipv4Addr,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let udp_len = 8 + payload.len();
    let total_len = 20 + udp_len;
    let mut frame = vec![0u8; total_len];
    frame[0] = 0x45;
    frame[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    frame[4..6].copy_from_slice(&0x1c46u16.to_be_bytes());
    frame[8] = 64;
    frame[9] = protocol;
    frame[12..16].copy_from_slice(&src.octets());
    frame[16..20].copy_from_slice(&dst.octets());
    frame[20..22].copy_from_slice(&src_port.to_be_bytes());
    frame[22..24].copy_from_slice(&dst_port.to_be_bytes());
    frame[24..26].copy_from_slice(&(udp_len as u16).to_be_bytes());
    frame[28..].copy_from_slice(payload);
    let header_checksum = checksum::ipv4_header(&frame[..20]);
    frame[10..12].copy_from_slice(&header_checksum.to_be_bytes());
    frame
}

pub(crate) fn udp_frame(dst_port: u16, payload: &[u8]) -> Vec<u8> {
    ipv4_frame(17, CLIENT, CLIENT_PORT, TUN_DNS, dst_port, payload)
}

pub(crate) fn query_frame(id: u16, name: &str) -> Vec<u8> {
    udp_frame(53, &dns_query(id, name, 1))
}
