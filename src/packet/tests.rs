use super::testing::*;
use super::*;
use smoltcp::wire::{IpAddress, Ipv4Packet, UdpPacket as WireUdpPacket};

#[test]
fn frames_shorter_than_headers_are_passthrough() {
    let template = query_frame(0x1234, "example.com");
    for len in 0..MIN_HEADER_LEN {
        assert_eq!(
            classify(&template[..len]),
            Classification::Passthrough(PassthroughReason::TooShort),
            "len {len}"
        );
    }
}

#[test]
fn udp_port_53_is_candidate() {
    let frame = query_frame(0x1234, "example.com");
    let Classification::DnsCandidate(header) = classify(&frame) else {
        panic!("expected dns candidate");
    };
    assert_eq!(header.protocol, PROTO_UDP);
    assert_eq!(header.src, CLIENT);
    assert_eq!(header.dst, TUN_DNS);
    assert_eq!(header.src_port, CLIENT_PORT);
    assert_eq!(header.dst_port, 53);
    assert_eq!(usize::from(header.total_len), frame.len());
    assert_eq!(header.header_len, 20);
}

#[test]
fn non_udp_protocols_pass_through_whatever_the_payload() {
    let payload = dns_query(1, "example.com", 1);
    for protocol in [1u8, 6, 47, 50, 132] {
        let frame = ipv4_frame(protocol, CLIENT, CLIENT_PORT, TUN_DNS, 53, &payload);
        assert_eq!(
            classify(&frame),
            Classification::Passthrough(PassthroughReason::NotUdp(protocol))
        );
    }
}

#[test]
fn other_udp_ports_pass_through() {
    let frame = udp_frame(8053, &dns_query(1, "example.com", 1));
    assert_eq!(
        classify(&frame),
        Classification::Passthrough(PassthroughReason::NotDnsPort(8053))
    );
    let frame = udp_frame(443, &[0u8; 64]);
    assert!(!classify(&frame).is_dns_candidate());
}

#[test]
fn ip_options_are_rejected_instead_of_misparsed() {
    let mut frame = query_frame(1, "example.com");
    frame[0] = 0x46;
    assert_eq!(
        classify(&frame),
        Classification::Passthrough(PassthroughReason::IpOptions)
    );
}

#[test]
fn fragments_and_ipv6_pass_through() {
    let mut fragment = query_frame(1, "example.com");
    fragment[6] = 0x20; // more fragments
    assert_eq!(
        classify(&fragment),
        Classification::Passthrough(PassthroughReason::Fragment)
    );

    let mut v6 = query_frame(1, "example.com");
    v6[0] = 0x60;
    assert_eq!(
        classify(&v6),
        Classification::Passthrough(PassthroughReason::NotIpv4(6))
    );
}

#[test]
fn total_length_beyond_frame_is_malformed() {
    let frame = query_frame(1, "example.com");
    let cut = &frame[..frame.len() - 3];
    assert_eq!(
        classify(cut),
        Classification::Passthrough(PassthroughReason::LengthMismatch)
    );
}

#[test]
fn dns_header_without_question_is_too_short() {
    let frame = udp_frame(53, &[0u8; DNS_HEADER_LEN]);
    assert_eq!(
        classify(&frame),
        Classification::Passthrough(PassthroughReason::TooShort)
    );
}

#[test]
fn trailing_padding_is_ignored() {
    let mut frame = query_frame(7, "padded.example");
    frame.extend_from_slice(&[0xEE; 6]);
    assert_eq!(extract_query_name(&frame).unwrap(), "padded.example");
}

#[test]
fn query_names_round_trip() {
    let long_label = "a".repeat(63);
    let long_name = format!("{long_label}.example.com");
    let names = [
        "example.com",
        "localhost",
        "v16.us.tiktok.com",
        "a.b.c.d.e.f.g.h.i.j.example.org",
        "xn--bcher-kva.example",
        long_name.as_str(),
    ];
    for name in names {
        let frame = query_frame(0x4242, name);
        assert_eq!(extract_query_name(&frame).unwrap(), name);
    }
}

#[test]
fn root_query_yields_empty_name() {
    let frame = query_frame(1, "");
    assert_eq!(extract_query_name(&frame).unwrap(), "");
}

#[test]
fn label_running_past_the_buffer_is_truncated() {
    let mut message = dns_query(1, "example.com", 1);
    message.truncate(DNS_HEADER_LEN);
    message.extend_from_slice(&[10, b'a', b'b', b'c']);
    let frame = udp_frame(53, &message);
    assert!(classify(&frame).is_dns_candidate());
    assert_eq!(
        extract_query_name(&frame),
        Err(QueryError::Truncated(DNS_HEADER_LEN))
    );
}

#[test]
fn missing_terminator_is_truncated() {
    let mut message = dns_query(1, "example.com", 1);
    message.truncate(DNS_HEADER_LEN);
    message.extend_from_slice(&[3, b'c', b'o', b'm']);
    let frame = udp_frame(53, &message);
    assert_eq!(
        extract_query_name(&frame),
        Err(QueryError::Truncated(DNS_HEADER_LEN + 4))
    );
}

#[test]
fn compressed_question_is_unparseable() {
    let mut message = dns_query(1, "example.com", 1);
    message.truncate(DNS_HEADER_LEN);
    message.extend_from_slice(&[0xC0, 0x0C, 0x00, 0x01, 0x00, 0x01]);
    let frame = udp_frame(53, &message);
    assert_eq!(
        extract_query_name(&frame),
        Err(QueryError::Compressed(DNS_HEADER_LEN))
    );
}

#[test]
fn reserved_label_lengths_are_rejected() {
    let mut message = dns_query(1, "example.com", 1);
    message.truncate(DNS_HEADER_LEN);
    message.push(0x40);
    message.extend_from_slice(&[b'x'; 70]);
    message.push(0);
    let frame = udp_frame(53, &message);
    assert_eq!(
        extract_query_name(&frame),
        Err(QueryError::InvalidLabelLength {
            offset: DNS_HEADER_LEN,
            length: 0x40
        })
    );
}

#[test]
fn non_text_labels_are_rejected() {
    let mut message = dns_query(1, "example.com", 1);
    message.truncate(DNS_HEADER_LEN);
    message.extend_from_slice(&[2, 0xFF, 0xFE, 0]);
    let frame = udp_frame(53, &message);
    assert_eq!(
        extract_query_name(&frame),
        Err(QueryError::InvalidText(DNS_HEADER_LEN + 1))
    );
}

#[test]
fn overlong_names_are_rejected() {
    let label = "b".repeat(63);
    let name = [label.as_str(); 4].join(".");
    let frame = query_frame(1, &name);
    assert_eq!(extract_query_name(&frame), Err(QueryError::NameTooLong));
}

#[test]
fn extract_refuses_passthrough_frames() {
    let frame = udp_frame(5353, &dns_query(1, "printer.local", 1));
    assert_eq!(
        extract_query_name(&frame),
        Err(QueryError::NotDnsCandidate(PassthroughReason::NotDnsPort(
            5353
        )))
    );
}

#[test]
fn dns_query_keeps_request_bytes_and_metadata() {
    let message = dns_query(0xBEEF, "example.com", 28);
    let frame = udp_frame(53, &message);
    let query = DnsQuery::from_frame(&frame).unwrap();
    assert_eq!(query.name, "example.com");
    assert_eq!(query.id, 0xBEEF);
    assert_eq!(query.qtype, Some(28));
    assert_eq!(qtype_label(28), "AAAA");
    assert_eq!(query.request, message);
    assert_eq!(query.header.src_port, CLIENT_PORT);
}

#[test]
fn response_frame_swaps_endpoints() {
    let request = query_frame(0x0101, "example.com");
    let Classification::DnsCandidate(original) = classify(&request) else {
        panic!("expected dns candidate");
    };
    let answer = dns_answer(&dns_query(0x0101, "example.com", 1), Ipv4Addr::new(93, 184, 216, 34));
    let frame = build_response_frame(&original, &answer, 1472).unwrap();

    let reply = ParsedHeader::parse(&frame).unwrap();
    assert_eq!(reply.src, original.dst);
    assert_eq!(reply.dst, original.src);
    assert_eq!(reply.src_port, original.dst_port);
    assert_eq!(reply.dst_port, original.src_port);
    assert_eq!(usize::from(reply.total_len), frame.len());
    assert_eq!(usize::from(reply.udp_len), UDP_HEADER_LEN + answer.len());
    assert_eq!(reply.dns_payload(&frame), answer.as_slice());
}

#[test]
fn response_frame_echoes_the_request_identification() {
    let request = query_frame(0x0303, "ident.example");
    let Classification::DnsCandidate(original) = classify(&request) else {
        panic!("expected dns candidate");
    };
    assert_eq!(original.identification, 0x1c46);
    let answer = dns_answer(&dns_query(0x0303, "ident.example", 1), Ipv4Addr::new(5, 6, 7, 8));
    let frame = build_response_frame(&original, &answer, 1472).unwrap();

    let ip = Ipv4Packet::new_checked(&frame[..]).expect("valid ipv4");
    assert_eq!(ip.ident(), 0x1c46);
    assert!(ip.dont_frag());
    assert!(ip.verify_checksum());
}

#[test]
fn response_frame_checksums_verify() {
    let request = query_frame(0x0202, "checksum.example");
    let Classification::DnsCandidate(original) = classify(&request) else {
        panic!("expected dns candidate");
    };
    // Odd-length payload exercises the pad byte.
    let mut answer = dns_answer(&dns_query(0x0202, "checksum.example", 1), Ipv4Addr::new(1, 2, 3, 4));
    answer.push(0);
    assert_eq!(answer.len() % 2, 1);
    let frame = build_response_frame(&original, &answer, 1472).unwrap();

    let ip = Ipv4Packet::new_checked(&frame[..]).expect("valid ipv4");
    assert!(ip.verify_checksum());
    let src = IpAddress::Ipv4(ip.src_addr());
    let dst = IpAddress::Ipv4(ip.dst_addr());
    let udp = WireUdpPacket::new_checked(ip.payload()).expect("valid udp");
    assert_ne!(udp.checksum(), 0);
    assert!(udp.verify_checksum(&src, &dst));
    assert_eq!(udp.src_port(), 53);
    assert_eq!(udp.dst_port(), CLIENT_PORT);
}

#[test]
fn empty_answer_is_a_construction_error() {
    let request = query_frame(1, "example.com");
    let Classification::DnsCandidate(original) = classify(&request) else {
        panic!("expected dns candidate");
    };
    assert_eq!(
        build_response_frame(&original, &[], 1472),
        Err(BuildError::EmptyAnswer)
    );
}

#[test]
fn oversized_answer_is_a_construction_error() {
    let request = query_frame(1, "example.com");
    let Classification::DnsCandidate(original) = classify(&request) else {
        panic!("expected dns candidate");
    };
    assert_eq!(
        build_response_frame(&original, &[0u8; 513], 512),
        Err(BuildError::AnswerTooLarge { len: 513, max: 512 })
    );
    assert!(build_response_frame(&original, &[0u8; 512], 512).is_ok());
    assert_eq!(
        build_response_frame(&original, &vec![0u8; 70_000], usize::MAX),
        Err(BuildError::AnswerTooLarge {
            len: 70_000,
            max: builder::MAX_UDP_PAYLOAD
        })
    );
}
