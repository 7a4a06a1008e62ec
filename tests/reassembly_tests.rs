use impish_net::executor::{format_reply, fragment_reply};
use impish_net::ground::reassembler::{
    order_fragments, parse_reply, ReassembleError, ReplyReassembler,
};
use impish_net::packets::{ShellReplyFragment, FRAGMENT_DATA_BYTES};
use impish_net::wire::{self, GondolaTime};
use std::net::UdpSocket;
use std::time::Duration;

fn tagged_fragment(seq_num: u16) -> ShellReplyFragment {
    // Payload bytes derived from the sequence number, so ordering is
    // visible in the concatenated stream.
    let tag = [(seq_num >> 8) as u8, seq_num as u8];
    let chunk: Vec<u8> = tag.iter().copied().cycle().take(FRAGMENT_DATA_BYTES).collect();
    ShellReplyFragment::from_chunk(&chunk, seq_num)
}

fn stream_order(fragments: &[ShellReplyFragment]) -> Vec<u16> {
    let stream = order_fragments(fragments);
    stream
        .chunks(FRAGMENT_DATA_BYTES)
        .map(|chunk| (u16::from(chunk[0]) << 8) | u16::from(chunk[1]))
        .collect()
}

#[test]
fn test_wrap_burst_reorders_across_zero() {
    let fragments: Vec<_> = [65534, 65535, 0, 1, 2]
        .into_iter()
        .map(tagged_fragment)
        .collect();
    assert_eq!(stream_order(&fragments), vec![65534, 65535, 0, 1, 2]);

    // Delivery order must not matter.
    let shuffled: Vec<_> = [1, 65535, 2, 65534, 0].into_iter().map(tagged_fragment).collect();
    assert_eq!(stream_order(&shuffled), vec![65534, 65535, 0, 1, 2]);
}

#[test]
fn test_plain_burst_sorts_naturally() {
    let fragments: Vec<_> = [7, 5, 6].into_iter().map(tagged_fragment).collect();
    assert_eq!(stream_order(&fragments), vec![5, 6, 7]);
}

#[test]
fn test_two_fragment_wrap() {
    let fragments: Vec<_> = [0, 65535].into_iter().map(tagged_fragment).collect();
    assert_eq!(stream_order(&fragments), vec![65535, 0]);
}

#[test]
fn test_parse_reply_happy_path() {
    let stream = format_reply(true, 0, b"hello\n", b"");
    let reply = parse_reply(&stream).unwrap();
    assert_eq!(reply.exit_code, 0);
    assert_eq!(reply.stdout, "hello\n");
    assert_eq!(reply.stderr, "");
}

#[test]
fn test_parse_reply_failure_path() {
    let stream = format_reply(false, 2, b"", b"ls: no such file\n");
    let reply = parse_reply(&stream).unwrap();
    assert_eq!(reply.exit_code, 2);
    assert_eq!(reply.stdout, "");
    assert_eq!(reply.stderr, "ls: no such file\n");
}

#[test]
fn test_parse_reply_multiline_output() {
    let stdout = b"line one\nline two\nline three";
    let stream = format_reply(true, 0, stdout, b"warn\n");
    let reply = parse_reply(&stream).unwrap();
    assert_eq!(reply.stdout, "line one\nline two\nline three");
    assert_eq!(reply.stderr, "warn\n");
}

#[test]
fn test_parse_reply_tolerates_fragment_padding() {
    let mut stream = format_reply(true, 0, b"out", b"err");
    stream.resize(FRAGMENT_DATA_BYTES * 2, 0);
    let reply = parse_reply(&stream).unwrap();
    assert_eq!(reply.exit_code, 0);
    assert_eq!(reply.stdout, "out");
    assert_eq!(reply.stderr, "err");
}

#[test]
fn test_parse_reply_rejects_streams_without_markers() {
    for bad in [
        &b"no markers anywhere in here"[..],
        &b"stdout:backwards\nack-ok\n"[..],
        &b""[..],
        &b"\x00\x00\x00"[..],
        &b"ack-ok\nmissing the exit code line"[..],
    ] {
        match parse_reply(bad) {
            Err(ReassembleError::MalformedReply { .. }) => {}
            other => panic!("expected MalformedReply for {bad:?}, got {other:?}"),
        }
    }
}

#[test]
fn test_fragmentation_round_trip_with_wrap() {
    // A reply big enough for several fragments, with newlines sprinkled
    // into stdout.
    let stdout: Vec<u8> = (0..600u32)
        .flat_map(|i| format!("data point {i}\n").into_bytes())
        .collect();
    let stream = format_reply(true, 0, &stdout, b"some stderr text");

    let mut fragments = fragment_reply(&stream);
    assert!(fragments.len() > 2);
    // Re-number the burst so it straddles the 16-bit wrap.
    let base: u16 = 65533;
    for fragment in &mut fragments {
        fragment.seq_num = base.wrapping_add(fragment.seq_num);
    }
    fragments.reverse();

    let reassembled = order_fragments(&fragments);
    assert!(reassembled.starts_with(&stream));

    let reply = parse_reply(&reassembled).unwrap();
    assert_eq!(reply.exit_code, 0);
    assert_eq!(reply.stdout.as_bytes(), &stdout[..]);
    assert_eq!(reply.stderr, "some stderr text");
}

#[test]
fn test_session_collection_over_udp() {
    let mut reassembler = ReplyReassembler::bind("127.0.0.1:0")
        .unwrap()
        .with_session_timeout(Duration::from_millis(200));
    let dest = reassembler.local_addr().unwrap();

    let stream = format_reply(true, 0, b"udp round trip\n", b"");
    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    for fragment in fragment_reply(&stream) {
        sender.send_to(&fragment.encode(), dest).unwrap();
    }

    let reply = reassembler.collect_session().unwrap();
    assert_eq!(reply.exit_code, 0);
    assert_eq!(reply.stdout, "udp round trip\n");
}

#[test]
fn test_session_collection_accepts_wrapped_packets() {
    let mut reassembler = ReplyReassembler::bind("127.0.0.1:0")
        .unwrap()
        .with_session_timeout(Duration::from_millis(200));
    let dest = reassembler.local_addr().unwrap();

    let stream = format_reply(false, 3, b"", b"broken\n");
    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    for (i, fragment) in fragment_reply(&stream).into_iter().enumerate() {
        // As delivered by the discriminator: full telemetry datagrams.
        let mut packet = wire::encode_telemetry(
            &fragment.encode(),
            impish_net::packets::TelemetryKind::ShellReply.wire_id(),
            i as u16,
            GondolaTime::default(),
        );
        wire::stamp_and_seal(&mut packet);
        sender.send_to(&packet, dest).unwrap();
    }

    let reply = reassembler.collect_session().unwrap();
    assert_eq!(reply.exit_code, 3);
    assert_eq!(reply.stderr, "broken\n");
}

#[test]
fn test_first_fragment_wait_can_be_bounded() {
    let mut reassembler = ReplyReassembler::bind("127.0.0.1:0")
        .unwrap()
        .with_session_timeout(Duration::from_millis(100))
        .with_first_fragment_timeout(Some(Duration::from_millis(100)));

    // Nothing is ever sent: the one-shot caller gets a timeout instead of
    // blocking forever.
    match reassembler.collect_session() {
        Err(ReassembleError::Io(e)) => {
            assert!(
                e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut
            );
        }
        other => panic!("expected a timeout, got {other:?}"),
    }

    // A session arriving afterwards still reassembles normally.
    let dest = reassembler.local_addr().unwrap();
    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    for fragment in fragment_reply(&format_reply(true, 0, b"late\n", b"")) {
        sender.send_to(&fragment.encode(), dest).unwrap();
    }
    let reply = reassembler.collect_session().unwrap();
    assert_eq!(reply.stdout, "late\n");
}

#[test]
fn test_malformed_session_is_surfaced() {
    let mut reassembler = ReplyReassembler::bind("127.0.0.1:0")
        .unwrap()
        .with_session_timeout(Duration::from_millis(200));
    let dest = reassembler.local_addr().unwrap();

    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    let stray = ShellReplyFragment::from_chunk(&[b'x'; FRAGMENT_DATA_BYTES], 0);
    sender.send_to(&stray.encode(), dest).unwrap();

    match reassembler.collect_session() {
        Err(ReassembleError::MalformedReply { bytes }) => {
            assert!(bytes.starts_with(b"xxx"));
        }
        other => panic!("expected MalformedReply, got {other:?}"),
    }
}
