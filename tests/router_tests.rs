use impish_net::ground::Commander;
use impish_net::packets::{Ack, AckError, AckErrorKind, Command, CommandKind};
use impish_net::router::{CommandRouter, RouterError};
use impish_net::wire;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

const LOOPBACK: &str = "127.0.0.1:0";
const ACK_WAIT: Duration = Duration::from_secs(2);

fn spawn_router_once(mut router: CommandRouter) -> std::thread::JoinHandle<Result<(), RouterError>> {
    std::thread::spawn(move || router.route_once())
}

fn spawn_router_n(
    mut router: CommandRouter,
    iterations: usize,
) -> std::thread::JoinHandle<Vec<Result<(), RouterError>>> {
    std::thread::spawn(move || (0..iterations).map(|_| router.route_once()).collect())
}

#[test]
fn test_happy_round_trip() {
    let mut router = CommandRouter::bind(LOOPBACK).unwrap();
    let router_addr = router.local_addr().unwrap();
    router.register(CommandKind::Ping, |_record| Ok(Ack::new()));
    let routed = spawn_router_once(router);

    let mut commander = Commander::bind(LOOPBACK).unwrap();
    commander.set_ack_timeout(Some(ACK_WAIT)).unwrap();
    let seq = commander.send(&Command::Ping, router_addr).unwrap();
    assert_eq!(seq, 0);
    assert_eq!(commander.sequence_number(), 1);

    assert!(routed.join().unwrap().is_ok());

    let ack = commander.recv_ack().unwrap();
    assert!(ack.success());
    assert_eq!(ack.counter, 0);
    assert_eq!(ack.cmd_kind(), CommandKind::Ping);
}

#[test]
fn test_unsealed_command_gets_crc_error_ack() {
    let mut router = CommandRouter::bind(LOOPBACK).unwrap();
    let router_addr = router.local_addr().unwrap();
    router.register(CommandKind::Ping, |_record| Ok(Ack::new()));
    let routed = spawn_router_once(router);

    // A header with valid sync and system id but the CRC field still
    // zeroed, sent around the commander entirely.
    let mut packet = wire::encode_command(&[], CommandKind::Ping.wire_id(), 0);
    packet[2] = 0;
    packet[3] = 0;

    let sender = UdpSocket::bind(LOOPBACK).unwrap();
    sender.set_read_timeout(Some(ACK_WAIT)).unwrap();
    sender.send_to(&packet, router_addr).unwrap();

    assert!(matches!(
        routed.join().unwrap(),
        Err(RouterError::Rejected(AckErrorKind::IncorrectCrc))
    ));

    let mut buf = [0u8; 2048];
    let len = sender.recv(&mut buf).unwrap();
    wire::verify(&buf[..len]).unwrap();
    let ack = Ack::decode(&buf[..len]).unwrap();
    assert_eq!(ack.error_kind(), Some(AckErrorKind::IncorrectCrc));
    assert_eq!(ack.counter, 0);
    assert_eq!(ack.cmd_kind(), CommandKind::Unknown);
    // Diagnostic data: received CRC (zero) then the recomputed one.
    assert_eq!(&ack.error_data[..2], &[0, 0]);
    assert_ne!(&ack.error_data[2..4], &[0, 0]);
}

#[test]
fn test_unregistered_variant_sends_no_ack() {
    let router = CommandRouter::bind(LOOPBACK).unwrap();
    let router_addr = router.local_addr().unwrap();
    let routed = spawn_router_once(router);

    let mut commander = Commander::bind(LOOPBACK).unwrap();
    commander
        .set_ack_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    commander.send(&Command::Ping, router_addr).unwrap();

    assert!(matches!(
        routed.join().unwrap(),
        Err(RouterError::NoHandler(CommandKind::Ping))
    ));

    // No ack may arrive for a command nobody handled.
    match commander.recv_ack() {
        Err(impish_net::ground::CommanderError::Io(e)) => {
            assert!(
                e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut
            );
        }
        other => panic!("expected a receive timeout, got {other:?}"),
    }
}

#[test]
fn test_busy_handler_acks_busy() {
    let mut router = CommandRouter::bind(LOOPBACK).unwrap();
    let router_addr = router.local_addr().unwrap();
    router.register(CommandKind::Ping, |record| {
        Err(AckError::new(
            AckErrorKind::Busy,
            &[],
            record.sender,
            record.header.counter,
            record.command.kind(),
        ))
    });
    let routed = spawn_router_once(router);

    let mut commander = Commander::bind(LOOPBACK).unwrap();
    commander.set_ack_timeout(Some(ACK_WAIT)).unwrap();
    commander.send(&Command::Ping, router_addr).unwrap();

    assert!(matches!(
        routed.join().unwrap(),
        Err(RouterError::Rejected(AckErrorKind::Busy))
    ));

    let ack = commander.recv_ack().unwrap();
    assert_eq!(ack.error_kind(), Some(AckErrorKind::Busy));
    assert_eq!(ack.error_type, 9);
    assert_eq!(ack.counter, 0);
    assert_eq!(ack.cmd_kind(), CommandKind::Ping);
}

#[test]
fn test_sequence_number_rollover() {
    let receiver = UdpSocket::bind(LOOPBACK).unwrap();
    receiver.set_read_timeout(Some(ACK_WAIT)).unwrap();
    let receiver_addr = receiver.local_addr().unwrap();

    let mut commander = Commander::bind(LOOPBACK).unwrap();
    let mut buf = [0u8; 2048];
    for i in 0u32..12_345 {
        let sent = commander.send(&Command::Ping, receiver_addr).unwrap();
        assert_eq!(sent, (i % 256) as u8);

        let len = receiver.recv(&mut buf).unwrap();
        let header = wire::CommandHeader::read(&buf[..len]).unwrap();
        assert_eq!(header.counter, (i % 256) as u8);
    }
    assert_eq!(commander.sequence_number(), (12_345 % 256) as u8);
}

#[test]
fn test_sequence_mismatch_is_acked_and_not_advanced() {
    let mut router = CommandRouter::bind(LOOPBACK).unwrap();
    let router_addr = router.local_addr().unwrap();
    router.register(CommandKind::Ping, |_record| Ok(Ack::new()));
    let routed = spawn_router_n(router, 3);

    // First commander establishes the expected counter; the router then
    // wants 1 next.
    let mut first = Commander::bind(LOOPBACK).unwrap();
    first.set_ack_timeout(Some(ACK_WAIT)).unwrap();
    first.send(&Command::Ping, router_addr).unwrap();
    assert!(first.recv_ack().unwrap().success());

    // A second commander starts over at 0 and mismatches.
    let mut second = Commander::bind(LOOPBACK).unwrap();
    second.set_ack_timeout(Some(ACK_WAIT)).unwrap();
    second.send(&Command::Ping, router_addr).unwrap();
    let ack = second.recv_ack().unwrap();
    assert_eq!(ack.error_kind(), Some(AckErrorKind::GeneralFailure));
    assert_eq!(&ack.error_data[..6], b"badsqn");
    assert_eq!(ack.error_data[6], 1, "the counter the router wanted");
    assert_eq!(ack.counter, 0, "the counter the command carried");

    // Known quirk, preserved on purpose: a mismatch does not advance the
    // expected counter, so the second commander's next send (now at 1)
    // happens to re-sync.
    second.send(&Command::Ping, router_addr).unwrap();
    assert!(second.recv_ack().unwrap().success());

    let results = routed.join().unwrap();
    assert!(results[0].is_ok());
    assert!(matches!(
        results[1],
        Err(RouterError::SequenceMismatch {
            expected: 1,
            received: 0
        })
    ));
    assert!(results[2].is_ok());
}

#[test]
fn test_verifier_check_order() {
    use impish_net::verify::decode_command;
    let sender: SocketAddr = "127.0.0.1:5000".parse().unwrap();

    // Too short for a command header.
    let err = decode_command(&[0xEB, 0x90, 0x00], sender).unwrap_err();
    assert_eq!(err.kind, AckErrorKind::PartialHeader);
    assert_eq!(err.seq_num, 255);
    assert_eq!(err.cmd_type, CommandKind::Unknown);

    // Sync is checked before the CRC.
    let mut packet = wire::encode_command(&[], CommandKind::Ping.wire_id(), 9);
    packet[0] = 0x12;
    packet[1] = 0x34;
    let err = decode_command(&packet, sender).unwrap_err();
    assert_eq!(err.kind, AckErrorKind::InvalidSync);
    assert_eq!(err.data.as_slice(), &[0x12, 0x34]);
    assert_eq!(err.seq_num, 9);

    // CRC before system id: corrupt both, CRC wins.
    let mut packet = wire::encode_command(&[], CommandKind::Ping.wire_id(), 9);
    packet[4] = 0x11;
    let err = decode_command(&packet, sender).unwrap_err();
    assert_eq!(err.kind, AckErrorKind::IncorrectCrc);
    assert_eq!(err.data.len(), 4);

    // System id alone, resealed so the CRC passes.
    let mut packet = wire::encode_command(&[], CommandKind::Ping.wire_id(), 9);
    packet[4] = 0x11;
    wire::seal(&mut packet);
    let err = decode_command(&packet, sender).unwrap_err();
    assert_eq!(err.kind, AckErrorKind::IncorrectSystemId);
    assert_eq!(err.data.as_slice(), &[0x11]);

    // Unknown command id, and the reserved slot 0.
    for bad_id in [99u8, 0u8] {
        let packet = wire::encode_command(&[], bad_id, 9);
        let err = decode_command(&packet, sender).unwrap_err();
        assert_eq!(err.kind, AckErrorKind::InvalidCommandType);
        assert_eq!(err.cmd_type, CommandKind::Unknown);
    }

    // Body longer than the size field claims.
    let mut packet = wire::encode_command(&[], CommandKind::Ping.wire_id(), 9);
    packet.extend_from_slice(&[0xAA, 0xBB]);
    wire::seal(&mut packet);
    let err = decode_command(&packet, sender).unwrap_err();
    assert_eq!(err.kind, AckErrorKind::IncorrectPacketLength);
    assert_eq!(err.data.as_slice(), &[2, 0]);
    assert_eq!(err.cmd_type, CommandKind::Ping);

    // Consistent header and body, but the wrong size for the variant.
    let packet = wire::encode_command(&[1, 2, 3], CommandKind::Ping.wire_id(), 9);
    let err = decode_command(&packet, sender).unwrap_err();
    assert_eq!(err.kind, AckErrorKind::InvalidPacketLength);
    assert_eq!(err.data.as_slice(), &[3]);

    // And a clean one decodes.
    let packet = wire::encode_command(&[], CommandKind::Ping.wire_id(), 9);
    let record = decode_command(&packet, sender).unwrap();
    assert_eq!(record.header.counter, 9);
    assert_eq!(record.command, Command::Ping);
    assert_eq!(record.sender, sender);
}

#[test]
fn test_fixed_reply_address_redirects_acks() {
    let sink = UdpSocket::bind(LOOPBACK).unwrap();
    sink.set_read_timeout(Some(ACK_WAIT)).unwrap();
    let sink_addr: SocketAddr = sink.local_addr().unwrap();

    let mut router = CommandRouter::bind(LOOPBACK).unwrap();
    let router_addr = router.local_addr().unwrap();
    router.set_reply_to(Some(sink_addr));
    router.register(CommandKind::Ping, |_record| Ok(Ack::new()));
    let routed = spawn_router_once(router);

    let mut commander = Commander::bind(LOOPBACK).unwrap();
    commander
        .set_ack_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    commander.send(&Command::Ping, router_addr).unwrap();
    assert!(routed.join().unwrap().is_ok());

    // The ack lands at the configured address, not at the sender.
    let mut buf = [0u8; 2048];
    let len = sink.recv(&mut buf).unwrap();
    let ack = Ack::decode(&buf[..len]).unwrap();
    assert!(ack.success());
    assert!(commander.recv_ack().is_err());
}
