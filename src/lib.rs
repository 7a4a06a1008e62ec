//! # IMPISH network layer
//!
//! Flight-to-ground command and telemetry networking for the IMPISH
//! payload riding on the GRIPS balloon gondola.
//!
//! ## Features
//!
//! - **Bit-exact GRIPS framing**: little-endian packed headers, Modbus
//!   CRC-16 trailer, 48-bit gondola time
//! - **Command path**: ordered verification ladder, 8-bit sequence
//!   tracking, per-variant handler dispatch, one ack per datagram
//! - **Telemetry path**: source-port type mapping, 16-bit monotonic
//!   counter, ground-side fan-out by type tag
//! - **Shell command subsystem**: dispatch, execution, 128-byte fragment
//!   streaming, and ground-side burst reassembly with wrap handling
//!
//! ## Quick start
//!
//! ```no_run
//! use impish_net::router::CommandRouter;
//! use impish_net::packets::{Ack, CommandKind};
//!
//! let mut router = CommandRouter::bind("0.0.0.0:38000").unwrap();
//! router.register(CommandKind::Ping, |_record| Ok(Ack::new()));
//! loop {
//!     if let Err(e) = router.route_once() {
//!         eprintln!("command not dispatched: {e}");
//!     }
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`wire`] - headers, CRC, gondola time
//! - [`packets`] - command/telemetry tables and the acknowledgement
//! - [`verify`] - command datagram verification ladder
//! - [`router`] - on-board command dispatch
//! - [`telemeter`] - telemetry wrapping and downlink
//! - [`executor`] - arbitrary shell command execution
//! - [`ground`] - commander, packet fan-out, reply reassembly
//! - [`ports`] - port bands and deployment configuration

pub mod executor;
pub mod ground;
pub mod packets;
pub mod ports;
pub mod router;
pub mod telemeter;
pub mod verify;
pub mod wire;

// Re-export the main public types for convenience
pub use ground::{Commander, PacketDiscriminator, ReplyReassembler, ShellReply, TelemetrySorter};
pub use packets::{Ack, AckError, AckErrorKind, Command, CommandKind, TelemetryKind};
pub use router::CommandRouter;
pub use telemeter::Telemeter;
pub use verify::CommandRecord;
