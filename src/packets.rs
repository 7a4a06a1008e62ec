//! Command and telemetry records the payload exchanges with the gondola,
//! plus the acknowledgement packet and its error vocabulary.
//!
//! Both tables are ordered: an entry's position is its wire id. Command
//! slot 0 is reserved for `Unknown`, used in acknowledgements for packets
//! whose type never decoded. Telemetry slot 0 is reserved and never used;
//! slot 1 is the acknowledgement. Telemetry ids 2..=15 are housekeeping,
//! 16..=255 science.

use crate::wire::{self, GondolaTime, BASE_HEADER_BYTES};
use arrayvec::ArrayVec;
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;
use std::net::SocketAddr;
use thiserror::Error;

/// Fixed length of the shell command text buffer (UTF-8, NUL-terminated
/// or not).
pub const SHELL_COMMAND_BYTES: usize = 255;

/// Opaque payload bytes carried per shell-reply fragment.
pub const FRAGMENT_DATA_BYTES: usize = 128;

/// Wire size of one shell-reply fragment record.
pub const FRAGMENT_BYTES: usize = FRAGMENT_DATA_BYTES + 2;

pub const HEALTH_BYTES: usize = 13;

pub const SPECTRUM_BINS: usize = 32;
pub const SPECTRUM_BYTES: usize = 2 + 2 * SPECTRUM_BINS;

/// Wire size of a complete acknowledgement datagram.
pub const ACK_BYTES: usize = 24;

/// Diagnostic bytes an acknowledgement can carry alongside its error code.
pub const ACK_ERROR_DATA_BYTES: usize = 7;

/// Value of the ack's telemetry-header `size` field (error type + data).
pub const ACK_PAYLOAD_BYTES: usize = 1 + ACK_ERROR_DATA_BYTES;

/// Sentinel the shell executor sends after the last fragment of a reply so
/// the router can stop waiting early.
pub const REPLY_DONE_SENTINEL: &[u8] = b"arb-cmd-finished";

const_assert_eq!(FRAGMENT_BYTES, 130);
const_assert_eq!(SPECTRUM_BYTES, 66);

/// Command table. Position is the wire id; slot 0 is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CommandKind {
    Unknown = 0,
    Shell = 1,
    Ping = 2,
}

impl CommandKind {
    pub fn from_wire(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::Unknown),
            1 => Some(Self::Shell),
            2 => Some(Self::Ping),
            _ => None,
        }
    }

    pub fn wire_id(self) -> u8 {
        self as u8
    }

    /// Exact payload size of the decoded variant.
    pub fn payload_size(self) -> usize {
        match self {
            Self::Unknown => 0,
            Self::Shell => SHELL_COMMAND_BYTES,
            Self::Ping => 0,
        }
    }
}

/// Telemetry table. Position is the wire id; slot 0 is reserved, slot 1 is
/// the acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TelemetryKind {
    Ack = 1,
    ShellReply = 2,
    Health = 3,
    Spectrum = 16,
}

impl TelemetryKind {
    pub fn from_wire(id: u8) -> Option<Self> {
        match id {
            1 => Some(Self::Ack),
            2 => Some(Self::ShellReply),
            3 => Some(Self::Health),
            16 => Some(Self::Spectrum),
            _ => None,
        }
    }

    pub fn wire_id(self) -> u8 {
        self as u8
    }

    pub fn payload_size(self) -> usize {
        match self {
            Self::Ack => ACK_PAYLOAD_BYTES,
            Self::ShellReply => FRAGMENT_BYTES,
            Self::Health => HEALTH_BYTES,
            Self::Spectrum => SPECTRUM_BYTES,
        }
    }

    pub fn is_housekeeping(self) -> bool {
        (2..=15).contains(&self.wire_id())
    }

    pub fn is_science(self) -> bool {
        self.wire_id() >= 16
    }
}

/// A decoded command payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Shell(ShellCommand),
    Ping,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::Shell(_) => CommandKind::Shell,
            Self::Ping => CommandKind::Ping,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Shell(cmd) => cmd.as_bytes().to_vec(),
            Self::Ping => Vec::new(),
        }
    }

    /// Decode a verified command body. `kind` must come from the command
    /// table and the body must already have the variant's exact size.
    pub fn decode(kind: CommandKind, body: &[u8]) -> Option<Self> {
        match kind {
            CommandKind::Unknown => None,
            CommandKind::Shell => ShellCommand::from_bytes(body).map(Self::Shell),
            CommandKind::Ping => {
                if body.is_empty() {
                    Some(Self::Ping)
                } else {
                    None
                }
            }
        }
    }
}

/// The command text does not fit the fixed 255-byte record.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("command is {len} bytes encoded; the record holds 255")]
pub struct CommandTooLong {
    pub len: usize,
}

/// Fixed-size shell command record: UTF-8 text zero-padded to 255 bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct ShellCommand {
    buf: [u8; SHELL_COMMAND_BYTES],
}

impl ShellCommand {
    pub fn new(text: &str) -> Result<Self, CommandTooLong> {
        let bytes = text.as_bytes();
        if bytes.len() > SHELL_COMMAND_BYTES {
            return Err(CommandTooLong { len: bytes.len() });
        }
        let mut buf = [0u8; SHELL_COMMAND_BYTES];
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(Self { buf })
    }

    pub fn from_bytes(body: &[u8]) -> Option<Self> {
        if body.len() != SHELL_COMMAND_BYTES {
            return None;
        }
        let mut buf = [0u8; SHELL_COMMAND_BYTES];
        buf.copy_from_slice(body);
        Some(Self { buf })
    }

    pub fn as_bytes(&self) -> &[u8; SHELL_COMMAND_BYTES] {
        &self.buf
    }

    /// Command text up to the first NUL (or the whole buffer when none).
    pub fn text(&self) -> String {
        let end = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(SHELL_COMMAND_BYTES);
        String::from_utf8_lossy(&self.buf[..end]).into_owned()
    }
}

impl std::fmt::Debug for ShellCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ShellCommand").field(&self.text()).finish()
    }
}

/// One 128-byte slice of a shell reply, numbered within its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellReplyFragment {
    pub data: [u8; FRAGMENT_DATA_BYTES],
    pub seq_num: u16,
}

impl ShellReplyFragment {
    /// Build a fragment from at most 128 raw bytes, zero-padding the tail.
    pub fn from_chunk(chunk: &[u8], seq_num: u16) -> Self {
        let mut data = [0u8; FRAGMENT_DATA_BYTES];
        let take = chunk.len().min(FRAGMENT_DATA_BYTES);
        data[..take].copy_from_slice(&chunk[..take]);
        Self { data, seq_num }
    }

    pub fn encode(&self) -> [u8; FRAGMENT_BYTES] {
        let mut buf = [0u8; FRAGMENT_BYTES];
        buf[..FRAGMENT_DATA_BYTES].copy_from_slice(&self.data);
        LittleEndian::write_u16(&mut buf[FRAGMENT_DATA_BYTES..], self.seq_num);
        buf
    }

    pub fn decode(body: &[u8]) -> Option<Self> {
        if body.len() != FRAGMENT_BYTES {
            return None;
        }
        let mut data = [0u8; FRAGMENT_DATA_BYTES];
        data.copy_from_slice(&body[..FRAGMENT_DATA_BYTES]);
        Some(Self {
            data,
            seq_num: LittleEndian::read_u16(&body[FRAGMENT_DATA_BYTES..]),
        })
    }
}

/// Housekeeping snapshot of the flight computer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    pub uptime_s: u32,
    pub cpu_pct: u8,
    pub mem_pct: u8,
    pub disk_pct: u8,
    pub temp_centi_c: i16,
    pub free_mem_kib: u32,
}

impl Health {
    pub fn encode(&self) -> [u8; HEALTH_BYTES] {
        let mut buf = [0u8; HEALTH_BYTES];
        LittleEndian::write_u32(&mut buf[0..4], self.uptime_s);
        buf[4] = self.cpu_pct;
        buf[5] = self.mem_pct;
        buf[6] = self.disk_pct;
        LittleEndian::write_i16(&mut buf[7..9], self.temp_centi_c);
        LittleEndian::write_u32(&mut buf[9..13], self.free_mem_kib);
        buf
    }

    pub fn decode(body: &[u8]) -> Option<Self> {
        if body.len() != HEALTH_BYTES {
            return None;
        }
        Some(Self {
            uptime_s: LittleEndian::read_u32(&body[0..4]),
            cpu_pct: body[4],
            mem_pct: body[5],
            disk_pct: body[6],
            temp_centi_c: LittleEndian::read_i16(&body[7..9]),
            free_mem_kib: LittleEndian::read_u32(&body[9..13]),
        })
    }
}

/// Science spectrum record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spectrum {
    pub num_events: u16,
    pub bins: [u16; SPECTRUM_BINS],
}

impl Default for Spectrum {
    fn default() -> Self {
        Self {
            num_events: 0,
            bins: [0; SPECTRUM_BINS],
        }
    }
}

impl Spectrum {
    pub fn encode(&self) -> [u8; SPECTRUM_BYTES] {
        let mut buf = [0u8; SPECTRUM_BYTES];
        LittleEndian::write_u16(&mut buf[0..2], self.num_events);
        for (i, bin) in self.bins.iter().enumerate() {
            LittleEndian::write_u16(&mut buf[2 + 2 * i..4 + 2 * i], *bin);
        }
        buf
    }

    pub fn decode(body: &[u8]) -> Option<Self> {
        if body.len() != SPECTRUM_BYTES {
            return None;
        }
        let mut bins = [0u16; SPECTRUM_BINS];
        for (i, bin) in bins.iter_mut().enumerate() {
            *bin = LittleEndian::read_u16(&body[2 + 2 * i..4 + 2 * i]);
        }
        Some(Self {
            num_events: LittleEndian::read_u16(&body[0..2]),
            bins,
        })
    }
}

/// A decoded telemetry payload, as produced by on-board processes and fed
/// to the telemeter. Acknowledgements are their own self-contained packet
/// and never travel through this enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelemetryRecord {
    ShellReply(ShellReplyFragment),
    Health(Health),
    Spectrum(Spectrum),
}

impl TelemetryRecord {
    pub fn kind(&self) -> TelemetryKind {
        match self {
            Self::ShellReply(_) => TelemetryKind::ShellReply,
            Self::Health(_) => TelemetryKind::Health,
            Self::Spectrum(_) => TelemetryKind::Spectrum,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::ShellReply(f) => f.encode().to_vec(),
            Self::Health(h) => h.encode().to_vec(),
            Self::Spectrum(s) => s.encode().to_vec(),
        }
    }

    pub fn decode(kind: TelemetryKind, body: &[u8]) -> Option<Self> {
        match kind {
            TelemetryKind::Ack => None,
            TelemetryKind::ShellReply => ShellReplyFragment::decode(body).map(Self::ShellReply),
            TelemetryKind::Health => Health::decode(body).map(Self::Health),
            TelemetryKind::Spectrum => Spectrum::decode(body).map(Self::Spectrum),
        }
    }
}

/// Acknowledgement error table, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum AckErrorKind {
    NoError = 0,
    PartialHeader = 1,
    InvalidSync = 2,
    IncorrectCrc = 3,
    IncorrectSystemId = 4,
    InvalidCommandType = 5,
    IncorrectPacketLength = 6,
    InvalidPacketLength = 7,
    InvalidPayloadValue = 8,
    Busy = 9,
    GeneralFailure = 10,
}

impl AckErrorKind {
    pub fn from_wire(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::NoError),
            1 => Some(Self::PartialHeader),
            2 => Some(Self::InvalidSync),
            3 => Some(Self::IncorrectCrc),
            4 => Some(Self::IncorrectSystemId),
            5 => Some(Self::InvalidCommandType),
            6 => Some(Self::IncorrectPacketLength),
            7 => Some(Self::InvalidPacketLength),
            8 => Some(Self::InvalidPayloadValue),
            9 => Some(Self::Busy),
            10 => Some(Self::GeneralFailure),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::NoError => "NO_ERROR",
            Self::PartialHeader => "PARTIAL_HEADER",
            Self::InvalidSync => "INVALID_SYNC",
            Self::IncorrectCrc => "INCORRECT_CRC",
            Self::IncorrectSystemId => "INCORRECT_SYSTEM_ID",
            Self::InvalidCommandType => "INVALID_COMMAND_TYPE",
            Self::IncorrectPacketLength => "INCORRECT_PACKET_LENGTH",
            Self::InvalidPacketLength => "INVALID_PACKET_LENGTH",
            Self::InvalidPayloadValue => "INVALID_PAYLOAD_VALUE",
            Self::Busy => "BUSY",
            Self::GeneralFailure => "GENERAL_FAILURE",
        }
    }
}

/// Rejection of a command, on its way to becoming an error ack. Carried as
/// a plain value through the verifier and handlers; the router turns it
/// into the one ack it owes the sender.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("command rejected: {}", .kind.name())]
pub struct AckError {
    pub kind: AckErrorKind,
    pub data: ArrayVec<u8, ACK_ERROR_DATA_BYTES>,
    pub sender: SocketAddr,
    pub seq_num: u8,
    pub cmd_type: CommandKind,
}

impl AckError {
    /// `data` beyond 7 bytes is dropped; the ack format has no room for it.
    pub fn new(
        kind: AckErrorKind,
        data: &[u8],
        sender: SocketAddr,
        seq_num: u8,
        cmd_type: CommandKind,
    ) -> Self {
        let mut clamped = ArrayVec::new();
        clamped.extend(data.iter().copied().take(ACK_ERROR_DATA_BYTES));
        Self {
            kind,
            data: clamped,
            sender,
            seq_num,
            cmd_type,
        }
    }
}

/// Command acknowledgement: a fixed 24-byte telemetry datagram echoing the
/// command's sequence number and type plus an error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub counter: u8,
    pub cmd_type: u8,
    pub gondola_time: GondolaTime,
    pub error_type: u8,
    pub error_data: [u8; ACK_ERROR_DATA_BYTES],
}

impl Default for Ack {
    fn default() -> Self {
        Self::new()
    }
}

impl Ack {
    /// Zero-initialized success ack. `pre_send` fills in the originating
    /// command just before transmission.
    pub fn new() -> Self {
        Self {
            counter: 0,
            cmd_type: 0,
            gondola_time: GondolaTime::default(),
            error_type: AckErrorKind::NoError as u8,
            error_data: [0; ACK_ERROR_DATA_BYTES],
        }
    }

    pub fn from_error(err: &AckError) -> Self {
        let mut error_data = [0u8; ACK_ERROR_DATA_BYTES];
        error_data[..err.data.len()].copy_from_slice(&err.data);
        Self {
            counter: err.seq_num,
            cmd_type: err.cmd_type.wire_id(),
            gondola_time: GondolaTime::default(),
            error_type: err.kind as u8,
            error_data,
        }
    }

    /// Stamp the originating command's sequence number and type.
    pub fn pre_send(&mut self, seq_num: u8, cmd_type: CommandKind) {
        self.counter = seq_num;
        self.cmd_type = cmd_type.wire_id();
    }

    pub fn success(&self) -> bool {
        self.error_type == AckErrorKind::NoError as u8
    }

    pub fn error_kind(&self) -> Option<AckErrorKind> {
        AckErrorKind::from_wire(self.error_type)
    }

    pub fn cmd_kind(&self) -> CommandKind {
        CommandKind::from_wire(self.cmd_type).unwrap_or(CommandKind::Unknown)
    }

    /// Serialize to the full 24-byte datagram. The CRC field is left zero;
    /// `wire::stamp_and_seal` finishes the packet at transmission time.
    pub fn encode(&self) -> [u8; ACK_BYTES] {
        let mut buf = [0u8; ACK_BYTES];
        LittleEndian::write_u16(&mut buf[0..2], wire::GRIPS_SYNC);
        buf[4] = wire::IMPISH_SYSTEM_ID;
        buf[5] = TelemetryKind::Ack.wire_id();
        LittleEndian::write_u16(&mut buf[6..8], ACK_PAYLOAD_BYTES as u16);
        buf[8] = self.counter;
        buf[9] = self.cmd_type;
        LittleEndian::write_u32(&mut buf[10..14], (self.gondola_time.value() & 0xffff_ffff) as u32);
        LittleEndian::write_u16(&mut buf[14..16], (self.gondola_time.value() >> 32) as u16);
        buf[16] = self.error_type;
        buf[17..24].copy_from_slice(&self.error_data);
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < ACK_BYTES || buf[BASE_HEADER_BYTES] != TelemetryKind::Ack.wire_id() {
            return None;
        }
        let low = LittleEndian::read_u32(&buf[10..14]);
        let high = LittleEndian::read_u16(&buf[14..16]);
        let mut error_data = [0u8; ACK_ERROR_DATA_BYTES];
        error_data.copy_from_slice(&buf[17..24]);
        Some(Self {
            counter: buf[8],
            cmd_type: buf[9],
            gondola_time: GondolaTime::from_millis((u64::from(high) << 32) | u64::from(low)),
            error_type: buf[16],
            error_data,
        })
    }
}
