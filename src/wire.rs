//! GRIPS wire framing: headers, gondola time, and the Modbus CRC trailer.
//!
//! Every datagram exchanged with the gondola starts with the 5-byte base
//! header (sync word, CRC-16, system id). Commands extend it with a 3-byte
//! command header; telemetry extends it with an 11-byte telemetry header
//! that carries the 48-bit gondola time. The CRC is computed over the whole
//! datagram with the CRC field zeroed, and is rewritten as the very last
//! step before transmission.

use byteorder::{ByteOrder, LittleEndian};
use crc::{Crc, CRC_16_MODBUS};
use static_assertions::const_assert_eq;
use std::sync::OnceLock;
use std::time::Instant;
use thiserror::Error;

/// Sync word opening every GRIPS packet.
pub const GRIPS_SYNC: u16 = 0xEB90;

/// System id assigned to the IMPISH payload in the GRIPS network tables.
pub const IMPISH_SYSTEM_ID: u8 = 0xED;

/// sync (2) + crc16 (2) + system_id (1)
pub const BASE_HEADER_BYTES: usize = 5;

/// base + cmd_type (1) + counter (1) + size (1)
pub const COMMAND_HEADER_BYTES: usize = BASE_HEADER_BYTES + 3;

/// base + telem_type (1) + size (2) + counter (2) + gondola time (6)
pub const TELEMETRY_HEADER_BYTES: usize = BASE_HEADER_BYTES + 11;

/// Offset of the telemetry type tag, shared by telemetry and ack layouts.
pub const TELEM_TYPE_OFFSET: usize = BASE_HEADER_BYTES;

/// Offset of the 48-bit gondola time in every telemetry-side datagram.
const GONDOLA_TIME_OFFSET: usize = 10;

const_assert_eq!(COMMAND_HEADER_BYTES, 8);
const_assert_eq!(TELEMETRY_HEADER_BYTES, 16);

const MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Framing-level rejection of a datagram.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    #[error("datagram too short for a header ({len} bytes)")]
    ShortBuffer { len: usize },
    #[error("bad sync word {found:#06x}")]
    InvalidSync { found: u16 },
    #[error("CRC mismatch: received {received:#06x}, computed {computed:#06x}")]
    BadCrc { received: u16, computed: u16 },
}

/// Fields shared by every GRIPS packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaseHeader {
    pub sync: u16,
    pub crc16: u16,
    pub system_id: u8,
}

impl BaseHeader {
    pub fn read(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < BASE_HEADER_BYTES {
            return Err(WireError::ShortBuffer { len: buf.len() });
        }
        Ok(Self {
            sync: LittleEndian::read_u16(&buf[0..2]),
            crc16: LittleEndian::read_u16(&buf[2..4]),
            system_id: buf[4],
        })
    }
}

/// Header of a command datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    pub base: BaseHeader,
    pub cmd_type: u8,
    pub counter: u8,
    pub size: u8,
}

impl CommandHeader {
    pub fn read(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < COMMAND_HEADER_BYTES {
            return Err(WireError::ShortBuffer { len: buf.len() });
        }
        Ok(Self {
            base: BaseHeader::read(buf)?,
            cmd_type: buf[5],
            counter: buf[6],
            size: buf[7],
        })
    }
}

/// Header of a telemetry datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetryHeader {
    pub base: BaseHeader,
    pub telem_type: u8,
    pub size: u16,
    pub counter: u16,
    pub gondola_time: GondolaTime,
}

impl TelemetryHeader {
    pub fn read(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < TELEMETRY_HEADER_BYTES {
            return Err(WireError::ShortBuffer { len: buf.len() });
        }
        Ok(Self {
            base: BaseHeader::read(buf)?,
            telem_type: buf[5],
            size: LittleEndian::read_u16(&buf[6..8]),
            counter: LittleEndian::read_u16(&buf[8..10]),
            gondola_time: GondolaTime::read(&buf[GONDOLA_TIME_OFFSET..TELEMETRY_HEADER_BYTES]),
        })
    }
}

/// 48-bit gondola time, stored little-endian as a u32 low half and a u16
/// high half.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GondolaTime {
    low: u32,
    high: u16,
}

impl GondolaTime {
    pub fn from_millis(millis: u64) -> Self {
        Self {
            low: (millis & 0xffff_ffff) as u32,
            high: ((millis >> 32) & 0xffff) as u16,
        }
    }

    /// Assembled 48-bit value: `high << 32 | low`.
    pub fn value(&self) -> u64 {
        (u64::from(self.high) << 32) | u64::from(self.low)
    }

    fn read(buf: &[u8]) -> Self {
        Self {
            low: LittleEndian::read_u32(&buf[0..4]),
            high: LittleEndian::read_u16(&buf[4..6]),
        }
    }

    fn write(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..4], self.low);
        LittleEndian::write_u16(&mut buf[4..6], self.high);
    }
}

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Coarse monotonic gondola time: milliseconds since the process first
/// asked for it. Clock synchronization is out of scope; the sender only
/// needs a monotonically increasing stamp.
pub fn gondola_now() -> GondolaTime {
    let epoch = EPOCH.get_or_init(Instant::now);
    GondolaTime::from_millis(epoch.elapsed().as_millis() as u64)
}

/// Modbus CRC-16 (polynomial 0xA001 reflected, init 0xFFFF) over `buf`.
pub fn compute_crc(buf: &[u8]) -> u16 {
    MODBUS.checksum(buf)
}

/// Zero the CRC field, recompute over the whole datagram, and store it.
pub fn seal(buf: &mut [u8]) {
    buf[2] = 0;
    buf[3] = 0;
    let crc = compute_crc(buf);
    LittleEndian::write_u16(&mut buf[2..4], crc);
}

/// Write the current gondola time into a telemetry-side buffer, then
/// rewrite the CRC. Buffers shorter than a telemetry header (commands)
/// only get the CRC pass.
pub fn stamp_and_seal(buf: &mut [u8]) {
    if buf.len() >= TELEMETRY_HEADER_BYTES {
        gondola_now().write(&mut buf[GONDOLA_TIME_OFFSET..GONDOLA_TIME_OFFSET + 6]);
    }
    seal(buf);
}

/// Check sync word and CRC of a received datagram. The stored CRC is
/// compared for strict u16 equality against the value recomputed over a
/// copy with the CRC field zeroed.
pub fn verify(buf: &[u8]) -> Result<(), WireError> {
    if buf.len() < BASE_HEADER_BYTES {
        return Err(WireError::ShortBuffer { len: buf.len() });
    }
    let sync = LittleEndian::read_u16(&buf[0..2]);
    if sync != GRIPS_SYNC {
        return Err(WireError::InvalidSync { found: sync });
    }
    let received = LittleEndian::read_u16(&buf[2..4]);
    let mut copy = buf.to_vec();
    copy[2] = 0;
    copy[3] = 0;
    let computed = compute_crc(&copy);
    if received != computed {
        return Err(WireError::BadCrc { received, computed });
    }
    Ok(())
}

/// Frame a payload in a command header. The caller supplies the wire id
/// and sequence number; the packet comes back sealed.
pub fn encode_command(payload: &[u8], cmd_id: u8, counter: u8) -> Vec<u8> {
    let mut buf = vec![0u8; COMMAND_HEADER_BYTES + payload.len()];
    LittleEndian::write_u16(&mut buf[0..2], GRIPS_SYNC);
    buf[4] = IMPISH_SYSTEM_ID;
    buf[5] = cmd_id;
    buf[6] = counter;
    buf[7] = payload.len() as u8;
    buf[COMMAND_HEADER_BYTES..].copy_from_slice(payload);
    seal(&mut buf);
    buf
}

/// Frame a payload in a telemetry header. `stamp_and_seal` should still be
/// run immediately before transmission to refresh the time stamp.
pub fn encode_telemetry(payload: &[u8], telem_id: u8, counter: u16, time: GondolaTime) -> Vec<u8> {
    let mut buf = vec![0u8; TELEMETRY_HEADER_BYTES + payload.len()];
    LittleEndian::write_u16(&mut buf[0..2], GRIPS_SYNC);
    buf[4] = IMPISH_SYSTEM_ID;
    buf[5] = telem_id;
    LittleEndian::write_u16(&mut buf[6..8], payload.len() as u16);
    LittleEndian::write_u16(&mut buf[8..10], counter);
    time.write(&mut buf[GONDOLA_TIME_OFFSET..GONDOLA_TIME_OFFSET + 6]);
    buf[TELEMETRY_HEADER_BYTES..].copy_from_slice(payload);
    seal(&mut buf);
    buf
}
