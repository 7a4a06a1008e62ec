//! Command datagram verification.
//!
//! The GRIPS network documentation prescribes the exact order of the
//! checks and the error code each one maps to; the first failing check
//! wins. Only a
//! datagram that clears all seven gets decoded into a [`CommandRecord`].

use crate::packets::{AckError, AckErrorKind, Command, CommandKind};
use crate::wire::{self, CommandHeader, WireError, COMMAND_HEADER_BYTES, GRIPS_SYNC, IMPISH_SYSTEM_ID};
use byteorder::{ByteOrder, LittleEndian};
use std::net::SocketAddr;

/// A fully verified, decoded command and where it came from.
#[derive(Debug, Clone)]
pub struct CommandRecord {
    pub header: CommandHeader,
    pub command: Command,
    pub sender: SocketAddr,
}

/// Run the full verification ladder over a received datagram.
///
/// Check order: header length, sync word, CRC, system id, command type,
/// body length vs the header's size field, size field vs the variant's
/// fixed size. Invalid parameter and busy conditions are the handler's
/// business and are reported through the same [`AckError`] channel.
pub fn decode_command(data: &[u8], sender: SocketAddr) -> Result<CommandRecord, AckError> {
    let header = match CommandHeader::read(data) {
        Ok(header) => header,
        Err(_) => {
            return Err(AckError::new(
                AckErrorKind::PartialHeader,
                data,
                sender,
                255,
                CommandKind::Unknown,
            ));
        }
    };

    if header.base.sync != GRIPS_SYNC {
        return Err(AckError::new(
            AckErrorKind::InvalidSync,
            &data[..2],
            sender,
            header.counter,
            CommandKind::Unknown,
        ));
    }

    if let Err(WireError::BadCrc { received, computed }) = wire::verify(data) {
        let mut detail = [0u8; 4];
        LittleEndian::write_u16(&mut detail[0..2], received);
        LittleEndian::write_u16(&mut detail[2..4], computed);
        return Err(AckError::new(
            AckErrorKind::IncorrectCrc,
            &detail,
            sender,
            header.counter,
            CommandKind::Unknown,
        ));
    }

    if header.base.system_id != IMPISH_SYSTEM_ID {
        return Err(AckError::new(
            AckErrorKind::IncorrectSystemId,
            &[header.base.system_id],
            sender,
            header.counter,
            CommandKind::Unknown,
        ));
    }

    // Slot 0 is reserved; a command claiming it is as invalid as an id
    // past the end of the table.
    let kind = match CommandKind::from_wire(header.cmd_type) {
        Some(kind) if kind != CommandKind::Unknown => kind,
        _ => {
            return Err(AckError::new(
                AckErrorKind::InvalidCommandType,
                &[header.cmd_type],
                sender,
                header.counter,
                CommandKind::Unknown,
            ));
        }
    };

    let actual = (data.len() - COMMAND_HEADER_BYTES) as u8;
    if actual != header.size {
        return Err(AckError::new(
            AckErrorKind::IncorrectPacketLength,
            &[actual, header.size],
            sender,
            header.counter,
            kind,
        ));
    }

    if usize::from(header.size) != kind.payload_size() {
        return Err(AckError::new(
            AckErrorKind::InvalidPacketLength,
            &[header.size],
            sender,
            header.counter,
            kind,
        ));
    }

    match Command::decode(kind, &data[COMMAND_HEADER_BYTES..]) {
        Some(command) => Ok(CommandRecord {
            header,
            command,
            sender,
        }),
        None => Err(AckError::new(
            AckErrorKind::InvalidPacketLength,
            &[header.size],
            sender,
            header.counter,
            kind,
        )),
    }
}
