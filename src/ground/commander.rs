//! Ground-side command client.
//!
//! Wraps outgoing commands in the command header, stamps the next 8-bit
//! sequence number, and reads the acknowledgement back on the same socket.
//! The sequence number only advances after a successful send; correlating
//! acks to commands is the caller's job (the ack's `counter` field is
//! authoritative).

use crate::packets::{Ack, Command, CommandKind};
use crate::wire::{self, WireError};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommanderError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("received datagram failed verification: {0}")]
    Wire(#[from] WireError),
    #[error("{len}-byte datagram does not decode as an acknowledgement")]
    NotAnAck { len: usize },
    #[error("command kind has no entry in the command table")]
    UnknownCommand,
}

pub struct Commander {
    socket: UdpSocket,
    sequence_number: u8,
}

impl Commander {
    pub fn bind<A: ToSocketAddrs>(local: A) -> io::Result<Self> {
        Ok(Self {
            socket: UdpSocket::bind(local)?,
            sequence_number: 0,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// How long `recv_ack` waits; `None` blocks forever.
    pub fn set_ack_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.socket.set_read_timeout(timeout)
    }

    pub fn sequence_number(&self) -> u8 {
        self.sequence_number
    }

    /// Send one command. Returns the sequence number it went out with.
    pub fn send(&mut self, command: &Command, dest: SocketAddr) -> Result<u8, CommanderError> {
        self.send_raw(command.kind(), &command.encode(), dest)
    }

    /// Send a pre-encoded body under a table entry. The reserved `Unknown`
    /// slot has no wire identity to send under.
    pub fn send_raw(
        &mut self,
        kind: CommandKind,
        body: &[u8],
        dest: SocketAddr,
    ) -> Result<u8, CommanderError> {
        if kind == CommandKind::Unknown {
            return Err(CommanderError::UnknownCommand);
        }
        let packet = wire::encode_command(body, kind.wire_id(), self.sequence_number);
        self.socket.send_to(&packet, dest)?;
        let used = self.sequence_number;
        self.sequence_number = self.sequence_number.wrapping_add(1);
        Ok(used)
    }

    /// Receive and decode one acknowledgement.
    pub fn recv_ack(&self) -> Result<Ack, CommanderError> {
        let mut buf = [0u8; 2048];
        let len = self.socket.recv(&mut buf)?;
        wire::verify(&buf[..len])?;
        Ack::decode(&buf[..len]).ok_or(CommanderError::NotAnAck { len })
    }
}
