//! Telemetry wrapping and downlink forwarding.
//!
//! On-board producers send bare records to the telemeter's socket; the
//! sender's source port identifies the record type. The telemeter wraps
//! each one in a telemetry header carrying the next 16-bit counter value,
//! stamps gondola time and CRC, and forwards it to the downlink address.
//! One instance per payload, or the counter stops meaning anything.

use crate::packets::{TelemetryKind, TelemetryRecord};
use crate::wire::{self, GondolaTime};
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use thiserror::Error;
use tracing::{debug, error, warn};

const RECV_BUFFER_BYTES: usize = 65536;

#[derive(Debug, Error)]
pub enum TelemeterError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("no telemetry type mapped for source port {0}")]
    UnknownSourcePort(u16),
    #[error("{len}-byte payload does not decode as {kind:?}")]
    MalformedPayload { kind: TelemetryKind, len: usize },
}

pub struct Telemeter {
    socket: UdpSocket,
    destination: SocketAddr,
    counter: u16,
    port_map: HashMap<u16, TelemetryKind>,
    recv_buf: Vec<u8>,
}

impl Telemeter {
    pub fn bind<A: ToSocketAddrs>(listen: A, destination: SocketAddr) -> io::Result<Self> {
        Ok(Self {
            socket: UdpSocket::bind(listen)?,
            destination,
            counter: 0,
            port_map: HashMap::new(),
            recv_buf: vec![0; RECV_BUFFER_BYTES],
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Register which record type a producer port emits. Producers are
    /// expected to register after construction, as processes come up.
    pub fn map_port(&mut self, port: u16, kind: TelemetryKind) {
        self.port_map.insert(port, kind);
    }

    /// Wrap and forward one datagram. Returns the counter value the packet
    /// went out with. Datagrams from unmapped ports are dropped.
    pub fn forward_once(&mut self) -> Result<u16, TelemeterError> {
        let (len, sender) = self.socket.recv_from(&mut self.recv_buf)?;

        let kind = *self
            .port_map
            .get(&sender.port())
            .ok_or(TelemeterError::UnknownSourcePort(sender.port()))?;

        let record = TelemetryRecord::decode(kind, &self.recv_buf[..len])
            .ok_or(TelemeterError::MalformedPayload { kind, len })?;

        let payload = record.encode();
        let mut packet = wire::encode_telemetry(
            &payload,
            kind.wire_id(),
            self.counter,
            GondolaTime::default(),
        );
        wire::stamp_and_seal(&mut packet);
        self.socket.send_to(&packet, self.destination)?;

        let used = self.counter;
        self.counter = self.counter.wrapping_add(1);
        debug!(counter = used, ?kind, "telemetry forwarded");
        Ok(used)
    }

    pub fn run(&mut self) {
        loop {
            match self.forward_once() {
                Ok(_) => {}
                Err(TelemeterError::Io(e)) => error!(error = %e, "telemeter socket failed"),
                Err(e) => warn!(error = %e, "telemetry dropped"),
            }
        }
    }
}
