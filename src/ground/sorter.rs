//! Second-stage telemetry fan-out by record type.
//!
//! Sits behind the discriminator's telemetry leg. Every datagram is copied
//! to the dump endpoint first (redundancy), then forwarded to every
//! endpoint registered for its telemetry type. Endpoints are expected to
//! be bound UDP sockets; an unbound one loses its copy without affecting
//! the others.

use crate::packets::TelemetryKind;
use crate::wire::TelemetryHeader;
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use tracing::{debug, warn};

const RECV_BUFFER_BYTES: usize = 65536;

pub struct TelemetrySorter {
    socket: UdpSocket,
    dump: SocketAddr,
    forward_map: HashMap<TelemetryKind, Vec<SocketAddr>>,
    recv_buf: Vec<u8>,
}

impl TelemetrySorter {
    pub fn bind<A: ToSocketAddrs>(listen: A, dump: SocketAddr) -> io::Result<Self> {
        Ok(Self {
            socket: UdpSocket::bind(listen)?,
            dump,
            forward_map: HashMap::new(),
            recv_buf: vec![0; RECV_BUFFER_BYTES],
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Add an endpoint for a telemetry type. A type may fan out to several
    /// consumers; each registered endpoint gets its own copy.
    pub fn forward(&mut self, kind: TelemetryKind, endpoint: SocketAddr) {
        self.forward_map.entry(kind).or_default().push(endpoint);
    }

    pub fn sort_once(&mut self) -> io::Result<()> {
        let (len, _) = self.socket.recv_from(&mut self.recv_buf)?;
        let datagram = &self.recv_buf[..len];

        if let Err(e) = self.socket.send_to(datagram, self.dump) {
            debug!(error = %e, "dump copy dropped");
        }

        let header = match TelemetryHeader::read(datagram) {
            Ok(header) => header,
            Err(e) => {
                warn!(len, error = %e, "unsortable datagram");
                return Ok(());
            }
        };
        match TelemetryKind::from_wire(header.telem_type).and_then(|k| self.forward_map.get(&k)) {
            Some(endpoints) => {
                for endpoint in endpoints {
                    if let Err(e) = self.socket.send_to(datagram, endpoint) {
                        debug!(%endpoint, error = %e, "forwarded copy dropped");
                    }
                }
            }
            None => {
                warn!(
                    telem_type = header.telem_type,
                    "telemetry type not in the forwarding map"
                );
            }
        }
        Ok(())
    }

    pub fn run(&mut self) {
        loop {
            if let Err(e) = self.sort_once() {
                warn!(error = %e, "telemetry sorter read failed");
            }
        }
    }
}
