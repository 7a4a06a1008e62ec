//! First-stage fan-out of the ground ingress stream.
//!
//! Everything the gondola relays down arrives on one socket. The
//! discriminator peeks the telemetry type tag and copies each datagram to
//! the acknowledgement endpoints or the telemetry endpoints. Endpoints are
//! plain UDP addresses; a dead one loses its copy without affecting the
//! rest.

use crate::packets::TelemetryKind;
use crate::wire::TELEM_TYPE_OFFSET;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use tracing::{debug, warn};

const RECV_BUFFER_BYTES: usize = 65536;

pub struct PacketDiscriminator {
    stream: UdpSocket,
    resender: UdpSocket,
    telemetry_endpoints: Vec<SocketAddr>,
    ack_endpoints: Vec<SocketAddr>,
    recv_buf: Vec<u8>,
}

impl PacketDiscriminator {
    /// `stream` is the bound ingress socket fed by the relay.
    pub fn new<A: ToSocketAddrs>(
        stream: UdpSocket,
        resend_bind: A,
        telemetry_endpoints: Vec<SocketAddr>,
        ack_endpoints: Vec<SocketAddr>,
    ) -> io::Result<Self> {
        Ok(Self {
            stream,
            resender: UdpSocket::bind(resend_bind)?,
            telemetry_endpoints,
            ack_endpoints,
            recv_buf: vec![0; RECV_BUFFER_BYTES],
        })
    }

    /// Read one datagram off the ingress and fan it out.
    pub fn route_once(&mut self) -> io::Result<()> {
        let (len, _) = self.stream.recv_from(&mut self.recv_buf)?;
        if len <= TELEM_TYPE_OFFSET {
            warn!(len, "runt datagram on the ground ingress");
            return Ok(());
        }

        let telem_type = self.recv_buf[TELEM_TYPE_OFFSET];
        let endpoints = if telem_type == TelemetryKind::Ack.wire_id() {
            &self.ack_endpoints
        } else {
            &self.telemetry_endpoints
        };

        for endpoint in endpoints {
            if let Err(e) = self.resender.send_to(&self.recv_buf[..len], endpoint) {
                debug!(%endpoint, error = %e, "fan-out copy dropped");
            }
        }
        Ok(())
    }

    pub fn run(&mut self) {
        loop {
            if let Err(e) = self.route_once() {
                warn!(error = %e, "ground ingress read failed");
            }
        }
    }
}
