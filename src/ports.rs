//! Port assignments and deployment configuration.
//!
//! Every process on the payload and on the ground talks UDP. Each role is
//! assigned a 1000-port-wide band so a listener can identify an origin by
//! `port - (port % 1000)` if it ever needs to. The relay IP comes from the
//! `GRIPS_IP_ADDR` environment variable, defaulting to loopback for
//! testing.

use serde::{Deserialize, Serialize};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use thiserror::Error;

/// Environment variable naming the gondola relay IP.
pub const GRIPS_IP_ENV: &str = "GRIPS_IP_ADDR";

/// Port the gondola relay exposes for our downlink.
pub const GRIPS_EXPOSED: u16 = 12345;

// Payload-side bands.
pub const COMMAND_EXECUTOR: u16 = 35000;
pub const SHELL_FRAGMENTS: u16 = 35010;
pub const DETECTOR_SERVICE: u16 = 36000;
pub const COMPUTER_MONITOR: u16 = 37000;
pub const GRIPS_LISTENER: u16 = 38000;
pub const TELEMETER_INGRESS: u16 = 39000;

// Ground-side bands.
pub const MAIN_DATA_PIPE: u16 = 40000;
pub const DISCRIMINATOR_RESEND: u16 = 40010;
pub const TELEMETRY_SORTER: u16 = 41000;
pub const TELEMETRY_DUMP: u16 = 41010;
pub const COMMAND_ACK_DISPLAY: u16 = 42000;
pub const COMMAND_ACK_DUMP: u16 = 42010;
pub const COMMAND_TELEMETRY: u16 = 43000;
pub const COMMANDER: u16 = 44000;
pub const COMMANDER_REPLY: u16 = 44010;

/// Gondola relay IP, from the environment or loopback.
pub fn grips_ip() -> IpAddr {
    std::env::var(GRIPS_IP_ENV)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(#[from] io::Error),
    #[error("could not parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Every socket address a deployment needs, in one record. The default is
/// the loopback test topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Gondola relay: telemeter egress destination.
    pub grips_addr: SocketAddr,
    /// Router bind address (payload command ingress).
    pub command_ingress: SocketAddr,
    /// Shell executor bind address.
    pub executor: SocketAddr,
    /// Shell-reply fragment port (router-side handler socket).
    pub shell_fragments: SocketAddr,
    /// Telemeter bind address.
    pub telemeter_ingress: SocketAddr,
    /// Housekeeping producer bind address.
    pub monitor: SocketAddr,
    /// Ground ingress from the relay (discriminator stream).
    pub ground_ingress: SocketAddr,
    /// Discriminator resend socket bind address.
    pub discriminator_resend: SocketAddr,
    /// Second-level telemetry sorter bind address.
    pub telemetry_sorter: SocketAddr,
    /// Catch-all telemetry dump endpoint.
    pub telemetry_dump: SocketAddr,
    /// Ack sink feeding the operator display.
    pub ack_display: SocketAddr,
    /// Redundant ack dump endpoint.
    pub ack_dump: SocketAddr,
    /// Shell-reply telemetry endpoint (reply reassembler bind address).
    pub command_telemetry: SocketAddr,
    /// Operator commander socket bind address.
    pub commander: SocketAddr,
    /// Shell-reply endpoint the commander binds to print replies itself.
    /// The sorter copies shell replies here alongside `command_telemetry`.
    pub commander_reply: SocketAddr,
    /// Router-side shell execution bound, milliseconds.
    pub handler_timeout_ms: u64,
    /// Reassembler burst idle timeout, milliseconds.
    pub session_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        let local = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let at = |port| SocketAddr::new(local, port);
        Self {
            grips_addr: SocketAddr::new(grips_ip(), GRIPS_EXPOSED),
            command_ingress: at(GRIPS_LISTENER),
            executor: at(COMMAND_EXECUTOR),
            shell_fragments: at(SHELL_FRAGMENTS),
            telemeter_ingress: at(TELEMETER_INGRESS),
            monitor: at(COMPUTER_MONITOR),
            ground_ingress: at(MAIN_DATA_PIPE),
            discriminator_resend: at(DISCRIMINATOR_RESEND),
            telemetry_sorter: at(TELEMETRY_SORTER),
            telemetry_dump: at(TELEMETRY_DUMP),
            ack_display: at(COMMAND_ACK_DISPLAY),
            ack_dump: at(COMMAND_ACK_DUMP),
            command_telemetry: at(COMMAND_TELEMETRY),
            commander: at(COMMANDER),
            commander_reply: at(COMMANDER_REPLY),
            handler_timeout_ms: 5000,
            session_timeout_ms: 1000,
        }
    }
}

impl NetworkConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Load from a file when one is named, otherwise the loopback default.
    pub fn load_or_default(path: Option<&str>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}
