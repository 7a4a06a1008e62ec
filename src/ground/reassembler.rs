//! Shell reply reconstruction from fragment bursts.
//!
//! One session is a maximal burst of fragments separated from the next by
//! at least the idle timeout. The reassembler blocks for the first
//! fragment, then keeps reading under the timeout until it fires, orders
//! the collected fragments by their session-local sequence number
//! (tolerating a single 16-bit wrap), and parses the concatenated bytes
//! into the command's exit code and output streams.

use crate::packets::{
    ShellReplyFragment, FRAGMENT_BYTES, TelemetryKind,
};
use crate::wire::{self, TELEMETRY_HEADER_BYTES, TELEM_TYPE_OFFSET};
use serde::Serialize;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Bursts are bounded, so two sequence numbers from the same burst can
/// only differ by more than this if the counter wrapped between them.
pub const FRAGMENT_WRAP_GUARD: u16 = u16::MAX - MAX_BURST_FRAGMENTS as u16;

/// Upper bound on fragments per burst.
pub const MAX_BURST_FRAGMENTS: usize = 512;

/// Default idle gap that closes a session.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(1);

/// A reconstructed shell command result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShellReply {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Error)]
pub enum ReassembleError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    /// The ordered stream never showed a status marker, or the exit code
    /// would not parse. Raw bytes are kept for diagnostics.
    #[error("malformed reply stream ({} bytes)", .bytes.len())]
    MalformedReply { bytes: Vec<u8> },
}

pub struct ReplyReassembler {
    socket: UdpSocket,
    session_timeout: Duration,
    first_fragment_timeout: Option<Duration>,
    recv_buf: Vec<u8>,
}

impl ReplyReassembler {
    pub fn bind<A: ToSocketAddrs>(listen: A) -> io::Result<Self> {
        Ok(Self {
            socket: UdpSocket::bind(listen)?,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            first_fragment_timeout: None,
            recv_buf: vec![0; 2048],
        })
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Bound the wait for a session to open. The default (`None`) blocks
    /// until a fragment arrives, which is what a long-running pump wants;
    /// a one-shot caller sets this so it can give up and report instead.
    pub fn with_first_fragment_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.first_fragment_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Block until a burst arrives and goes quiet, then reconstruct it.
    pub fn collect_session(&mut self) -> Result<ShellReply, ReassembleError> {
        let fragments = self.collect_fragments()?;
        let stream = order_fragments(&fragments);
        parse_reply(&stream)
    }

    fn collect_fragments(&mut self) -> io::Result<Vec<ShellReplyFragment>> {
        let mut fragments = Vec::new();

        self.socket.set_read_timeout(self.first_fragment_timeout)?;
        let len = match self.socket.recv(&mut self.recv_buf) {
            Ok(len) => len,
            Err(e) => {
                self.socket.set_read_timeout(None)?;
                return Err(e);
            }
        };
        self.push_fragment(&mut fragments, len);

        self.socket.set_read_timeout(Some(self.session_timeout))?;
        while fragments.len() < MAX_BURST_FRAGMENTS {
            match self.socket.recv(&mut self.recv_buf) {
                Ok(len) => self.push_fragment(&mut fragments, len),
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    break;
                }
                Err(e) => {
                    self.socket.set_read_timeout(None)?;
                    return Err(e);
                }
            }
        }
        self.socket.set_read_timeout(None)?;
        Ok(fragments)
    }

    fn push_fragment(&self, fragments: &mut Vec<ShellReplyFragment>, len: usize) {
        let datagram = &self.recv_buf[..len];
        // Fragments normally arrive wrapped in a telemetry header; bare
        // records are accepted too.
        let body = if len == TELEMETRY_HEADER_BYTES + FRAGMENT_BYTES
            && datagram[TELEM_TYPE_OFFSET] == TelemetryKind::ShellReply.wire_id()
            && wire::verify(datagram).is_ok()
        {
            &datagram[TELEMETRY_HEADER_BYTES..]
        } else {
            datagram
        };
        match ShellReplyFragment::decode(body) {
            Some(fragment) => fragments.push(fragment),
            None => warn!(len, "undecodable datagram on the reply stream"),
        }
    }
}

/// Order a burst's fragments by sequence number and concatenate their
/// payloads.
///
/// If two numbers differ by more than the wrap guard, the counter wrapped
/// within the burst: the high values were sent before the wrap, the low
/// values after. Each side is sorted on its own and the high side comes
/// first.
pub fn order_fragments(fragments: &[ShellReplyFragment]) -> Vec<u8> {
    let mut ordered: Vec<&ShellReplyFragment> = fragments.iter().collect();

    let min = fragments.iter().map(|f| f.seq_num).min().unwrap_or(0);
    let max = fragments.iter().map(|f| f.seq_num).max().unwrap_or(0);
    let wrapped = max - min > FRAGMENT_WRAP_GUARD;

    ordered.sort_by_key(|fragment| {
        if wrapped && fragment.seq_num <= FRAGMENT_WRAP_GUARD {
            // Post-wrap values sort after every pre-wrap value.
            u32::from(fragment.seq_num) + u32::from(u16::MAX) + 1
        } else {
            u32::from(fragment.seq_num)
        }
    });

    let mut stream = Vec::with_capacity(ordered.len() * crate::packets::FRAGMENT_DATA_BYTES);
    for fragment in ordered {
        stream.extend_from_slice(&fragment.data);
    }
    stream
}

/// Parse a reconstructed reply stream.
///
/// The stream must open with an `ack-ok` or `error` status line followed
/// by a `retc:` line carrying the raw exit byte; anything else is
/// malformed (this covers both "no marker ever seen" and content before
/// the first marker). The `stdout:` and `stderr:` sections are best
/// effort: a truncated capture yields whatever arrived.
pub fn parse_reply(stream: &[u8]) -> Result<ShellReply, ReassembleError> {
    let trimmed = strip_trailing_nuls(stream);
    let malformed = || ReassembleError::MalformedReply {
        bytes: trimmed.to_vec(),
    };

    let rest = trimmed
        .strip_prefix(b"ack-ok\n".as_slice())
        .or_else(|| trimmed.strip_prefix(b"error\n".as_slice()))
        .ok_or_else(malformed)?;

    let rest = rest.strip_prefix(b"retc:".as_slice()).ok_or_else(malformed)?;
    let (&exit_byte, rest) = rest.split_first().ok_or_else(malformed)?;
    let rest = rest.strip_prefix(b"\n".as_slice()).unwrap_or(rest);

    let (stdout, stderr) = match rest.strip_prefix(b"stdout:".as_slice()) {
        Some(body) => match find_subslice(body, b"\nstderr:") {
            Some(split) => (&body[..split], &body[split + b"\nstderr:".len()..]),
            None => (body, &[][..]),
        },
        None => (&[][..], &[][..]),
    };

    Ok(ShellReply {
        exit_code: i32::from(exit_byte),
        stdout: String::from_utf8_lossy(stdout).into_owned(),
        stderr: String::from_utf8_lossy(stderr).into_owned(),
    })
}

fn strip_trailing_nuls(stream: &[u8]) -> &[u8] {
    let end = stream
        .iter()
        .rposition(|&b| b != 0)
        .map(|pos| pos + 1)
        .unwrap_or(0);
    &stream[..end]
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
