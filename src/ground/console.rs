//! Plumbing between the ground data streams and an operator display.
//!
//! The display itself is out of scope; this module gives it two feeds.
//! Acknowledgements land in a five-slot history ring (oldest dropped),
//! reconstructed replies in an unbounded queue. Each feed has one pump
//! thread producing and one consumer draining, nothing more.

use crate::packets::{Ack, SHELL_COMMAND_BYTES};
use crate::wire;
use crate::ground::reassembler::{ReassembleError, ReplyReassembler, ShellReply};
use heapless::Deque;
use serde::Serialize;
use std::net::UdpSocket;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{info, warn};

/// Acknowledgement history depth shown to the operator.
pub const ACK_HISTORY_LEN: usize = 5;

/// Fixed-depth ack history. Pushing past capacity drops the oldest entry.
pub struct AckRing {
    ring: Deque<Ack, ACK_HISTORY_LEN>,
}

impl Default for AckRing {
    fn default() -> Self {
        Self::new()
    }
}

impl AckRing {
    pub fn new() -> Self {
        Self { ring: Deque::new() }
    }

    pub fn push(&mut self, ack: Ack) {
        if self.ring.is_full() {
            self.ring.pop_front();
        }
        // A slot is free at this point.
        let _ = self.ring.push_back(ack);
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn latest(&self) -> Option<&Ack> {
        self.ring.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Ack> {
        self.ring.iter()
    }
}

/// Raw bytes of a reply stream that would not parse, preserved for the
/// operator's diagnostics view.
#[derive(Debug, Clone, Serialize)]
pub struct StrayReply {
    #[serde(with = "serde_bytes")]
    pub bytes: Vec<u8>,
}

/// One line of operator-facing text per ack.
pub fn format_ack(ack: &Ack) -> String {
    let kind = ack
        .error_kind()
        .map(|k| k.name())
        .unwrap_or("UNRECOGNIZED_ERROR");
    format!(
        "seq {:>3}  cmd {:?}  {} {:?}",
        ack.counter,
        ack.cmd_kind(),
        kind,
        &ack.error_data
    )
}

/// Operator-facing rendering of a reconstructed reply.
pub fn format_reply(reply: &ShellReply) -> String {
    format!(
        "exit {}\n--- stdout ---\n{}\n--- stderr ---\n{}",
        reply.exit_code, reply.stdout, reply.stderr
    )
}

/// Refuse commands whose encoding exceeds the fixed record, reporting the
/// byte count the way the operator console is required to.
pub fn check_command_length(text: &str) -> Result<(), String> {
    let len = text.as_bytes().len();
    if len > SHELL_COMMAND_BYTES {
        Err(format!(
            "Command too long. Limit is {} bytes. You have {}",
            SHELL_COMMAND_BYTES, len
        ))
    } else {
        Ok(())
    }
}

/// Drain a bound ack sink into the shared history ring.
pub fn spawn_ack_pump(socket: UdpSocket, ring: Arc<Mutex<AckRing>>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut buf = [0u8; 2048];
        loop {
            let len = match socket.recv(&mut buf) {
                Ok(len) => len,
                Err(e) => {
                    warn!(error = %e, "ack sink read failed");
                    continue;
                }
            };
            if wire::verify(&buf[..len]).is_err() {
                warn!(len, "unverifiable datagram on the ack sink");
                continue;
            }
            match Ack::decode(&buf[..len]) {
                Some(ack) => {
                    info!(ack = %format_ack(&ack), "ack received");
                    if let Ok(mut ring) = ring.lock() {
                        ring.push(ack);
                    }
                }
                None => warn!(len, "non-ack datagram on the ack sink"),
            }
        }
    })
}

/// Run the reassembler and feed completed replies to the display queue.
/// Malformed sessions are logged with their raw bytes and discarded.
pub fn spawn_reply_pump(
    mut reassembler: ReplyReassembler,
    tx: mpsc::Sender<ShellReply>,
) -> JoinHandle<()> {
    std::thread::spawn(move || loop {
        match reassembler.collect_session() {
            Ok(reply) => {
                if tx.send(reply).is_err() {
                    return;
                }
            }
            Err(ReassembleError::MalformedReply { bytes }) => {
                let stray = StrayReply { bytes };
                let rendered = serde_json::to_string(&stray).unwrap_or_default();
                warn!(stray = %rendered, "discarding malformed reply session");
            }
            Err(e) => warn!(error = %e, "reply session failed"),
        }
    })
}

/// What the commander CLI expects from a `recv_ack` round: success, or a
/// readable reason.
pub fn describe_ack_result(ack: &Ack) -> (bool, String) {
    if ack.success() {
        (true, format!("command {} acknowledged", ack.counter))
    } else {
        (false, format_ack(ack))
    }
}
