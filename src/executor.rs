//! Arbitrary shell command execution on the flight computer.
//!
//! One datagram in (the fixed 255-byte command record), one fragmented
//! reply stream out. The reply is a line-tagged byte stream carrying the
//! exit code, stdout, and stderr, chunked into raw 128-byte fragments with
//! a per-invocation sequence number, followed by a sentinel datagram so
//! the waiting router can stop early.

use crate::packets::{
    ShellCommand, ShellReplyFragment, FRAGMENT_DATA_BYTES, REPLY_DONE_SENTINEL,
    SHELL_COMMAND_BYTES,
};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::process::Command as OsCommand;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("{len}-byte datagram is not a command record")]
    BadCommandRecord { len: usize },
}

/// Build the reply byte stream for one finished command.
///
/// Layout: status line (`ack-ok` or `error`), `retc:` plus the raw exit
/// byte, `stdout:` plus the captured bytes, `stderr:` plus the captured
/// bytes, newline-delimited. Fragmentation never inserts bytes of its own.
pub fn format_reply(success: bool, exit_code: u8, stdout: &[u8], stderr: &[u8]) -> Vec<u8> {
    let mut stream = Vec::with_capacity(32 + stdout.len() + stderr.len());
    stream.extend_from_slice(if success { b"ack-ok\n" } else { b"error\n" });
    stream.extend_from_slice(b"retc:");
    stream.push(exit_code);
    stream.push(b'\n');
    stream.extend_from_slice(b"stdout:");
    stream.extend_from_slice(stdout);
    stream.push(b'\n');
    stream.extend_from_slice(b"stderr:");
    stream.extend_from_slice(stderr);
    stream
}

/// Chunk a reply stream into fragments, numbering from zero.
pub fn fragment_reply(stream: &[u8]) -> Vec<ShellReplyFragment> {
    let mut seq_num: u16 = 0;
    let mut fragments = Vec::with_capacity(stream.len() / FRAGMENT_DATA_BYTES + 1);
    for chunk in stream.chunks(FRAGMENT_DATA_BYTES) {
        fragments.push(ShellReplyFragment::from_chunk(chunk, seq_num));
        seq_num = seq_num.wrapping_add(1);
    }
    fragments
}

pub struct ShellExecutor {
    socket: UdpSocket,
    recv_buf: Vec<u8>,
}

impl ShellExecutor {
    pub fn bind<A: ToSocketAddrs>(listen: A) -> io::Result<Self> {
        Ok(Self {
            socket: UdpSocket::bind(listen)?,
            recv_buf: vec![0; SHELL_COMMAND_BYTES + 1],
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Wait for one command, run it to completion, send the fragmented
    /// reply back to the requestor. Returns the fragment count.
    pub fn serve_once(&mut self) -> Result<usize, ExecutorError> {
        let (len, requestor) = self.socket.recv_from(&mut self.recv_buf)?;
        let command = ShellCommand::from_bytes(&self.recv_buf[..len])
            .ok_or(ExecutorError::BadCommandRecord { len })?;
        let text = command.text();
        info!(command = %text, "running shell command");

        let output = OsCommand::new("sh").arg("-c").arg(&text).output()?;
        // A signal death has no exit code; 255 stands in for it.
        let exit_code = output.status.code().unwrap_or(-1) as u8;

        let stream = format_reply(
            output.status.success(),
            exit_code,
            &output.stdout,
            &output.stderr,
        );
        let fragments = fragment_reply(&stream);
        for fragment in &fragments {
            self.socket.send_to(&fragment.encode(), requestor)?;
        }
        self.socket.send_to(REPLY_DONE_SENTINEL, requestor)?;
        Ok(fragments.len())
    }

    pub fn run(&mut self) {
        loop {
            match self.serve_once() {
                Ok(count) => info!(fragments = count, "reply sent"),
                Err(ExecutorError::Io(e)) => error!(error = %e, "executor socket failed"),
                Err(e) => warn!(error = %e, "command dropped"),
            }
        }
    }
}
