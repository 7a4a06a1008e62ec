//! On-board command routing.
//!
//! The router owns the command ingress socket, verifies each datagram,
//! tracks the 8-bit sequence number, hands the decoded record to the
//! handler registered for its variant, and answers with exactly one
//! acknowledgement. There should only be one router per payload.

use crate::packets::{
    Ack, AckError, AckErrorKind, Command, CommandKind, ShellReplyFragment, REPLY_DONE_SENTINEL,
};
use crate::verify::{self, CommandRecord};
use crate::wire;
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, warn};

const RECV_BUFFER_BYTES: usize = 65536;

/// Default wall-clock bound on a shell command's execution, router side.
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of one router iteration that did not end in a normal ack.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("command rejected ({}), error ack sent", .0.name())]
    Rejected(AckErrorKind),
    #[error("sequence mismatch: expected {expected}, received {received}")]
    SequenceMismatch { expected: u8, received: u8 },
    #[error("no handler registered for {0:?}")]
    NoHandler(CommandKind),
}

/// Handler for one command variant. May reject with an [`AckError`]; the
/// router still owes the sender an ack either way.
pub type Handler = Box<dyn FnMut(&CommandRecord) -> Result<Ack, AckError> + Send>;

pub struct CommandRouter {
    socket: UdpSocket,
    handlers: HashMap<CommandKind, Handler>,
    expected_counter: Option<u8>,
    reply_to: Option<SocketAddr>,
    recv_buf: Vec<u8>,
}

impl CommandRouter {
    pub fn bind<A: ToSocketAddrs>(listen: A) -> io::Result<Self> {
        Ok(Self {
            socket: UdpSocket::bind(listen)?,
            handlers: HashMap::new(),
            expected_counter: None,
            reply_to: None,
            recv_buf: vec![0; RECV_BUFFER_BYTES],
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Send every ack to a fixed address instead of the datagram's source.
    /// Used in flight so acks go straight to the gondola relay no matter
    /// which interface the command arrived on.
    pub fn set_reply_to(&mut self, addr: Option<SocketAddr>) {
        self.reply_to = addr;
    }

    pub fn register<F>(&mut self, kind: CommandKind, handler: F)
    where
        F: FnMut(&CommandRecord) -> Result<Ack, AckError> + Send + 'static,
    {
        self.handlers.insert(kind, Box::new(handler));
    }

    /// Receive one command, verify, sequence-check, dispatch, ack.
    pub fn route_once(&mut self) -> Result<(), RouterError> {
        let (len, sender) = self.socket.recv_from(&mut self.recv_buf)?;

        let record = match verify::decode_command(&self.recv_buf[..len], sender) {
            Ok(record) => record,
            Err(err) => {
                self.send_error_ack(&err)?;
                return Err(RouterError::Rejected(err.kind));
            }
        };

        let received = record.header.counter;
        if let Some(expected) = self.expected_counter {
            if expected != received {
                // A lost command skews this permanently: expected is not
                // advanced on a mismatch, so every later command also
                // mismatches until the sender re-syncs.
                let mut detail = [0u8; 7];
                detail[..6].copy_from_slice(b"badsqn");
                detail[6] = expected;
                let err = AckError::new(
                    AckErrorKind::GeneralFailure,
                    &detail,
                    sender,
                    received,
                    record.command.kind(),
                );
                self.send_error_ack(&err)?;
                return Err(RouterError::SequenceMismatch { expected, received });
            }
        }
        self.expected_counter = Some(received.wrapping_add(1));

        let kind = record.command.kind();
        let handler = match self.handlers.get_mut(&kind) {
            Some(handler) => handler,
            None => {
                // Programmer error: we cannot know what the handler would
                // have acked, so nothing is sent.
                error!(?kind, "no handler registered; dropping command");
                return Err(RouterError::NoHandler(kind));
            }
        };

        match handler(&record) {
            Ok(mut ack) => {
                ack.pre_send(received, kind);
                let mut bytes = ack.encode();
                wire::stamp_and_seal(&mut bytes);
                let dest = self.reply_to.unwrap_or(sender);
                self.socket.send_to(&bytes, dest)?;
                Ok(())
            }
            Err(err) => {
                // Handlers only pick the error code and data; the routing
                // fields are authoritative here.
                let err = AckError::new(err.kind, &err.data, sender, received, kind);
                self.send_error_ack(&err)?;
                Err(RouterError::Rejected(err.kind))
            }
        }
    }

    /// Loop forever, logging every iteration that did not produce a normal
    /// ack.
    pub fn run(&mut self) {
        loop {
            match self.route_once() {
                Ok(()) => {}
                Err(RouterError::Io(e)) => error!(error = %e, "command ingress socket failed"),
                Err(e) => warn!(error = %e, "command not dispatched"),
            }
        }
    }

    fn send_error_ack(&self, err: &AckError) -> io::Result<()> {
        let mut bytes = Ack::from_error(err).encode();
        wire::stamp_and_seal(&mut bytes);
        let dest = self.reply_to.unwrap_or(err.sender);
        self.socket.send_to(&bytes, dest)?;
        Ok(())
    }
}

/// Router-side handler for the shell command.
///
/// Forwards the command text to the executor, collects the reply fragments
/// the executor sends back, forwards each one to the telemeter ingress,
/// and decides the ack from what arrived. The socket doubles as the
/// fragment forwarding source so the telemeter's port map recognizes it.
pub struct ShellHandler {
    socket: UdpSocket,
    executor: SocketAddr,
    telemeter: SocketAddr,
    timeout: Duration,
}

impl ShellHandler {
    pub fn new<A: ToSocketAddrs>(
        fragment_bind: A,
        executor: SocketAddr,
        telemeter: SocketAddr,
    ) -> io::Result<Self> {
        Ok(Self {
            socket: UdpSocket::bind(fragment_bind)?,
            executor,
            telemeter,
            timeout: DEFAULT_HANDLER_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn handle(&mut self, record: &CommandRecord) -> Result<Ack, AckError> {
        let command = match &record.command {
            Command::Shell(command) => command,
            other => {
                return Err(AckError::new(
                    AckErrorKind::InvalidPayloadValue,
                    &[other.kind().wire_id()],
                    record.sender,
                    record.header.counter,
                    record.command.kind(),
                ));
            }
        };

        self.socket
            .send_to(command.as_bytes(), self.executor)
            .map_err(|e| self.socket_failure(record, &e))?;

        let fragments = self
            .collect_fragments()
            .map_err(|e| self.socket_failure(record, &e))?;

        if fragments.is_empty() {
            return Err(AckError::new(
                AckErrorKind::GeneralFailure,
                b"prdead",
                record.sender,
                record.header.counter,
                record.command.kind(),
            ));
        }
        if fragments[0].data.starts_with(b"error") {
            return Err(AckError::new(
                AckErrorKind::GeneralFailure,
                b"excerr",
                record.sender,
                record.header.counter,
                record.command.kind(),
            ));
        }
        Ok(Ack::new())
    }

    fn collect_fragments(&mut self) -> io::Result<Vec<ShellReplyFragment>> {
        let deadline = Instant::now() + self.timeout;
        let mut fragments = Vec::new();
        let mut buf = [0u8; 2048];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            self.socket.set_read_timeout(Some(remaining))?;
            match self.socket.recv(&mut buf) {
                Ok(len) => {
                    let datagram = &buf[..len];
                    if datagram == REPLY_DONE_SENTINEL {
                        break;
                    }
                    match ShellReplyFragment::decode(datagram) {
                        Some(fragment) => {
                            if let Err(e) = self.socket.send_to(datagram, self.telemeter) {
                                warn!(error = %e, "could not forward reply fragment");
                            }
                            fragments.push(fragment);
                        }
                        None => warn!(len, "undecodable datagram on the fragment port"),
                    }
                }
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

        fragments.sort_by_key(|fragment| fragment.seq_num);
        Ok(fragments)
    }

    fn socket_failure(&self, record: &CommandRecord, err: &io::Error) -> AckError {
        error!(error = %err, "shell handler socket failure");
        AckError::new(
            AckErrorKind::GeneralFailure,
            b"sckerr",
            record.sender,
            record.header.counter,
            record.command.kind(),
        )
    }
}
