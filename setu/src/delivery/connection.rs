//! One keep-alive connection to the telemetry endpoint
//!
//! ```text
//!  Connecting ──writable, no error──▶ Sending ──full write──▶ Receiving
//!       │                              ▲  │                      │
//!       │                              │  └──── WouldBlock ──────┤ (entry dropped)
//!       │                              └──────── response ───────┘
//!       └──────────── any error ──────────────────────────────▶ Faulted
//! ```
//!
//! Sockets are registered edge-triggered, so readiness is cached per
//! connection and only cleared when an operation reports `WouldBlock`.

use super::request::{RESPONSE_BUFFER_LEN, StatusLine, parse_status};
use mio::event::Event;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr};

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Non-blocking connect in flight
    Connecting,
    /// Ready to write the next request
    Sending,
    /// Request written, waiting for the response
    Receiving,
    /// Unusable; must be closed and replaced
    Faulted,
}

/// Result of one send attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Whole request written
    Sent,
    /// Socket buffer full, request not written
    WouldBlock,
    /// Write failed or was cut short
    Failed,
}

/// Result of one receive attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Response bytes arrived; status line if it could be parsed
    Response(Option<StatusLine>),
    /// Nothing to read yet
    Pending,
    /// Peer closed or read failed
    Failed,
}

pub struct DeliveryConnection {
    stream: TcpStream,
    token: Token,
    state: ConnectionState,
    readable: bool,
    writable: bool,
}

impl DeliveryConnection {
    /// Start a non-blocking connect and register for read and write readiness
    pub fn connect(registry: &Registry, addr: SocketAddr, token: Token) -> io::Result<Self> {
        let mut stream = TcpStream::connect(addr)?;
        if let Err(e) = registry.register(
            &mut stream,
            token,
            Interest::READABLE | Interest::WRITABLE,
        ) {
            let _ = stream.shutdown(Shutdown::Both);
            return Err(e);
        }
        Ok(Self {
            stream,
            token,
            state: ConnectionState::Connecting,
            readable: false,
            writable: false,
        })
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Record readiness reported by the poll
    pub fn note_event(&mut self, event: &Event) {
        if event.is_readable() || event.is_read_closed() {
            self.readable = true;
        }
        if event.is_writable() || event.is_write_closed() {
            self.writable = true;
        }
        if event.is_error() {
            self.readable = true;
            self.writable = true;
        }
    }

    /// Pending socket error, if any
    pub fn health_check(&mut self) -> Option<String> {
        match self.stream.take_error() {
            Ok(None) => None,
            Ok(Some(e)) => Some(e.to_string()),
            Err(e) => Some(format!("take_error: {}", e)),
        }
    }

    /// Finish a pending connect once the socket reports writable
    ///
    /// Returns true when the connection moved to `Sending`.
    pub fn complete_connect(&mut self) -> bool {
        if self.state != ConnectionState::Connecting || !self.writable {
            return false;
        }
        if let Some(reason) = self.health_check() {
            log::debug!("{:?}: connect failed: {}", self.token, reason);
            self.state = ConnectionState::Faulted;
            return false;
        }
        match self.stream.peer_addr() {
            Ok(peer) => {
                log::debug!("{:?}: connected to {}", self.token, peer);
                self.state = ConnectionState::Sending;
                true
            }
            Err(e) if e.kind() == ErrorKind::NotConnected => {
                self.writable = false;
                false
            }
            Err(e) => {
                log::debug!("{:?}: connect failed: {}", self.token, e);
                self.state = ConnectionState::Faulted;
                false
            }
        }
    }

    /// Write one request with a single non-blocking write
    ///
    /// A short write faults the connection instead of leaving it in
    /// `Sending`: the endpoint already holds a torn request, so any further
    /// byte on this socket would be parsed as part of it. `WouldBlock` writes
    /// nothing and keeps the connection in `Sending`.
    pub fn send(&mut self, request: &[u8]) -> SendOutcome {
        loop {
            match self.stream.write(request) {
                Ok(n) if n == request.len() => {
                    self.state = ConnectionState::Receiving;
                    return SendOutcome::Sent;
                }
                Ok(n) => {
                    log::warn!(
                        "{:?}: short write ({} of {} bytes), dropping connection",
                        self.token,
                        n,
                        request.len()
                    );
                    self.state = ConnectionState::Faulted;
                    return SendOutcome::Failed;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.writable = false;
                    return SendOutcome::WouldBlock;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("{:?}: write failed: {}", self.token, e);
                    self.state = ConnectionState::Faulted;
                    return SendOutcome::Failed;
                }
            }
        }
    }

    /// Read the response to the last request
    ///
    /// Everything currently buffered is consumed; only the first chunk is
    /// parsed.
    pub fn receive(&mut self) -> ReceiveOutcome {
        if !self.readable {
            return ReceiveOutcome::Pending;
        }
        let mut buf = [0u8; RESPONSE_BUFFER_LEN];
        let mut status = None;
        let mut received = false;

        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    log::debug!("{:?}: closed by peer", self.token);
                    self.state = ConnectionState::Faulted;
                    return if received {
                        ReceiveOutcome::Response(status)
                    } else {
                        ReceiveOutcome::Failed
                    };
                }
                Ok(n) => {
                    if !received {
                        status = parse_status(&buf[..n]);
                        received = true;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.readable = false;
                    break;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("{:?}: read failed: {}", self.token, e);
                    self.state = ConnectionState::Faulted;
                    return ReceiveOutcome::Failed;
                }
            }
        }

        if received {
            self.state = ConnectionState::Sending;
            ReceiveOutcome::Response(status)
        } else {
            ReceiveOutcome::Pending
        }
    }

    /// Consume bytes arriving outside a request/response exchange
    ///
    /// Detects an endpoint that closed an idle keep-alive connection.
    pub fn discard_unsolicited(&mut self) {
        if !self.readable {
            return;
        }
        let mut buf = [0u8; RESPONSE_BUFFER_LEN];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    log::debug!("{:?}: idle connection closed by peer", self.token);
                    self.state = ConnectionState::Faulted;
                    return;
                }
                Ok(n) => log::debug!("{:?}: discarding {} unsolicited bytes", self.token, n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.readable = false;
                    return;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("{:?}: read failed: {}", self.token, e);
                    self.state = ConnectionState::Faulted;
                    return;
                }
            }
        }
    }

    pub fn mark_faulted(&mut self) {
        self.state = ConnectionState::Faulted;
    }

    /// Half-close, deregister and drop the socket
    pub fn close(mut self, registry: &Registry) {
        let _ = self.stream.shutdown(Shutdown::Write);
        if let Err(e) = registry.deregister(&mut self.stream) {
            log::debug!("{:?}: deregister failed: {}", self.token, e);
        }
    }
}
