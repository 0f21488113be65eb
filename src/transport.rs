//! Byte transports.
//!
//! A connection never talks to its socket directly; it goes through a
//! [`Transport`], so the protocol engine is identical over plain TCP and
//! over a secure record layer. Both directions are strictly non-blocking:
//! `WouldBlock` tells the event loop to wait for readiness.

use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};

use nix::errno::Errno;
use nix::sys::socket::{self, MsgFlags, Shutdown};

/// Outcome of one transport read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    /// `n > 0` bytes were transferred.
    Ready(usize),
    /// The operation would block; retry on the next readiness event.
    WouldBlock,
    /// The peer closed the stream in an orderly fashion.
    Closed,
    /// Hard error (reset, record-layer alert, ...); close without ceremony.
    Error,
}

/// Progress of a secure transport's initial handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    Complete,
    WantRead,
    WantWrite,
    Failed,
}

/// Non-blocking byte stream under a connection.
pub trait Transport: Send {
    fn recv(&mut self, buf: &mut [u8]) -> IoStatus;
    fn send(&mut self, buf: &[u8]) -> IoStatus;

    /// Drive the pre-protocol handshake. Plain transports are born ready.
    fn handshake(&mut self) -> HandshakeStatus {
        HandshakeStatus::Complete
    }

    /// Orderly shutdown; errors at this point are of no interest.
    fn close(&mut self);

    fn raw_fd(&self) -> RawFd;
}

/// Direct socket transport.
pub struct PlainTransport {
    stream: TcpStream,
}

impl PlainTransport {
    pub fn new(stream: TcpStream) -> PlainTransport {
        PlainTransport { stream }
    }
}

impl Transport for PlainTransport {
    fn recv(&mut self, buf: &mut [u8]) -> IoStatus {
        loop {
            return match socket::recv(self.stream.as_raw_fd(), buf, MsgFlags::empty()) {
                Ok(0) => IoStatus::Closed,
                Ok(n) => IoStatus::Ready(n),
                Err(nix::Error::Sys(Errno::EAGAIN)) => IoStatus::WouldBlock,
                Err(nix::Error::Sys(Errno::EINTR)) => continue,
                Err(_) => IoStatus::Error,
            };
        }
    }

    fn send(&mut self, buf: &[u8]) -> IoStatus {
        loop {
            return match socket::send(self.stream.as_raw_fd(), buf, MsgFlags::empty()) {
                Ok(0) => IoStatus::WouldBlock,
                Ok(n) => IoStatus::Ready(n),
                Err(nix::Error::Sys(Errno::EAGAIN)) => IoStatus::WouldBlock,
                Err(nix::Error::Sys(Errno::EPIPE)) => IoStatus::Closed,
                Err(nix::Error::Sys(Errno::EINTR)) => continue,
                Err(_) => IoStatus::Error,
            };
        }
    }

    fn close(&mut self) {
        socket::shutdown(self.stream.as_raw_fd(), Shutdown::Both).ok();
    }

    fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

/// Record layer supplied by the embedder for secure transports.
///
/// The engine knows nothing about the cryptography; it only needs the
/// handshake driven to completion before any HTTP byte is parsed, and
/// `recv`/`send` with the same non-blocking semantics as a plain socket.
pub trait RecordLayer: Send {
    fn handshake(&mut self, fd: RawFd) -> HandshakeStatus;
    fn recv(&mut self, fd: RawFd, buf: &mut [u8]) -> IoStatus;
    fn send(&mut self, fd: RawFd, buf: &[u8]) -> IoStatus;
    fn close(&mut self, fd: RawFd);
}

/// Factory invoked once per accepted connection when the daemon runs in
/// secure mode.
pub type RecordLayerFactory = dyn Fn() -> Box<dyn RecordLayer> + Send + Sync;

/// Secure transport: a socket wrapped in an opaque record layer.
pub struct SecureTransport {
    stream: TcpStream,
    layer: Box<dyn RecordLayer>,
    established: bool,
}

impl SecureTransport {
    pub fn new(stream: TcpStream, layer: Box<dyn RecordLayer>) -> SecureTransport {
        SecureTransport {
            stream,
            layer,
            established: false,
        }
    }
}

impl Transport for SecureTransport {
    fn recv(&mut self, buf: &mut [u8]) -> IoStatus {
        if !self.established {
            return IoStatus::WouldBlock;
        }
        self.layer.recv(self.stream.as_raw_fd(), buf)
    }

    fn send(&mut self, buf: &[u8]) -> IoStatus {
        if !self.established {
            return IoStatus::WouldBlock;
        }
        self.layer.send(self.stream.as_raw_fd(), buf)
    }

    fn handshake(&mut self) -> HandshakeStatus {
        if self.established {
            return HandshakeStatus::Complete;
        }
        let status = self.layer.handshake(self.stream.as_raw_fd());
        if status == HandshakeStatus::Complete {
            self.established = true;
        }
        status
    }

    fn close(&mut self) {
        self.layer.close(self.stream.as_raw_fd());
        socket::shutdown(self.stream.as_raw_fd(), Shutdown::Both).ok();
    }

    fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}
