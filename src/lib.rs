//! embhttpd: an embeddable HTTP/1.1 server library.
//!
//! The crate is a per-connection protocol engine behind a thin embedding
//! API: accept sockets, parse requests incrementally, hand them to an
//! access handler, and stream responses back with chunked transfer
//! encoding, keep-alive and pipelining, all multiplexed over a
//! readiness-driven event loop that never blocks.
//!
//! ```no_run
//! use std::sync::Arc;
//! use embhttpd::{Daemon, HandlerOutcome, Response, Session, StartFlags};
//!
//! let handler = Arc::new(|session: &mut Session| {
//!     if session.upload_complete() {
//!         let body = Response::from_static(b"Hello, world!");
//!         session.queue_response(200, Arc::new(body)).unwrap();
//!     }
//!     HandlerOutcome::Continue
//! });
//! let daemon = Daemon::builder(StartFlags::IPV4 | StartFlags::SELECT_INTERNALLY, 8080)
//!     .timeout_secs(30)
//!     .start(handler)
//!     .unwrap();
//! // ... the daemon serves until dropped ...
//! drop(daemon);
//! ```
//!
//! Three ways to drive the loop, chosen by [`StartFlags`]: let the daemon
//! own a select thread (`SELECT_INTERNALLY`), give every connection its own
//! worker (`THREAD_PER_CONNECTION`), or drive it yourself from the host's
//! event loop with [`Daemon::get_fdset`] and [`Daemon::run`].

mod connection;
mod daemon;
mod error;
mod headers;
mod parser;
mod pool;
mod response;
mod transport;

pub use connection::{
    AcceptPolicy, AccessHandler, ClientContext, Connection, HandlerOutcome, Session,
    TerminationNotifier, TerminationReason,
};
pub use daemon::{Daemon, DaemonBuilder};
pub use error::{DaemonError, HeaderError, ParseError, QueueError};
pub use headers::{HeaderMap, ValueKind};
pub use parser::{HttpVersion, UrlEncoded, MAX_HEADER_BLOCK_BYTES, MAX_URL_BYTES};
pub use pool::{Block, MemoryPool, PoolMark};
pub use response::{reason_phrase, ContentRead, Response};
pub use transport::{
    HandshakeStatus, IoStatus, PlainTransport, RecordLayer, RecordLayerFactory, SecureTransport,
    Transport,
};

/// Option flags for [`Daemon::start`], combinable with `|`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StartFlags(u32);

impl StartFlags {
    /// Emit diagnostic `tracing` events.
    pub const DEBUG: StartFlags = StartFlags(1);
    /// Run connections over the secure record layer.
    pub const TLS: StartFlags = StartFlags(2);
    /// One dedicated worker thread per connection.
    pub const THREAD_PER_CONNECTION: StartFlags = StartFlags(4);
    /// The daemon owns a thread running the select loop.
    pub const SELECT_INTERNALLY: StartFlags = StartFlags(8);
    /// Listen on IPv4.
    pub const IPV4: StartFlags = StartFlags(16);
    /// Listen on IPv6.
    pub const IPV6: StartFlags = StartFlags(32);

    pub const fn empty() -> StartFlags {
        StartFlags(0)
    }

    pub const fn contains(self, other: StartFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for StartFlags {
    type Output = StartFlags;

    fn bitor(self, rhs: StartFlags) -> StartFlags {
        StartFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for StartFlags {
    fn bitor_assign(&mut self, rhs: StartFlags) {
        self.0 |= rhs.0;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn flags_combine_and_test() {
        let flags = StartFlags::IPV4 | StartFlags::DEBUG;
        assert!(flags.contains(StartFlags::IPV4));
        assert!(flags.contains(StartFlags::DEBUG));
        assert!(!flags.contains(StartFlags::TLS));
        assert!(flags.contains(StartFlags::empty()));

        let mut flags = StartFlags::empty();
        flags |= StartFlags::IPV6;
        assert!(flags.contains(StartFlags::IPV6));
    }
}
