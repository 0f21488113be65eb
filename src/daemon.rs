//! The daemon: listening socket, connection registry, event loop and
//! threading policy.
//!
//! Three mutually exclusive ways to drive the engine:
//!
//! 1. external mode: the host calls [`Daemon::get_fdset`] and [`Daemon::run`]
//!    around its own `select`;
//! 2. internal select: one thread owned by the daemon runs the loop;
//! 3. thread per connection: a listener thread accepts and hands each
//!    connection to a dedicated worker.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::select::{select, FdSet};
use nix::sys::time::TimeVal;
use nix::unistd;
use tracing::{debug, warn};

use crate::connection::{
    AcceptPolicy, AccessHandler, Connection, TerminationNotifier, TerminationReason,
};
use crate::error::DaemonError;
use crate::transport::{PlainTransport, RecordLayer, RecordLayerFactory, SecureTransport, Transport};
use crate::StartFlags;

const DEFAULT_POOL_SIZE: usize = 32 * 1024;
const MIN_POOL_SIZE: usize = 8 * 1024;
// loop wakeup granularity; bounds how late timeouts and shutdown are noticed
const TICK_SECONDS: libc::time_t = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunMode {
    External,
    SelectInternally,
    ThreadPerConnection,
}

/// Daemon state the connections need while being driven.
pub(crate) struct Shared {
    pub(crate) debug: bool,
    pub(crate) mode: RunMode,
    pub(crate) timeout: Duration,
    pub(crate) pool_size: usize,
    pub(crate) handlers: Mutex<Vec<(String, AccessHandler)>>,
    pub(crate) default_handler: AccessHandler,
    pub(crate) accept_policy: Option<AcceptPolicy>,
    pub(crate) notifier: Option<TerminationNotifier>,
}

impl Shared {
    /// Longest registered prefix wins; the default handler is the fallback.
    pub(crate) fn resolve_handler(&self, url: &str) -> AccessHandler {
        let handlers = self.handlers.lock().unwrap();
        handlers
            .iter()
            .filter(|(prefix, _)| url.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, handler)| handler.clone())
            .unwrap_or_else(|| self.default_handler.clone())
    }
}

struct Inner {
    shared: Shared,
    // taken and dropped on shutdown, which closes the socket; the raw fd is
    // kept separately for the select sets
    listener: Mutex<Option<TcpListener>>,
    listener_fd: RawFd,
    local_addr: SocketAddr,
    secure: bool,
    record_layer: Option<Arc<RecordLayerFactory>>,
    connections: Mutex<Vec<Connection>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
    accepting: AtomicBool,
    connection_limit: usize,
    num_connections: AtomicUsize,
    wake_read: RawFd,
    wake_write: RawFd,
}

/// Configuration collected before [`DaemonBuilder::start`].
pub struct DaemonBuilder {
    flags: StartFlags,
    port: u16,
    bind_addr: Option<IpAddr>,
    timeout_secs: u64,
    pool_size: usize,
    connection_limit: usize,
    accept_policy: Option<AcceptPolicy>,
    notifier: Option<TerminationNotifier>,
    record_layer: Option<Arc<RecordLayerFactory>>,
}

impl DaemonBuilder {
    fn new(flags: StartFlags, port: u16) -> DaemonBuilder {
        DaemonBuilder {
            flags,
            port,
            bind_addr: None,
            timeout_secs: 0,
            pool_size: DEFAULT_POOL_SIZE,
            connection_limit: usize::MAX,
            accept_policy: None,
            notifier: None,
            record_layer: None,
        }
    }

    /// Bind to a specific interface instead of the wildcard address.
    pub fn bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    /// Idle timeout in seconds; 0 disables timeouts.
    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Per-connection memory pool size.
    pub fn pool_size(mut self, bytes: usize) -> Self {
        self.pool_size = bytes.max(MIN_POOL_SIZE);
        self
    }

    /// Stop accepting once this many connections are live.
    pub fn connection_limit(mut self, limit: usize) -> Self {
        self.connection_limit = limit;
        self
    }

    pub fn accept_policy(mut self, policy: AcceptPolicy) -> Self {
        self.accept_policy = Some(policy);
        self
    }

    pub fn notifier(mut self, notifier: TerminationNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Record layer factory for [`StartFlags::TLS`] operation.
    pub fn record_layer<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn RecordLayer> + Send + Sync + 'static,
    {
        self.record_layer = Some(Arc::new(factory));
        self
    }

    /// Bind, spawn whatever threads the mode calls for, and return the
    /// running daemon.
    pub fn start(self, default_handler: AccessHandler) -> Result<Daemon, DaemonError> {
        let flags = self.flags;
        if !flags.contains(StartFlags::IPV4) && !flags.contains(StartFlags::IPV6) {
            return Err(DaemonError::NoAddressFamily);
        }
        if flags.contains(StartFlags::THREAD_PER_CONNECTION)
            && flags.contains(StartFlags::SELECT_INTERNALLY)
        {
            return Err(DaemonError::ConflictingModes);
        }
        let secure = flags.contains(StartFlags::TLS);
        if secure && self.record_layer.is_none() {
            return Err(DaemonError::MissingRecordLayer);
        }
        let mode = if flags.contains(StartFlags::THREAD_PER_CONNECTION) {
            RunMode::ThreadPerConnection
        } else if flags.contains(StartFlags::SELECT_INTERNALLY) {
            RunMode::SelectInternally
        } else {
            RunMode::External
        };

        let addr = self.bind_addr.unwrap_or(if flags.contains(StartFlags::IPV6) {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        });
        let listener = TcpListener::bind(SocketAddr::new(addr, self.port))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let listener_fd = listener.as_raw_fd();

        let (wake_read, wake_write) = unistd::pipe().map_err(nix_io)?;

        let inner = Arc::new(Inner {
            shared: Shared {
                debug: flags.contains(StartFlags::DEBUG),
                mode,
                timeout: Duration::from_secs(self.timeout_secs),
                pool_size: self.pool_size,
                handlers: Mutex::new(Vec::new()),
                default_handler,
                accept_policy: self.accept_policy,
                notifier: self.notifier,
            },
            listener: Mutex::new(Some(listener)),
            listener_fd,
            local_addr,
            secure,
            record_layer: self.record_layer,
            connections: Mutex::new(Vec::new()),
            workers: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
            accepting: AtomicBool::new(true),
            connection_limit: self.connection_limit,
            num_connections: AtomicUsize::new(0),
            wake_read,
            wake_write,
        });

        if inner.shared.debug {
            debug!(addr = %local_addr, ?mode, "daemon listening");
        }

        let loop_thread = match mode {
            RunMode::External => None,
            RunMode::SelectInternally => {
                let inner = inner.clone();
                Some(std::thread::spawn(move || select_loop(inner)))
            }
            RunMode::ThreadPerConnection => {
                let inner = inner.clone();
                Some(std::thread::spawn(move || accept_loop(inner)))
            }
        };

        Ok(Daemon {
            inner,
            loop_thread: Mutex::new(loop_thread),
        })
    }
}

/// A running server instance.
///
/// Dropping the daemon stops it: the listener closes, loop and worker
/// threads are joined, and every live connection is terminated with
/// [`TerminationReason::DaemonShutdown`].
pub struct Daemon {
    inner: Arc<Inner>,
    loop_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Daemon {
    pub fn builder(flags: StartFlags, port: u16) -> DaemonBuilder {
        DaemonBuilder::new(flags, port)
    }

    /// Start with default options; shorthand for `builder(..).start(..)`.
    pub fn start(
        flags: StartFlags,
        port: u16,
        default_handler: AccessHandler,
    ) -> Result<Daemon, DaemonError> {
        DaemonBuilder::new(flags, port).start(default_handler)
    }

    /// The bound address (useful when started with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Register a handler for URLs beginning with `prefix`. The longest
    /// matching prefix wins at dispatch time.
    pub fn register_handler(
        &self,
        prefix: &str,
        handler: AccessHandler,
    ) -> Result<(), DaemonError> {
        let mut handlers = self.inner.shared.handlers.lock().unwrap();
        if handlers.iter().any(|(p, _)| p == prefix) {
            return Err(DaemonError::DuplicateHandler);
        }
        handlers.push((prefix.to_string(), handler));
        Ok(())
    }

    pub fn unregister_handler(&self, prefix: &str) -> Result<(), DaemonError> {
        let mut handlers = self.inner.shared.handlers.lock().unwrap();
        let before = handlers.len();
        handlers.retain(|(p, _)| p != prefix);
        if handlers.len() == before {
            return Err(DaemonError::UnknownHandler);
        }
        Ok(())
    }

    /// Fill the host's fd sets with everything the daemon is waiting on.
    /// Only valid in external mode.
    pub fn get_fdset(
        &self,
        read_set: &mut FdSet,
        write_set: &mut FdSet,
        _except_set: &mut FdSet,
        max_fd: &mut RawFd,
    ) -> Result<(), DaemonError> {
        if self.inner.shared.mode != RunMode::External {
            return Err(DaemonError::WrongMode);
        }
        let mut track = |set: &mut FdSet, fd: RawFd| {
            set.insert(fd);
            if fd > *max_fd {
                *max_fd = fd;
            }
        };
        if self.inner.accepting.load(Ordering::Relaxed) {
            track(read_set, self.inner.listener_fd);
        }
        let connections = self.inner.connections.lock().unwrap();
        for conn in connections.iter() {
            if conn.wants_read() {
                track(read_set, conn.raw_fd());
            }
            if conn.wants_write() {
                track(write_set, conn.raw_fd());
            }
        }
        Ok(())
    }

    /// One non-blocking sweep: accept, advance every connection as far as
    /// it will go, reap the dead. Only valid in external mode.
    pub fn run(&self) -> Result<(), DaemonError> {
        if self.inner.shared.mode != RunMode::External {
            return Err(DaemonError::WrongMode);
        }
        run_once(&self.inner);
        Ok(())
    }

    /// Stop the daemon and tear down all connections. Equivalent to
    /// dropping it.
    pub fn stop(self) {}

    fn shutdown(&self) {
        let inner = &self.inner;
        if !inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        // wake the loop thread out of select()
        unistd::write(inner.wake_write, &[1u8]).ok();
        if let Some(handle) = self.loop_thread.lock().unwrap().take() {
            handle.join().ok();
        }
        let workers = std::mem::take(&mut *inner.workers.lock().unwrap());
        for worker in workers {
            worker.join().ok();
        }
        // closing the listener refuses any late connection attempts
        inner.listener.lock().unwrap().take();
        let mut connections = inner.connections.lock().unwrap();
        for conn in connections.iter_mut() {
            conn.terminate(&inner.shared, TerminationReason::DaemonShutdown);
        }
        connections.clear();
        unistd::close(inner.wake_read).ok();
        unistd::close(inner.wake_write).ok();
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn nix_io(e: nix::Error) -> DaemonError {
    let errno = e.as_errno().map(|errno| errno as i32).unwrap_or(0);
    DaemonError::Io(io::Error::from_raw_os_error(errno))
}

/// Accept one pending connection, if the policy and limits allow it.
fn accept_one(inner: &Inner) -> Option<Connection> {
    let guard = inner.listener.lock().unwrap();
    let listener = guard.as_ref()?;
    let (stream, peer) = match listener.accept() {
        Ok(accepted) => accepted,
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return None,
        Err(e) => {
            if matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE)) {
                // out of descriptors; resume accepting when a slot frees up
                inner.accepting.store(false, Ordering::Relaxed);
            }
            warn!(error = %e, "accept failed");
            return None;
        }
    };
    drop(guard);
    if inner.num_connections.load(Ordering::Relaxed) >= inner.connection_limit {
        inner.accepting.store(false, Ordering::Relaxed);
        return None; // dropping the stream refuses the client
    }
    if let Some(policy) = &inner.shared.accept_policy {
        if !policy(&peer) {
            if inner.shared.debug {
                debug!(peer = %peer, "connection refused by accept policy");
            }
            return None;
        }
    }
    if let Err(e) = stream.set_nonblocking(true) {
        warn!(error = %e, "failed to make accepted socket non-blocking");
        return None;
    }
    let transport: Box<dyn Transport> = if inner.secure {
        let factory = inner
            .record_layer
            .as_ref()
            .expect("secure daemon without record layer");
        Box::new(SecureTransport::new(stream, factory()))
    } else {
        Box::new(PlainTransport::new(stream))
    };
    match Connection::new(transport, peer, inner.shared.pool_size, inner.secure) {
        Some(conn) => {
            inner.num_connections.fetch_add(1, Ordering::Relaxed);
            if inner.shared.debug {
                debug!(peer = %peer, "connection accepted");
            }
            Some(conn)
        }
        None => {
            warn!("connection pool too small for buffers");
            None
        }
    }
}

/// One sweep over the registry, used by external mode and the internal
/// select thread.
fn run_once(inner: &Inner) {
    if inner.accepting.load(Ordering::Relaxed) {
        if let Some(conn) = accept_one(inner) {
            let mut connections = inner.connections.lock().unwrap();
            connections.push(conn);
            let index = connections.len() - 1;
            // try to read straight away instead of waiting for the next
            // readiness sweep
            connections[index].advance_io(&inner.shared);
        }
    }
    let now = Instant::now();
    let mut connections = inner.connections.lock().unwrap();
    for conn in connections.iter_mut() {
        conn.check_timeout(&inner.shared, now);
        conn.advance_io(&inner.shared);
    }
    let before = connections.len();
    connections.retain(|conn| !conn.closed());
    let reaped = before - connections.len();
    if reaped > 0 {
        inner.num_connections.fetch_sub(reaped, Ordering::Relaxed);
        inner.accepting.store(true, Ordering::Relaxed);
    }
}

/// Internal-select mode: the daemon's own event loop thread.
fn select_loop(inner: Arc<Inner>) {
    while inner.running.load(Ordering::Relaxed) {
        let mut read_set = FdSet::new();
        let mut write_set = FdSet::new();
        read_set.insert(inner.wake_read);
        if inner.accepting.load(Ordering::Relaxed) {
            read_set.insert(inner.listener_fd);
        }
        {
            let connections = inner.connections.lock().unwrap();
            for conn in connections.iter() {
                if conn.wants_read() {
                    read_set.insert(conn.raw_fd());
                }
                if conn.wants_write() {
                    write_set.insert(conn.raw_fd());
                }
            }
        }
        let mut timeout = TimeVal::from(libc::timeval {
            tv_sec: TICK_SECONDS,
            tv_usec: 0,
        });
        match select(
            None,
            Some(&mut read_set),
            Some(&mut write_set),
            None,
            Some(&mut timeout),
        ) {
            Ok(_) => {}
            Err(e) => {
                if e.as_errno() == Some(Errno::EINTR) {
                    continue; // interrupted by signal
                }
                warn!(error = %e, "select failed");
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }
        }
        if read_set.contains(inner.wake_read) {
            let mut sink = [0u8; 8];
            unistd::read(inner.wake_read, &mut sink).ok();
        }
        run_once(&inner);
    }
}

/// Thread-per-connection mode: accept here, serve over there.
fn accept_loop(inner: Arc<Inner>) {
    while inner.running.load(Ordering::Relaxed) {
        let mut read_set = FdSet::new();
        read_set.insert(inner.wake_read);
        if inner.accepting.load(Ordering::Relaxed) {
            read_set.insert(inner.listener_fd);
        }
        let mut timeout = TimeVal::from(libc::timeval {
            tv_sec: TICK_SECONDS,
            tv_usec: 0,
        });
        match select(None, Some(&mut read_set), None, None, Some(&mut timeout)) {
            Ok(_) => {}
            Err(e) => {
                if e.as_errno() == Some(Errno::EINTR) {
                    continue;
                }
                warn!(error = %e, "select failed in accept loop");
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }
        }
        if read_set.contains(inner.wake_read) {
            let mut sink = [0u8; 8];
            unistd::read(inner.wake_read, &mut sink).ok();
        }
        if !read_set.contains(inner.listener_fd) {
            continue;
        }
        if let Some(conn) = accept_one(&inner) {
            let worker_inner = inner.clone();
            let handle = std::thread::spawn(move || worker_loop(worker_inner, conn));
            inner.workers.lock().unwrap().push(handle);
        }
    }
}

/// Serve exactly one connection until it closes or the daemon stops.
fn worker_loop(inner: Arc<Inner>, mut conn: Connection) {
    while inner.running.load(Ordering::Relaxed) && !conn.closed() {
        let fd = conn.raw_fd();
        let mut read_set = FdSet::new();
        let mut write_set = FdSet::new();
        if conn.wants_read() {
            read_set.insert(fd);
        }
        if conn.wants_write() {
            write_set.insert(fd);
        }
        let mut timeout = TimeVal::from(libc::timeval {
            tv_sec: 0,
            tv_usec: 250_000,
        });
        match select(
            None,
            Some(&mut read_set),
            Some(&mut write_set),
            None,
            Some(&mut timeout),
        ) {
            Ok(_) => {}
            Err(e) => {
                if e.as_errno() == Some(Errno::EINTR) {
                    continue;
                }
                break;
            }
        }
        conn.advance_io(&inner.shared);
        conn.check_timeout(&inner.shared, Instant::now());
    }
    if !conn.closed() {
        conn.terminate(&inner.shared, TerminationReason::DaemonShutdown);
    }
    inner.num_connections.fetch_sub(1, Ordering::Relaxed);
    inner.accepting.store(true, Ordering::Relaxed);
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::connection::{HandlerOutcome, Session};

    fn nop_handler() -> AccessHandler {
        Arc::new(|_session: &mut Session| HandlerOutcome::Continue)
    }

    fn test_shared(prefixes: &[&str]) -> Shared {
        let handlers = prefixes
            .iter()
            .map(|p| {
                let tag = p.to_string();
                let handler: AccessHandler = Arc::new(move |_session: &mut Session| {
                    let _ = &tag;
                    HandlerOutcome::Continue
                });
                (p.to_string(), handler)
            })
            .collect();
        Shared {
            debug: false,
            mode: RunMode::External,
            timeout: Duration::from_secs(0),
            pool_size: DEFAULT_POOL_SIZE,
            handlers: Mutex::new(handlers),
            default_handler: nop_handler(),
            accept_policy: None,
            notifier: None,
        }
    }

    #[test]
    fn longest_prefix_wins() {
        let shared = test_shared(&["/", "/api", "/api/v2"]);
        let handlers = shared.handlers.lock().unwrap();
        let expected: Vec<*const ()> = vec![
            Arc::as_ptr(&handlers[2].1) as *const (),
            Arc::as_ptr(&handlers[1].1) as *const (),
            Arc::as_ptr(&handlers[0].1) as *const (),
        ];
        drop(handlers);
        assert_eq!(
            Arc::as_ptr(&shared.resolve_handler("/api/v2/users")) as *const (),
            expected[0]
        );
        assert_eq!(
            Arc::as_ptr(&shared.resolve_handler("/api/v1")) as *const (),
            expected[1]
        );
        assert_eq!(
            Arc::as_ptr(&shared.resolve_handler("/other")) as *const (),
            expected[2]
        );
    }

    #[test]
    fn unmatched_urls_fall_back_to_the_default() {
        let shared = test_shared(&["/api"]);
        let resolved = shared.resolve_handler("/elsewhere");
        assert_eq!(
            Arc::as_ptr(&resolved) as *const (),
            Arc::as_ptr(&shared.default_handler) as *const ()
        );
    }

    #[test]
    fn starting_without_an_address_family_fails() {
        let result = Daemon::start(StartFlags::empty(), 0, nop_handler());
        assert!(matches!(result, Err(DaemonError::NoAddressFamily)));
    }

    #[test]
    fn conflicting_modes_are_rejected() {
        let flags =
            StartFlags::IPV4 | StartFlags::THREAD_PER_CONNECTION | StartFlags::SELECT_INTERNALLY;
        let result = Daemon::start(flags, 0, nop_handler());
        assert!(matches!(result, Err(DaemonError::ConflictingModes)));
    }

    #[test]
    fn tls_requires_a_record_layer() {
        let result = Daemon::start(StartFlags::IPV4 | StartFlags::TLS, 0, nop_handler());
        assert!(matches!(result, Err(DaemonError::MissingRecordLayer)));
    }

    #[test]
    fn handler_registration_is_prefix_unique() {
        let daemon = Daemon::start(StartFlags::IPV4, 0, nop_handler()).unwrap();
        daemon.register_handler("/api", nop_handler()).unwrap();
        assert!(matches!(
            daemon.register_handler("/api", nop_handler()),
            Err(DaemonError::DuplicateHandler)
        ));
        daemon.unregister_handler("/api").unwrap();
        assert!(matches!(
            daemon.unregister_handler("/api"),
            Err(DaemonError::UnknownHandler)
        ));
    }

    #[test]
    fn get_fdset_is_external_mode_only() {
        let daemon = Daemon::start(
            StartFlags::IPV4 | StartFlags::SELECT_INTERNALLY,
            0,
            nop_handler(),
        )
        .unwrap();
        let mut read_set = FdSet::new();
        let mut write_set = FdSet::new();
        let mut except_set = FdSet::new();
        let mut max_fd = -1;
        assert!(matches!(
            daemon.get_fdset(&mut read_set, &mut write_set, &mut except_set, &mut max_fd),
            Err(DaemonError::WrongMode)
        ));
        assert!(matches!(daemon.run(), Err(DaemonError::WrongMode)));
    }

    #[test]
    fn get_fdset_reports_the_listener() {
        let daemon = Daemon::start(StartFlags::IPV4, 0, nop_handler()).unwrap();
        let mut read_set = FdSet::new();
        let mut write_set = FdSet::new();
        let mut except_set = FdSet::new();
        let mut max_fd = -1;
        daemon
            .get_fdset(&mut read_set, &mut write_set, &mut except_set, &mut max_fd)
            .unwrap();
        assert!(read_set.contains(daemon.inner.listener_fd));
        assert_eq!(max_fd, daemon.inner.listener_fd);
    }
}
