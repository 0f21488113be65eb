//! Per-connection protocol engine.
//!
//! Each accepted socket gets one `Connection`: a state machine that is
//! advanced whenever the event loop sees readiness, never blocks, and owns
//! all of its memory through a [`MemoryPool`]. The public face of a
//! connection, as seen from an access handler, is the [`Session`] alias.

use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, warn};

use crate::daemon::{RunMode, Shared};
use crate::error::{ParseError, QueueError};
use crate::headers::{HeaderMap, ValueKind};
use crate::parser::{
    parse_cookies, parse_pairs, percent_decode, HttpVersion, ParseEvent, RequestHead,
    RequestParser, MAX_HEADER_BLOCK_BYTES,
};
use crate::pool::{Block, MemoryPool, PoolMark};
use crate::response::{reason_phrase, ContentRead, HttpDate, Response};
use crate::transport::{HandshakeStatus, IoStatus, Transport};

const READ_BUFFER_INITIAL: usize = 2 * 1024;
const WRITE_BUFFER_SIZE: usize = 8 * 1024;
// room for "FFFFFF\r\n" ahead of a chunk's data
const CHUNK_PREFIX: usize = 10;

/// Why a request (or an idle connection) was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// The response was transmitted in full.
    Completed,
    /// Parse failure, handler abort, or a transport error mid-request.
    WithError,
    TimeoutReached,
    DaemonShutdown,
}

/// Verdict returned by an access handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Keep going; the handler will be called again as upload data arrives.
    Continue,
    /// Something is badly wrong; drop the connection.
    Abort,
}

/// User-supplied request handler.
///
/// Called at least twice per request: once when the headers are complete
/// (empty upload data), once per chunk of uploaded body, and once more when
/// the upload is over ([`Session::upload_complete`] returns true). Calls
/// stop as soon as the handler queues a response.
pub type AccessHandler = Arc<dyn Fn(&mut Session) -> HandlerOutcome + Send + Sync>;

/// Decides whether a new peer may connect at all.
pub type AcceptPolicy = Arc<dyn Fn(&SocketAddr) -> bool + Send + Sync>;

/// Observer for request termination events.
pub type TerminationNotifier = Arc<dyn Fn(&mut Session, TerminationReason) + Send + Sync>;

/// Handler-owned state carried across handler invocations of one request.
pub type ClientContext = Option<Box<dyn Any + Send>>;

/// The session alias under which handlers see a connection.
pub type Session = Connection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    /// Secure transports must finish their handshake before any HTTP byte.
    Handshake,
    Init,
    RecvUrl,
    RecvHeaders,
    Dispatch,
    RecvBody,
    SendHeaders,
    SendBody,
    SendFooters,
    Done,
    Closed,
}

pub struct Connection {
    transport: Box<dyn Transport>,
    peer: SocketAddr,
    pool: MemoryPool,
    base_mark: PoolMark,

    rbuf: Block,
    read_off: usize,
    read_size: usize,

    wbuf: Option<Block>,
    wpos: usize,
    wend: usize,

    parser: RequestParser,
    method: String,
    url: String,
    version: HttpVersion,
    values: HeaderMap,
    handler: Option<AccessHandler>,

    response: Option<Arc<Response>>,
    status: u16,
    response_pos: u64,
    header_only: bool,
    chunked_out: bool,

    client_context: ClientContext,
    upload: (usize, usize),
    upload_done: bool,
    form_buf: Vec<u8>,
    collect_form: bool,

    state: ConnState,
    hs_want: HandshakeStatus,
    last_activity: Instant,
    keepalive: bool,
    must_close: bool,
    continue_pending: bool,
    failed: bool,
    notified: bool,
}

impl Connection {
    /// Allocate a connection and its pool. Returns `None` if the pool is too
    /// small to hold even the initial read buffer.
    pub(crate) fn new(
        transport: Box<dyn Transport>,
        peer: SocketAddr,
        pool_size: usize,
        secure: bool,
    ) -> Option<Connection> {
        let mut pool = MemoryPool::with_capacity(pool_size);
        let base_mark = pool.mark();
        let rbuf = pool.allocate(READ_BUFFER_INITIAL)?;
        Some(Connection {
            transport,
            peer,
            pool,
            base_mark,
            rbuf,
            read_off: 0,
            read_size: 0,
            wbuf: None,
            wpos: 0,
            wend: 0,
            parser: RequestParser::new(),
            method: String::new(),
            url: String::new(),
            version: HttpVersion::Http11,
            values: HeaderMap::new(),
            handler: None,
            response: None,
            status: 0,
            response_pos: 0,
            header_only: false,
            chunked_out: false,
            client_context: None,
            upload: (0, 0),
            upload_done: false,
            form_buf: Vec::new(),
            collect_form: false,
            state: if secure {
                ConnState::Handshake
            } else {
                ConnState::Init
            },
            hs_want: HandshakeStatus::WantRead,
            last_activity: Instant::now(),
            keepalive: true,
            must_close: false,
            continue_pending: false,
            failed: false,
            notified: false,
        })
    }

    // ---- public session surface -------------------------------------------

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Percent-decoded request path, query string stripped.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn http_version(&self) -> HttpVersion {
        self.version
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// First request value matching the kind mask and key. Header lookups
    /// are case-insensitive in the key.
    pub fn lookup_value(&self, kind_mask: u32, key: &str) -> Option<&str> {
        self.values.lookup_first(kind_mask, key)
    }

    /// Iterate request values matching the kind mask; returns the number
    /// visited.
    pub fn get_values<F>(&self, kind_mask: u32, f: F) -> usize
    where
        F: FnMut(ValueKind, &str, &str) -> bool,
    {
        self.values.iterate(kind_mask, f)
    }

    /// The current chunk of uploaded body data. Empty on the headers-ready
    /// call and on the final call.
    pub fn upload_data(&self) -> &[u8] {
        let (start, len) = self.upload;
        &self.pool.bytes(&self.rbuf)[start..start + len]
    }

    /// True on the final handler call, once the whole body has been
    /// delivered.
    pub fn upload_complete(&self) -> bool {
        self.upload_done
    }

    /// Handler-owned state for the current request.
    pub fn client_context(&mut self) -> &mut ClientContext {
        &mut self.client_context
    }

    /// Queue `response` for transmission with the given status code.
    ///
    /// Fails if a response is already queued or the send phase has begun.
    /// Further handler calls for this request are suppressed.
    pub fn queue_response(
        &mut self,
        status: u16,
        response: Arc<Response>,
    ) -> Result<(), QueueError> {
        if self.response.is_some() {
            return Err(QueueError::AlreadyQueued);
        }
        match self.state {
            ConnState::Dispatch | ConnState::RecvBody | ConnState::RecvHeaders => {}
            _ => return Err(QueueError::TooLate),
        }
        self.status = status;
        self.response = Some(response);
        Ok(())
    }

    // ---- event loop interface ---------------------------------------------

    pub(crate) fn raw_fd(&self) -> std::os::unix::io::RawFd {
        self.transport.raw_fd()
    }

    pub(crate) fn closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    pub(crate) fn wants_read(&self) -> bool {
        match self.state {
            ConnState::Handshake => self.hs_want != HandshakeStatus::WantWrite,
            ConnState::Init
            | ConnState::RecvUrl
            | ConnState::RecvHeaders
            | ConnState::RecvBody => true,
            _ => false,
        }
    }

    pub(crate) fn wants_write(&self) -> bool {
        if self.out_pending() {
            return true;
        }
        match self.state {
            ConnState::Handshake => self.hs_want == HandshakeStatus::WantWrite,
            ConnState::SendHeaders | ConnState::SendBody | ConnState::SendFooters => true,
            _ => false,
        }
    }

    /// Close an idle connection whose timeout has expired.
    pub(crate) fn check_timeout(&mut self, shared: &Shared, now: Instant) {
        if self.state == ConnState::Closed || shared.timeout == Duration::from_secs(0) {
            return;
        }
        if now.duration_since(self.last_activity) >= shared.timeout {
            if shared.debug {
                debug!(peer = %self.peer, "connection timed out");
            }
            self.notify(shared, TerminationReason::TimeoutReached);
            self.close_silent();
        }
    }

    /// Tear the connection down on daemon shutdown.
    pub(crate) fn terminate(&mut self, shared: &Shared, reason: TerminationReason) {
        if self.state == ConnState::Closed {
            return;
        }
        self.notify(shared, reason);
        self.close_silent();
    }

    /// Make as much forward progress as the transport allows, in both
    /// directions, without ever blocking.
    pub(crate) fn advance_io(&mut self, shared: &Shared) {
        if self.state == ConnState::Closed {
            return;
        }
        if self.state == ConnState::Handshake {
            match self.transport.handshake() {
                HandshakeStatus::Complete => {
                    self.state = ConnState::Init;
                    self.last_activity = Instant::now();
                }
                status @ HandshakeStatus::WantRead | status @ HandshakeStatus::WantWrite => {
                    self.hs_want = status;
                    return;
                }
                HandshakeStatus::Failed => {
                    if shared.debug {
                        debug!(peer = %self.peer, "handshake failed");
                    }
                    self.close_silent();
                    return;
                }
            }
        }

        let mut can_read = true;
        loop {
            let snapshot = (
                self.state,
                self.read_off,
                self.read_size,
                self.wpos,
                self.wend,
            );
            if self.reading() {
                self.process_buffered(shared);
            }
            if can_read && self.reading() && !self.fill_read_buffer(shared) {
                can_read = false;
            }
            if self.out_pending()
                || matches!(
                    self.state,
                    ConnState::SendHeaders | ConnState::SendBody | ConnState::SendFooters
                )
            {
                self.drive_write(shared);
            }
            if self.state == ConnState::Closed {
                return;
            }
            let now = (
                self.state,
                self.read_off,
                self.read_size,
                self.wpos,
                self.wend,
            );
            if now == snapshot {
                return;
            }
        }
    }

    // ---- reading ----------------------------------------------------------

    fn reading(&self) -> bool {
        matches!(
            self.state,
            ConnState::Init | ConnState::RecvUrl | ConnState::RecvHeaders | ConnState::RecvBody
        )
    }

    fn read_limit(&self) -> usize {
        (self.pool.capacity() / 2).min(MAX_HEADER_BLOCK_BYTES + 1024)
    }

    /// Pull bytes off the transport. Returns false once reading cannot
    /// continue (would block, buffer exhausted, peer gone).
    fn fill_read_buffer(&mut self, shared: &Shared) -> bool {
        if self.read_size == self.rbuf.len() {
            if self.read_off > 0 {
                self.pool.compact(&self.rbuf, self.read_off, self.read_size);
                self.read_size -= self.read_off;
                self.read_off = 0;
            } else if self.rbuf.len() < self.read_limit() {
                let want = (self.rbuf.len() * 2).min(self.read_limit());
                match self.pool.reallocate(&self.rbuf, want) {
                    Some(grown) => self.rbuf = grown,
                    None => {
                        self.fail_request(shared, self.parser.overflow_error());
                        return false;
                    }
                }
            } else {
                self.fail_request(shared, self.parser.overflow_error());
                return false;
            }
        }
        let rbuf = self.rbuf.clone();
        let read_size = self.read_size;
        match self
            .transport
            .recv(&mut self.pool.bytes_mut(&rbuf)[read_size..])
        {
            IoStatus::Ready(n) => {
                self.read_size += n;
                self.last_activity = Instant::now();
                true
            }
            IoStatus::WouldBlock => false,
            IoStatus::Closed => {
                let mid_request =
                    self.state != ConnState::Init || self.read_off != self.read_size;
                if mid_request {
                    self.notify(shared, TerminationReason::WithError);
                }
                self.close_silent();
                false
            }
            IoStatus::Error => {
                self.close_silent();
                false
            }
        }
    }

    /// Run the parser over whatever is buffered, dispatching to the handler
    /// as requests and upload chunks come off.
    fn process_buffered(&mut self, shared: &Shared) {
        loop {
            if !self.reading() {
                return;
            }
            // interim output (100 Continue) must drain before parsing goes on,
            // or the next staging would clobber it
            if self.out_pending() {
                return;
            }
            if self.state == ConnState::Init && self.read_off < self.read_size {
                self.state = ConnState::RecvUrl;
            }
            let base = self.read_off;
            let step = self
                .parser
                .advance(&self.pool.bytes(&self.rbuf)[self.read_off..self.read_size]);
            match step {
                Err(e) => {
                    self.fail_request(shared, e);
                    return;
                }
                Ok((consumed, event)) => {
                    self.read_off += consumed;
                    match event {
                        ParseEvent::NeedMore => return,
                        ParseEvent::RequestLineDone => {
                            self.state = ConnState::RecvHeaders;
                        }
                        ParseEvent::HeadersReady(head) => {
                            self.begin_request(shared, *head);
                        }
                        ParseEvent::BodyChunk { offset, len } => {
                            self.deliver_chunk(shared, base + offset, len);
                        }
                        ParseEvent::Trailer { key, value } => {
                            if !self.append_value(ValueKind::Header, &key, &value) {
                                self.refuse(shared, 413, EXPLAIN_413);
                                return;
                            }
                        }
                        ParseEvent::BodyDone => {
                            self.finish_body(shared);
                        }
                    }
                }
            }
        }
    }

    /// Headers are in: populate the session values, pick a handler, and make
    /// the first handler call.
    fn begin_request(&mut self, shared: &Shared, head: RequestHead) {
        self.state = ConnState::Dispatch;
        self.version = head.version;
        self.keepalive = keepalive_requested(head.version, head.header("Connection"));

        // raw request-target: path before '?', query after
        let (path, query) = match head.url.find('?') {
            Some(q) => (head.url[..q].to_string(), Some(head.url[q + 1..].to_string())),
            None => (head.url.clone(), None),
        };
        self.url = String::from_utf8_lossy(&percent_decode(&path, false)).into_owned();
        self.method = head.method.clone();
        if !self.pool.charge(self.method.len() + self.url.len()) {
            self.refuse(shared, 413, EXPLAIN_413);
            return;
        }

        let has_body = head.framing.has_body();
        self.continue_pending = head.version == HttpVersion::Http11
            && has_body
            && head
                .header("Expect")
                .map_or(false, |v| v.eq_ignore_ascii_case("100-continue"));
        self.collect_form = has_body
            && head.header("Content-Type").map_or(false, |v| {
                v.trim()
                    .to_ascii_lowercase()
                    .starts_with("application/x-www-form-urlencoded")
            });

        for (key, value) in &head.headers {
            if !self.append_value(ValueKind::Header, key, value) {
                self.refuse(shared, 413, EXPLAIN_413);
                return;
            }
        }
        if let Some(cookie_header) = head.header("Cookie") {
            for (key, value) in parse_cookies(cookie_header) {
                if !self.append_value(ValueKind::Cookie, &key, &value) {
                    self.refuse(shared, 413, EXPLAIN_413);
                    return;
                }
            }
        }
        if let Some(query) = query {
            for (key, value) in parse_pairs(&query, false) {
                if !self.append_value(ValueKind::GetArgument, &key, &value) {
                    self.refuse(shared, 413, EXPLAIN_413);
                    return;
                }
            }
        }

        if shared.debug {
            debug!(peer = %self.peer, method = %self.method, url = %self.url, "request");
        }
        self.handler = Some(shared.resolve_handler(&self.url));

        if !self.invoke_handler(shared) {
            return;
        }
        if self.response.is_some() {
            // responding without having consumed the body: the framing is
            // lost, so this connection cannot be reused
            if !self.parser.body_complete() && has_body {
                self.must_close = true;
            }
            self.begin_send(shared);
            return;
        }
        self.state = ConnState::RecvBody;
        if self.continue_pending {
            self.continue_pending = false;
            let interim = format!("{} 100 Continue\r\n\r\n", HttpVersion::Http11.as_str());
            if !self.stage_output(interim.as_bytes()) {
                self.notify(shared, TerminationReason::WithError);
                self.close_silent();
            }
        }
    }

    fn deliver_chunk(&mut self, shared: &Shared, start: usize, len: usize) {
        if self.collect_form {
            if self.pool.charge(len) {
                let chunk = &self.pool.bytes(&self.rbuf)[start..start + len];
                self.form_buf.extend_from_slice(chunk);
            } else {
                // over budget: give up on form decoding, keep streaming
                self.collect_form = false;
                self.form_buf.clear();
            }
        }
        if self.response.is_some() {
            return; // handler already answered; body bytes are discarded
        }
        self.upload = (start, len);
        let delivered = self.invoke_handler(shared);
        self.upload = (0, 0);
        if !delivered {
            return;
        }
        if self.response.is_some() && !self.parser.body_complete() {
            self.must_close = true;
            self.begin_send(shared);
        }
    }

    /// End of the upload: decode buffered form data, give the handler its
    /// final call, and move to the send phase.
    fn finish_body(&mut self, shared: &Shared) {
        if self.collect_form && !self.form_buf.is_empty() {
            let body = std::mem::take(&mut self.form_buf);
            let text = String::from_utf8_lossy(&body);
            for (key, value) in parse_pairs(&text, false) {
                if !self.append_value(ValueKind::PostData, &key, &value) {
                    self.refuse(shared, 413, EXPLAIN_413);
                    return;
                }
            }
        }
        self.upload_done = true;
        if self.response.is_none() {
            if !self.invoke_handler(shared) {
                return;
            }
        }
        match self.response {
            Some(_) => self.begin_send(shared),
            None => {
                // the handler never produced anything to send
                self.failed = true;
                self.refuse(shared, 500, EXPLAIN_500);
            }
        }
    }

    /// Call the access handler once. Returns false if the connection died.
    fn invoke_handler(&mut self, shared: &Shared) -> bool {
        let handler = match &self.handler {
            Some(handler) => handler.clone(),
            None => return true,
        };
        match handler(self) {
            HandlerOutcome::Continue => true,
            HandlerOutcome::Abort => {
                if shared.debug {
                    debug!(peer = %self.peer, "handler aborted the request");
                }
                self.notify(shared, TerminationReason::WithError);
                self.close_silent();
                false
            }
        }
    }

    fn append_value(&mut self, kind: ValueKind, key: &str, value: &str) -> bool {
        if !self.pool.charge(HeaderMap::entry_cost(key, value)) {
            return false;
        }
        // pairs with control bytes (decoded %00 and friends) are dropped
        self.values.append(kind, key, value).ok();
        true
    }

    // ---- writing ----------------------------------------------------------

    fn out_pending(&self) -> bool {
        self.wbuf.is_some() && self.wpos < self.wend
    }

    /// Copy `data` into the write buffer, growing it if needed.
    fn stage_output(&mut self, data: &[u8]) -> bool {
        let block = match self.wbuf.clone() {
            Some(existing) if existing.len() >= data.len() => existing,
            Some(small) => match self.pool.reallocate(&small, data.len()) {
                Some(grown) => grown,
                None => return false,
            },
            None => {
                let want = data.len().max(WRITE_BUFFER_SIZE.min(self.pool.available() / 2));
                match self
                    .pool
                    .allocate(want)
                    .or_else(|| self.pool.allocate(data.len()))
                {
                    Some(fresh) => fresh,
                    None => return false,
                }
            }
        };
        self.pool.bytes_mut(&block)[..data.len()].copy_from_slice(data);
        self.wbuf = Some(block);
        self.wpos = 0;
        self.wend = data.len();
        true
    }

    fn ensure_write_buffer(&mut self) -> Option<Block> {
        if let Some(block) = self.wbuf.clone() {
            if block.len() >= CHUNK_PREFIX + 2 + 16 {
                return Some(block);
            }
        }
        let want = WRITE_BUFFER_SIZE
            .min(self.pool.available())
            .max(CHUNK_PREFIX + 2 + 16);
        let block = self.pool.allocate(want)?;
        self.wbuf = Some(block.clone());
        Some(block)
    }

    /// Serialize the status line and headers, then enter the send phase.
    fn begin_send(&mut self, shared: &Shared) {
        let response = match self.response.clone() {
            Some(response) => response,
            None => return,
        };
        if let Some(value) = response.lookup_header("Connection") {
            if value
                .split(',')
                .any(|t| t.trim().eq_ignore_ascii_case("close"))
            {
                self.must_close = true;
            }
        }
        if !self.keepalive {
            self.must_close = true;
        }

        // 1xx, 204 and 304 carry no body and no framing header at all;
        // HEAD keeps the framing header but skips the body
        let bodyless_status = self.status < 200 || matches!(self.status, 204 | 304);
        self.header_only = self.method == "HEAD" || bodyless_status;

        self.chunked_out = false;
        let mut framing = String::new();
        if !bodyless_status {
            match response.size() {
                Some(n) => {
                    if response.lookup_header("Content-Length").is_none() {
                        framing = format!("Content-Length: {}\r\n", n);
                    }
                }
                None => {
                    if self.version == HttpVersion::Http11 {
                        self.chunked_out = true;
                        if response.lookup_header("Transfer-Encoding").is_none() {
                            framing = "Transfer-Encoding: chunked\r\n".to_string();
                        }
                    } else {
                        // no framing available to a 1.0 peer: end of body is
                        // end of connection
                        self.must_close = true;
                    }
                }
            }
        }

        let mut head = format!(
            "HTTP/1.1 {} {}\r\n",
            self.status,
            reason_phrase(self.status)
        );
        response.headers(|_, key, value| {
            head.push_str(key);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
            true
        });
        if response.lookup_header("Date").is_none() {
            head.push_str(&format!("Date: {}\r\n", HttpDate(Utc::now())));
        }
        head.push_str(&framing);
        if response.lookup_header("Connection").is_none() {
            if self.must_close {
                head.push_str("Connection: close\r\n");
            } else {
                if self.version == HttpVersion::Http10 {
                    head.push_str("Connection: keep-alive\r\n");
                }
                if shared.timeout.as_secs() > 0 {
                    head.push_str(&format!("Keep-Alive: timeout={}\r\n", shared.timeout.as_secs()));
                }
            }
        }
        head.push_str("\r\n");

        self.response_pos = 0;
        if !self.stage_output(head.as_bytes()) {
            self.notify(shared, TerminationReason::WithError);
            self.close_silent();
            return;
        }
        self.state = ConnState::SendHeaders;
    }

    /// Drain staged output and keep the send phase fed until the transport
    /// pushes back.
    fn drive_write(&mut self, shared: &Shared) {
        loop {
            if self.state == ConnState::Closed {
                return;
            }
            if self.out_pending() {
                let wbuf = self.wbuf.clone().expect("output pending without buffer");
                match self
                    .transport
                    .send(&self.pool.bytes(&wbuf)[self.wpos..self.wend])
                {
                    IoStatus::Ready(n) => {
                        self.wpos += n;
                        self.last_activity = Instant::now();
                        if self.wpos < self.wend {
                            continue;
                        }
                    }
                    IoStatus::WouldBlock => return,
                    IoStatus::Closed | IoStatus::Error => {
                        self.notify(shared, TerminationReason::WithError);
                        self.close_silent();
                        return;
                    }
                }
            }
            match self.state {
                ConnState::SendHeaders => {
                    if self.header_only {
                        self.complete_request(shared);
                        return;
                    }
                    self.state = ConnState::SendBody;
                }
                ConnState::SendBody => {
                    if !self.fill_body(shared) {
                        return;
                    }
                }
                ConnState::SendFooters => {
                    self.complete_request(shared);
                    return;
                }
                _ => return, // interim output (100 Continue) drained
            }
        }
    }

    /// Produce the next stretch of body bytes. Returns false when the send
    /// loop should stop (blocked, finished, or dead).
    fn fill_body(&mut self, shared: &Shared) -> bool {
        let response = match self.response.clone() {
            Some(response) => response,
            None => return false,
        };

        // plain buffers go straight from the response to the socket
        if let Some(bytes) = response.bytes() {
            let total = bytes.len() as u64;
            if self.response_pos >= total {
                self.complete_request(shared);
                return false;
            }
            return match self.transport.send(&bytes[self.response_pos as usize..]) {
                IoStatus::Ready(n) => {
                    self.response_pos += n as u64;
                    self.last_activity = Instant::now();
                    if self.response_pos == total {
                        self.complete_request(shared);
                        return false;
                    }
                    true
                }
                IoStatus::WouldBlock => false,
                IoStatus::Closed | IoStatus::Error => {
                    self.notify(shared, TerminationReason::WithError);
                    self.close_silent();
                    false
                }
            };
        }

        if let Some(total) = response.size() {
            if self.response_pos >= total {
                self.complete_request(shared);
                return false;
            }
        }
        let wbuf = match self.ensure_write_buffer() {
            Some(wbuf) => wbuf,
            None => {
                self.notify(shared, TerminationReason::WithError);
                self.close_silent();
                return false;
            }
        };

        let (data_off, data_cap) = if self.chunked_out {
            (CHUNK_PREFIX, wbuf.len() - CHUNK_PREFIX - 2)
        } else {
            let cap = match response.size() {
                Some(total) => (total - self.response_pos).min(wbuf.len() as u64) as usize,
                None => wbuf.len(),
            };
            (0, cap)
        };
        let outcome = response.read_at(
            self.response_pos,
            &mut self.pool.bytes_mut(&wbuf)[data_off..data_off + data_cap],
        );
        match outcome {
            ContentRead::Data(n) if n > 0 && n <= data_cap => {
                self.response_pos += n as u64;
                if self.chunked_out {
                    let hex = format!("{:X}\r\n", n);
                    let start = CHUNK_PREFIX - hex.len();
                    self.pool.bytes_mut(&wbuf)[start..CHUNK_PREFIX]
                        .copy_from_slice(hex.as_bytes());
                    self.pool.bytes_mut(&wbuf)[CHUNK_PREFIX + n..CHUNK_PREFIX + n + 2]
                        .copy_from_slice(b"\r\n");
                    self.wpos = start;
                    self.wend = CHUNK_PREFIX + n + 2;
                } else {
                    self.wpos = 0;
                    self.wend = n;
                }
                true
            }
            ContentRead::Data(_) | ContentRead::Again => {
                if shared.mode == RunMode::ThreadPerConnection {
                    // the dedicated worker may simply try again
                    return false;
                }
                warn!(
                    peer = %self.peer,
                    "content reader produced no data in a non-blocking mode"
                );
                self.notify(shared, TerminationReason::WithError);
                self.close_silent();
                false
            }
            ContentRead::End => {
                if self.chunked_out {
                    // graceful end of a stream of unknown length
                    self.must_close = true;
                    if !self.stage_output(b"0\r\n\r\n") {
                        self.close_silent();
                        return false;
                    }
                    self.state = ConnState::SendFooters;
                    true
                } else if response.size().is_none() {
                    // close-delimited body for a 1.0 peer
                    self.complete_request(shared);
                    false
                } else {
                    // the reader gave up before the declared length
                    self.notify(shared, TerminationReason::WithError);
                    self.close_silent();
                    false
                }
            }
        }
    }

    // ---- request lifecycle ------------------------------------------------

    /// The response went out in full: either recycle for the next pipelined
    /// request or close.
    fn complete_request(&mut self, shared: &Shared) {
        self.state = ConnState::Done;
        let reason = if self.failed {
            TerminationReason::WithError
        } else {
            TerminationReason::Completed
        };
        self.notify(shared, reason);
        if self.must_close || !self.keepalive {
            self.close_silent();
            return;
        }
        if !self.recycle() {
            self.close_silent();
        }
    }

    /// Reset for the next request on a keep-alive connection, preserving
    /// any pipelined bytes byte-exactly.
    fn recycle(&mut self) -> bool {
        let leftover = self.pool.bytes(&self.rbuf)[self.read_off..self.read_size].to_vec();
        self.pool.reset_to(self.base_mark);
        let rbuf = match self.pool.allocate(leftover.len().max(READ_BUFFER_INITIAL)) {
            Some(rbuf) => rbuf,
            None => return false,
        };
        self.pool.bytes_mut(&rbuf)[..leftover.len()].copy_from_slice(&leftover);
        self.rbuf = rbuf;
        self.read_off = 0;
        self.read_size = leftover.len();

        self.wbuf = None;
        self.wpos = 0;
        self.wend = 0;
        self.parser = RequestParser::new();
        self.method.clear();
        self.url.clear();
        self.version = HttpVersion::Http11;
        self.values = HeaderMap::new();
        self.handler = None;
        self.response = None;
        self.status = 0;
        self.response_pos = 0;
        self.header_only = false;
        self.chunked_out = false;
        self.client_context = None;
        self.upload = (0, 0);
        self.upload_done = false;
        self.form_buf = Vec::new();
        self.collect_form = false;
        self.keepalive = true;
        self.must_close = false;
        self.continue_pending = false;
        self.failed = false;
        self.notified = false;
        self.state = ConnState::Init;
        true
    }

    /// Parse failure: answer with the matching status if we still can.
    fn fail_request(&mut self, shared: &Shared, error: ParseError) {
        if shared.debug {
            debug!(peer = %self.peer, error = %error, "bad request");
        }
        let status = error.status();
        self.refuse(shared, status, explanation(status));
    }

    /// Best-effort error reply; falls back to dropping the connection when
    /// the response phase has already begun.
    fn refuse(&mut self, shared: &Shared, status: u16, detail: &str) {
        self.failed = true;
        self.must_close = true;
        match self.state {
            ConnState::SendHeaders
            | ConnState::SendBody
            | ConnState::SendFooters
            | ConnState::Done
            | ConnState::Closed => {
                self.notify(shared, TerminationReason::WithError);
                self.close_silent();
            }
            _ => {
                let mut response = Response::from_buffer(error_page(status, detail).into_bytes());
                response
                    .add_header("Content-Type", "text/html; charset=UTF-8")
                    .ok();
                self.status = status;
                self.response = Some(Arc::new(response));
                self.begin_send(shared);
            }
        }
    }

    fn notify(&mut self, shared: &Shared, reason: TerminationReason) {
        if self.notified {
            return;
        }
        self.notified = true;
        if let Some(notifier) = shared.notifier.clone() {
            notifier(self, reason);
        }
    }

    fn close_silent(&mut self) {
        if self.state == ConnState::Closed {
            return;
        }
        self.transport.close();
        // release the queued response and handler right away
        self.response = None;
        self.handler = None;
        self.state = ConnState::Closed;
    }
}

/// Keep-alive by protocol default, overridden by an explicit `Connection`
/// header either way.
fn keepalive_requested(version: HttpVersion, connection_header: Option<&str>) -> bool {
    let mut keepalive = version == HttpVersion::Http11;
    if let Some(value) = connection_header {
        for token in value.split(',') {
            let token = token.trim();
            if token.eq_ignore_ascii_case("close") {
                keepalive = false;
            } else if token.eq_ignore_ascii_case("keep-alive") {
                keepalive = true;
            }
        }
    }
    keepalive
}

fn error_page(status: u16, detail: &str) -> String {
    let reason = reason_phrase(status);
    format!(
        "<html><head><title>{} {}</title></head><body>\n\
        <h1>{}</h1>\n\
        {}\n\
        <hr>\n\
        </body></html>\n",
        status, reason, reason, detail
    )
}

const EXPLAIN_413: &str = "Your request exceeded the server's limits.";
const EXPLAIN_500: &str = "The server could not produce a response.";

fn explanation(status: u16) -> &'static str {
    match status {
        400 => "You sent a request that the server couldn't understand.",
        411 => "Your request did not state the length of its body.",
        413 => EXPLAIN_413,
        414 => "The URL you requested was too long.",
        500 => EXPLAIN_500,
        501 => "The transfer encoding you used is not implemented.",
        _ => "Your request could not be processed.",
    }
}
