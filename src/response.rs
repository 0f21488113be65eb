//! Reusable response objects.
//!
//! A `Response` carries a body source and a set of headers; it is queued on
//! a session behind an `Arc`, so one response may be in flight on any number
//! of connections at once. Bodies are treated as immutable from the moment
//! a response is first queued.

use std::borrow::Cow;
use std::fmt;

use chrono::{DateTime, Utc};

use crate::error::HeaderError;
use crate::headers::{HeaderMap, ValueKind};

/// Result of one content-reader invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentRead {
    /// `n` bytes were written into the buffer, `0 < n <= buf.len()`.
    Data(usize),
    /// Nothing right now; ask again later. Only legal in
    /// thread-per-connection mode, where the engine may block.
    Again,
    /// The stream is over. For unknown-size bodies the chunked terminator is
    /// emitted and the connection is closed afterwards; ending a known-size
    /// body early closes the connection mid-stream.
    End,
}

type Reader = Box<dyn Fn(u64, &mut [u8]) -> ContentRead + Send + Sync>;

enum Body {
    Bytes(Cow<'static, [u8]>),
    Reader(Reader),
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Body::Reader(_) => write!(f, "Reader"),
        }
    }
}

/// A status-less response body plus headers.
///
/// The status code is supplied when the response is queued, so the same
/// object can back a 200 on one connection and a 404 on another.
#[derive(Debug)]
pub struct Response {
    size: Option<u64>,
    body: Body,
    headers: HeaderMap,
}

impl Response {
    /// Respond from a buffer the response takes ownership of.
    pub fn from_buffer(data: Vec<u8>) -> Response {
        Response {
            size: Some(data.len() as u64),
            body: Body::Bytes(Cow::Owned(data)),
            headers: HeaderMap::new(),
        }
    }

    /// Respond from a static buffer without copying.
    pub fn from_static(data: &'static [u8]) -> Response {
        Response {
            size: Some(data.len() as u64),
            body: Body::Bytes(Cow::Borrowed(data)),
            headers: HeaderMap::new(),
        }
    }

    /// Respond from a caller-owned buffer, copied immediately; the caller
    /// may reuse or free its buffer as soon as this returns.
    pub fn from_copy(data: &[u8]) -> Response {
        Response::from_buffer(data.to_vec())
    }

    /// Respond from a content-reader callback.
    ///
    /// `size` of `None` means the length is unknown and the body will be
    /// sent with chunked transfer encoding. The reader is handed the
    /// position to read from, which for any one queuing equals the sum of
    /// the byte counts it has returned so far. Resources captured by the
    /// closure are released when the last queued copy is dropped.
    pub fn from_callback<F>(size: Option<u64>, reader: F) -> Response
    where
        F: Fn(u64, &mut [u8]) -> ContentRead + Send + Sync + 'static,
    {
        Response {
            size,
            body: Body::Reader(Box::new(reader)),
            headers: HeaderMap::new(),
        }
    }

    /// Declared body size; `None` for unknown (chunked).
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn add_header(&mut self, key: &str, value: &str) -> Result<(), HeaderError> {
        self.headers.append(ValueKind::ResponseHeader, key, value)
    }

    /// Remove every header with this key; fails if none matched.
    pub fn del_header(&mut self, key: &str) -> Result<(), HeaderError> {
        if self.headers.remove(ValueKind::ResponseHeader, key) == 0 {
            return Err(HeaderError);
        }
        Ok(())
    }

    pub fn lookup_header(&self, key: &str) -> Option<&str> {
        self.headers.lookup_first(0, key)
    }

    /// Visit the response headers in insertion order.
    pub fn headers<F>(&self, f: F) -> usize
    where
        F: FnMut(ValueKind, &str, &str) -> bool,
    {
        self.headers.iterate(0, f)
    }

    /// Body bytes when the body is a plain buffer.
    pub(crate) fn bytes(&self) -> Option<&[u8]> {
        match &self.body {
            Body::Bytes(b) => Some(b),
            Body::Reader(_) => None,
        }
    }

    /// Pull body bytes from a callback body.
    pub(crate) fn read_at(&self, pos: u64, buf: &mut [u8]) -> ContentRead {
        match &self.body {
            Body::Bytes(b) => {
                let b: &[u8] = b;
                if pos >= b.len() as u64 {
                    return ContentRead::End;
                }
                let n = buf.len().min(b.len() - pos as usize);
                buf[..n].copy_from_slice(&b[pos as usize..pos as usize + n]);
                ContentRead::Data(n)
            }
            Body::Reader(reader) => reader(pos, buf),
        }
    }
}

/// Reason phrase for a status code.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        200 => "OK",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Request Entity Too Large",
        414 => "Request-URI Too Long",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// RFC1123 formatted date.
pub(crate) struct HttpDate(pub DateTime<Utc>);

impl fmt::Display for HttpDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%a, %d %b %Y %H:%M:%S GMT"))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use chrono::TimeZone;

    #[test]
    fn copied_buffers_are_isolated() {
        let mut data = b"original".to_vec();
        let response = Response::from_copy(&data);
        data.copy_from_slice(b"mutated!");
        assert_eq!(response.bytes().unwrap(), b"original");
    }

    #[test]
    fn buffer_reads_honor_position() {
        let response = Response::from_buffer(b"hello world".to_vec());
        let mut buf = [0u8; 4];
        assert_eq!(response.read_at(6, &mut buf), ContentRead::Data(4));
        assert_eq!(&buf, b"worl");
        assert_eq!(response.read_at(11, &mut buf), ContentRead::End);
    }

    #[test]
    fn callback_sizes_may_be_unknown() {
        let response = Response::from_callback(None, |_, _| ContentRead::End);
        assert_eq!(response.size(), None);
        let sized = Response::from_callback(Some(10), |_, _| ContentRead::End);
        assert_eq!(sized.size(), Some(10));
    }

    #[test]
    fn header_validation() {
        let mut response = Response::from_static(b"");
        assert!(response.add_header("Content-Type", "text/plain").is_ok());
        assert!(response.add_header("X-Bad", "a\r\nb").is_err());
        assert!(response.del_header("content-type").is_ok());
        assert!(response.del_header("content-type").is_err());
    }

    #[test]
    fn reason_phrases_cover_the_table() {
        for &code in &[
            100u16, 200, 204, 206, 301, 302, 304, 400, 401, 403, 404, 405, 408, 411, 413, 414,
            500, 501, 503,
        ] {
            assert_ne!(reason_phrase(code), "Unknown", "code {}", code);
        }
        assert_eq!(reason_phrase(200), "OK");
        assert_eq!(reason_phrase(418), "Unknown");
    }

    #[test]
    fn http_date_works() {
        assert_eq!(
            HttpDate(Utc.timestamp(1622040683, 0)).to_string(),
            "Wed, 26 May 2021 14:51:23 GMT"
        );
    }
}
