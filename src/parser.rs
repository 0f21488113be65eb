//! Incremental HTTP/1.1 request parsing.
//!
//! The parser consumes whatever bytes the connection has buffered and hands
//! back at most one event per call; it never blocks and never looks at the
//! transport. Body bytes are reported as ranges into the caller's input so
//! that uploads stream through without copying.

use once_cell::sync::Lazy;

use crate::error::ParseError;

/// Longest accepted request-target.
pub const MAX_URL_BYTES: usize = 8 * 1024;
/// Cap on the combined size of all header lines of one request.
pub const MAX_HEADER_BLOCK_BYTES: usize = 32 * 1024;

// A chunk-size line has no business being anywhere near this long.
const MAX_CHUNK_LINE_BYTES: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
}

impl HttpVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpVersion::Http10 => "HTTP/1.0",
            HttpVersion::Http11 => "HTTP/1.1",
        }
    }
}

/// How the request body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    /// No body-framing header present; the body is empty.
    None,
    Fixed(u64),
    Chunked,
}

impl BodyFraming {
    pub(crate) fn has_body(self) -> bool {
        match self {
            BodyFraming::None | BodyFraming::Fixed(0) => false,
            _ => true,
        }
    }
}

/// Everything known about a request once the blank line has been seen.
#[derive(Debug)]
pub(crate) struct RequestHead {
    pub method: String,
    pub url: String,
    pub version: HttpVersion,
    pub headers: Vec<(String, String)>,
    pub framing: BodyFraming,
}

impl RequestHead {
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

/// One step of parser progress. `BodyChunk` offsets index into the input
/// slice passed to the `advance` call that produced the event.
#[derive(Debug)]
pub(crate) enum ParseEvent {
    NeedMore,
    RequestLineDone,
    HeadersReady(Box<RequestHead>),
    BodyChunk { offset: usize, len: usize },
    Trailer { key: String, value: String },
    BodyDone,
}

#[derive(Debug, Clone, Copy)]
enum State {
    RequestLine,
    Headers,
    FixedBody { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkDataEnd,
    Trailers,
    Complete,
}

#[derive(Debug)]
pub(crate) struct RequestParser {
    state: State,
    method: String,
    url: String,
    version: HttpVersion,
    headers: Vec<(String, String)>,
    // last header line, kept open for obsolete line folding
    pending: Option<(String, String)>,
    header_bytes: usize,
}

impl RequestParser {
    pub fn new() -> RequestParser {
        RequestParser {
            state: State::RequestLine,
            method: String::new(),
            url: String::new(),
            version: HttpVersion::Http11,
            headers: Vec::new(),
            pending: None,
            header_bytes: 0,
        }
    }

    /// Consume bytes from `input` and report one event.
    ///
    /// Returns the number of bytes consumed; the caller advances its read
    /// offset by that amount before the next call. `NeedMore` may still
    /// consume bytes (header lines are swallowed silently).
    pub fn advance(&mut self, input: &[u8]) -> Result<(usize, ParseEvent), ParseError> {
        let mut used = 0;
        loop {
            let rest = &input[used..];
            match self.state {
                State::RequestLine => match find_line(rest) {
                    None => {
                        if rest.len() > MAX_URL_BYTES + 256 {
                            return Err(ParseError::UrlTooLong);
                        }
                        return Ok((used, ParseEvent::NeedMore));
                    }
                    Some((line, n)) => {
                        used += n;
                        if line.is_empty() {
                            // tolerate stray CRLFs between pipelined requests
                            continue;
                        }
                        self.parse_request_line(line)?;
                        self.state = State::Headers;
                        return Ok((used, ParseEvent::RequestLineDone));
                    }
                },
                State::Headers => match find_line(rest) {
                    None => {
                        if rest.len() > MAX_HEADER_BLOCK_BYTES {
                            return Err(ParseError::HeaderBlockTooLarge);
                        }
                        return Ok((used, ParseEvent::NeedMore));
                    }
                    Some((line, n)) => {
                        used += n;
                        if line.is_empty() {
                            if let Some(pending) = self.pending.take() {
                                self.headers.push(pending);
                            }
                            let framing = decide_framing(&self.headers)?;
                            let head = RequestHead {
                                method: std::mem::take(&mut self.method),
                                url: std::mem::take(&mut self.url),
                                version: self.version,
                                headers: std::mem::take(&mut self.headers),
                                framing,
                            };
                            self.state = match framing {
                                BodyFraming::Chunked => State::ChunkSize,
                                BodyFraming::Fixed(remaining) => State::FixedBody { remaining },
                                BodyFraming::None => State::FixedBody { remaining: 0 },
                            };
                            return Ok((used, ParseEvent::HeadersReady(Box::new(head))));
                        }
                        self.header_bytes += n;
                        if self.header_bytes > MAX_HEADER_BLOCK_BYTES {
                            return Err(ParseError::HeaderBlockTooLarge);
                        }
                        self.take_header_line(line)?;
                    }
                },
                State::FixedBody { remaining } => {
                    if remaining == 0 {
                        self.state = State::Complete;
                        return Ok((used, ParseEvent::BodyDone));
                    }
                    let n = (rest.len() as u64).min(remaining) as usize;
                    if n == 0 {
                        return Ok((used, ParseEvent::NeedMore));
                    }
                    self.state = State::FixedBody {
                        remaining: remaining - n as u64,
                    };
                    return Ok((used + n, ParseEvent::BodyChunk { offset: used, len: n }));
                }
                State::ChunkSize => match find_line(rest) {
                    None => {
                        if rest.len() > MAX_CHUNK_LINE_BYTES {
                            return Err(ParseError::BadChunk);
                        }
                        return Ok((used, ParseEvent::NeedMore));
                    }
                    Some((line, n)) => {
                        used += n;
                        let size = parse_chunk_size(line)?;
                        self.state = if size == 0 {
                            State::Trailers
                        } else {
                            State::ChunkData { remaining: size }
                        };
                    }
                },
                State::ChunkData { remaining } => {
                    let n = (rest.len() as u64).min(remaining) as usize;
                    if n == 0 {
                        return Ok((used, ParseEvent::NeedMore));
                    }
                    self.state = if remaining == n as u64 {
                        State::ChunkDataEnd
                    } else {
                        State::ChunkData {
                            remaining: remaining - n as u64,
                        }
                    };
                    return Ok((used + n, ParseEvent::BodyChunk { offset: used, len: n }));
                }
                State::ChunkDataEnd => {
                    // the CRLF that closes a chunk's data
                    match rest.first() {
                        None => return Ok((used, ParseEvent::NeedMore)),
                        Some(b'\n') => {
                            used += 1;
                            self.state = State::ChunkSize;
                        }
                        Some(b'\r') => {
                            if rest.len() < 2 {
                                return Ok((used, ParseEvent::NeedMore));
                            }
                            if rest[1] != b'\n' {
                                return Err(ParseError::BadChunk);
                            }
                            used += 2;
                            self.state = State::ChunkSize;
                        }
                        Some(_) => return Err(ParseError::BadChunk),
                    }
                }
                State::Trailers => match find_line(rest) {
                    None => {
                        if rest.len() > MAX_HEADER_BLOCK_BYTES {
                            return Err(ParseError::HeaderBlockTooLarge);
                        }
                        return Ok((used, ParseEvent::NeedMore));
                    }
                    Some((line, n)) => {
                        used += n;
                        if line.is_empty() {
                            self.state = State::Complete;
                            return Ok((used, ParseEvent::BodyDone));
                        }
                        self.header_bytes += n;
                        if self.header_bytes > MAX_HEADER_BLOCK_BYTES {
                            return Err(ParseError::HeaderBlockTooLarge);
                        }
                        let (key, value) = split_header_line(line)?;
                        return Ok((used, ParseEvent::Trailer { key, value }));
                    }
                },
                State::Complete => return Ok((used, ParseEvent::NeedMore)),
            }
        }
    }

    /// The error to report when the read buffer fills up without the parser
    /// making progress.
    pub fn overflow_error(&self) -> ParseError {
        match self.state {
            State::RequestLine => ParseError::UrlTooLong,
            State::ChunkSize | State::ChunkData { .. } | State::ChunkDataEnd => {
                ParseError::BadChunk
            }
            _ => ParseError::HeaderBlockTooLarge,
        }
    }

    pub fn body_complete(&self) -> bool {
        matches!(self.state, State::Complete)
    }

    fn parse_request_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let line = std::str::from_utf8(line).map_err(|_| ParseError::BadRequestLine)?;
        let mut parts = line.splitn(3, ' ');
        let method = parts.next().unwrap_or("");
        let url = parts.next().unwrap_or("");
        let version = parts.next().unwrap_or("");
        if method.is_empty() || url.is_empty() || version.is_empty() {
            return Err(ParseError::BadRequestLine);
        }
        if !method.bytes().all(is_token_byte) {
            return Err(ParseError::BadMethod);
        }
        if url.len() > MAX_URL_BYTES {
            return Err(ParseError::UrlTooLong);
        }
        self.version = if version.eq_ignore_ascii_case("HTTP/1.1") {
            HttpVersion::Http11
        } else if version.eq_ignore_ascii_case("HTTP/1.0") {
            HttpVersion::Http10
        } else {
            return Err(ParseError::BadVersion);
        };
        self.method = method.to_uppercase();
        self.url = url.to_string();
        Ok(())
    }

    fn take_header_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        if line[0] == b' ' || line[0] == b'\t' {
            // obsolete line folding: the line continues the previous value
            let folded = std::str::from_utf8(line).map_err(|_| ParseError::BadHeader)?;
            let pending = self.pending.as_mut().ok_or(ParseError::BadHeader)?;
            pending.1.push(' ');
            pending.1.push_str(folded.trim_matches(|c| c == ' ' || c == '\t'));
            return Ok(());
        }
        if let Some(pending) = self.pending.take() {
            self.headers.push(pending);
        }
        self.pending = Some(split_header_line(line)?);
        Ok(())
    }
}

/// Locate one line. Returns the line without its terminator plus the number
/// of bytes to consume; accepts both CRLF and bare LF.
fn find_line(input: &[u8]) -> Option<(&[u8], usize)> {
    let lf = input.iter().position(|&b| b == b'\n')?;
    let line = if lf > 0 && input[lf - 1] == b'\r' {
        &input[..lf - 1]
    } else {
        &input[..lf]
    };
    Some((line, lf + 1))
}

fn split_header_line(line: &[u8]) -> Result<(String, String), ParseError> {
    let line = std::str::from_utf8(line).map_err(|_| ParseError::BadHeader)?;
    let colon = line.find(':').ok_or(ParseError::BadHeader)?;
    let key = &line[..colon];
    if key.is_empty() || !key.bytes().all(is_token_byte) {
        return Err(ParseError::BadHeader);
    }
    let value = line[colon + 1..].trim_matches(|c| c == ' ' || c == '\t');
    Ok((key.to_string(), value.to_string()))
}

fn decide_framing(headers: &[(String, String)]) -> Result<BodyFraming, ParseError> {
    let mut te_tokens: Vec<&str> = Vec::new();
    for (k, v) in headers {
        if k.eq_ignore_ascii_case("Transfer-Encoding") {
            te_tokens.extend(v.split(',').map(str::trim).filter(|t| !t.is_empty()));
        }
    }
    if let Some(last) = te_tokens.last() {
        return if last.eq_ignore_ascii_case("chunked") {
            Ok(BodyFraming::Chunked)
        } else {
            Err(ParseError::BadTransferEncoding)
        };
    }

    let mut length: Option<u64> = None;
    let mut seen = false;
    for (k, v) in headers {
        if !k.eq_ignore_ascii_case("Content-Length") {
            continue;
        }
        // a value may itself be a comma-joined list of repeated lengths
        for part in v.split(',') {
            let part = part.trim();
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ParseError::BadContentLength);
            }
            let parsed: u64 = part.parse().map_err(|_| ParseError::BadContentLength)?;
            match length {
                Some(prev) if prev != parsed => {
                    return Err(ParseError::ConflictingContentLength)
                }
                _ => length = Some(parsed),
            }
            seen = true;
        }
    }
    if seen {
        Ok(BodyFraming::Fixed(length.unwrap_or(0)))
    } else {
        Ok(BodyFraming::None)
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, ParseError> {
    let digits = match line.iter().position(|&b| b == b';') {
        Some(semi) => &line[..semi],
        None => line,
    };
    let digits = trim_bytes(digits);
    if digits.is_empty() {
        return Err(ParseError::BadChunk);
    }
    let mut size: u64 = 0;
    for &b in digits {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => return Err(ParseError::BadChunk),
        };
        size = size
            .checked_mul(16)
            .and_then(|s| s.checked_add(u64::from(digit)))
            .ok_or(ParseError::BadChunk)?;
    }
    Ok(size)
}

fn trim_bytes(mut bytes: &[u8]) -> &[u8] {
    while let Some((&b, rest)) = bytes.split_first() {
        if b != b' ' && b != b'\t' {
            break;
        }
        bytes = rest;
    }
    while let Some((&b, rest)) = bytes.split_last() {
        if b != b' ' && b != b'\t' {
            break;
        }
        bytes = rest;
    }
    bytes
}

static TOKEN_BYTES: Lazy<[bool; 256]> = Lazy::new(|| {
    let mut table = [false; 256];
    for b in 0u8..=255 {
        table[b as usize] = b.is_ascii_alphanumeric()
            || matches!(
                b,
                b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^'
                    | b'_' | b'`' | b'|' | b'~'
            );
    }
    table
});

fn is_token_byte(b: u8) -> bool {
    TOKEN_BYTES[b as usize]
}

/// Decode %XX escapes; anything malformed passes through untouched.
pub(crate) fn percent_decode(input: &str, plus_as_space: bool) -> Vec<u8> {
    let bytes = input.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if c == b'%'
            && bytes.get(i + 1).map_or(false, u8::is_ascii_hexdigit)
            && bytes.get(i + 2).map_or(false, u8::is_ascii_hexdigit)
        {
            decoded.push(hex_to_digit(bytes[i + 1]) * 16 + hex_to_digit(bytes[i + 2]));
            i += 3;
        } else if plus_as_space && c == b'+' {
            decoded.push(b' ');
            i += 1;
        } else {
            decoded.push(c);
            i += 1;
        }
    }
    decoded
}

/// Convert hex digit to integer.
fn hex_to_digit(hex: u8) -> u8 {
    if (b'A'..=b'F').contains(&hex) {
        hex - b'A' + 10
    } else if (b'a'..=b'f').contains(&hex) {
        hex - b'a' + 10
    } else {
        hex - b'0'
    }
}

/// Encode string to be an RFC3986-compliant URL part.
pub struct UrlEncoded<'a>(pub &'a str);

impl<'a> std::fmt::Display for UrlEncoded<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for c in self.0.chars() {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~') {
                write!(f, "{}", c)?;
            } else {
                let mut buf = [0; 4];
                c.encode_utf8(&mut buf);
                for byte in buf.iter().take(c.len_utf8()) {
                    write!(f, "%{:02X}", byte)?;
                }
            }
        }
        Ok(())
    }
}

/// Split `key=value&…` into decoded pairs. Used for both URL query strings
/// and urlencoded form bodies.
pub(crate) fn parse_pairs(input: &str, plus_as_space: bool) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for piece in input.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = match piece.find('=') {
            Some(eq) => (&piece[..eq], &piece[eq + 1..]),
            None => (piece, ""),
        };
        pairs.push((
            String::from_utf8_lossy(&percent_decode(key, plus_as_space)).into_owned(),
            String::from_utf8_lossy(&percent_decode(value, plus_as_space)).into_owned(),
        ));
    }
    pairs
}

/// Split a `Cookie:` header value into its pairs.
pub(crate) fn parse_cookies(value: &str) -> Vec<(String, String)> {
    let mut cookies = Vec::new();
    for piece in value.split(';') {
        let piece = piece.trim();
        if let Some(eq) = piece.find('=') {
            let key = piece[..eq].trim();
            if !key.is_empty() {
                cookies.push((key.to_string(), piece[eq + 1..].trim().to_string()));
            }
        }
    }
    cookies
}

#[cfg(test)]
mod test {
    use super::*;

    use test_case::test_case;

    fn feed_all(parser: &mut RequestParser, input: &[u8]) -> Vec<String> {
        let mut events = Vec::new();
        let mut off = 0;
        loop {
            let (n, ev) = parser.advance(&input[off..]).expect("parse failed");
            off += n;
            match ev {
                ParseEvent::NeedMore => break,
                ParseEvent::BodyChunk { offset, len } => {
                    let data = &input[off - n + offset..off - n + offset + len];
                    events.push(format!("chunk:{}", String::from_utf8_lossy(data)));
                }
                ParseEvent::RequestLineDone => events.push("line".to_string()),
                ParseEvent::HeadersReady(head) => {
                    events.push(format!("head:{} {}", head.method, head.url))
                }
                ParseEvent::Trailer { key, value } => {
                    events.push(format!("trailer:{}={}", key, value))
                }
                ParseEvent::BodyDone => {
                    events.push("done".to_string());
                    break;
                }
            }
        }
        events
    }

    #[test]
    fn parses_a_simple_get() {
        let mut parser = RequestParser::new();
        let events = feed_all(
            &mut parser,
            b"GET /hello?a=1 HTTP/1.1\r\nHost: example\r\n\r\n",
        );
        assert_eq!(events, vec!["line", "head:GET /hello?a=1", "done"]);
    }

    #[test]
    fn survives_single_byte_arrival() {
        // bytes trickle in one at a time, accumulating in a buffer the way
        // the connection's read buffer does
        let input = b"POST /up HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        let mut parser = RequestParser::new();
        let mut buffer = Vec::new();
        let mut consumed = 0;
        let mut body = Vec::new();
        let mut done = false;
        let mut head_seen = false;
        for &byte in input.iter() {
            buffer.push(byte);
            loop {
                let base = consumed;
                let (n, ev) = parser.advance(&buffer[consumed..]).unwrap();
                consumed += n;
                match ev {
                    ParseEvent::NeedMore => break,
                    ParseEvent::HeadersReady(head) => {
                        assert_eq!(head.framing, BodyFraming::Fixed(5));
                        head_seen = true;
                    }
                    ParseEvent::BodyChunk { offset, len } => {
                        body.extend_from_slice(&buffer[base + offset..base + offset + len]);
                    }
                    ParseEvent::BodyDone => {
                        done = true;
                        break;
                    }
                    _ => {}
                }
            }
            if done {
                break;
            }
        }
        // the zero-remainder step fires on the call after the last byte
        if !done {
            if let (_, ParseEvent::BodyDone) = parser.advance(&buffer[consumed..]).unwrap() {
                done = true;
            }
        }
        assert!(head_seen);
        assert!(done);
        assert_eq!(body, b"hello");
    }

    #[test]
    fn folded_headers_are_joined_with_one_space() {
        let mut parser = RequestParser::new();
        let input = b"GET / HTTP/1.1\r\nX-Long: first\r\n  second\t\r\nHost: h\r\n\r\n";
        let mut head = None;
        let mut off = 0;
        loop {
            let (n, ev) = parser.advance(&input[off..]).unwrap();
            off += n;
            match ev {
                ParseEvent::HeadersReady(h) => {
                    head = Some(h);
                    break;
                }
                ParseEvent::NeedMore => panic!("incomplete"),
                _ => {}
            }
        }
        let head = head.unwrap();
        assert_eq!(head.header("x-long"), Some("first second"));
        assert_eq!(head.header("host"), Some("h"));
    }

    #[test]
    fn chunked_bodies_decode_with_extensions_and_trailers() {
        let mut parser = RequestParser::new();
        let events = feed_all(
            &mut parser,
            b"POST /up HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
              5;ext=1\r\nHello\r\n6\r\n World\r\n0\r\nX-Sum: 11\r\n\r\n",
        );
        assert_eq!(
            events,
            vec![
                "line",
                "head:POST /up",
                "chunk:Hello",
                "chunk: World",
                "trailer:X-Sum=11",
                "done"
            ]
        );
    }

    #[test]
    fn pipelined_bytes_are_left_unconsumed() {
        let mut parser = RequestParser::new();
        let input = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n\r\nGET /next HTTP/1.1\r\n";
        let mut off = 0;
        loop {
            let (n, ev) = parser.advance(&input[off..]).unwrap();
            off += n;
            if let ParseEvent::BodyDone = ev {
                break;
            }
        }
        assert_eq!(&input[off..], b"GET /next HTTP/1.1\r\n".as_ref());
    }

    #[test]
    fn duplicate_content_lengths_must_agree() {
        let mut parser = RequestParser::new();
        let input = b"POST / HTTP/1.1\r\nContent-Length: 4\r\nContent-Length: 4\r\n\r\n";
        let mut off = 0;
        loop {
            let (n, ev) = parser.advance(&input[off..]).unwrap();
            off += n;
            if let ParseEvent::HeadersReady(head) = ev {
                assert_eq!(head.framing, BodyFraming::Fixed(4));
                break;
            }
        }

        let mut bad = RequestParser::new();
        let input = b"POST / HTTP/1.1\r\nContent-Length: 4\r\nContent-Length: 5\r\n\r\n";
        let mut off = 0;
        let err = loop {
            match bad.advance(&input[off..]) {
                Ok((n, _)) => off += n,
                Err(e) => break e,
            }
        };
        assert_eq!(err, ParseError::ConflictingContentLength);
    }

    #[test]
    fn chunked_wins_over_content_length() {
        let mut parser = RequestParser::new();
        let input =
            b"POST / HTTP/1.1\r\nContent-Length: 999\r\nTransfer-Encoding: chunked\r\n\r\n";
        let mut off = 0;
        loop {
            let (n, ev) = parser.advance(&input[off..]).unwrap();
            off += n;
            if let ParseEvent::HeadersReady(head) = ev {
                assert_eq!(head.framing, BodyFraming::Chunked);
                break;
            }
        }
    }

    #[test]
    fn non_chunked_transfer_encoding_is_rejected() {
        let mut parser = RequestParser::new();
        let input = b"POST / HTTP/1.1\r\nTransfer-Encoding: gzip\r\n\r\n";
        let mut off = 0;
        let err = loop {
            match parser.advance(&input[off..]) {
                Ok((n, _)) => off += n,
                Err(e) => break e,
            }
        };
        assert_eq!(err, ParseError::BadTransferEncoding);
    }

    #[test_case("GET  HTTP/1.1", ParseError::BadRequestLine ; "missing url")]
    #[test_case("GE\x01T / HTTP/1.1", ParseError::BadMethod ; "bad method byte")]
    #[test_case("GET / HTTP/2.0", ParseError::BadVersion ; "unsupported version")]
    #[test_case("GET / SPDY/3", ParseError::BadVersion ; "unknown protocol")]
    fn request_line_rejections(line: &str, expected: ParseError) {
        let mut parser = RequestParser::new();
        let input = format!("{}\r\n", line);
        assert_eq!(parser.advance(input.as_bytes()).unwrap_err(), expected);
    }

    #[test]
    fn oversized_urls_are_rejected() {
        let mut parser = RequestParser::new();
        let input = format!("GET /{} HTTP/1.1\r\n", "a".repeat(MAX_URL_BYTES));
        assert_eq!(
            parser.advance(input.as_bytes()).unwrap_err(),
            ParseError::UrlTooLong
        );
    }

    #[test]
    fn header_block_cap_is_exact() {
        // lines of exactly 32 bytes each, so the cap divides evenly
        let line = "X-Filler-Header-00000: aaaaaaaa\n";
        assert_eq!(line.len(), 32);
        let fill = line.repeat(MAX_HEADER_BLOCK_BYTES / 32);

        let mut parser = RequestParser::new();
        let input = format!("GET / HTTP/1.1\r\n{}\r\n", fill);
        let mut off = 0;
        let input = input.as_bytes();
        let mut ready = false;
        loop {
            match parser.advance(&input[off..]) {
                Ok((n, ParseEvent::HeadersReady(_))) => {
                    off += n;
                    ready = true;
                    break;
                }
                Ok((n, _)) => off += n,
                Err(e) => panic!("cap-sized block rejected: {}", e),
            }
        }
        assert!(ready);

        // one more byte anywhere in the block pushes it over
        let mut parser = RequestParser::new();
        let input = format!("GET / HTTP/1.1\r\n{}X: y\r\n\r\n", fill);
        let input = input.as_bytes();
        let mut off = 0;
        let err = loop {
            match parser.advance(&input[off..]) {
                Ok((n, _)) => off += n,
                Err(e) => break e,
            }
        };
        assert_eq!(err, ParseError::HeaderBlockTooLarge);
    }

    #[test_case("escape%28this%29name%09", b"escape(this)name\t" ; "escapes")]
    #[test_case("edge%", b"edge%" ; "trailing percent")]
    #[test_case("edge%2", b"edge%2" ; "truncated escape")]
    #[test_case("edge%20", b"edge " ; "space")]
    #[test_case("invalid%C3%28", b"invalid\xc3\x28" ; "invalid utf8 passthrough")]
    fn percent_decode_works(input: &str, expected: &[u8]) {
        assert_eq!(percent_decode(input, false), expected);
    }

    #[test]
    fn plus_decodes_to_space_only_when_asked() {
        assert_eq!(percent_decode("a+b", true), b"a b");
        assert_eq!(percent_decode("a+b", false), b"a+b");
    }

    #[test]
    fn percent_round_trip_normalizes_reserved_chars() {
        let original = "name%20with%2Fslash%7E";
        let decoded = percent_decode(original, false);
        let reencoded = UrlEncoded(std::str::from_utf8(&decoded).unwrap()).to_string();
        assert_eq!(reencoded, "name%20with%2Fslash~");
        // a second round trip is stable
        let decoded2 = percent_decode(&reencoded, false);
        assert_eq!(decoded, decoded2);
    }

    #[test]
    fn query_pairs_decode() {
        let pairs = parse_pairs("a=1&b=two%20words&flag&=skip", false);
        assert_eq!(
            pairs,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "two words".to_string()),
                ("flag".to_string(), "".to_string()),
                ("".to_string(), "skip".to_string()),
            ]
        );
    }

    #[test]
    fn cookie_pairs_split_on_semicolons() {
        let cookies = parse_cookies("id=42; theme=dark ;broken; k=v=w");
        assert_eq!(
            cookies,
            vec![
                ("id".to_string(), "42".to_string()),
                ("theme".to_string(), "dark".to_string()),
                ("k".to_string(), "v=w".to_string()),
            ]
        );
    }

    #[test]
    fn chunk_size_overflow_is_rejected() {
        assert_eq!(
            parse_chunk_size(b"ffffffffffffffffff"),
            Err(ParseError::BadChunk)
        );
        assert_eq!(parse_chunk_size(b"1a"), Ok(26));
        assert_eq!(parse_chunk_size(b"0"), Ok(0));
        assert_eq!(parse_chunk_size(b""), Err(ParseError::BadChunk));
    }
}
