use thiserror::Error;

/// A request that could not be parsed into a well-formed HTTP/1.1 message.
///
/// Each variant maps to the status code sent in the best-effort error reply,
/// provided the response phase has not begun yet.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum ParseError {
    #[error("malformed request line")]
    BadRequestLine,
    #[error("method contains non-token characters")]
    BadMethod,
    #[error("request URL too long")]
    UrlTooLong,
    #[error("unsupported HTTP version")]
    BadVersion,
    #[error("malformed header line")]
    BadHeader,
    #[error("header block too large")]
    HeaderBlockTooLarge,
    #[error("invalid Content-Length")]
    BadContentLength,
    #[error("conflicting Content-Length values")]
    ConflictingContentLength,
    #[error("unsupported transfer encoding")]
    BadTransferEncoding,
    #[error("invalid chunk framing")]
    BadChunk,
}

impl ParseError {
    /// Status code for the error reply.
    pub(crate) fn status(self) -> u16 {
        match self {
            ParseError::UrlTooLong => 414,
            ParseError::BadTransferEncoding => 501,
            ParseError::BadContentLength => 411,
            _ => 400,
        }
    }
}

/// Rejected header key or value (embedded CR, LF or NUL, or an empty key).
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
#[error("malformed header key or value")]
pub struct HeaderError;

/// Failure to queue a response on a session.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum QueueError {
    #[error("a response is already queued on this session")]
    AlreadyQueued,
    #[error("the response phase has already begun")]
    TooLate,
}

/// Errors surfaced by the daemon entry points.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("the daemon was not started with the mode required for this call")]
    WrongMode,
    #[error("at least one of IPV4 and IPV6 must be given")]
    NoAddressFamily,
    #[error("THREAD_PER_CONNECTION and SELECT_INTERNALLY are mutually exclusive")]
    ConflictingModes,
    #[error("the TLS flag requires a record layer factory")]
    MissingRecordLayer,
    #[error("a handler is already registered for this prefix")]
    DuplicateHandler,
    #[error("no handler is registered for this prefix")]
    UnknownHandler,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
