//! Error types for the WebSocket client

use std::fmt;
use std::io;

use thiserror::Error;

use crate::handshake::HandshakeResponse;
use crate::parser::{ParseError, ParseErrorKind};

/// Result type alias for WebSocket operations
pub type Result<T> = std::result::Result<T, Error>;

/// WebSocket error types
///
/// Protocol violations (`Protocol`, `MessageTooLarge`, `InvalidUtf8`,
/// `UnacceptableType`) are fatal to the connection and map to a close code
/// through [`Error::close_code`]. `InvalidState`, `InvalidText`, `InvalidUri`
/// and `InvalidOptions` report caller mistakes and leave the connection alone.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error from the underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The upgrade response was rejected
    #[error("Handshake failed: {0}")]
    Handshake(Box<HandshakeError>),

    /// The handshake did not complete within its deadline
    #[error("Handshake timed out")]
    Timeout,

    /// RFC 6455 violation by the peer
    #[error("Protocol error: {0}")]
    Protocol(&'static str),

    /// Frame or message exceeded the configured limit
    #[error("Message too large")]
    MessageTooLarge,

    /// Text message carried invalid UTF-8
    #[error("Invalid UTF-8 in text message")]
    InvalidUtf8,

    /// Data opcode not accepted by this connection
    #[error("Unacceptable message type")]
    UnacceptableType,

    /// The connection is closed, or closed while the operation was in flight
    #[error("Connection closed: {0}")]
    Closed(CloseReason),

    /// Operation not allowed in the current state
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    /// Attempted to send non-UTF-8 bytes as a text message
    #[error("Text payload is not valid UTF-8")]
    InvalidText,

    /// The connect URI cannot be used
    #[error("Invalid URI: {0}")]
    InvalidUri(&'static str),

    /// Rejected option combination
    #[error("Invalid options: {0}")]
    InvalidOptions(&'static str),
}

impl Error {
    /// Close code a connection-fatal error maps to, if any
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Error::Protocol(_) => Some(CloseReason::PROTOCOL_ERROR),
            Error::MessageTooLarge => Some(CloseReason::TOO_BIG),
            Error::InvalidUtf8 => Some(CloseReason::INVALID_PAYLOAD),
            Error::UnacceptableType => Some(CloseReason::UNSUPPORTED),
            Error::Io(_) => Some(CloseReason::ABNORMAL),
            Error::Closed(reason) => Some(reason.code),
            _ => None,
        }
    }

    /// Whether this error is a rejected handshake
    pub fn is_handshake(&self) -> bool {
        matches!(self, Error::Handshake(_))
    }

    pub(crate) fn handshake(reason: &'static str, response: Option<HandshakeResponse>) -> Self {
        Error::Handshake(Box::new(HandshakeError { reason, response }))
    }
}

impl From<ParseError> for Error {
    fn from(e: ParseError) -> Self {
        match e.kind {
            ParseErrorKind::Protocol => Error::Protocol(e.reason),
            ParseErrorKind::MessageTooLarge => Error::MessageTooLarge,
            ParseErrorKind::InvalidUtf8 => Error::InvalidUtf8,
            ParseErrorKind::UnacceptableType => Error::UnacceptableType,
        }
    }
}

/// A rejected upgrade, with the response that caused it when one was parsed
#[derive(Debug)]
pub struct HandshakeError {
    /// What was wrong
    pub reason: &'static str,
    /// The offending response
    pub response: Option<HandshakeResponse>,
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.response {
            Some(res) => write!(f, "{} (status {})", self.reason, res.status),
            None => f.write_str(self.reason),
        }
    }
}

/// Close frame reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Close status code
    pub code: u16,
    /// Optional reason string
    pub reason: String,
}

impl CloseReason {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Going away (e.g., server shutdown)
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Unsupported data
    pub const UNSUPPORTED: u16 = 1003;
    /// No status received
    pub const NO_STATUS: u16 = 1005;
    /// Abnormal closure
    pub const ABNORMAL: u16 = 1006;
    /// Invalid frame payload
    pub const INVALID_PAYLOAD: u16 = 1007;
    /// Policy violation
    pub const POLICY: u16 = 1008;
    /// Message too big
    pub const TOO_BIG: u16 = 1009;
    /// Mandatory extension
    pub const EXTENSION: u16 = 1010;
    /// Internal server error
    pub const INTERNAL: u16 = 1011;

    /// Create a new close reason
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Check if the close code may be sent on the wire per RFC 6455
    pub fn is_valid_code(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} ({})", self.code, self.reason)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_codes_for_protocol_errors() {
        assert_eq!(Error::Protocol("x").close_code(), Some(1002));
        assert_eq!(Error::MessageTooLarge.close_code(), Some(1009));
        assert_eq!(Error::InvalidUtf8.close_code(), Some(1007));
        assert_eq!(Error::UnacceptableType.close_code(), Some(1003));
        assert_eq!(Error::InvalidText.close_code(), None);
    }

    #[test]
    fn test_parse_error_conversion() {
        let err: Error = ParseError::new(ParseErrorKind::MessageTooLarge, "too big").into();
        assert!(matches!(err, Error::MessageTooLarge));

        let err: Error = ParseError::new(ParseErrorKind::Protocol, "bad opcode").into();
        assert!(matches!(err, Error::Protocol("bad opcode")));
    }

    #[test]
    fn test_valid_close_codes() {
        assert!(CloseReason::is_valid_code(1000));
        assert!(CloseReason::is_valid_code(4000));
        assert!(!CloseReason::is_valid_code(1005));
        assert!(!CloseReason::is_valid_code(1006));
        assert!(!CloseReason::is_valid_code(999));
    }

    #[test]
    fn test_display() {
        let e = Error::Closed(CloseReason::new(1000, "bye"));
        assert_eq!(e.to_string(), "Connection closed: 1000 (bye)");
    }
}
