//! Error types
//!
//! The broker reports failures to peers as small signed status codes; inside
//! the crate those codes travel alongside I/O and framing errors in a single
//! `Error` enum.

use std::fmt;
use std::io;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Status codes carried on the wire (component 0 of every response)
///
/// `Success` is zero; everything else is an error. The set is closed: peers
/// receiving an unknown code treat it as `Internal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Success = 0,
    ParseError = 1,
    NoSuchEncoding = 2,
    NoSuchSource = 3,
    NoSuchStream = 4,
    NameInUse = 5,
    InvalidState = 6,
    InvalidArgument = 7,
    Unauthorized = 8,
    Timeout = 9,
    PeerDisconnected = 10,
    Internal = 11,
}

impl ErrorCode {
    /// Decode a wire status integer
    pub fn from_wire(value: i32) -> Self {
        match value {
            0 => ErrorCode::Success,
            1 => ErrorCode::ParseError,
            2 => ErrorCode::NoSuchEncoding,
            3 => ErrorCode::NoSuchSource,
            4 => ErrorCode::NoSuchStream,
            5 => ErrorCode::NameInUse,
            6 => ErrorCode::InvalidState,
            7 => ErrorCode::InvalidArgument,
            8 => ErrorCode::Unauthorized,
            9 => ErrorCode::Timeout,
            10 => ErrorCode::PeerDisconnected,
            _ => ErrorCode::Internal,
        }
    }

    /// The wire integer for this code
    pub fn to_wire(self) -> i32 {
        self as i32
    }

    pub fn is_success(self) -> bool {
        self == ErrorCode::Success
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::Success => "success",
            ErrorCode::ParseError => "parse error",
            ErrorCode::NoSuchEncoding => "no such encoding",
            ErrorCode::NoSuchSource => "no such source",
            ErrorCode::NoSuchStream => "no such stream",
            ErrorCode::NameInUse => "name in use",
            ErrorCode::InvalidState => "invalid state",
            ErrorCode::InvalidArgument => "invalid argument",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::Timeout => "timeout",
            ErrorCode::PeerDisconnected => "peer disconnected",
            ErrorCode::Internal => "internal error",
        };
        f.write_str(name)
    }
}

/// Crate-wide error type
#[derive(Debug)]
pub enum Error {
    /// Socket-level failure
    Io(io::Error),
    /// Malformed wire data; the connection is closed after this
    Wire(String),
    /// A peer (or a local verb handler) reported a non-success status
    Status(ErrorCode),
    /// A request/response wait expired
    Timeout,
    /// The connection closed while an operation was in flight
    Disconnected,
}

impl Error {
    /// The status code a verb handler should answer with for this error
    pub fn status(&self) -> ErrorCode {
        match self {
            Error::Io(_) | Error::Disconnected => ErrorCode::PeerDisconnected,
            Error::Wire(_) => ErrorCode::ParseError,
            Error::Status(code) => *code,
            Error::Timeout => ErrorCode::Timeout,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "i/o error: {}", e),
            Error::Wire(detail) => write!(f, "malformed message: {}", detail),
            Error::Status(code) => write!(f, "{}", code),
            Error::Timeout => f.write_str("request timed out"),
            Error::Disconnected => f.write_str("connection closed"),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<ErrorCode> for Error {
    fn from(code: ErrorCode) -> Self {
        Error::Status(code)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_roundtrip() {
        for value in 0..=11 {
            let code = ErrorCode::from_wire(value);
            assert_eq!(code.to_wire(), value);
        }
    }

    #[test]
    fn test_unknown_code_is_internal() {
        assert_eq!(ErrorCode::from_wire(99), ErrorCode::Internal);
        assert_eq!(ErrorCode::from_wire(-1), ErrorCode::Internal);
    }

    #[test]
    fn test_error_status_mapping() {
        let e: Error = ErrorCode::NameInUse.into();
        assert_eq!(e.status(), ErrorCode::NameInUse);
        assert_eq!(Error::Timeout.status(), ErrorCode::Timeout);
        assert_eq!(Error::Wire("bad".into()).status(), ErrorCode::ParseError);
    }
}
