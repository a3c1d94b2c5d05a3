use std::fmt;
use std::io;

/// Errors surfaced across the public API.
///
/// Transport timeouts are not represented here — they are retried
/// internally by the owning service and never reach the caller.
#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    /// A malformed or out-of-protocol payload was rejected outright
    /// (as opposed to silently dropped, which is the default for
    /// telemetry frames — see the crate's error handling notes).
    Protocol(String),
    ChecksumMismatch,
    Disconnected,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Error::ChecksumMismatch => write!(f, "navdata checksum mismatch"),
            Error::Disconnected => write!(f, "service is disconnected"),
        }
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

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
