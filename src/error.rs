//! Error types for the lumisync crate.

use std::error::Error as StdError;
use std::fmt;
use std::io;

/// Crate-wide error type.
///
/// Every fallible operation in the crate reports one of these kinds so that
/// callers can surface the specific failure rather than a generic one.
#[derive(Debug)]
pub enum Error {
    /// Device unreachable, handshake failure, or all candidate addresses
    /// exhausted.
    Connection(String),

    /// A frame failed the codec's preconditions, or an encoded byte stream
    /// does not match the wire format the firmware expects.
    Format(String),

    /// Pattern count, resolution, or exposure beyond a configured ceiling.
    LimitExceeded(String),

    /// Requested exposure exceeds the hardware-safe maximum in a mode that
    /// enforces device timing.
    Timing(String),

    /// Unsupported wavelength, channel, or intensity value.
    Config(String),

    /// Operation invoked in an invalid session state.
    State(String),

    /// Transport-level read/write failure during an otherwise valid
    /// operation.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(msg) => write!(f, "connection failed: {}", msg),
            Error::Format(msg) => write!(f, "invalid frame format: {}", msg),
            Error::LimitExceeded(msg) => write!(f, "limit exceeded: {}", msg),
            Error::Timing(msg) => write!(f, "timing violation: {}", msg),
            Error::Config(msg) => write!(f, "invalid configuration: {}", msg),
            Error::State(msg) => write!(f, "invalid state: {}", msg),
            Error::Io(e) => write!(f, "i/o error: {}", e),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl Error {
    /// Create a connection error with a message.
    pub fn connection(msg: impl Into<String>) -> Self {
        Error::Connection(msg.into())
    }

    /// Create a format error with a message.
    pub fn format(msg: impl Into<String>) -> Self {
        Error::Format(msg.into())
    }

    /// Create a limit-exceeded error with a message.
    pub fn limit(msg: impl Into<String>) -> Self {
        Error::LimitExceeded(msg.into())
    }

    /// Create a timing error with a message.
    pub fn timing(msg: impl Into<String>) -> Self {
        Error::Timing(msg.into())
    }

    /// Create a config error with a message.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a state error with a message.
    pub fn state(msg: impl Into<String>) -> Self {
        Error::State(msg.into())
    }

    /// Create an I/O error from a message (for transports that do not carry
    /// a `std::io::Error` of their own).
    pub fn io(msg: impl Into<String>) -> Self {
        Error::Io(io::Error::new(io::ErrorKind::Other, msg.into()))
    }

    /// Returns true if this is a Connection error.
    pub fn is_connection(&self) -> bool {
        matches!(self, Error::Connection(_))
    }

    /// Returns true if this is a Format error.
    pub fn is_format(&self) -> bool {
        matches!(self, Error::Format(_))
    }

    /// Returns true if this is a LimitExceeded error.
    pub fn is_limit_exceeded(&self) -> bool {
        matches!(self, Error::LimitExceeded(_))
    }

    /// Returns true if this is a Timing error.
    pub fn is_timing(&self) -> bool {
        matches!(self, Error::Timing(_))
    }

    /// Returns true if this is a Config error.
    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config(_))
    }

    /// Returns true if this is a State error.
    pub fn is_state(&self) -> bool {
        matches!(self, Error::State(_))
    }

    /// Returns true if this is an Io error.
    pub fn is_io(&self) -> bool {
        matches!(self, Error::Io(_))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

/// Result type for lumisync operations.
pub type Result<T> = std::result::Result<T, Error>;
