//! Error types for payloadlink.

use std::fmt;
use std::io;
use thiserror::Error;

/// Result type for payloadlink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for payloadlink operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (file writes, sockets).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// A caller supplied an argument the operation cannot accept.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// OS-level failure reported by the payload core.
    #[error("System error: {0}")]
    System(String),

    /// The payload core could not allocate memory for the request.
    #[error("Memory allocation failed")]
    MemoryAlloc,

    /// Feature not present on this hardware/firmware combination.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Requested file, entry or resource does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource is held by someone else (e.g. downloader rights).
    #[error("Busy: {0}")]
    Busy(String),

    /// Error code the core reported without further classification.
    #[error("Unknown error (code {0:#x})")]
    Unknown(u64),

    /// Operation did not complete in time.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The remote end closed the channel.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Malformed frame or unexpected data on a link.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// An event arrived that the current state does not accept.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Malformed media file list.
    #[error("Invalid file list: {0}")]
    InvalidFileList(String),

    /// A bounded retry loop gave up.
    #[error("{what} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// What was being retried.
        what: String,
        /// Number of attempts made.
        attempts: u32,
        /// Error returned by the final attempt.
        last: Box<Error>,
    },

    /// Operation was cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether retrying the same operation may succeed.
    ///
    /// Parameter, lookup and cancellation errors never resolve on their own.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(e) => !matches!(
                e.kind(),
                io::ErrorKind::PermissionDenied | io::ErrorKind::InvalidInput
            ),
            #[cfg(feature = "native")]
            Self::Serial(_) => true,
            Self::System(_)
            | Self::MemoryAlloc
            | Self::Busy(_)
            | Self::Unknown(_)
            | Self::Timeout(_)
            | Self::ConnectionClosed
            | Self::Protocol(_) => true,
            Self::InvalidParameter(_)
            | Self::Unsupported(_)
            | Self::NotFound(_)
            | Self::InvalidState(_)
            | Self::InvalidFileList(_)
            | Self::RetriesExhausted { .. }
            | Self::Cancelled
            | Self::Config(_) => false,
        }
    }

    /// Map this error onto the C return-code surface.
    pub fn return_code(&self) -> ReturnCode {
        match self {
            Self::InvalidParameter(_) | Self::InvalidFileList(_) | Self::Config(_) => {
                ReturnCode::InvalidParameter
            },
            Self::Io(_) | Self::System(_) | Self::Timeout(_) | Self::ConnectionClosed => {
                ReturnCode::SystemError
            },
            #[cfg(feature = "native")]
            Self::Serial(_) => ReturnCode::SystemError,
            Self::MemoryAlloc => ReturnCode::MemoryAllocFailed,
            Self::Unsupported(_) => ReturnCode::UnsupportedCommand,
            Self::NotFound(_) => ReturnCode::NotFound,
            Self::Busy(_) | Self::InvalidState(_) => ReturnCode::Busy,
            Self::RetriesExhausted { last, .. } => last.return_code(),
            Self::Unknown(_) | Self::Protocol(_) | Self::Cancelled => ReturnCode::Unknown,
        }
    }
}

/// Return codes exposed by the payload core's C interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnCode {
    /// Call succeeded.
    Success,
    /// Invalid parameter.
    InvalidParameter,
    /// OS-level I/O failure.
    SystemError,
    /// Allocation failure inside the core.
    MemoryAllocFailed,
    /// Feature not present on this hardware/firmware combination.
    UnsupportedCommand,
    /// Target does not exist.
    NotFound,
    /// Resource busy.
    Busy,
    /// Anything else.
    Unknown,
}

impl ReturnCode {
    /// Numeric code as reported by the core.
    pub fn code(self) -> u64 {
        match self {
            Self::Success => 0x000,
            Self::InvalidParameter => 0x0E1,
            Self::SystemError => 0x0EC,
            Self::MemoryAllocFailed => 0x0E4,
            Self::UnsupportedCommand => 0x0E5,
            Self::NotFound => 0x0EE,
            Self::Busy => 0x0E7,
            Self::Unknown => 0x0FF,
        }
    }

    /// Decode a numeric code; unrecognised codes map to [`ReturnCode::Unknown`].
    pub fn from_code(code: u64) -> Self {
        match code {
            0x000 => Self::Success,
            0x0E1 => Self::InvalidParameter,
            0x0EC => Self::SystemError,
            0x0E4 => Self::MemoryAllocFailed,
            0x0E5 => Self::UnsupportedCommand,
            0x0EE => Self::NotFound,
            0x0E7 => Self::Busy,
            _ => Self::Unknown,
        }
    }

    /// Turn a code reported by the core into a `Result`.
    ///
    /// `context` describes the call and ends up in the error message.
    pub fn into_result(self, context: &str) -> Result<()> {
        match self {
            Self::Success => Ok(()),
            Self::InvalidParameter => Err(Error::InvalidParameter(context.to_string())),
            Self::SystemError => Err(Error::System(context.to_string())),
            Self::MemoryAllocFailed => Err(Error::MemoryAlloc),
            Self::UnsupportedCommand => Err(Error::Unsupported(context.to_string())),
            Self::NotFound => Err(Error::NotFound(context.to_string())),
            Self::Busy => Err(Error::Busy(context.to_string())),
            Self::Unknown => Err(Error::Unknown(self.code())),
        }
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?} ({:#05x})", self.code())
    }
}
