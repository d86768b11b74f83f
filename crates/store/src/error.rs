//! Error types for the sediment storage engine.

use std::io;

use snafu::Snafu;

/// Logical address of a byte in the log.
pub type Address = u64;

/// Sentinel address denoting "no such record".
pub const NULL_ADDRESS: Address = u64::MAX;

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during storage operations.
#[derive(Debug, Snafu)]
pub enum Error {
    /// I/O error from the underlying storage medium.
    #[snafu(display("I/O error: {source}"))]
    Io {
        /// The underlying I/O error.
        source: io::Error,
    },

    /// The log contents failed an integrity check: a bad page hash, an
    /// invalid record type, a length out of bounds, or a misaligned file.
    #[snafu(display("Data corruption at address {address:#x}: {reason}"))]
    Corrupted {
        /// Description of what was corrupted.
        reason: String,
        /// Log address where the corruption was detected.
        address: Address,
    },

    /// Reference to an address whose segment has been deleted or never
    /// existed.
    #[snafu(display("Block {address:#018x} not found"))]
    BlockNotFound {
        /// Segment address of the missing block.
        address: Address,
    },

    /// The configured cipher key/IV does not match the log contents:
    /// no valid root could be located in a non-empty log.
    #[snafu(display("Cipher key or IV does not match the log contents"))]
    InvalidCipher,

    /// A single record is larger than a segment can hold.
    #[snafu(display("Loggable of {length} bytes exceeds the file length bound {bound}"))]
    TooBigLoggable {
        /// Encoded length of the offending record.
        length: usize,
        /// Configured segment size.
        bound: u64,
    },

    /// Configuration incompatible with the on-disk state or with another
    /// already-configured component.
    #[snafu(display("Invalid setting: {reason}"))]
    InvalidSetting {
        /// Description of the incompatibility.
        reason: String,
    },

    /// Write attempted on a read-only log.
    #[snafu(display("Log is read-only"))]
    ReadOnly,

    /// The log directory lock could not be acquired.
    #[snafu(display("Failed to lock the log directory: {details}"))]
    LockFailed {
        /// Information about the current lock holder, when available.
        details: String,
    },

    /// Catch-all for assertion violations and unreleasable resources.
    #[snafu(display("Storage engine failure: {reason}"))]
    Internal {
        /// Description of the violated invariant.
        reason: String,
    },
}

// Automatic conversion from io::Error for ergonomic ? usage.
impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        Error::Io { source }
    }
}

impl Error {
    /// Shorthand for a corruption error.
    pub(crate) fn corrupted(address: Address, reason: impl Into<String>) -> Self {
        Error::Corrupted { reason: reason.into(), address }
    }
}
