//! Error types for prefixdb.

use std::fmt;
use std::io;

/// Result type alias for prefixdb operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for prefixdb operations
#[derive(Debug)]
pub enum Error {
    /// I/O error from the backing storage
    Io(io::Error),

    /// Invalid input (empty key, key too long, oversized value, bad table name)
    InvalidInput(String),

    /// Data corruption detected (invalid tag byte, dangling pointer, unsorted children)
    Corrupted(String),

    /// Read past the end of the storage
    OutOfBounds(String),

    /// A just-written record could not be read back with the stored value
    Consistency(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            Error::Corrupted(msg) => write!(f, "Data corrupted: {}", msg),
            Error::OutOfBounds(msg) => write!(f, "Out of bounds: {}", msg),
            Error::Consistency(msg) => write!(f, "Consistency check failed: {}", msg),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Corrupted("bad tag 7 at offset 42".into());
        assert!(err.to_string().contains("corrupted"));
        assert!(err.to_string().contains("bad tag 7"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
