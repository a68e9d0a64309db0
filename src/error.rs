//! Crate-wide error taxonomy.

use std::error;
use std::fmt;
use std::fmt::Display;
use std::io;

/// A specialized result type for external-memory operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Taxonomic error kind. Every [`Error`] maps to exactly one kind so that
/// callers can match on the class of a failure without inspecting its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// An underlying read or write failed.
    Io,
    /// A read advanced past the last record. Not fatal.
    EndOfStream,
    /// A seek or truncate outside the permitted bound.
    OutOfRange,
    /// The stream access mode disallows the operation.
    PermissionDenied,
    /// The memory budget would be exceeded.
    OutOfMemory,
    /// An expected environment variable is absent.
    EnvUndefined,
    /// A stream file header carries the wrong magic, version or record size.
    FormatMismatch,
    /// A file that was expected to be absent already exists.
    AlreadyExists,
    /// A file or writable device path could not be found.
    NotFound,
}

/// Error value crossing the library boundary.
#[derive(Debug)]
pub enum Error {
    /// Common I/O error.
    Io(io::Error),
    /// End of stream reached while reading.
    EndOfStream,
    /// Offset outside the permitted bound.
    OutOfRange { offset: u64, length: u64 },
    /// Operation disallowed by the access mode.
    PermissionDenied(&'static str),
    /// Allocation denied by the memory manager.
    OutOfMemory { requested: u64, available: u64 },
    /// Named environment variable is not set.
    EnvUndefined(String),
    /// Backing file header disagrees with the opener.
    FormatMismatch(String),
    /// File already exists.
    AlreadyExists(String),
    /// File or writable path not found.
    NotFound(String),
}

impl Error {
    /// Returns the taxonomic kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) => ErrorKind::Io,
            Error::EndOfStream => ErrorKind::EndOfStream,
            Error::OutOfRange { .. } => ErrorKind::OutOfRange,
            Error::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Error::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            Error::EnvUndefined(_) => ErrorKind::EnvUndefined,
            Error::FormatMismatch(_) => ErrorKind::FormatMismatch,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::NotFound(_) => ErrorKind::NotFound,
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            Error::Io(err) => write!(f, "I/O operation failed: {}", err),
            Error::EndOfStream => write!(f, "end of stream"),
            Error::OutOfRange { offset, length } => {
                write!(f, "offset {} out of range (stream length {})", offset, length)
            }
            Error::PermissionDenied(op) => write!(f, "operation not permitted by access mode: {}", op),
            Error::OutOfMemory { requested, available } => {
                write!(f, "memory budget exceeded: requested {}, available {}", requested, available)
            }
            Error::EnvUndefined(name) => write!(f, "environment variable not set: {}", name),
            Error::FormatMismatch(reason) => write!(f, "stream format mismatch: {}", reason),
            Error::AlreadyExists(path) => write!(f, "file already exists: {}", path),
            Error::NotFound(what) => write!(f, "not found: {}", what),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

#[cfg(test)]
mod test {
    use std::error::Error as _;
    use std::io;

    use super::{Error, ErrorKind};

    #[test]
    fn test_kind_mapping() {
        let err = Error::from(io::Error::new(io::ErrorKind::Other, "boom"));
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.source().is_some());

        assert_eq!(Error::EndOfStream.kind(), ErrorKind::EndOfStream);
        assert!(Error::EndOfStream.source().is_none());
    }

    #[test]
    fn test_display() {
        let err = Error::OutOfRange { offset: 11, length: 10 };
        assert_eq!(err.to_string(), "offset 11 out of range (stream length 10)");
    }
}
