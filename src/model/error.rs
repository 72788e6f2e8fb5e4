use std::{io, path::PathBuf};

use crate::model::iter::IterOption;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors shared by every bucket backend.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("object not found: {key}")]
    NotFound { key: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation deadline exceeded")]
    DeadlineExceeded,

    #[error("iter option not supported: {0}")]
    OptionNotSupported(IterOption),

    #[error("invalid object key {key:?}: {reason}")]
    InvalidKey { key: String, reason: &'static str },

    #[error("bucket is closed")]
    Closed,

    #[error("failed to {op} at: {}, {source}", .path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{message}")]
    Backend { message: String },
}

impl Error {
    pub fn not_found(key: impl Into<String>) -> Self {
        Error::NotFound { key: key.into() }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Error::Backend {
            message: message.into(),
        }
    }

    /// Wraps a filesystem error, turning a missing path into `NotFound` for `key`.
    pub fn from_io(op: &'static str, key: &str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        if matches!(
            source.kind(),
            io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
        ) {
            return Error::not_found(key);
        }

        Error::from_io_source(op, path, source)
    }

    /// Wraps a filesystem error without reclassifying it.
    ///
    /// An `io::Error` produced by a cancelled [`ObjectReader`](crate::ObjectReader)
    /// is unwrapped back into the original cancellation error.
    pub fn from_io_source(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        match cancellation_of(&source) {
            Some(err) => err,
            None => Error::Io {
                op,
                path: path.into(),
                source,
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// True for both an explicit cancel and an expired deadline.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled | Error::DeadlineExceeded)
    }

    pub(crate) fn into_io(self) -> io::Error {
        io::Error::other(self)
    }
}

fn cancellation_of(err: &io::Error) -> Option<Error> {
    match err.get_ref()?.downcast_ref::<Error>()? {
        Error::Cancelled => Some(Error::Cancelled),
        Error::DeadlineExceeded => Some(Error::DeadlineExceeded),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_io() {
        let cases = vec![
            (io::ErrorKind::NotFound, true),
            (io::ErrorKind::NotADirectory, true),
            (io::ErrorKind::PermissionDenied, false),
            (io::ErrorKind::Other, false),
        ];

        for (kind, expected) in cases {
            let err = Error::from_io("stat", "folder/file", "/root/folder/file", kind.into());
            assert_eq!(err.is_not_found(), expected, "failed for case: {:?}", kind);
        }
    }

    #[test]
    fn test_from_io_unwraps_cancellation() {
        let cases = vec![Error::Cancelled, Error::DeadlineExceeded];

        for case in cases {
            let expected = case.to_string();
            let err = Error::from_io_source("read", "/root/file", case.into_io());
            assert!(err.is_cancelled(), "failed for case: {}", expected);
            assert_eq!(err.to_string(), expected, "failed for case: {}", expected);
        }
    }

    #[test]
    fn test_display() {
        let err = Error::from_io_source(
            "rm",
            "/root/folder",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(err.to_string(), "failed to rm at: /root/folder, denied");
        assert!(!err.is_not_found());
        assert!(!err.is_cancelled());
    }
}
