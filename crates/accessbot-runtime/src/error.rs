use std::fmt;

use thiserror::Error;

/// Classification every adapter maps its failures into. Retry decisions only
/// ever look at this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConnectionProblem,
    Eof,
    Canceled,
    DeadlineExceeded,
    CompareFailed,
    NotFound,
    BadParameter,
    NotImplemented,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConnectionProblem => "connection_problem",
            ErrorKind::Eof => "eof",
            ErrorKind::Canceled => "canceled",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::CompareFailed => "compare_failed",
            ErrorKind::NotFound => "not_found",
            ErrorKind::BadParameter => "bad_parameter",
            ErrorKind::NotImplemented => "not_implemented",
            ErrorKind::Internal => "internal",
        }
    }

    /// Kinds a watcher job heals by opening a new stream.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::ConnectionProblem | ErrorKind::Eof)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn connection_problem(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConnectionProblem, message)
    }

    pub fn eof(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Eof, message)
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Canceled, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DeadlineExceeded, message)
    }

    pub fn compare_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CompareFailed, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn bad_parameter(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadParameter, message)
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotImplemented, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    pub fn is_canceled(&self) -> bool {
        self.kind == ErrorKind::Canceled
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }

    pub fn is_compare_failed(&self) -> bool {
        self.kind == ErrorKind::CompareFailed
    }

    /// Prefix the message, keeping the kind.
    pub fn context(self, what: impl fmt::Display) -> Self {
        Self {
            kind: self.kind,
            message: format!("{what}: {}", self.message),
        }
    }
}

impl From<crate::cache::CacheError> for Error {
    fn from(err: crate::cache::CacheError) -> Self {
        // The cache only closes on shutdown.
        Error::canceled(err.to_string())
    }
}

impl From<accessbot_kernel::VersionError> for Error {
    fn from(err: accessbot_kernel::VersionError) -> Self {
        Error::not_implemented(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_stream_failures_are_retryable() {
        assert!(Error::connection_problem("dial").is_retryable());
        assert!(Error::eof("closed").is_retryable());
        for kind in [
            ErrorKind::Canceled,
            ErrorKind::DeadlineExceeded,
            ErrorKind::CompareFailed,
            ErrorKind::NotFound,
            ErrorKind::BadParameter,
            ErrorKind::NotImplemented,
            ErrorKind::Internal,
        ] {
            assert!(!Error::new(kind, "x").is_retryable(), "{kind}");
        }
    }

    #[test]
    fn context_keeps_kind() {
        let err = Error::compare_failed("value changed").context("update plugin data");
        assert_eq!(err.kind(), ErrorKind::CompareFailed);
        assert_eq!(
            err.to_string(),
            "compare_failed: update plugin data: value changed"
        );
    }
}
