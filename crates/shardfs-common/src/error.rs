//! Error types for ShardFS
//!
//! A single result-or-error type conveys outcomes across all module
//! boundaries. Transports that can fail internally trap and translate
//! into one of these kinds.

use thiserror::Error;

/// Common result type for ShardFS operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for ShardFS
#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("corruption: {0}")]
    Corruption(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("buffer full: need {need} bytes, have {have}")]
    BufferFull { need: usize, have: usize },

    /// RPC timeout or transport loss; the peer may have moved partitions.
    #[error("disconnected: {0}")]
    Disconnected(String),

    #[error("assertion failed: {0}")]
    AssertionFailed(String),
}

impl Error {
    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an already-exists error
    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::AlreadyExists(msg.into())
    }

    /// Create a corruption error
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// Create a not-supported error
    pub fn not_supported(msg: impl Into<String>) -> Self {
        Self::NotSupported(msg.into())
    }

    /// Create an invalid-argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an I/O error
    pub fn io(msg: impl Into<String>) -> Self {
        Self::IoError(msg.into())
    }

    /// Create a disconnected error
    pub fn disconnected(msg: impl Into<String>) -> Self {
        Self::Disconnected(msg.into())
    }

    /// Check if this is a not-found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this is a corruption error
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption(_))
    }

    /// Check if the caller may retry, possibly on a refreshed partition map
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Disconnected(_) | Self::BufferFull { .. })
    }

    /// Stable numeric code used on the wire (see shardfs-proto)
    #[must_use]
    pub fn code(&self) -> u8 {
        match self {
            Self::NotFound(_) => 1,
            Self::AlreadyExists(_) => 2,
            Self::Corruption(_) => 3,
            Self::NotSupported(_) => 4,
            Self::InvalidArgument(_) => 5,
            Self::IoError(_) => 6,
            Self::BufferFull { .. } => 7,
            Self::Disconnected(_) => 8,
            Self::AssertionFailed(_) => 9,
        }
    }

    /// Rebuild an error from a wire code and message
    pub fn from_code(code: u8, msg: String) -> Self {
        match code {
            1 => Self::NotFound(msg),
            2 => Self::AlreadyExists(msg),
            3 => Self::Corruption(msg),
            4 => Self::NotSupported(msg),
            5 => Self::InvalidArgument(msg),
            7 => Self::BufferFull { need: 0, have: 0 },
            8 => Self::Disconnected(msg),
            9 => Self::AssertionFailed(msg),
            _ => Self::IoError(msg),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(e.to_string()),
            std::io::ErrorKind::AlreadyExists => Self::AlreadyExists(e.to_string()),
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                Self::Disconnected(e.to_string())
            }
            _ => Self::IoError(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_predicates() {
        assert!(Error::not_found("x").is_not_found());
        assert!(Error::disconnected("peer gone").is_retryable());
        assert!(!Error::corruption("bad block").is_retryable());
        assert!(Error::corruption("bad block").is_corruption());
    }

    #[test]
    fn test_error_code_roundtrip() {
        let errors = vec![
            Error::not_found("a"),
            Error::already_exists("b"),
            Error::corruption("c"),
            Error::not_supported("d"),
            Error::invalid_argument("e"),
            Error::io("f"),
            Error::disconnected("g"),
        ];
        for e in errors {
            let code = e.code();
            let back = Error::from_code(code, "msg".to_string());
            assert_eq!(back.code(), code);
        }
    }

    #[test]
    fn test_io_error_translation() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let e: Error = io.into();
        assert!(e.is_not_found());

        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        let e: Error = io.into();
        assert!(e.is_retryable());
    }
}
