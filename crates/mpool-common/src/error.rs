//! Error types for the mpool metadata core
//!
//! One discriminated error covers the whole workspace; variants carry the
//! identity of the drive, MDC or object involved so callers never need a
//! side-channel report to know what failed.

use thiserror::Error;
use uuid::Uuid;

/// Common result type for mpool operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for mpool operations
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    #[error("out of space")]
    NoSpace,

    #[error("object not found: {objid:#x}")]
    NotFound { objid: u64 },

    #[error("object already exists: {objid:#x}")]
    Exists { objid: u64 },

    #[error("object busy: {objid:#x}")]
    Busy { objid: u64 },

    #[error("object deleted: {objid:#x}")]
    Gone { objid: u64 },

    #[error("metadata corrupt: {detail}")]
    Corrupt { detail: String },

    #[error("metadata version {found} newer than latest supported {latest}")]
    UnsupportedVersion { found: String, latest: String },

    #[error("drive {devid} parameters do not match the drive list record")]
    ParmMismatch { devid: Uuid },

    #[error("zombie drive {devid}: listed in the pool but absent from the drive set")]
    Zombie { devid: Uuid },

    #[error("not enough good drives: {unavail} unavailable")]
    InsufficientGood { unavail: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record too big for active log: {len} bytes, {cap} free")]
    TooBig { len: u64, cap: u64 },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("critical invariant broken: {0}")]
    Critical(String),
}

impl Error {
    /// Create an invalid argument error
    pub fn invalid_arg(msg: impl Into<String>) -> Self {
        Self::InvalidArg(msg.into())
    }

    /// Create a corruption error
    pub fn corrupt(detail: impl Into<String>) -> Self {
        Self::Corrupt {
            detail: detail.into(),
        }
    }

    /// Create a critical error
    pub fn critical(msg: impl Into<String>) -> Self {
        Self::Critical(msg.into())
    }

    /// Check if this is the append-overflow error that triggers compaction
    #[must_use]
    pub fn is_too_big(&self) -> bool {
        matches!(self, Self::TooBig { .. })
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_predicates() {
        assert!(Error::TooBig { len: 100, cap: 10 }.is_too_big());
        assert!(!Error::NoSpace.is_too_big());
        assert!(Error::NotFound { objid: 0x1001 }.is_not_found());
        assert!(!Error::Gone { objid: 0x1001 }.is_not_found());
    }

    #[test]
    fn test_error_display_names_object() {
        let msg = Error::Exists { objid: 0x2102 }.to_string();
        assert!(msg.contains("0x2102"));
    }
}
