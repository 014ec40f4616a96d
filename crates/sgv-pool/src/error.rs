//! Error handling for the SGV allocator.

use thiserror::Error;

/// Result type alias for allocator operations.
pub type SgvResult<T> = std::result::Result<T, SgvError>;

/// Errors surfaced to callers of the allocator.
///
/// Allocation paths undo all side effects (counters, quota, partial SG
/// pages) before returning one of these. A cache miss is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SgvError {
    /// Zero size or an incompatible flag combination.
    #[error("invalid argument: {reason}")]
    InvalidArg {
        /// What was wrong with the request.
        reason: &'static str,
    },

    /// The page source failed, or the watermark or quota rejected the
    /// request after a shrink attempt.
    #[error("out of memory")]
    OutOfMemory,

    /// The pool name is claimed by an incompatible owner.
    #[error("pool name is busy")]
    Busy,
}

impl SgvError {
    /// Creates an invalid-argument error.
    pub const fn invalid(reason: &'static str) -> Self {
        Self::InvalidArg { reason }
    }

    /// Returns true if retrying later may succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::OutOfMemory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = SgvError::invalid("zero size");
        assert_eq!(err.to_string(), "invalid argument: zero size");
        assert_eq!(SgvError::OutOfMemory.to_string(), "out of memory");
    }

    #[test]
    fn test_is_retryable() {
        assert!(SgvError::OutOfMemory.is_retryable());
        assert!(!SgvError::Busy.is_retryable());
    }
}
