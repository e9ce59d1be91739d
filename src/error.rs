//! Error kinds raised by the estimation pipeline

use thiserror::Error;

/// Failure of a pipeline stage.
///
/// Every stage validates its own inputs and fails with the most specific kind.
/// A failed fit is never retried or papered over.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ClvError {
    /// Malformed or out-of-domain input, e.g. a non-positive amount.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Too few customers or observations to fit a model.
    #[error("insufficient data for {what}: need at least {needed}, got {got}")]
    InsufficientData {
        what: &'static str,
        needed: usize,
        got: usize,
    },

    /// The optimizer did not reach a stable optimum within its budget.
    #[error("optimizer did not converge after {iterations} iterations: {reason}")]
    Convergence { iterations: usize, reason: String },
}

impl ClvError {
    pub fn invalid(message: impl Into<String>) -> Self {
        ClvError::InvalidInput(message.into())
    }
}

/// Result type for the statistical stages.
pub type Result<T> = std::result::Result<T, ClvError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = ClvError::InsufficientData {
            what: "spend model",
            needed: 2,
            got: 1,
        };
        assert_eq!(
            err.to_string(),
            "insufficient data for spend model: need at least 2, got 1"
        );

        let err = ClvError::invalid("amount must be positive");
        assert!(err.to_string().contains("amount must be positive"));
    }
}
