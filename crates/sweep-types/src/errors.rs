use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::trial::{TrialId, TrialState};

/// Main error type for alpha-sweep.
///
/// Only configuration problems and ledger I/O failures end a run; every
/// per-trial problem is recorded into the ledger instead of surfacing here.
#[derive(Error, Debug)]
pub enum SweepError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Trial ledger errors
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Ledger IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Journal corrupt at line {line}: {message}")]
    Corrupt { line: usize, message: String },

    #[error("Unknown trial: {id}")]
    UnknownTrial { id: TrialId },

    #[error("Invalid transition for trial {id}: {from:?} -> {to:?}")]
    InvalidTransition {
        id: TrialId,
        from: TrialState,
        to: TrialState,
    },

    #[error("Incomplete update for trial {id}: {message}")]
    IncompleteUpdate { id: TrialId, message: String },

    #[error("Ledger {} is locked by another process", path.display())]
    Locked { path: PathBuf },

    #[error("Journal serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure of one call into the evaluation backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    /// Rate limiting, a retryable server error, or a timed-out attempt.
    #[error("transient evaluation failure: {message}")]
    Transient {
        message: String,
        /// Minimum wait the backend asked for before the next attempt.
        retry_after: Option<Duration>,
    },

    /// Malformed request, authentication failure, or a configuration the
    /// backend cannot evaluate.
    #[error("permanent evaluation failure: {message}")]
    Permanent { message: String },
}

impl EvaluationError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

pub type EvaluationResult<T> = Result<T, EvaluationError>;

/// Scoring errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScoreError {
    #[error("invalid result: missing field '{field}'")]
    InvalidResult { field: String },

    #[error("invalid result: objective is not finite ({reason})")]
    NonFinite { reason: String },
}

/// Result type alias for alpha-sweep operations
pub type SweepResult<T> = Result<T, SweepError>;

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::SweepError::Config(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::SweepError::Internal(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = LedgerError::InvalidTransition {
            id: 7,
            from: TrialState::Succeeded,
            to: TrialState::Running,
        };
        assert_eq!(
            error.to_string(),
            "Invalid transition for trial 7: Succeeded -> Running"
        );

        let error = ScoreError::InvalidResult {
            field: "drawdown".into(),
        };
        assert!(error.to_string().contains("drawdown"));
    }

    #[test]
    fn test_error_conversion() {
        let ledger_error = LedgerError::UnknownTrial { id: 3 };
        let sweep_error: SweepError = ledger_error.into();

        match sweep_error {
            SweepError::Ledger(_) => (),
            _ => panic!("Expected Ledger error"),
        }
    }

    #[test]
    fn test_evaluation_error_kinds() {
        assert!(EvaluationError::transient("429").is_transient());
        assert!(!EvaluationError::permanent("401").is_transient());
    }

    #[test]
    fn test_macros() {
        let err = config_error!("empty domain for '{}'", "delay");
        assert!(matches!(err, SweepError::Config(ref m) if m.contains("delay")));
        let err = internal_error!("worker pool closed");
        assert_eq!(err.to_string(), "Internal error: worker pool closed");
    }
}
