//! Trial records and their lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::configuration::Configuration;
use crate::errors::{LedgerError, LedgerResult};

/// Ledger-assigned, strictly increasing trial identity.
pub type TrialId = u64;

/// Lifecycle state of a trial.
///
/// ```text
/// Pending -> Running -> Succeeded
///                    -> Failed
/// Pending -> Pruned
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrialState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Pruned,
}

impl TrialState {
    pub fn can_transition_to(self, next: TrialState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Pruned)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
        )
    }

    /// Succeeded and Pruned trials never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Pruned)
    }

    /// Pending or Running: a worker owns (or owned) the configuration.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl fmt::Display for TrialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Pruned => "pruned",
        };
        f.write_str(s)
    }
}

/// Marker stored when a check category has no entries.
pub const NO_CHECKS: &str = "NONE";

/// Metrics persisted with every succeeded trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialMetrics {
    /// Backend identifier of the evaluated alpha.
    pub alpha_id: String,
    pub sharpe: Option<f64>,
    pub fitness: Option<f64>,
    pub turnover: Option<f64>,
    pub returns: Option<f64>,
    pub drawdown: Option<f64>,
    /// Comma-joined check names per status, or [`NO_CHECKS`].
    pub passed_checks: String,
    pub failed_checks: String,
    pub warnings: String,
}

/// Why a trial ended in [`TrialState::Failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Transient backend errors outlasted the retry budget.
    Transient,
    /// The backend refused the configuration outright.
    Permanent,
    /// The backend answered, but the answer could not be scored.
    InvalidResult,
    /// The process exited while the trial was running.
    Abandoned,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Transient => "Transient",
            Self::Permanent => "Permanent",
            Self::InvalidResult => "InvalidResult",
            Self::Abandoned => "Abandoned",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TrialFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn retries_exhausted() -> Self {
        Self::new(FailureKind::Transient, "retries exhausted")
    }
}

impl fmt::Display for TrialFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// A requested state change, as passed to the ledger and journalled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialUpdate {
    pub state: TrialState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objective: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<TrialMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<TrialFailure>,
}

impl TrialUpdate {
    pub fn running() -> Self {
        Self {
            state: TrialState::Running,
            objective: None,
            metrics: None,
            failure: None,
        }
    }

    pub fn succeeded(objective: f64, metrics: TrialMetrics) -> Self {
        Self {
            state: TrialState::Succeeded,
            objective: Some(objective),
            metrics: Some(metrics),
            failure: None,
        }
    }

    pub fn failed(failure: TrialFailure) -> Self {
        Self {
            state: TrialState::Failed,
            objective: None,
            metrics: None,
            failure: Some(failure),
        }
    }

    pub fn pruned() -> Self {
        Self {
            state: TrialState::Pruned,
            objective: None,
            metrics: None,
            failure: None,
        }
    }
}

/// One recorded attempt to evaluate a configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub id: TrialId,
    pub configuration: Configuration,
    pub state: TrialState,
    pub objective: Option<f64>,
    pub metrics: Option<TrialMetrics>,
    pub failure: Option<TrialFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Trial {
    pub fn new(id: TrialId, configuration: Configuration, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            configuration,
            state: TrialState::Pending,
            objective: None,
            metrics: None,
            failure: None,
            created_at,
            updated_at: created_at,
        }
    }

    /// Check that `update` is a legal, complete transition from the current
    /// state without applying it.
    pub fn validate(&self, update: &TrialUpdate) -> LedgerResult<()> {
        if !self.state.can_transition_to(update.state) {
            return Err(LedgerError::InvalidTransition {
                id: self.id,
                from: self.state,
                to: update.state,
            });
        }
        let missing = match update.state {
            TrialState::Succeeded if update.objective.is_none() => Some("objective"),
            TrialState::Succeeded if update.metrics.is_none() => Some("metrics"),
            TrialState::Failed if update.failure.is_none() => Some("failure reason"),
            _ => None,
        };
        match missing {
            Some(what) => Err(LedgerError::IncompleteUpdate {
                id: self.id,
                message: format!("{:?} requires {what}", update.state),
            }),
            None => Ok(()),
        }
    }

    pub fn apply(&mut self, update: TrialUpdate, at: DateTime<Utc>) -> LedgerResult<()> {
        self.validate(&update)?;
        self.state = update.state;
        self.objective = update.objective;
        self.metrics = update.metrics;
        self.failure = update.failure;
        self.updated_at = at;
        Ok(())
    }
}
