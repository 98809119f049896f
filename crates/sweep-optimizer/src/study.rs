//! Study configuration and end-of-run summary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use sweep_client::RetryPolicy;
use sweep_types::{config_error, Configuration, SweepResult, Trial, TrialState};

use crate::scorer::ScoringConfig;

/// Concurrent simulation ceiling of the evaluation backend.
pub const MAX_CONCURRENCY: usize = 8;

/// How candidates are proposed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Every point of the space, once.
    #[default]
    Grid,
    Random,
    Tpe,
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "grid" => Ok(Self::Grid),
            "random" => Ok(Self::Random),
            "tpe" => Ok(Self::Tpe),
            other => Err(format!("unknown strategy '{other}' (grid, random, tpe)")),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Grid => "grid",
            Self::Random => "random",
            Self::Tpe => "tpe",
        })
    }
}

/// Top-level configuration for a study.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyConfig {
    /// Selects the journal file; must be usable as a file name.
    pub name: String,

    /// Evaluations in flight at once.
    pub concurrency: usize,

    pub strategy: Strategy,

    /// Upper bound on trials started by one run.
    pub max_trials: Option<usize>,

    /// Re-run configurations whose latest trial failed before exploring.
    pub retry_failed: bool,

    /// A stochastic source is considered exhausted after this many
    /// consecutive proposals were refused as duplicates.
    pub max_duplicate_proposals: usize,

    /// Seed for the stochastic sources.
    pub seed: Option<u64>,

    /// Configurations dispatched before any proposed candidate.
    pub enqueue: Vec<Configuration>,

    pub retry: RetryPolicy,
    pub scoring: ScoringConfig,
}

impl StudyConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            concurrency: 5,
            strategy: Strategy::Grid,
            max_trials: None,
            retry_failed: true,
            max_duplicate_proposals: 1000,
            seed: None,
            enqueue: Vec::new(),
            retry: RetryPolicy::default(),
            scoring: ScoringConfig::default(),
        }
    }

    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n;
        self
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_max_trials(mut self, n: usize) -> Self {
        self.max_trials = Some(n);
        self
    }

    pub fn with_retry_failed(mut self, retry: bool) -> Self {
        self.retry_failed = retry;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_enqueued(mut self, configuration: Configuration) -> Self {
        self.enqueue.push(configuration);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn with_scoring(mut self, scoring: ScoringConfig) -> Self {
        self.scoring = scoring;
        self
    }

    pub fn validate(&self) -> SweepResult<()> {
        if self.name.trim().is_empty() {
            return Err(config_error!("study name is empty"));
        }
        if self.name.contains(|c: char| c == '/' || c == '\\') || self.name == "." || self.name == ".." {
            return Err(config_error!("study name '{}' is not a file name", self.name));
        }
        if !(1..=MAX_CONCURRENCY).contains(&self.concurrency) {
            return Err(config_error!(
                "concurrency must be between 1 and {}, got {}",
                MAX_CONCURRENCY,
                self.concurrency
            ));
        }
        if self.max_trials == Some(0) {
            return Err(config_error!("max_trials must be positive"));
        }
        if self.max_duplicate_proposals == 0 {
            return Err(config_error!("max_duplicate_proposals must be positive"));
        }
        if self.scoring.precision > 28 {
            return Err(config_error!(
                "objective precision {} exceeds 28 digits",
                self.scoring.precision
            ));
        }
        Ok(())
    }

    /// Journal of this study inside `studies_dir`.
    pub fn journal_path(&self, studies_dir: &Path) -> PathBuf {
        studies_dir.join(format!("{}.jsonl", self.name))
    }
}

/// Aggregate outcome of a study, as recorded in its ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudySummary {
    pub name: String,
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub pruned: usize,
    /// Trials started by this run.
    pub started: usize,
    pub best_trial: Option<Trial>,
    pub elapsed: Duration,
    /// The run stopped on a cancellation request.
    pub cancelled: bool,
    pub finished_at: DateTime<Utc>,
}

impl StudySummary {
    pub fn from_trials(name: impl Into<String>, trials: &[Trial]) -> Self {
        let mut summary = Self {
            name: name.into(),
            total: trials.len(),
            pending: 0,
            running: 0,
            succeeded: 0,
            failed: 0,
            pruned: 0,
            started: 0,
            best_trial: None,
            elapsed: Duration::ZERO,
            cancelled: false,
            finished_at: Utc::now(),
        };
        for trial in trials {
            match trial.state {
                TrialState::Pending => summary.pending += 1,
                TrialState::Running => summary.running += 1,
                TrialState::Succeeded => summary.succeeded += 1,
                TrialState::Failed => summary.failed += 1,
                TrialState::Pruned => summary.pruned += 1,
            }
            summary.update_best(trial);
        }
        summary
    }

    /// Keep `trial` as the best one if it succeeded with a higher objective.
    /// Ties keep the earlier trial.
    pub fn update_best(&mut self, trial: &Trial) {
        let Some(objective) = trial.objective.filter(|_| trial.state == TrialState::Succeeded)
        else {
            return;
        };
        let improves = match self.best_trial.as_ref().and_then(|b| b.objective) {
            None => true,
            Some(best) => objective > best,
        };
        if improves {
            self.best_trial = Some(trial.clone());
        }
    }
}

impl fmt::Display for StudySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Study: {}", self.name)?;
        writeln!(f, "Elapsed: {:.1?}", self.elapsed)?;
        if self.cancelled {
            writeln!(f, "Stopped early on interrupt")?;
        }
        writeln!(
            f,
            "Trials: {} total, {} started this run ({} succeeded, {} failed, {} pruned, {} pending, {} running)",
            self.total,
            self.started,
            self.succeeded,
            self.failed,
            self.pruned,
            self.pending,
            self.running
        )?;
        match &self.best_trial {
            Some(best) => {
                writeln!(f, "Best trial: #{}", best.id)?;
                if let Some(objective) = best.objective {
                    writeln!(f, "Best objective: {objective}")?;
                }
                writeln!(f, "Best parameters:")?;
                for (name, value) in best.configuration.iter() {
                    writeln!(f, "    {name}: {value}")?;
                }
                if let Some(m) = &best.metrics {
                    writeln!(f, "Best trial metrics:")?;
                    writeln!(f, "    Alpha: {}", m.alpha_id)?;
                    for (label, value) in [
                        ("Sharpe", m.sharpe),
                        ("Fitness", m.fitness),
                        ("Turnover", m.turnover),
                        ("Returns", m.returns),
                        ("Drawdown", m.drawdown),
                    ] {
                        if let Some(v) = value {
                            writeln!(f, "    {label}: {v}")?;
                        }
                    }
                    writeln!(f, "    Failed checks: {}", m.failed_checks)?;
                }
            }
            None => writeln!(f, "No successful trials yet")?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sweep_types::{FailureKind, TrialFailure, TrialMetrics, TrialUpdate, NO_CHECKS};

    fn metrics() -> TrialMetrics {
        TrialMetrics {
            alpha_id: "a".into(),
            sharpe: Some(1.1),
            fitness: None,
            turnover: None,
            returns: None,
            drawdown: None,
            passed_checks: NO_CHECKS.into(),
            failed_checks: NO_CHECKS.into(),
            warnings: NO_CHECKS.into(),
        }
    }

    fn finished(id: u64, update: TrialUpdate) -> Trial {
        let mut t = Trial::new(id, Configuration::new().with("n", id as i64), Utc::now());
        t.apply(TrialUpdate::running(), Utc::now()).unwrap();
        t.apply(update, Utc::now()).unwrap();
        t
    }

    #[test]
    fn builder_and_validation() {
        let config = StudyConfig::new("usa_settings")
            .with_concurrency(8)
            .with_strategy(Strategy::Tpe)
            .with_max_trials(100)
            .with_seed(42);
        assert!(config.validate().is_ok());
        assert!(config.retry_failed);
        assert_eq!(config.max_duplicate_proposals, 1000);

        assert!(config.clone().with_concurrency(0).validate().is_err());
        assert!(config.clone().with_concurrency(9).validate().is_err());
        assert!(StudyConfig::new("../x").validate().is_err());
        assert!(StudyConfig::new("  ").validate().is_err());
    }

    #[test]
    fn journal_lives_in_studies_dir() {
        let config = StudyConfig::new("2024-01-01_12-00-00");
        assert_eq!(
            config.journal_path(Path::new("studies")),
            Path::new("studies").join("2024-01-01_12-00-00.jsonl")
        );
    }

    #[test]
    fn strategy_parses_case_insensitively() {
        assert_eq!("TPE".parse::<Strategy>(), Ok(Strategy::Tpe));
        assert_eq!("grid".parse::<Strategy>(), Ok(Strategy::Grid));
        assert!("bayesian".parse::<Strategy>().is_err());
        assert_eq!(Strategy::Random.to_string(), "random");
    }

    #[test]
    fn summary_counts_and_best() {
        let trials = vec![
            finished(0, TrialUpdate::succeeded(1.5, metrics())),
            finished(1, TrialUpdate::succeeded(2.0, metrics())),
            finished(
                2,
                TrialUpdate::failed(TrialFailure::new(FailureKind::Permanent, "bad")),
            ),
            finished(3, TrialUpdate::succeeded(2.0, metrics())),
            Trial::new(4, Configuration::new(), Utc::now()),
        ];
        let summary = StudySummary::from_trials("s", &trials);
        assert_eq!(summary.total, 5);
        assert_eq!(summary.succeeded, 3);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.pending, 1);
        assert_eq!(summary.best_trial.as_ref().map(|t| t.id), Some(1));

        let text = summary.to_string();
        assert!(text.contains("Best objective: 2"));
        assert!(text.contains("n: 1"));
    }

    #[test]
    fn summary_without_successes() {
        let summary = StudySummary::from_trials("empty", &[]);
        assert!(summary.best_trial.is_none());
        assert!(summary.to_string().contains("No successful trials"));
    }
}
