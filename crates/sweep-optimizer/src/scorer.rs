//! Reduction of a raw simulation result into an objective and metrics.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use sweep_types::{CheckStatus, ScoreError, SimulationResult, TrialMetrics, NO_CHECKS};

/// A scored result, ready to be recorded on a succeeded trial.
#[derive(Debug, Clone, PartialEq)]
pub struct Score {
    pub objective: f64,
    pub metrics: TrialMetrics,
}

/// Pure reduction of a backend result. No I/O.
pub trait Scorer: Send + Sync {
    fn score(&self, result: &SimulationResult) -> Result<Score, ScoreError>;

    fn name(&self) -> &str;
}

/// Which objective a study maximises.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveKind {
    /// Returns net of trading costs over drawdown.
    #[default]
    NetCalmar,
    /// Sharpe times fitness.
    SharpeFitness,
}

/// Scoring constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub objective: ObjectiveKind,
    /// Cost of one unit of turnover (0.0005 = 5 bp).
    pub per_trade_cost: f64,
    /// Trading days per year.
    pub annualization_factor: f64,
    /// Decimal digits kept in the stored objective.
    pub precision: u32,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            objective: ObjectiveKind::NetCalmar,
            per_trade_cost: 0.0005,
            annualization_factor: 252.0,
            precision: 2,
        }
    }
}

impl ScoringConfig {
    pub fn scorer(&self) -> Arc<dyn Scorer> {
        match self.objective {
            ObjectiveKind::NetCalmar => Arc::new(NetCalmarScorer::new(self.clone())),
            ObjectiveKind::SharpeFitness => Arc::new(SharpeFitnessScorer::new(self.precision)),
        }
    }
}

/// `(returns - turnover * annualization * cost) / drawdown`.
#[derive(Debug, Clone, Default)]
pub struct NetCalmarScorer {
    config: ScoringConfig,
}

impl NetCalmarScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }
}

impl Scorer for NetCalmarScorer {
    fn score(&self, result: &SimulationResult) -> Result<Score, ScoreError> {
        let is = &result.insample;
        let returns = required(is.returns, "returns")?;
        let turnover = required(is.turnover, "turnover")?;
        let drawdown = required(is.drawdown, "drawdown")?;
        if drawdown == 0.0 {
            return Err(ScoreError::NonFinite {
                reason: "drawdown is zero".into(),
            });
        }

        let cost = turnover * self.config.annualization_factor * self.config.per_trade_cost;
        let objective = round((returns - cost) / drawdown, self.config.precision)?;
        Ok(Score {
            objective,
            metrics: metrics(result),
        })
    }

    fn name(&self) -> &str {
        "net_calmar"
    }
}

/// `sharpe * fitness`.
#[derive(Debug, Clone)]
pub struct SharpeFitnessScorer {
    precision: u32,
}

impl SharpeFitnessScorer {
    pub fn new(precision: u32) -> Self {
        Self { precision }
    }
}

impl Default for SharpeFitnessScorer {
    fn default() -> Self {
        Self::new(2)
    }
}

impl Scorer for SharpeFitnessScorer {
    fn score(&self, result: &SimulationResult) -> Result<Score, ScoreError> {
        let is = &result.insample;
        let sharpe = required(is.sharpe, "sharpe")?;
        let fitness = required(is.fitness, "fitness")?;
        Ok(Score {
            objective: round(sharpe * fitness, self.precision)?,
            metrics: metrics(result),
        })
    }

    fn name(&self) -> &str {
        "sharpe_fitness"
    }
}

fn required(value: Option<f64>, field: &str) -> Result<f64, ScoreError> {
    value.ok_or_else(|| ScoreError::InvalidResult {
        field: field.to_string(),
    })
}

/// Round half to even at `precision` decimal digits.
fn round(value: f64, precision: u32) -> Result<f64, ScoreError> {
    Decimal::from_f64_retain(value)
        .map(|d| d.round_dp(precision))
        .and_then(|d| d.to_f64())
        .ok_or_else(|| ScoreError::NonFinite {
            reason: format!("{value}"),
        })
}

fn joined(names: Vec<&str>) -> String {
    if names.is_empty() {
        NO_CHECKS.to_string()
    } else {
        names.join(",")
    }
}

fn metrics(result: &SimulationResult) -> TrialMetrics {
    let is = &result.insample;
    TrialMetrics {
        alpha_id: result.id.clone(),
        sharpe: is.sharpe,
        fitness: is.fitness,
        turnover: is.turnover,
        returns: is.returns,
        drawdown: is.drawdown,
        passed_checks: joined(is.check_names(&CheckStatus::Pass)),
        failed_checks: joined(is.check_names(&CheckStatus::Fail)),
        warnings: joined(is.check_names(&CheckStatus::Warning)),
    }
}
