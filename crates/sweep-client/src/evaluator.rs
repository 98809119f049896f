//! The evaluation backend seam.

use async_trait::async_trait;
use std::sync::Arc;
use sweep_types::{Configuration, EvaluationResult, SimulationResult};

/// Runs one configuration through the external scoring backend.
///
/// Implementations hold no per-call state: every call either returns the
/// backend's raw result or a tagged [`sweep_types::EvaluationError`]
/// saying whether the failure is worth retrying. Claims and ledger writes
/// are the caller's business.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, configuration: &Configuration) -> EvaluationResult<SimulationResult>;
}

#[async_trait]
impl<E: Evaluator + ?Sized> Evaluator for Arc<E> {
    async fn evaluate(&self, configuration: &Configuration) -> EvaluationResult<SimulationResult> {
        (**self).evaluate(configuration).await
    }
}

#[async_trait]
impl<E: Evaluator + ?Sized> Evaluator for Box<E> {
    async fn evaluate(&self, configuration: &Configuration) -> EvaluationResult<SimulationResult> {
        (**self).evaluate(configuration).await
    }
}
