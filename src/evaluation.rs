//! Evaluation of the aggregated global model.
//!
//! The evaluation harness and its metrics are external: the engine hands the
//! model config and the freshly aggregated parameters over after each round
//! and persists whatever comes back when the session completes.

use async_trait::async_trait;

use crate::{
    aggregation::ParameterTree,
    sessions::{RoundResult, SessionId},
    storage::StorageResult,
};

/// Scores a global model and persists the accumulated per-round results.
#[async_trait]
pub trait Evaluator
where
    Self: Clone + Send + Sync + 'static,
{
    /// Evaluates the aggregated parameters against the session's model
    /// config, returning the metric results for this round.
    async fn evaluate(
        &self,
        model_config: &serde_json::Value,
        parameters: &ParameterTree,
    ) -> StorageResult<serde_json::Value>;

    /// Persists all per-round results once the session has completed.
    async fn persist_results(
        &self,
        session_id: SessionId,
        results: &[RoundResult],
    ) -> StorageResult<()>;
}

/// An evaluator that scores nothing and archives nowhere.
#[derive(Clone, Default)]
pub struct NoOpEvaluator;

#[async_trait]
impl Evaluator for NoOpEvaluator {
    async fn evaluate(
        &self,
        _model_config: &serde_json::Value,
        _parameters: &ParameterTree,
    ) -> StorageResult<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }

    async fn persist_results(
        &self,
        _session_id: SessionId,
        _results: &[RoundResult],
    ) -> StorageResult<()> {
        Ok(())
    }
}
