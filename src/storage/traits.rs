use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    aggregation::ParameterTree,
    sessions::{ClientStatus, Session, SessionClient, SessionId, TrainingStatus, UserId},
};

/// The error type for storage operations that are not part of the application
/// domain: broken connections, serialization failures, IO errors and so on.
pub type StorageError = anyhow::Error;

/// The result of a storage operation.
pub type StorageResult<T> = Result<T, StorageError>;

/// An abstract session store.
///
/// Write partitioning is the engine's only concurrency control: the session
/// coordinator is the sole writer of the session-level lifecycle fields
/// (training status, current round, global parameters), while each client is
/// the sole writer of its own participation row and of its own entry in the
/// round-scoped parameter map. Implementations therefore only need per-row
/// and per-field atomic upserts, never cross-session transactions.
#[async_trait]
pub trait SessionStorage
where
    Self: Clone + Send + Sync + 'static,
{
    /// Inserts the session, or overwrites it if it already exists.
    async fn save_session(&self, session: &Session) -> StorageResult<()>;

    /// Returns the latest committed state of a session, or `None` if it does
    /// not exist.
    async fn session(&self, id: SessionId) -> StorageResult<Option<Session>>;

    /// Returns all sessions.
    async fn sessions(&self) -> StorageResult<Vec<Session>>;

    /// Atomically updates a session's training status.
    async fn set_training_status(
        &self,
        id: SessionId,
        status: TrainingStatus,
    ) -> StorageResult<()>;

    /// Atomically updates a session's current round counter.
    async fn set_curr_round(&self, id: SessionId, round: u32) -> StorageResult<()>;

    /// Atomically replaces a session's aggregated global parameters.
    async fn set_global_parameters(
        &self,
        id: SessionId,
        parameters: &ParameterTree,
    ) -> StorageResult<()>;

    /// Inserts or replaces one user's participation row, keyed by
    /// `(session, user)`.
    async fn upsert_client(&self, client: &SessionClient) -> StorageResult<()>;

    /// Returns one user's participation row, or `None` if the user has no
    /// record in this session.
    async fn client(&self, id: SessionId, user: UserId) -> StorageResult<Option<SessionClient>>;

    /// Returns all participation rows of a session.
    async fn clients(&self, id: SessionId) -> StorageResult<Vec<SessionClient>>;

    /// Atomically updates one client's status.
    async fn set_client_status(
        &self,
        id: SessionId,
        user: UserId,
        status: ClientStatus,
    ) -> StorageResult<()>;

    /// Inserts or replaces one user's entry in the current round's parameter
    /// map.
    async fn insert_client_parameters(
        &self,
        id: SessionId,
        user: UserId,
        parameters: &ParameterTree,
    ) -> StorageResult<()>;

    /// Empties the round-scoped parameter map before the next round begins.
    async fn clear_client_parameters(&self, id: SessionId) -> StorageResult<()>;
}

/// Baseline statistics of one benchmark metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricStats {
    pub mean: f64,
    pub std_dev: f64,
}

/// A reference benchmark that session pricing compares against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Benchmark {
    pub model_name: String,
    /// Name of the primary metric, which must be a key of `metrics`.
    pub benchmark_metric: String,
    pub metrics: HashMap<String, MetricStats>,
}

/// Read access to the benchmark catalog.
#[async_trait]
pub trait BenchmarkStorage
where
    Self: Clone + Send + Sync + 'static,
{
    /// Returns a benchmark by id, or `None` if it does not exist.
    async fn benchmark(&self, id: &str) -> StorageResult<Option<Benchmark>>;
}
