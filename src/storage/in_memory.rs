//! An in-process session and benchmark store.
//!
//! Backs the standalone coordinator binary and the protocol tests. All
//! mutations run under one async `RwLock`, which trivially satisfies the
//! per-row and per-field atomicity the [`SessionStorage`] contract asks for.

use std::{collections::HashMap, sync::Arc};

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    aggregation::ParameterTree,
    sessions::{ClientStatus, Session, SessionClient, SessionId, TrainingStatus, UserId},
    storage::traits::{
        Benchmark, BenchmarkStorage, SessionStorage, StorageResult,
    },
};

#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, Session>,
    clients: HashMap<(SessionId, UserId), SessionClient>,
    benchmarks: HashMap<String, Benchmark>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the benchmark catalog.
    pub async fn insert_benchmark(&self, id: impl Into<String>, benchmark: Benchmark) {
        let mut inner = self.inner.write().await;
        inner.benchmarks.insert(id.into(), benchmark);
    }
}

impl Inner {
    fn session_mut(&mut self, id: SessionId) -> StorageResult<&mut Session> {
        self.sessions
            .get_mut(&id)
            .ok_or_else(|| anyhow!("session {} not found", id))
    }
}

#[async_trait]
impl SessionStorage for InMemoryStore {
    async fn save_session(&self, session: &Session) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        inner.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn session(&self, id: SessionId) -> StorageResult<Option<Session>> {
        let inner = self.inner.read().await;
        Ok(inner.sessions.get(&id).cloned())
    }

    async fn sessions(&self) -> StorageResult<Vec<Session>> {
        let inner = self.inner.read().await;
        Ok(inner.sessions.values().cloned().collect())
    }

    async fn set_training_status(
        &self,
        id: SessionId,
        status: TrainingStatus,
    ) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        inner.session_mut(id)?.training_status = status;
        Ok(())
    }

    async fn set_curr_round(&self, id: SessionId, round: u32) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        inner.session_mut(id)?.curr_round = round;
        Ok(())
    }

    async fn set_global_parameters(
        &self,
        id: SessionId,
        parameters: &ParameterTree,
    ) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        inner.session_mut(id)?.global_parameters = Some(parameters.clone());
        Ok(())
    }

    async fn upsert_client(&self, client: &SessionClient) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        inner
            .clients
            .insert((client.session_id, client.user_id), client.clone());
        Ok(())
    }

    async fn client(&self, id: SessionId, user: UserId) -> StorageResult<Option<SessionClient>> {
        let inner = self.inner.read().await;
        Ok(inner.clients.get(&(id, user)).cloned())
    }

    async fn clients(&self, id: SessionId) -> StorageResult<Vec<SessionClient>> {
        let inner = self.inner.read().await;
        Ok(inner
            .clients
            .values()
            .filter(|client| client.session_id == id)
            .cloned()
            .collect())
    }

    async fn set_client_status(
        &self,
        id: SessionId,
        user: UserId,
        status: ClientStatus,
    ) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let client = inner
            .clients
            .get_mut(&(id, user))
            .ok_or_else(|| anyhow!("user {} has no record in session {}", user, id))?;
        client.status = status;
        Ok(())
    }

    async fn insert_client_parameters(
        &self,
        id: SessionId,
        user: UserId,
        parameters: &ParameterTree,
    ) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        inner
            .session_mut(id)?
            .client_parameters
            .insert(user, parameters.clone());
        Ok(())
    }

    async fn clear_client_parameters(&self, id: SessionId) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        inner.session_mut(id)?.client_parameters.clear();
        Ok(())
    }
}

#[async_trait]
impl BenchmarkStorage for InMemoryStore {
    async fn benchmark(&self, id: &str) -> StorageResult<Option<Benchmark>> {
        let inner = self.inner.read().await;
        Ok(inner.benchmarks.get(id).cloned())
    }
}
