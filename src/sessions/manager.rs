//! Session creation, lookup and client-side protocol writes.
//!
//! The [`SessionManager`] is the surface the REST layer calls into. It prices
//! and persists new sessions, spawns their coordinator task, and records the
//! client-initiated writes of the protocol (join decisions, handshake
//! acknowledgments, parameter submissions). Every write is an independent
//! upsert keyed by client identity, so manager calls never conflict with the
//! coordinator's session-level writes.

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{error_span, info};
use tracing_futures::Instrument;

use crate::{
    aggregation::ParameterTree,
    coordinator::{self, RoundCoordinator},
    evaluation::Evaluator,
    notifications::Notifier,
    pricing::{self, PricingError},
    sessions::{
        ClientStatus, Session, SessionClient, SessionId, SessionSummary, TrainingStatus, UserId,
    },
    settings::{PricingSettings, ProtocolSettings},
    storage::{BenchmarkStorage, SessionStorage, StorageError},
};

/// An error surfaced to the manager's callers.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("session {0} not found")]
    NotFound(SessionId),
    #[error("benchmark `{0}` not found")]
    UnknownBenchmark(String),
    #[error("user {user} has no client record in session {session}")]
    UnknownClient { session: SessionId, user: UserId },
    #[error(transparent)]
    Pricing(#[from] PricingError),
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
}

/// A session together with its participation records.
#[derive(Debug, Clone, Serialize)]
pub struct SessionDetails {
    pub session: Session,
    pub clients: Vec<SessionClient>,
}

/// Creates and exposes federated sessions.
#[derive(Clone)]
pub struct SessionManager<S, B, N, E> {
    store: S,
    benchmarks: B,
    notifier: N,
    evaluator: E,
    protocol: ProtocolSettings,
    pricing: PricingSettings,
}

impl<S, B, N, E> SessionManager<S, B, N, E>
where
    S: SessionStorage,
    B: BenchmarkStorage,
    N: Notifier,
    E: Evaluator,
{
    pub fn new(
        store: S,
        benchmarks: B,
        notifier: N,
        evaluator: E,
        protocol: ProtocolSettings,
        pricing: PricingSettings,
    ) -> Self {
        Self {
            store,
            benchmarks,
            notifier,
            evaluator,
            protocol,
            pricing,
        }
    }

    /// Prices and persists a new session, records the admin as an already
    /// joined client, and spawns the session's coordinator task.
    ///
    /// # Errors
    /// Any pricing failure (unknown benchmark, missing statistics, malformed
    /// input shape, zero effect size) aborts creation before anything is
    /// persisted.
    pub async fn create_session(
        &self,
        admin: UserId,
        federated_info: serde_json::Value,
        origin: Option<String>,
    ) -> Result<Session, ManagerError> {
        let benchmark_id = pricing::benchmark_id(&federated_info)?;
        let benchmark = self
            .benchmarks
            .benchmark(benchmark_id)
            .await?
            .ok_or_else(|| ManagerError::UnknownBenchmark(benchmark_id.to_string()))?;
        let price = pricing::session_price(
            &federated_info,
            &benchmark,
            self.pricing.alpha,
            self.pricing.power,
        )?;

        let mut session = Session::new(
            admin,
            federated_info,
            self.protocol.max_round,
            Utc::now() + self.protocol.join_window(),
        );
        session.session_price = Some(price as f64);
        self.store.save_session(&session).await?;
        self.store
            .upsert_client(&SessionClient {
                user_id: admin,
                session_id: session.id,
                status: ClientStatus::Joined,
                local_model_id: None,
                origin,
            })
            .await?;

        info!(session = %session.id, price, "created federated session");
        let coordinator = RoundCoordinator::new(
            session.id,
            self.store.clone(),
            self.notifier.clone(),
            self.evaluator.clone(),
            self.protocol,
        );
        tokio::spawn(
            coordinator::supervise(coordinator)
                .instrument(error_span!("session", id = %session.id)),
        );
        Ok(session)
    }

    /// Returns a session with its clients.
    pub async fn session(&self, id: SessionId) -> Result<SessionDetails, ManagerError> {
        let session = self
            .store
            .session(id)
            .await?
            .ok_or(ManagerError::NotFound(id))?;
        let clients = self.store.clients(id).await?;
        Ok(SessionDetails { session, clients })
    }

    /// Returns summaries of the sessions a user may see: those still inside
    /// their join window, plus those the user already participates in.
    /// Newest first.
    pub async fn sessions_visible_to(
        &self,
        user: UserId,
    ) -> Result<Vec<SessionSummary>, ManagerError> {
        let now = Utc::now();
        let mut visible = Vec::new();
        for session in self.store.sessions().await? {
            let participating = self.store.client(session.id, user).await?.is_some();
            if session.wait_till > now || participating {
                visible.push(session);
            }
        }
        visible.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(visible
            .into_iter()
            .map(|session| SessionSummary {
                id: session.id,
                training_status: session.training_status,
                name: session
                    .federated_info
                    .get("organisation_name")
                    .and_then(|name| name.as_str())
                    .map(str::to_string),
            })
            .collect())
    }

    /// Records the admin's verdict on the quoted price. The session's
    /// coordinator observes the new status on its next poll.
    pub async fn record_price_decision(
        &self,
        id: SessionId,
        accept: bool,
    ) -> Result<(), ManagerError> {
        self.require_session(id).await?;
        let status = if accept {
            TrainingStatus::PriceAccepted
        } else {
            TrainingStatus::PriceRejected
        };
        self.store.set_training_status(id, status).await?;
        Ok(())
    }

    /// Records a user's join decision. Idempotent: the first call creates the
    /// participation row, repeated calls only update its status.
    pub async fn record_client_decision(
        &self,
        id: SessionId,
        user: UserId,
        accept: bool,
        origin: Option<String>,
    ) -> Result<(), ManagerError> {
        self.require_session(id).await?;
        let status = if accept {
            ClientStatus::Joined
        } else {
            ClientStatus::Declined
        };
        match self.store.client(id, user).await? {
            Some(_) => self.store.set_client_status(id, user, status).await?,
            None => {
                self.store
                    .upsert_client(&SessionClient {
                        user_id: user,
                        session_id: id,
                        status,
                        local_model_id: None,
                        origin,
                    })
                    .await?
            }
        }
        Ok(())
    }

    /// Records that a client fetched the model config and is ready to train.
    pub async fn record_handshake_ack(
        &self,
        id: SessionId,
        user: UserId,
        local_model_id: String,
    ) -> Result<(), ManagerError> {
        self.require_session(id).await?;
        let mut client = self
            .store
            .client(id, user)
            .await?
            .ok_or(ManagerError::UnknownClient { session: id, user })?;
        client.status = ClientStatus::ReadyForRound;
        client.local_model_id = Some(local_model_id);
        self.store.upsert_client(&client).await?;
        Ok(())
    }

    /// Records a client's local model update for the current round.
    ///
    /// Only users with a participation row may submit; the round-scoped map
    /// never contains entries for unknown clients.
    pub async fn submit_client_parameters(
        &self,
        id: SessionId,
        user: UserId,
        parameters: ParameterTree,
    ) -> Result<(), ManagerError> {
        self.require_session(id).await?;
        if self.store.client(id, user).await?.is_none() {
            return Err(ManagerError::UnknownClient { session: id, user });
        }
        self.store
            .insert_client_parameters(id, user, &parameters)
            .await?;
        Ok(())
    }

    async fn require_session(&self, id: SessionId) -> Result<(), ManagerError> {
        self.store
            .session(id)
            .await?
            .map(|_| ())
            .ok_or(ManagerError::NotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::*;
    use crate::{
        evaluation::NoOpEvaluator,
        notifications::InMemoryNotifier,
        storage::{Benchmark, InMemoryStore, MetricStats},
    };

    fn federated_info() -> serde_json::Value {
        json!({
            "organisation_name": "test-org",
            "std_mean": 0.85,
            "std_deviation": 0.04,
            "benchmark_id": "mnist-v1",
            "model_info": { "model_name": "CNN", "input_shape": "(4,)" },
        })
    }

    async fn manager() -> (
        SessionManager<InMemoryStore, InMemoryStore, InMemoryNotifier, NoOpEvaluator>,
        InMemoryStore,
    ) {
        let store = InMemoryStore::new();
        let mut metrics = HashMap::new();
        metrics.insert(
            "accuracy".to_string(),
            MetricStats {
                mean: 0.70,
                std_dev: 0.05,
            },
        );
        store
            .insert_benchmark(
                "mnist-v1",
                Benchmark {
                    model_name: "baseline-cnn".to_string(),
                    benchmark_metric: "accuracy".to_string(),
                    metrics,
                },
            )
            .await;
        let manager = SessionManager::new(
            store.clone(),
            store.clone(),
            InMemoryNotifier::new(),
            NoOpEvaluator,
            ProtocolSettings::default(),
            PricingSettings::default(),
        );
        (manager, store)
    }

    #[tokio::test]
    async fn create_session_prices_and_records_the_admin() {
        let (manager, store) = manager().await;
        let admin = UserId::new();
        let session = manager
            .create_session(admin, federated_info(), Some("10.0.0.1".to_string()))
            .await
            .unwrap();

        assert_eq!(session.training_status, TrainingStatus::PricePending);
        assert_eq!(session.session_price, Some(3.0));
        assert_eq!(session.curr_round, 1);

        let clients = store.clients(session.id).await.unwrap();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].user_id, admin);
        assert_eq!(clients[0].status, ClientStatus::Joined);
    }

    #[tokio::test]
    async fn pricing_failures_abort_creation() {
        let (manager, store) = manager().await;
        let mut info = federated_info();
        info.as_object_mut().unwrap().remove("std_mean");

        let error = manager
            .create_session(UserId::new(), info, None)
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            ManagerError::Pricing(PricingError::MissingStatistic("std_mean"))
        ));
        assert!(store.sessions().await.unwrap().is_empty());

        let mut info = federated_info();
        *info.get_mut("benchmark_id").unwrap() = json!("no-such-benchmark");
        let error = manager
            .create_session(UserId::new(), info, None)
            .await
            .unwrap_err();
        assert!(matches!(error, ManagerError::UnknownBenchmark(_)));
    }

    #[tokio::test]
    async fn client_decisions_are_idempotent_upserts() {
        let (manager, store) = manager().await;
        let session = manager
            .create_session(UserId::new(), federated_info(), None)
            .await
            .unwrap();
        let user = UserId::new();

        manager
            .record_client_decision(session.id, user, true, Some("10.0.0.2".to_string()))
            .await
            .unwrap();
        manager
            .record_client_decision(session.id, user, true, Some("10.9.9.9".to_string()))
            .await
            .unwrap();

        let client = store.client(session.id, user).await.unwrap().unwrap();
        assert_eq!(client.status, ClientStatus::Joined);
        // Repeated calls update the status only.
        assert_eq!(client.origin.as_deref(), Some("10.0.0.2"));
        assert_eq!(store.clients(session.id).await.unwrap().len(), 2);

        manager
            .record_client_decision(session.id, user, false, None)
            .await
            .unwrap();
        let client = store.client(session.id, user).await.unwrap().unwrap();
        assert_eq!(client.status, ClientStatus::Declined);
    }

    #[tokio::test]
    async fn handshake_ack_marks_the_client_ready() {
        let (manager, store) = manager().await;
        let admin = UserId::new();
        let session = manager
            .create_session(admin, federated_info(), None)
            .await
            .unwrap();

        manager
            .record_handshake_ack(session.id, admin, "local-7".to_string())
            .await
            .unwrap();
        let client = store.client(session.id, admin).await.unwrap().unwrap();
        assert_eq!(client.status, ClientStatus::ReadyForRound);
        assert_eq!(client.local_model_id.as_deref(), Some("local-7"));

        let error = manager
            .record_handshake_ack(session.id, UserId::new(), "local-8".to_string())
            .await
            .unwrap_err();
        assert!(matches!(error, ManagerError::UnknownClient { .. }));
    }

    #[tokio::test]
    async fn only_recorded_clients_may_submit_parameters() {
        let (manager, store) = manager().await;
        let admin = UserId::new();
        let session = manager
            .create_session(admin, federated_info(), None)
            .await
            .unwrap();
        let update: ParameterTree = serde_json::from_value(json!({ "weights": [1.0] })).unwrap();

        let error = manager
            .submit_client_parameters(session.id, UserId::new(), update.clone())
            .await
            .unwrap_err();
        assert!(matches!(error, ManagerError::UnknownClient { .. }));

        manager
            .submit_client_parameters(session.id, admin, update)
            .await
            .unwrap();
        let session = store.session(session.id).await.unwrap().unwrap();
        assert_eq!(session.client_parameters.len(), 1);
    }

    #[tokio::test]
    async fn visibility_covers_open_sessions_and_own_sessions() {
        let (manager, store) = manager().await;
        let admin = UserId::new();
        let stranger = UserId::new();

        let open = manager
            .create_session(admin, federated_info(), None)
            .await
            .unwrap();
        let mut expired = manager
            .create_session(admin, federated_info(), None)
            .await
            .unwrap();
        expired.wait_till = Utc::now() - chrono::Duration::minutes(1);
        store.save_session(&expired).await.unwrap();

        let visible = manager.sessions_visible_to(stranger).await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, open.id);
        assert_eq!(visible[0].name.as_deref(), Some("test-org"));

        // The admin keeps seeing the expired session, newest first.
        let visible = manager.sessions_visible_to(admin).await.unwrap();
        let ids: Vec<SessionId> = visible.iter().map(|summary| summary.id).collect();
        assert_eq!(ids, vec![expired.id, open.id]);

        let error = manager
            .session(SessionId::new())
            .await
            .unwrap_err();
        assert!(matches!(error, ManagerError::NotFound(_)));
    }
}
