//! The per-session round coordinator.
//!
//! One [`RoundCoordinator`] runs as a long-lived task per active session and
//! drives it from price confirmation to completion:
//!
//! 1. wait (bounded) for the admin to accept the quoted price,
//! 2. broadcast the new session to recently-active users,
//! 3. wait for every invited client's join decision and the join deadline,
//! 4. hand the model config to the joined clients and wait for their
//!    handshake acknowledgment,
//! 5. run `max_round` training rounds, each collecting every participant's
//!    parameters before aggregating them into the new global model,
//! 6. persist the per-round evaluation results and mark the session
//!    completed.
//!
//! Except for the price-confirmation wait, all waits are unbounded: a client
//! that never completes a step stalls its session. Coordinators of different
//! sessions share no mutable state, so a stalled or failed session never
//! affects another.

pub mod wait;

#[cfg(test)]
mod tests;

use std::{collections::HashMap, time::Duration};

use anyhow::anyhow;
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    aggregation::{self, AggregationError, ParameterTree},
    evaluation::Evaluator,
    notifications::{Notifier, OutboundMessage, StartTrainingData},
    sessions::{ClientStatus, RoundResult, Session, SessionId, TrainingStatus, UserId},
    settings::ProtocolSettings,
    storage::{SessionStorage, StorageError},
};

use self::wait::{wait_for, WaitError};

/// An error that aborts a session's coordinator.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// The admin neither accepted nor rejected the price within the
    /// confirmation window. The session never starts and no client is ever
    /// notified.
    #[error("the price decision did not arrive within the confirmation window")]
    PriceConfirmationTimeout,
    #[error("the admin rejected the session price")]
    PriceRejected,
    #[error(transparent)]
    Aggregation(#[from] AggregationError),
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
}

impl From<WaitError> for CoordinatorError {
    fn from(error: WaitError) -> Self {
        match error {
            // Only the price-confirmation wait carries a deadline.
            WaitError::Timeout => CoordinatorError::PriceConfirmationTimeout,
            WaitError::Storage(error) => CoordinatorError::Storage(error),
        }
    }
}

/// Drives one session through the pricing, recruitment and training protocol.
pub struct RoundCoordinator<S, N, E> {
    session_id: SessionId,
    store: S,
    notifier: N,
    evaluator: E,
    protocol: ProtocolSettings,
}

impl<S, N, E> RoundCoordinator<S, N, E>
where
    S: SessionStorage,
    N: Notifier,
    E: Evaluator,
{
    pub fn new(
        session_id: SessionId,
        store: S,
        notifier: N,
        evaluator: E,
        protocol: ProtocolSettings,
    ) -> Self {
        Self {
            session_id,
            store,
            notifier,
            evaluator,
            protocol,
        }
    }

    /// Runs the session to completion.
    ///
    /// The price has already been quoted and persisted by the session
    /// manager; this task begins by waiting for the admin's verdict.
    pub async fn run(self) -> Result<(), CoordinatorError> {
        self.await_price_acceptance().await?;
        info!("price accepted, recruiting clients");
        self.broadcast_new_session().await?;
        self.await_join_decisions().await?;
        info!("all clients have decided");
        self.deliver_model_configs().await?;
        let results = self.run_rounds().await?;
        self.complete(results).await?;
        info!("session completed");
        Ok(())
    }

    fn interval(&self) -> Duration {
        self.protocol.poll_interval()
    }

    async fn load_session(&self) -> Result<Session, StorageError> {
        self.store
            .session(self.session_id)
            .await?
            .ok_or_else(|| anyhow!("session {} not found", self.session_id))
    }

    /// Waits (bounded) until the admin has accepted or rejected the price.
    async fn await_price_acceptance(&self) -> Result<(), CoordinatorError> {
        debug!("waiting for the admin's price decision");
        let status = wait_for(
            self.interval(),
            Some(self.protocol.price_timeout()),
            || async move {
                let session = self.load_session().await?;
                Ok(match session.training_status {
                    TrainingStatus::PriceAccepted | TrainingStatus::PriceRejected => {
                        Some(session.training_status)
                    }
                    _ => None,
                })
            },
        )
        .await?;

        match status {
            TrainingStatus::PriceAccepted => Ok(()),
            _ => Err(CoordinatorError::PriceRejected),
        }
    }

    /// Tells every recently-active user (minus the admin) that the session
    /// exists. A single fire-and-forget fan-out, not part of any wait loop.
    async fn broadcast_new_session(&self) -> Result<(), CoordinatorError> {
        let session = self.load_session().await?;
        let message = OutboundMessage::NewSession {
            session_id: session.id,
            valid_until: session.wait_till,
        };
        self.notifier
            .broadcast_recent(&message, session.wait_till, &[session.admin_id])
            .await?;
        Ok(())
    }

    /// Waits until the join window has closed: the deadline has passed *and*
    /// no recorded client is still undecided. Both conditions are required; a
    /// client who answers early does not shorten the window, and one who
    /// never answers holds it open past the deadline.
    async fn await_join_decisions(&self) -> Result<(), CoordinatorError> {
        debug!("waiting for join decisions");
        wait_for(self.interval(), None, || async move {
            let session = self.load_session().await?;
            let clients = self.store.clients(self.session_id).await?;
            let all_decided = clients
                .iter()
                .all(|client| client.status != ClientStatus::Undecided);
            let window_closed = Utc::now() > session.wait_till;
            Ok((all_decided && window_closed).then(|| ()))
        })
        .await?;
        Ok(())
    }

    /// Sends the model config to every joined client, then waits until each
    /// of them has registered a local model id (the handshake ack).
    async fn deliver_model_configs(&self) -> Result<(), CoordinatorError> {
        let session = self.load_session().await?;
        let joined: Vec<UserId> = self
            .store
            .clients(self.session_id)
            .await?
            .into_iter()
            .filter(|client| client.status == ClientStatus::Joined)
            .map(|client| client.user_id)
            .collect();

        info!(clients = joined.len(), "delivering the model config");
        let message = OutboundMessage::ModelConfig {
            data: session.federated_info.clone(),
            session_id: session.id,
        };
        self.notifier.notify(&joined, &message).await?;

        debug!("waiting for handshake acknowledgments");
        wait_for(self.interval(), None, || {
            let joined = joined.clone();
            async move {
                let clients = self.store.clients(self.session_id).await?;
                let acked: HashMap<UserId, bool> = clients
                    .iter()
                    .map(|client| (client.user_id, client.local_model_id.is_some()))
                    .collect();
                let all_acked = joined
                    .iter()
                    .all(|user| acked.get(user).copied().unwrap_or(false));
                Ok(all_acked.then(|| ()))
            }
        })
        .await?;
        Ok(())
    }

    /// Runs all training rounds, returning the per-round evaluation results.
    async fn run_rounds(&self) -> Result<Vec<RoundResult>, CoordinatorError> {
        let session = self.load_session().await?;
        self.store
            .set_training_status(self.session_id, TrainingStatus::Training)
            .await?;

        let mut results = Vec::with_capacity(session.max_round as usize);
        for round in 1..=session.max_round {
            self.store.set_curr_round(self.session_id, round).await?;
            info!(round, max_round = session.max_round, "starting round");

            let participants = self.signal_training_start().await?;
            let submissions = self.collect_submissions(participants).await?;

            let global = aggregation::federated_average(&submissions)?;
            self.store
                .set_global_parameters(self.session_id, &global)
                .await?;
            info!(round, clients = submissions.len(), "aggregated parameters");

            let session = self.load_session().await?;
            let metrics = self
                .evaluator
                .evaluate(&session.federated_info, &global)
                .await?;
            results.push(RoundResult { round, metrics });

            self.store
                .clear_client_parameters(self.session_id)
                .await?;
        }
        Ok(results)
    }

    /// Sends the per-round `start_training` signal to every ready client and
    /// returns how many were signalled.
    async fn signal_training_start(&self) -> Result<usize, CoordinatorError> {
        let session = self.load_session().await?;
        let ready: Vec<_> = self
            .store
            .clients(self.session_id)
            .await?
            .into_iter()
            .filter(|client| client.status == ClientStatus::ReadyForRound)
            .collect();

        for client in &ready {
            let local_model_id = client.local_model_id.clone().ok_or_else(|| {
                anyhow!(
                    "client {} is ready for the round but has no local model id",
                    client.user_id
                )
            })?;
            let message = OutboundMessage::StartTraining {
                data: StartTrainingData {
                    model_config: session.federated_info.clone(),
                    local_model_id,
                },
                session_id: session.id,
            };
            self.notifier.notify(&[client.user_id], &message).await?;
        }
        Ok(ready.len())
    }

    /// Waits until every signalled participant has submitted its parameters
    /// for the current round, then returns the submissions.
    async fn collect_submissions(
        &self,
        participants: usize,
    ) -> Result<HashMap<UserId, ParameterTree>, CoordinatorError> {
        debug!(participants, "waiting for local model updates");
        let submissions = wait_for(self.interval(), None, || async move {
            let session = self.load_session().await?;
            let received = session.client_parameters.len();
            if received < participants {
                debug!(received, participants, "still waiting for submissions");
                return Ok(None);
            }
            Ok(Some(session.client_parameters))
        })
        .await?;
        Ok(submissions)
    }

    async fn complete(&self, results: Vec<RoundResult>) -> Result<(), CoordinatorError> {
        self.evaluator
            .persist_results(self.session_id, &results)
            .await?;
        self.store
            .set_training_status(self.session_id, TrainingStatus::Completed)
            .await?;
        Ok(())
    }
}

/// Runs a coordinator to completion, logging the outcome. Meant to be
/// `tokio::spawn`ed by the session manager.
pub async fn supervise<S, N, E>(coordinator: RoundCoordinator<S, N, E>)
where
    S: SessionStorage,
    N: Notifier,
    E: Evaluator,
{
    match coordinator.run().await {
        Ok(()) => {}
        Err(CoordinatorError::PriceConfirmationTimeout) => {
            warn!("aborting session: the price was never confirmed");
        }
        Err(CoordinatorError::PriceRejected) => {
            warn!("aborting session: the price was rejected");
        }
        Err(error) => {
            tracing::error!(%error, "session coordinator failed");
        }
    }
}
