//! Typed messages fanned out to clients.
//!
//! Delivery is an external concern (server-sent events, queues, whatever the
//! embedding service uses); the engine only depends on "enqueue message for
//! users X". Fan-out is fire-and-forget and at-least-once: the engine never
//! gets an acknowledgment back, it observes progress indirectly by polling
//! client state in the session store.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    sessions::{SessionId, UserId},
    storage::StorageResult,
};

/// A message sent to clients over the notification channel.
///
/// The `type` tags are part of the external wire contract and must not be
/// renamed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutboundMessage {
    /// A new session exists; recipients may join until `valid_until`.
    #[serde(rename = "new-session")]
    NewSession {
        session_id: SessionId,
        valid_until: DateTime<Utc>,
    },
    /// The model config for a session the recipient joined. Receiving this
    /// starts the client-side background process.
    #[serde(rename = "get_model_parameters_start_background_process")]
    ModelConfig {
        data: serde_json::Value,
        session_id: SessionId,
    },
    /// The per-round training signal.
    #[serde(rename = "start_training")]
    StartTraining {
        data: StartTrainingData,
        session_id: SessionId,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartTrainingData {
    pub model_config: serde_json::Value,
    pub local_model_id: String,
}

/// One-way fan-out of typed messages to sets of users.
#[async_trait]
pub trait Notifier
where
    Self: Clone + Send + Sync + 'static,
{
    /// Enqueues the message for each of the given users.
    async fn notify(&self, users: &[UserId], message: &OutboundMessage) -> StorageResult<()>;

    /// Enqueues the message for every user active within the last 24 hours,
    /// except the excluded ones, with a delivery validity bound.
    async fn broadcast_recent(
        &self,
        message: &OutboundMessage,
        valid_until: DateTime<Utc>,
        excluded: &[UserId],
    ) -> StorageResult<()>;
}

/// A recorded delivery, as kept by the [`InMemoryNotifier`].
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub user: UserId,
    pub message: OutboundMessage,
    pub valid_until: Option<DateTime<Utc>>,
}

/// An in-process notifier that records deliveries instead of sending them.
///
/// Used by the standalone binary and the protocol tests.
#[derive(Clone, Default)]
pub struct InMemoryNotifier {
    inner: Arc<Mutex<NotifierInner>>,
}

#[derive(Default)]
struct NotifierInner {
    last_seen: HashMap<UserId, DateTime<Utc>>,
    deliveries: Vec<Delivery>,
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that a user was just active, making them eligible for
    /// broadcasts.
    pub fn mark_active(&self, user: UserId) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_seen.insert(user, Utc::now());
    }

    /// Returns every delivery recorded so far.
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.inner.lock().unwrap().deliveries.clone()
    }

    /// Returns the recorded deliveries addressed to one user.
    pub fn deliveries_for(&self, user: UserId) -> Vec<Delivery> {
        self.inner
            .lock()
            .unwrap()
            .deliveries
            .iter()
            .filter(|delivery| delivery.user == user)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Notifier for InMemoryNotifier {
    async fn notify(&self, users: &[UserId], message: &OutboundMessage) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        for user in users {
            inner.deliveries.push(Delivery {
                user: *user,
                message: message.clone(),
                valid_until: None,
            });
        }
        Ok(())
    }

    async fn broadcast_recent(
        &self,
        message: &OutboundMessage,
        valid_until: DateTime<Utc>,
        excluded: &[UserId],
    ) -> StorageResult<()> {
        let cutoff = Utc::now() - Duration::hours(24);
        let mut inner = self.inner.lock().unwrap();
        let recipients: Vec<UserId> = inner
            .last_seen
            .iter()
            .filter(|(user, last_seen)| **last_seen >= cutoff && !excluded.contains(*user))
            .map(|(user, _)| *user)
            .collect();
        for user in recipients {
            inner.deliveries.push(Delivery {
                user,
                message: message.clone(),
                valid_until: Some(valid_until),
            });
        }
        Ok(())
    }
}
