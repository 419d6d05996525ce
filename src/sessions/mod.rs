//! Session data model and the [`SessionManager`].

mod manager;

pub use manager::{ManagerError, SessionDetails, SessionManager};

use std::{collections::HashMap, convert::TryFrom};

use chrono::{DateTime, Utc};
use derive_more::Display;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::aggregation::ParameterTree;

#[derive(Eq, PartialEq, Hash, Debug, Copy, Clone, Display, Serialize, Deserialize)]
/// A unique session identifier.
pub struct SessionId(Uuid);

impl SessionId {
    /// Returns a new random session identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Eq, PartialEq, Hash, Debug, Copy, Clone, Display, Serialize, Deserialize)]
/// A unique user identifier.
pub struct UserId(Uuid);

impl UserId {
    /// Returns a new random user identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

/// The session-level lifecycle state.
///
/// Encoded as a signed integer on the wire: the price rejection is the only
/// negative value, everything else counts up through the lifecycle.
#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(i8)]
pub enum TrainingStatus {
    /// The admin rejected the quoted price. Terminal.
    PriceRejected = -1,
    /// A price has been quoted and the admin has not decided yet.
    PricePending = 1,
    /// The admin accepted the price; recruitment may begin.
    PriceAccepted = 2,
    /// Training rounds are running.
    Training = 3,
    /// All rounds have completed and results are persisted. Terminal.
    Completed = 4,
}

/// The per-client participation state, independent of the session-level
/// [`TrainingStatus`] but causally linked to it.
#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ClientStatus {
    /// Invited but has not answered yet.
    Undecided = 1,
    /// Agreed to participate.
    Joined = 2,
    /// Declined to participate. Terminal for this client.
    Declined = 3,
    /// Fetched the round's model config and acknowledged it is about to train.
    ReadyForRound = 4,
}

macro_rules! impl_status_serde {
    ($status:ty, $repr:ty) => {
        impl Serialize for $status {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                <$repr>::from(*self).serialize(serializer)
            }
        }

        impl<'de> Deserialize<'de> for $status {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let value = <$repr>::deserialize(deserializer)?;
                Self::try_from(value).map_err(de::Error::custom)
            }
        }
    };
}

impl_status_serde!(TrainingStatus, i8);
impl_status_serde!(ClientStatus, u8);

/// One federated task, coordinated across multiple rounds.
///
/// The record held by the session store is the single source of truth: the
/// coordinator re-reads it at every poll and holds no authoritative copy in
/// between.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    /// The creating user. Owns the price decision.
    pub admin_id: UserId,
    /// Opaque model/dataset description, consumed by the local-model side.
    /// The engine only reads the pricing fields (`std_mean`, `std_deviation`,
    /// `benchmark_id`, `model_info.input_shape`).
    pub federated_info: serde_json::Value,
    pub curr_round: u32,
    pub max_round: u32,
    pub training_status: TrainingStatus,
    /// The required data points per client, set once before anyone is invited.
    pub session_price: Option<f64>,
    /// The aggregated global model; present once the first round completed.
    pub global_parameters: Option<ParameterTree>,
    /// The current round's submissions only; reset when a round ends.
    pub client_parameters: HashMap<UserId, ParameterTree>,
    /// Deadline of the join-decision window.
    pub wait_till: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        admin_id: UserId,
        federated_info: serde_json::Value,
        max_round: u32,
        wait_till: DateTime<Utc>,
    ) -> Self {
        Self {
            id: SessionId::new(),
            admin_id,
            federated_info,
            curr_round: 1,
            max_round,
            training_status: TrainingStatus::PricePending,
            session_price: None,
            global_parameters: None,
            client_parameters: HashMap::new(),
            wait_till,
            created_at: Utc::now(),
        }
    }
}

/// One user's participation record in one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClient {
    pub user_id: UserId,
    pub session_id: SessionId,
    pub status: ClientStatus,
    /// Opaque reference the client supplies once it has fetched the model
    /// config and prepared to train.
    pub local_model_id: Option<String>,
    /// Where the client's decision came from.
    pub origin: Option<String>,
}

/// Read-only projection of a session for listing endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub training_status: TrainingStatus,
    /// Display name, taken from `federated_info.organisation_name`.
    pub name: Option<String>,
}

/// The evaluation output of one completed round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundResult {
    pub round: u32,
    pub metrics: serde_json::Value,
}
