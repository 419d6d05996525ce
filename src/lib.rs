//! # Fedmarket coordinator
//!
//! Fedmarket coordinates a marketplace for federated learning: an admin
//! proposes a training task, the session is priced in "required data points"
//! via a statistical power calculation, a pool of data-holding clients decide
//! whether to join, and the coordinator then drives synchronous training
//! rounds, aggregating every client's locally-trained model update into a new
//! global model with federated averaging.
//!
//! The crate is the orchestration engine only. Persistence, notification
//! delivery and model evaluation are narrow async traits implemented by the
//! embedding service (see [`storage`], [`notifications`] and [`evaluation`]);
//! the engine never interprets a model update beyond treating it as a nested
//! numeric [`ParameterTree`].
//!
//! [`ParameterTree`]: crate::aggregation::ParameterTree

pub mod aggregation;
pub mod coordinator;
pub mod evaluation;
pub mod notifications;
pub mod pricing;
pub mod sessions;
pub mod settings;
pub mod storage;
