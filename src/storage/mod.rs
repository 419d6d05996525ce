//! Storage API.
//!
//! The engine treats persistence as an external collaborator behind narrow
//! async traits. Every read reflects the latest committed state; the
//! coordinator re-reads before evaluating any wait predicate and holds no
//! authoritative in-memory copy across polls.

mod in_memory;
mod traits;

pub use self::{
    in_memory::InMemoryStore,
    traits::{Benchmark, BenchmarkStorage, MetricStats, SessionStorage, StorageError, StorageResult},
};
