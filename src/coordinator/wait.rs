//! The level-triggered wait primitive behind every coordinator poll site.
//!
//! Each wait of the round protocol is the same mechanism: re-read the
//! authoritative store, check a predicate, suspend for a fixed interval,
//! repeat. [`wait_for`] captures that once, with an optional deadline, so the
//! call sites that are unbounded by design are visibly so.

use std::{future::Future, time::Duration};

use displaydoc::Display;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::trace;

use crate::storage::StorageError;

/// An error returned by [`wait_for`].
#[derive(Debug, Display, Error)]
pub enum WaitError {
    /// the deadline elapsed before the condition held
    Timeout,
    /// re-reading authoritative state failed: {0}
    Storage(#[from] StorageError),
}

/// Blocks the calling task until `probe` yields a value, re-probing every
/// `interval`.
///
/// The probe must re-read authoritative state on every call rather than
/// capture a copy: another process may have mutated the record since the last
/// poll. With `deadline: None` the wait is unbounded; otherwise it fails with
/// [`WaitError::Timeout`] once the deadline has elapsed without the condition
/// holding.
pub async fn wait_for<T, P, F>(
    interval: Duration,
    deadline: Option<Duration>,
    mut probe: P,
) -> Result<T, WaitError>
where
    P: FnMut() -> F,
    F: Future<Output = Result<Option<T>, StorageError>>,
{
    let deadline = deadline.map(|limit| Instant::now() + limit);
    loop {
        if let Some(value) = probe().await? {
            return Ok(value);
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Err(WaitError::Timeout);
            }
        }
        trace!("condition does not hold yet, sleeping");
        sleep(interval).await;
    }
}
