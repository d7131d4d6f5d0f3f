use thiserror::Error;

/// Errors surfaced by [`TaskPool`](crate::TaskPool) construction.
///
/// These are the only pool faults reported synchronously to a caller.
/// Task-level failures stay inside the task that produced them (via its
/// failure hook) and never escalate to the pool.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PoolError {
  #[error("attempting to create a task pool with less than 1 worker")]
  NoWorkers,
}
