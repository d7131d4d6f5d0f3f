use async_trait::async_trait;

/// The opaque error payload a task's `execute` reports on failure.
///
/// Failures are data for the task's own failure hook to consume, so the
/// pool never needs to inspect them beyond handing them over.
pub type TaskError = anyhow::Error;

/// A unit of work submitted to a [`TaskPool`](crate::TaskPool).
///
/// The producer owns the task until it is handed to
/// [`add_task`](crate::TaskPool::add_task); after that the pool owns it
/// exclusively. The worker that dequeues a task runs `execute` at most
/// once, then invokes exactly one completion hook on the same worker:
/// `on_done` if `execute` returned `Ok`, `on_failure` with the reported
/// error otherwise. A task discarded by a shutdown race is dropped without
/// any of the three operations being called.
#[async_trait]
pub trait Task: Send + 'static {
  /// Performs the work.
  async fn execute(&mut self) -> Result<(), TaskError>;

  /// Invoked after a successful `execute`.
  fn on_done(&mut self) {}

  /// Invoked with the error `execute` reported.
  fn on_failure(&mut self, error: TaskError) {
    let _ = error;
  }
}
