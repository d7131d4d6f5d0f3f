use crate::error::PoolError;
use crate::pending::PendingCounter;
use crate::task::Task;

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use anyhow::anyhow;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// An internal message pairing a task with the guard that keeps it counted
/// as pending.
///
/// The guard settles the pool's pending counter when this message is
/// dropped, on whichever path the task dies: executed by a worker (after its
/// completion hook has run), dropped by a submission forwarder that lost the
/// race against cancellation, or discarded from the queue during shutdown.
/// Tying the decrement to `Drop` is what makes the counter immune to
/// double-settling when an enqueue and the cancellation signal are ready at
/// the same instant.
struct QueuedTask {
  task: Box<dyn Task>,
  _guard: PendingGuard,
}

struct PendingGuard {
  pending: Arc<PendingCounter>,
}

impl Drop for PendingGuard {
  fn drop(&mut self) {
    self.pending.settle();
  }
}

/// A fixed-size pool of workers draining a bounded queue of [`Task`]s.
///
/// Submission via [`add_task`](Self::add_task) never blocks the caller:
/// each call spawns a short-lived forwarder that races the enqueue against
/// the pool's cancellation signal. [`stop`](Self::stop) shuts the pool down
/// exactly once, either abandoning queued work or flushing it first.
pub struct TaskPool {
  name: Arc<String>,
  task_tx: kanal::AsyncSender<QueuedTask>,
  // Retained for draining abandoned entries at shutdown.
  task_rx: kanal::AsyncReceiver<QueuedTask>,
  cancel: CancellationToken,
  stopped: AtomicBool,
  pending: Arc<PendingCounter>,
  tokio_handle: TokioHandle,
  worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskPool {
  /// Creates a pool with `worker_count` workers and a queue of
  /// `queue_capacity` slots (0 means a rendezvous queue), spawning the
  /// workers on `tokio_handle` immediately.
  ///
  /// # Errors
  /// Returns [`PoolError::NoWorkers`] when `worker_count` is zero; nothing
  /// is spawned in that case.
  pub fn new(
    worker_count: usize,
    queue_capacity: usize,
    tokio_handle: TokioHandle,
    name: &str,
  ) -> Result<Arc<Self>, PoolError> {
    if worker_count == 0 {
      return Err(PoolError::NoWorkers);
    }

    let (task_tx, task_rx) = kanal::bounded_async::<QueuedTask>(queue_capacity);
    let pool = Arc::new(Self {
      name: Arc::new(name.to_string()),
      task_tx,
      task_rx: task_rx.clone(),
      cancel: CancellationToken::new(),
      stopped: AtomicBool::new(false),
      pending: Arc::new(PendingCounter::new()),
      tokio_handle: tokio_handle.clone(),
      worker_handles: Mutex::new(Vec::with_capacity(worker_count)),
    });

    let mut handles = pool.worker_handles.lock();
    for worker in 0..worker_count {
      let worker_name = pool.name.clone();
      let worker_rx = task_rx.clone();
      let worker_cancel = pool.cancel.clone();

      let join_handle = tokio_handle.spawn(
        Self::run_worker_loop(worker_name, worker, worker_rx, worker_cancel)
          .instrument(info_span!("pool_worker", pool = %name, worker)),
      );
      handles.push(join_handle);
    }
    drop(handles);

    info!(pool = %pool.name, worker_count, queue_capacity, "Task pool started.");
    Ok(pool)
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Number of tasks accepted but not yet settled (queued, mid-enqueue, or
  /// executing).
  pub fn pending_count(&self) -> usize {
    self.pending.get()
  }

  /// Number of tasks currently sitting in the queue.
  pub fn queued_count(&self) -> usize {
    self.task_tx.len()
  }

  /// Submits a task without blocking the caller.
  ///
  /// If the pool has been stopped the task is silently discarded: it is
  /// never executed and none of its hooks fire. Otherwise the task is
  /// counted as pending and handed to a forwarder that races the enqueue
  /// against the cancellation signal; losing that race drops the task but
  /// still settles the pending count.
  pub fn add_task(&self, task: Box<dyn Task>) {
    if self.stopped.load(AtomicOrdering::SeqCst) || self.cancel.is_cancelled() {
      debug!(pool = %self.name, "Submission to a stopped pool discarded.");
      return;
    }

    self.pending.add();
    let message = QueuedTask {
      task,
      _guard: PendingGuard {
        pending: self.pending.clone(),
      },
    };

    let forward_name = self.name.clone();
    let forward_tx = self.task_tx.clone();
    let forward_cancel = self.cancel.clone();

    self.tokio_handle.spawn(async move {
      tokio::select! {
        biased;

        _ = forward_cancel.cancelled() => {
          // Administrative drop: the message (and its pending guard) is
          // discarded without the task ever reaching the queue.
          debug!(pool = %forward_name, "Enqueue lost the race against cancellation, task dropped.");
        }
        sent = forward_tx.send(message) => {
          if sent.is_err() {
            debug!(pool = %forward_name, "Task queue closed during enqueue, task dropped.");
          }
        }
      }
    });
  }

  /// Stops the pool. Idempotent: concurrent or repeated calls have the
  /// effect of exactly one stop, and the cancellation signal fires once.
  ///
  /// With `wait` set, blocks until every accepted task has settled before
  /// cancelling, so all submitted work is accounted for (the flush). With
  /// `wait` unset, cancels immediately; queued tasks are discarded without
  /// executing and without their hooks firing, though their pending entries
  /// are still settled. Either way the pool is permanently inert once this
  /// returns.
  pub async fn stop(&self, wait: bool) {
    if !self.stopped.swap(true, AtomicOrdering::SeqCst) {
      info!(pool = %self.name, wait, "Stopping task pool.");
    } else {
      debug!(pool = %self.name, "Stop already requested, repeating shutdown sequence idempotently.");
    }

    if wait {
      trace!(pool = %self.name, "Flushing: waiting for pending tasks to settle.");
      self.pending.wait().await;
    }

    // One-shot broadcast; repeated cancels are no-ops.
    self.cancel.cancel();

    let handles: Vec<JoinHandle<()>> = {
      let mut guard = self.worker_handles.lock();
      guard.drain(..).collect()
    };
    for handle in handles {
      if let Err(join_error) = handle.await {
        error!(pool = %self.name, "Worker loop panicked: {:?}", join_error);
      }
    }

    // Discard whatever the workers abandoned. Dropping each message settles
    // its pending entry, so the counter cannot leak even without a flush.
    let mut discarded = 0usize;
    while let Ok(Some(message)) = self.task_rx.try_recv() {
      drop(message);
      discarded += 1;
    }
    if discarded > 0 {
      info!(pool = %self.name, discarded, "Discarded queued tasks on shutdown.");
    }
    let _ = self.task_tx.close();

    info!(pool = %self.name, "Task pool stopped.");
  }

  async fn run_worker_loop(
    pool_name: Arc<String>,
    worker: usize,
    task_rx: kanal::AsyncReceiver<QueuedTask>,
    cancel: CancellationToken,
  ) {
    info!(pool = %pool_name, worker, "Worker started.");

    loop {
      tokio::select! {
        biased;

        _ = cancel.cancelled() => {
          info!(pool = %pool_name, worker, "Cancellation signal received. Worker exiting.");
          break;
        }

        received = task_rx.recv() => {
          match received {
            Ok(message) => Self::run_task(&pool_name, worker, message).await,
            Err(_) => {
              info!(pool = %pool_name, worker, "Task queue closed. Worker exiting.");
              break;
            }
          }
        }
      }
    }
  }

  /// Executes one task to completion and fires exactly one of its hooks.
  /// The message's pending guard settles when it is dropped at the end.
  async fn run_task(pool_name: &str, worker: usize, message: QueuedTask) {
    let QueuedTask { mut task, _guard } = message;

    let execute_outcome = AssertUnwindSafe(task.execute()).catch_unwind().await;
    let hook_outcome = match execute_outcome {
      Ok(Ok(())) => {
        trace!(pool = %pool_name, worker, "Task executed successfully.");
        std::panic::catch_unwind(AssertUnwindSafe(|| task.on_done()))
      }
      Ok(Err(task_error)) => {
        debug!(pool = %pool_name, worker, error = %task_error, "Task reported a failure.");
        std::panic::catch_unwind(AssertUnwindSafe(|| task.on_failure(task_error)))
      }
      Err(_panic_payload) => {
        error!(pool = %pool_name, worker, "Task panicked during execution.");
        std::panic::catch_unwind(AssertUnwindSafe(|| {
          task.on_failure(anyhow!("task panicked during execution"))
        }))
      }
    };

    if hook_outcome.is_err() {
      warn!(pool = %pool_name, worker, "Task completion hook panicked.");
    }
  }
}

impl Drop for TaskPool {
  fn drop(&mut self) {
    // An explicit `stop` has already cancelled; otherwise signal the
    // workers so they don't outlive the pool. Never joins here.
    if !self.cancel.is_cancelled() {
      info!(pool = %self.name, "Task pool dropped without stop. Signalling workers to exit.");
      self.cancel.cancel();
      let _ = self.task_tx.close();
    }
  }
}
