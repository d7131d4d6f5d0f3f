use std::pin::pin;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;

/// A wait-group-style counter for tasks that have been accepted but not yet
/// fully settled (queued, mid-enqueue, or executing).
///
/// Every `add` must be matched by exactly one `settle`, on whichever path
/// the task ends up taking: executed (after its completion hook), dropped by
/// a losing enqueue race, or discarded from the queue during shutdown.
/// `wait` suspends until the count reaches zero.
#[derive(Debug, Default)]
pub(crate) struct PendingCounter {
  count: AtomicUsize,
  zero: Notify,
}

impl PendingCounter {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  pub(crate) fn add(&self) {
    self.count.fetch_add(1, Ordering::SeqCst);
  }

  /// Decrements the counter, waking any `wait`ers on the 1 -> 0 transition.
  pub(crate) fn settle(&self) {
    let previous = self.count.fetch_sub(1, Ordering::SeqCst);
    debug_assert!(previous != 0, "pending counter underflow");
    if previous == 1 {
      self.zero.notify_waiters();
    }
  }

  pub(crate) fn get(&self) -> usize {
    self.count.load(Ordering::SeqCst)
  }

  /// Suspends until the count is zero. Returns immediately if it already is.
  pub(crate) async fn wait(&self) {
    loop {
      // Register interest before re-checking the count, so a `settle` that
      // lands between the check and the await cannot be missed.
      let mut notified = pin!(self.zero.notified());
      notified.as_mut().enable();

      if self.count.load(Ordering::SeqCst) == 0 {
        return;
      }
      notified.await;
    }
  }
}
