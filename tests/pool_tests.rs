use notify_pool::{PoolError, Task, TaskError, TaskPool};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::sleep;

// Helper to initialize tracing for tests; Once ensures it runs only once
// per test binary.
fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,notify_pool=trace"));

    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

#[derive(Default)]
struct TestTask {
  executed: Arc<AtomicUsize>,
  done: Arc<AtomicBool>,
  failure: Arc<Mutex<Option<String>>>,
  delay: Duration,
  fail_with: Option<String>,
  panic_on_execute: bool,
}

#[async_trait]
impl Task for TestTask {
  async fn execute(&mut self) -> Result<(), TaskError> {
    self.executed.fetch_add(1, Ordering::SeqCst);
    if !self.delay.is_zero() {
      sleep(self.delay).await;
    }
    if self.panic_on_execute {
      panic!("intentional test panic");
    }
    if let Some(message) = &self.fail_with {
      return Err(anyhow!(message.clone()));
    }
    Ok(())
  }

  fn on_done(&mut self) {
    self.done.store(true, Ordering::SeqCst);
  }

  fn on_failure(&mut self, error: TaskError) {
    *self.failure.lock() = Some(error.to_string());
  }
}

#[tokio::test]
async fn test_construction_rejects_zero_workers() {
  setup_tracing_for_test();

  let result = TaskPool::new(0, 4, tokio::runtime::Handle::current(), "test_pool_no_workers");
  assert!(matches!(result, Err(PoolError::NoWorkers)));
}

#[tokio::test]
async fn test_construction_and_repeated_stop() {
  setup_tracing_for_test();

  let pool = TaskPool::new(5, 0, tokio::runtime::Handle::current(), "test_pool_repeated_stop").unwrap();
  assert_eq!(pool.name(), "test_pool_repeated_stop");
  assert_eq!(pool.pending_count(), 0);

  pool.stop(false).await;
  pool.stop(false).await;
  pool.stop(true).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_flush_settles_every_task() {
  setup_tracing_for_test();

  let pool = TaskPool::new(5, 1, tokio::runtime::Handle::current(), "test_pool_flush").unwrap();

  let mut tasks = Vec::new();
  for _ in 0..10 {
    let task = TestTask::default();
    tasks.push((task.executed.clone(), task.done.clone(), task.failure.clone()));
    pool.add_task(Box::new(task));
  }

  pool.stop(true).await;

  for (executed, done, failure) in &tasks {
    assert_eq!(executed.load(Ordering::SeqCst), 1, "every accepted task runs exactly once");
    assert!(done.load(Ordering::SeqCst), "the done hook fires for every successful task");
    assert!(failure.lock().is_none());
  }
  assert_eq!(pool.pending_count(), 0);
  assert_eq!(pool.queued_count(), 0);
}

#[tokio::test]
async fn test_add_task_after_stop_is_noop() {
  setup_tracing_for_test();

  let pool = TaskPool::new(2, 4, tokio::runtime::Handle::current(), "test_pool_add_after_stop").unwrap();
  pool.stop(false).await;

  let task = TestTask::default();
  let executed = task.executed.clone();
  let done = task.done.clone();
  pool.add_task(Box::new(task));

  sleep(Duration::from_millis(100)).await;
  assert_eq!(executed.load(Ordering::SeqCst), 0, "a task submitted after stop never executes");
  assert!(!done.load(Ordering::SeqCst), "no hook fires for a rejected task");
  assert_eq!(pool.pending_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_stops_are_idempotent() {
  setup_tracing_for_test();

  let pool = TaskPool::new(3, 4, tokio::runtime::Handle::current(), "test_pool_concurrent_stop").unwrap();

  pool.add_task(Box::new(TestTask::default()));

  let mut stoppers = Vec::new();
  for i in 0..4 {
    let pool = pool.clone();
    stoppers.push(tokio::spawn(async move {
      pool.stop(i % 2 == 0).await;
    }));
  }
  for stopper in stoppers {
    stopper.await.unwrap();
  }

  // A further stop after the concurrent batch is still fine.
  pool.stop(true).await;
  assert_eq!(pool.pending_count(), 0);

  // The pool is inert now; late submissions are discarded.
  let late = TestTask::default();
  let late_executed = late.executed.clone();
  pool.add_task(Box::new(late));
  sleep(Duration::from_millis(50)).await;
  assert_eq!(late_executed.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_without_wait_abandons_queued_tasks() {
  setup_tracing_for_test();

  let pool = TaskPool::new(1, 8, tokio::runtime::Handle::current(), "test_pool_abandon").unwrap();

  let slow = TestTask {
    delay: Duration::from_millis(200),
    ..Default::default()
  };
  let slow_done = slow.done.clone();
  pool.add_task(Box::new(slow));

  let mut queued = Vec::new();
  for _ in 0..5 {
    let task = TestTask::default();
    queued.push((task.executed.clone(), task.done.clone()));
    pool.add_task(Box::new(task));
  }

  // Let the slow task start and the rest settle into the queue.
  sleep(Duration::from_millis(50)).await;

  pool.stop(false).await;

  assert!(slow_done.load(Ordering::SeqCst), "the in-flight task finishes before its worker exits");
  for (executed, done) in &queued {
    assert_eq!(executed.load(Ordering::SeqCst), 0, "abandoned tasks never execute");
    assert!(!done.load(Ordering::SeqCst), "abandoned tasks see no hook");
  }
  assert_eq!(pool.pending_count(), 0, "abandoned tasks still settle the pending count");
}

#[tokio::test]
async fn test_failure_hook_receives_execute_error() {
  setup_tracing_for_test();

  let pool = TaskPool::new(1, 4, tokio::runtime::Handle::current(), "test_pool_failure_hook").unwrap();

  let task = TestTask {
    fail_with: Some("boom".to_string()),
    ..Default::default()
  };
  let done = task.done.clone();
  let failure = task.failure.clone();
  pool.add_task(Box::new(task));

  pool.stop(true).await;

  assert!(!done.load(Ordering::SeqCst), "on_done must not fire for a failed task");
  let recorded = failure.lock().clone();
  assert_eq!(recorded.as_deref(), Some("boom"));
}

#[tokio::test]
async fn test_panicking_task_is_contained() {
  setup_tracing_for_test();

  let pool = TaskPool::new(1, 4, tokio::runtime::Handle::current(), "test_pool_panic").unwrap();

  let bad = TestTask {
    panic_on_execute: true,
    ..Default::default()
  };
  let bad_failure = bad.failure.clone();
  pool.add_task(Box::new(bad));

  // The single worker must survive the panic and keep serving.
  let good = TestTask::default();
  let good_done = good.done.clone();
  pool.add_task(Box::new(good));

  pool.stop(true).await;

  assert!(good_done.load(Ordering::SeqCst), "the worker keeps serving after a task panic");
  let recorded = bad_failure.lock().clone();
  assert!(
    recorded.as_deref().is_some_and(|message| message.contains("panicked")),
    "the panicking task's failure hook reports the panic, got {:?}",
    recorded
  );
  assert_eq!(pool.pending_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tasks_execute_exactly_once_across_workers() {
  setup_tracing_for_test();

  let pool = TaskPool::new(4, 2, tokio::runtime::Handle::current(), "test_pool_exactly_once").unwrap();
  let total = Arc::new(AtomicUsize::new(0));

  let mut counters = Vec::new();
  for _ in 0..20 {
    let task = TestTask {
      executed: total.clone(),
      delay: Duration::from_millis(5),
      ..Default::default()
    };
    counters.push(task.done.clone());
    pool.add_task(Box::new(task));
  }

  pool.stop(true).await;

  assert_eq!(total.load(Ordering::SeqCst), 20, "each task executes exactly once");
  for done in &counters {
    assert!(done.load(Ordering::SeqCst));
  }
  assert_eq!(pool.pending_count(), 0);
}
