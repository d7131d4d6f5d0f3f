use crate::pool::TaskPool;
use crate::task::{Task, TaskError};

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::oneshot;
use tracing::debug;

/// Failure classes of a notification delivery.
#[derive(Error, Debug)]
pub enum NotifyError {
  #[error("building notification request failed: {0}")]
  Request(#[source] reqwest::Error),

  #[error("sending notification failed: {0}")]
  Transport(#[source] reqwest::Error),

  #[error("unexpected response status: {0}")]
  UnexpectedStatus(StatusCode),

  #[error("reading response body failed: {0}")]
  Body(#[source] reqwest::Error),

  /// The task was discarded by a pool shutdown before it could execute.
  #[error("notification task was dropped before execution")]
  Dropped,

  #[error(transparent)]
  Other(#[from] anyhow::Error),
}

/// The captured outcome of a successful delivery.
#[derive(Debug, Clone)]
pub struct Delivery {
  pub status: StatusCode,
  pub body: String,
}

/// A handle to a submitted notification.
///
/// Resolves once the task's completion hook has fired. If the pool dropped
/// the task without executing it, awaiting yields [`NotifyError::Dropped`].
#[derive(Debug)]
pub struct DeliveryHandle {
  receiver: oneshot::Receiver<Result<Delivery, NotifyError>>,
}

impl DeliveryHandle {
  pub async fn await_delivery(self) -> Result<Delivery, NotifyError> {
    match self.receiver.await {
      Ok(outcome) => outcome,
      // Sender dropped without a hook firing: the task never ran.
      Err(_) => Err(NotifyError::Dropped),
    }
  }
}

/// A [`Task`] that POSTs a plain-text message to a fixed URL.
///
/// `execute` succeeds only when the response arrives within the per-call
/// timeout and carries the expected status code; the full response body is
/// then captured. The completion hooks forward the outcome to the task's
/// [`DeliveryHandle`].
pub struct HttpNotifyTask {
  url: String,
  message: String,
  timeout: Option<Duration>,
  expected_status: StatusCode,
  client: reqwest::Client,
  delivery: Option<Delivery>,
  done_tx: Option<oneshot::Sender<Result<Delivery, NotifyError>>>,
}

impl HttpNotifyTask {
  pub fn new(
    url: String,
    message: String,
    timeout: Option<Duration>,
    expected_status: StatusCode,
    client: reqwest::Client,
  ) -> (Self, DeliveryHandle) {
    let (done_tx, receiver) = oneshot::channel();
    let task = Self {
      url,
      message,
      timeout,
      expected_status,
      client,
      delivery: None,
      done_tx: Some(done_tx),
    };
    (task, DeliveryHandle { receiver })
  }
}

#[async_trait]
impl Task for HttpNotifyTask {
  async fn execute(&mut self) -> Result<(), TaskError> {
    let mut builder = self
      .client
      .post(&self.url)
      .header(CONTENT_TYPE, "text/plain")
      .body(self.message.clone());
    if let Some(timeout) = self.timeout {
      builder = builder.timeout(timeout);
    }
    let request = builder.build().map_err(NotifyError::Request)?;

    debug!(url = %self.url, "Dispatching notification.");
    let response = self
      .client
      .execute(request)
      .await
      .map_err(NotifyError::Transport)?;

    let status = response.status();
    if status != self.expected_status {
      return Err(NotifyError::UnexpectedStatus(status).into());
    }

    let body = response.text().await.map_err(NotifyError::Body)?;
    self.delivery = Some(Delivery { status, body });
    Ok(())
  }

  fn on_done(&mut self) {
    if let (Some(tx), Some(delivery)) = (self.done_tx.take(), self.delivery.take()) {
      let _ = tx.send(Ok(delivery));
    }
  }

  fn on_failure(&mut self, error: TaskError) {
    if let Some(tx) = self.done_tx.take() {
      let error = error.downcast::<NotifyError>().unwrap_or_else(NotifyError::Other);
      let _ = tx.send(Err(error));
    }
  }
}

/// A thin factory that builds [`HttpNotifyTask`]s for a fixed URL and
/// forwards them to its own [`TaskPool`]. All concurrency guarantees come
/// from the pool; the sender adds none of its own.
pub struct MessageSender {
  url: String,
  expected_status: StatusCode,
  client: reqwest::Client,
  pool: Arc<TaskPool>,
}

impl MessageSender {
  /// Creates a sender whose pool has `workers` workers and a single queue
  /// slot. `expected_status` defaults to 200 when not given.
  pub fn new(
    url: &str,
    expected_status: Option<StatusCode>,
    workers: usize,
    tokio_handle: TokioHandle,
  ) -> anyhow::Result<Self> {
    let pool = TaskPool::new(workers, 1, tokio_handle, "message_sender")?;
    let client = reqwest::Client::builder()
      .build()
      .context("building notification HTTP client")?;
    Ok(Self {
      url: url.to_string(),
      expected_status: expected_status.unwrap_or(StatusCode::OK),
      client,
      pool,
    })
  }

  /// Submits a message for delivery without blocking. A `timeout` of `None`
  /// leaves the request without a deadline.
  pub fn send(&self, message: impl Into<String>, timeout: Option<Duration>) -> DeliveryHandle {
    let (task, handle) = HttpNotifyTask::new(
      self.url.clone(),
      message.into(),
      timeout,
      self.expected_status,
      self.client.clone(),
    );
    self.pool.add_task(Box::new(task));
    handle
  }

  /// Stops the underlying pool; with `wait` set, flushes all accepted
  /// deliveries first.
  pub async fn stop(&self, wait: bool) {
    self.pool.stop(wait).await;
  }
}
