//! A Tokio-based worker pool that executes submitted tasks at most once,
//! with non-blocking submission, bounded queuing and a one-shot shutdown
//! that can either abandon or flush outstanding work.

mod error;
mod notify;
mod pending;
mod pool;
mod task;

pub use error::PoolError;
pub use notify::{Delivery, DeliveryHandle, HttpNotifyTask, MessageSender, NotifyError};
pub use pool::TaskPool;
pub use task::{Task, TaskError};
