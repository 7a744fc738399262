//! Define an error type for the mprpc-threadpool crate.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// An error produced by the thread pool.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The pool was started with an unusable configuration.
    #[error("invalid pool configuration: {0}")]
    Configuration(&'static str),
    /// A submission arrived after [`stop`](crate::ThreadPool::stop).
    #[error("pool is shutting down")]
    ShuttingDown,
    /// A worker thread could not be spawned.
    #[error("could not spawn worker thread: {0}")]
    Spawn(#[source] Arc<std::io::Error>),
}

/// The task rejected by [`try_push_one`](crate::ThreadPool::try_push_one),
/// together with the reason.
#[derive(Error)]
#[non_exhaustive]
pub enum TryPushError<T> {
    /// Every slot of the ring is occupied.
    #[error("pool is at capacity")]
    Full(T),
    /// The pool no longer accepts submissions.
    #[error("pool is shutting down")]
    ShuttingDown(T),
}

impl<T> TryPushError<T> {
    /// Take the rejected task back.
    pub fn into_inner(self) -> T {
        match self {
            TryPushError::Full(task) | TryPushError::ShuttingDown(task) => task,
        }
    }
}

// Manual impl: tasks are usually closures, which are not Debug.
impl<T> fmt::Debug for TryPushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TryPushError::Full(_) => write!(f, "TryPushError::Full(..)"),
            TryPushError::ShuttingDown(_) => write!(f, "TryPushError::ShuttingDown(..)"),
        }
    }
}
