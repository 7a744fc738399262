//! Define an error type for the mprpc-reactor crate.

use std::sync::Arc;

use thiserror::Error;

/// An error produced by the reactor substrate.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The scheduler was started with an unusable configuration.
    #[error("invalid scheduler configuration: {0}")]
    Configuration(&'static str),
    /// An operation arrived after the scheduler began shutting down.
    #[error("scheduler is shutting down")]
    ShuttingDown,
    /// A reactor thread could not be spawned.
    #[error("could not spawn reactor thread: {0}")]
    Spawn(#[source] Arc<std::io::Error>),
    /// A timer the actor relied on was discarded by the reactor.
    #[error("timer was cleared by the reactor")]
    TimerCleared,
}
