//! Define an error type for the mprpc-relay crate.

use thiserror::Error;

/// An error produced by the relay engine.
///
/// Stale-reference errors are part of normal operation: connections and
/// messages disappear underneath their peers all the time, and a caller
/// holding an outdated handle simply learns that the record is gone.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// The connection id names no live connection record.
    #[error("stale or unknown relay connection id")]
    StaleConnection,
    /// The message id names no live message record.
    #[error("stale or unknown message id")]
    StaleMessage,
    /// The message was canceled before the operation could apply.
    #[error("message was canceled")]
    MessageCanceled,
}
