//! Define an error type for the mprpc-proto crate.

use thiserror::Error;

/// An error produced while encoding or decoding MPRPC framing.
///
/// Every variant here is a *protocol* error in the taxonomy of the framework:
/// the owning connection is expected to report it upward and terminate the
/// link.  None of them is recoverable by retrying the same bytes.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// The input ended in the middle of a fixed-size object.
    #[error("object truncated at {at} bytes; needed {needed}")]
    Truncated {
        /// How many bytes were available.
        at: usize,
        /// How many bytes the object needed.
        needed: usize,
    },
    /// A packet header failed its sanity checks.
    #[error("invalid packet header")]
    InvalidPacketHeader,
    /// A frame named a multiplex index at or above the negotiated bound.
    #[error("message index {index} out of range (limit {limit})")]
    MessageIndexOutOfRange {
        /// The offending index.
        index: u32,
        /// The configured `max_message_count_multiplex`.
        limit: u32,
    },
    /// A frame carried a command byte this implementation cannot parse.
    #[error("unrecognized frame command {0}")]
    UnrecognizedCommand(u8),
    /// A compact-encoded integer was malformed.
    #[error("malformed compact integer")]
    BadCompactValue,
    /// An object would not fit in the space its container allows.
    #[error("object too large for its container")]
    TooLarge,
}
