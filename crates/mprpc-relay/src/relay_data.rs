//! The unit of forwarded bytes.

use bitflags::bitflags;
use bytes::Bytes;
use mprpc_proto::{MessageFlags, MessageHeader};

use crate::MessageId;

bitflags! {
    /// Position of a [`RelayData`] within its message.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct RelayDataFlags: u8 {
        /// First chunk of the message (or of the response leg); the
        /// message header travels with it.
        const FIRST = 1 << 0;
        /// Final chunk of the message.
        const LAST = 1 << 1;
    }
}

/// One unit of forwarded bytes plus its metadata.
///
/// The buffer inside is the property of the connection that produced it;
/// the engine moves it toward the receiving writer and back, and the sender
/// gets it returned through its done queue exactly once.  A `RelayData`
/// with no buffer and [`RelayDataFlags::LAST`] set is the synthetic marker
/// the engine plants for a canceled message, making the receiving writer
/// emit a cancel frame.
#[derive(Clone, Debug, Default)]
pub struct RelayData {
    /// The bytes, absent only on synthetic cancel markers.
    data: Option<Bytes>,
    /// Position of this chunk within its message.
    flags: RelayDataFlags,
    /// Copy of the owning message's flags at the time the chunk entered
    /// the engine.
    message_flags: MessageFlags,
}

impl RelayData {
    /// Return a chunk in the middle of a message.
    pub fn new(data: Bytes) -> Self {
        RelayData {
            data: Some(data),
            flags: RelayDataFlags::empty(),
            message_flags: MessageFlags::empty(),
        }
    }

    /// Return the final chunk of a message.
    pub fn last(data: Bytes) -> Self {
        RelayData {
            data: Some(data),
            flags: RelayDataFlags::LAST,
            message_flags: MessageFlags::empty(),
        }
    }

    /// Return the synthetic marker announcing a canceled message.
    pub(crate) fn cancel_marker() -> Self {
        RelayData {
            data: None,
            flags: RelayDataFlags::LAST,
            message_flags: MessageFlags::empty(),
        }
    }

    /// Return the bytes, if any.
    pub fn data(&self) -> Option<&Bytes> {
        self.data.as_ref()
    }

    /// Take the bytes out.
    pub(crate) fn take_data(&mut self) -> Option<Bytes> {
        self.data.take()
    }

    /// Return this chunk's position flags.
    pub fn flags(&self) -> RelayDataFlags {
        self.flags
    }

    /// Return the cached copy of the owning message's flags.
    pub fn message_flags(&self) -> MessageFlags {
        self.message_flags
    }

    /// True for the first chunk of a message leg.
    pub fn is_first(&self) -> bool {
        self.flags.contains(RelayDataFlags::FIRST)
    }

    /// True for the final chunk of a message.
    pub fn is_last(&self) -> bool {
        self.flags.contains(RelayDataFlags::LAST)
    }

    /// True for the synthetic cancel marker.
    pub fn is_cancel_marker(&self) -> bool {
        self.data.is_none() && self.is_last()
    }

    /// Mark this chunk as the first of its leg.
    pub(crate) fn set_first(&mut self) {
        self.flags |= RelayDataFlags::FIRST;
    }

    /// Cache the owning message's flags on this chunk.
    pub(crate) fn set_message_flags(&mut self, flags: MessageFlags) {
        self.message_flags = flags;
    }
}

/// What [`poll_new`](crate::RelayEngine::poll_new) offers the receiving
/// connection's writer: one chunk plus everything needed to frame it.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct RelayChunk {
    /// The chunk itself.
    pub relay_data: RelayData,
    /// The message header, present when this is the first chunk of a leg.
    pub header: Option<MessageHeader>,
    /// The engine's handle for the message; quote it back to
    /// [`complete`](crate::RelayEngine::complete).
    pub engine_msg_id: MessageId,
    /// The handle the receiving connection chose for its own bookkeeping,
    /// as previously reported through
    /// [`PushResult`](crate::PushResult).
    pub receiver_msg_id: MessageId,
}
