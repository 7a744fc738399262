//! Engine-internal records: message, connection, and relay-data stubs.
//!
//! Records cross-reference each other freely (a message points at two
//! connections, each connection lists many messages), so nothing here owns
//! anything else.  Every reference is a pool index, generation-protected
//! where it crosses the engine boundary, and cycles dissolve by clearing.

use mprpc_base::inner_list::{InnerList, InnerNode, Link, NIL};
use mprpc_base::{ActorId, Generation, UniqueId};
use mprpc_proto::{MessageFlags, MessageHeader, RelayName};

use crate::relay_data::RelayData;
use crate::MessageId;

/// Link family index for receive lists (and nothing else).
pub(crate) const LINK_RECV: usize = 0;

/// Link family index for send lists; also reused by the message cache
/// list, since a cached message is on nobody's send list.
pub(crate) const LINK_SEND: usize = 1;

/// A list threading the receive-link family of the message pool.
pub(crate) type RecvList = InnerList<LINK_RECV>;

/// A list threading the send-link family of the message pool.
pub(crate) type SendList = InnerList<LINK_SEND>;

/// Lifecycle of one relayed message.
///
/// Transitions not drawn here are rejected by the engine rather than left
/// undefined.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum MessageState {
    /// On the free list.
    Cache,
    /// Chunks flowing sender → receiver (either leg).
    Relay,
    /// Last request chunk delivered; parked until the response arrives.
    WaitResponse,
    /// Receiver gave up; parked at the front of the sender's send list so
    /// its writer emits a cancel request.
    RecvCancel,
    /// Sender gave up; a synthetic marker rides the receiver's queue so
    /// its writer emits a cancel frame.
    SendCancel,
}

/// Engine-internal record for one in-flight relayed message.
pub(crate) struct MessageStub {
    /// Where the message is in its lifecycle.
    pub(crate) state: MessageState,
    /// Head of this message's FIFO of relay-data records, or [`NIL`].
    pub(crate) front: usize,
    /// Tail of the FIFO, or [`NIL`].  `front == NIL ⇔ back == NIL`.
    pub(crate) back: usize,
    /// Generation; bumped on every clear.
    pub(crate) unique: Generation,
    /// Engine id of the connection currently feeding chunks in.
    pub(crate) sender_con_id: UniqueId,
    /// Engine id of the connection the chunks flow toward.
    pub(crate) receiver_con_id: UniqueId,
    /// Handle the receiving connection chose for its own bookkeeping.
    pub(crate) receiver_msg_id: MessageId,
    /// The message header, request ids already swapped into stub form.
    pub(crate) header: MessageHeader,
    /// Flags of the most recent header seen for this message; cached onto
    /// every later chunk.
    pub(crate) last_message_flags: MessageFlags,
    /// Links for the recv- and send-list families.
    links: [Link; 2],
}

impl Default for MessageStub {
    fn default() -> Self {
        MessageStub {
            state: MessageState::Relay,
            front: NIL,
            back: NIL,
            unique: 0,
            sender_con_id: UniqueId::invalid(),
            receiver_con_id: UniqueId::invalid(),
            receiver_msg_id: MessageId::invalid(),
            header: MessageHeader::default(),
            last_message_flags: MessageFlags::empty(),
            links: [Link::unlinked(), Link::unlinked()],
        }
    }
}

impl InnerNode for MessageStub {
    fn inner_link(&self, which: usize) -> &Link {
        &self.links[which]
    }
    fn inner_link_mut(&mut self, which: usize) -> &mut Link {
        &mut self.links[which]
    }
}

impl MessageStub {
    /// Reset for reuse, invalidating every id pointing here.
    pub(crate) fn clear(&mut self) {
        debug_assert!(self.front == NIL && self.back == NIL);
        self.state = MessageState::Cache;
        self.front = NIL;
        self.back = NIL;
        self.unique = self.unique.wrapping_add(1);
        self.sender_con_id.clear();
        self.receiver_con_id.clear();
        self.receiver_msg_id.clear();
        self.header = MessageHeader::default();
        self.last_message_flags = MessageFlags::empty();
    }

    /// True if the receiving writer has something to pull for this
    /// message: queued chunks, or the cancel state it must announce.
    pub(crate) fn has_data(&self) -> bool {
        self.back != NIL || self.state == MessageState::SendCancel
    }
}

/// Engine-internal record for one connection.
pub(crate) struct ConnectionStub {
    /// The connection actor, target of notifications.  Invalid on
    /// placeholder stubs created by name lookup before registration.
    pub(crate) actor_id: ActorId,
    /// Generation; bumped on every clear.
    pub(crate) unique: Generation,
    /// The name this connection registered under, if any.
    pub(crate) name: Option<RelayName>,
    /// Head of the done queue: relay-data records whose buffers belong
    /// back with this connection's writer.  Drained in completion order.
    pub(crate) done_front: usize,
    /// Tail of the done queue.
    pub(crate) done_back: usize,
    /// Messages this connection is the sender of.
    pub(crate) send_list: SendList,
    /// Messages this connection is the receiver of; doubles as the ready
    /// queue for its writer.
    pub(crate) recv_list: RecvList,
}

impl Default for ConnectionStub {
    fn default() -> Self {
        ConnectionStub {
            actor_id: ActorId::invalid(),
            unique: 0,
            name: None,
            done_front: NIL,
            done_back: NIL,
            send_list: SendList::new(),
            recv_list: RecvList::new(),
        }
    }
}

impl ConnectionStub {
    /// Reset for reuse, invalidating every id pointing here.
    pub(crate) fn clear(&mut self) {
        debug_assert!(self.send_list.is_empty() && self.recv_list.is_empty());
        self.unique = self.unique.wrapping_add(1);
        self.actor_id.clear();
        self.name = None;
        self.done_front = NIL;
        self.done_back = NIL;
    }

    /// True if the done queue holds nothing.
    pub(crate) fn done_is_empty(&self) -> bool {
        self.done_front == NIL
    }
}

/// Pooled holder of one [`RelayData`].
///
/// The `next` index does triple duty, exactly one role at a time: message
/// FIFO chain, done-queue chain, or free-stack chain.
pub(crate) struct RelayDataStub {
    /// The chunk.
    pub(crate) data: RelayData,
    /// Chain link, [`NIL`]-terminated.
    pub(crate) next: usize,
}

impl Default for RelayDataStub {
    fn default() -> Self {
        RelayDataStub {
            data: RelayData::default(),
            next: NIL,
        }
    }
}

impl RelayDataStub {
    /// Return a stub holding `data`, unchained.
    pub(crate) fn new(data: RelayData) -> Self {
        RelayDataStub { data, next: NIL }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn message_clear_bumps_generation() {
        let mut stub = MessageStub::default();
        stub.sender_con_id = UniqueId::new(1, 0);
        let before = stub.unique;
        stub.clear();
        assert_eq!(stub.unique, before + 1);
        assert_eq!(stub.state, MessageState::Cache);
        assert!(stub.sender_con_id.is_invalid());
        assert!(!stub.has_data());
    }

    #[test]
    fn send_cancel_counts_as_data() {
        let mut stub = MessageStub::default();
        assert!(!stub.has_data());
        stub.state = MessageState::SendCancel;
        assert!(stub.has_data());
    }
}
