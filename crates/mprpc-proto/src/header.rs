//! Message headers and the identifiers they carry.
//!
//! Every relayed message starts with a [`MessageHeader`]: the two request
//! ids that tie it to pending requests on each side, the [`RelayName`] of the
//! destination, and the [`MessageFlags`] driving its lifecycle.  The header
//! rides inside the first chunk of the message, in front of the payload.

use bitflags::bitflags;
use bytes::{Buf, BufMut};
use derive_more::Display;

use crate::{Error, Result};

/// A request identifier allocated by one side of a connection.
///
/// Like every slot reference in this framework it is an index plus a
/// generation; the invalid value is all-bits-set.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[display("{index}:{unique}")]
pub struct RequestId {
    /// Slot index in the allocating side's request table.
    index: u32,
    /// Generation of that slot.
    unique: u32,
}

impl RequestId {
    /// Encoded size of a request id, in bytes.
    pub const SIZE: usize = 8;

    /// Return a new request id.
    pub const fn new(index: u32, unique: u32) -> Self {
        RequestId { index, unique }
    }

    /// Return the invalid request id.
    pub const fn invalid() -> Self {
        RequestId {
            index: u32::MAX,
            unique: u32::MAX,
        }
    }

    /// Return this id's slot index.
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Return this id's generation.
    pub const fn unique(&self) -> u32 {
        self.unique
    }

    /// Return true if this id can possibly name a pending request.
    pub const fn is_valid(&self) -> bool {
        self.index != u32::MAX
    }

    /// Reset this id to the invalid value.
    pub fn clear(&mut self) {
        *self = RequestId::invalid();
    }

    /// Append the eight id bytes to `out`.
    pub fn encode<B: BufMut>(&self, out: &mut B) {
        out.put_u32(self.index);
        out.put_u32(self.unique);
    }

    /// Decode a request id from the front of `input`.
    pub fn decode<B: Buf>(input: &mut B) -> Result<Self> {
        if input.remaining() < Self::SIZE {
            return Err(Error::Truncated {
                at: input.remaining(),
                needed: Self::SIZE,
            });
        }
        let index = input.get_u32();
        let unique = input.get_u32();
        Ok(RequestId { index, unique })
    }
}

impl Default for RequestId {
    fn default() -> Self {
        RequestId::invalid()
    }
}

/// The name a receiving connection registers under: a group of replicas and
/// one replica within it.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[display("{group_id}/{replica_id}")]
pub struct RelayName {
    /// Identifier of the replica group.
    group_id: u32,
    /// Identifier of the replica within the group.
    replica_id: u16,
}

impl RelayName {
    /// Encoded size of a relay name, in bytes.
    pub const SIZE: usize = 6;

    /// Return a new relay name.
    pub const fn new(group_id: u32, replica_id: u16) -> Self {
        RelayName {
            group_id,
            replica_id,
        }
    }

    /// Return the group identifier.
    pub const fn group_id(&self) -> u32 {
        self.group_id
    }

    /// Return the replica identifier.
    pub const fn replica_id(&self) -> u16 {
        self.replica_id
    }

    /// Append the six name bytes to `out`.
    pub fn encode<B: BufMut>(&self, out: &mut B) {
        out.put_u32(self.group_id);
        out.put_u16(self.replica_id);
    }

    /// Decode a relay name from the front of `input`.
    pub fn decode<B: Buf>(input: &mut B) -> Result<Self> {
        if input.remaining() < Self::SIZE {
            return Err(Error::Truncated {
                at: input.remaining(),
                needed: Self::SIZE,
            });
        }
        let group_id = input.get_u32();
        let replica_id = input.get_u16();
        Ok(RelayName {
            group_id,
            replica_id,
        })
    }
}

bitflags! {
    /// Lifecycle flags carried by a [`MessageHeader`].
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct MessageFlags: u32 {
        /// Deliver this message serially with respect to other synchronous
        /// messages on the same connection.
        const SYNCHRONOUS = 1 << 0;
        /// The sender is waiting for a response; the relay parks the message
        /// after its last chunk instead of completing it.
        const AWAIT_RESPONSE = 1 << 1;
        /// This message is a response.
        const RESPONSE = 1 << 2;
        /// This message is one part of a multi-part response.
        const RESPONSE_PART = 1 << 3;
        /// This message is the final part of a multi-part response.
        const RESPONSE_LAST = 1 << 4;
        /// Do not retry delivery if the first attempt fails.
        const ONE_SHOT = 1 << 5;
        /// Retrying delivery is safe.
        const IDEMPOTENT = 1 << 6;
        /// The message travelled through a relay.
        const RELAYED = 1 << 7;
    }
}

/// The header in front of every relayed message.
///
/// Request ids cross the wire *swapped*: the encoder writes its own id into
/// the recipient slot, so the decoder finds the peer's id in
/// `recipient_request_id` and its own (or nothing, on a first message) in
/// `sender_request_id`.  The relay engine performs the complementary swap
/// when it adopts a header into a message stub.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MessageHeader {
    /// Request id owned by whichever side most recently sent this header.
    sender_request_id: RequestId,
    /// Request id of the peer, as known to the sending side.
    recipient_request_id: RequestId,
    /// Destination the relay resolves on the first chunk.
    name: RelayName,
    /// Lifecycle flags.
    flags: MessageFlags,
}

impl Default for MessageHeader {
    /// A header addressed nowhere, as pooled records start out.
    fn default() -> Self {
        MessageHeader::new(RelayName::new(u32::MAX, u16::MAX), MessageFlags::empty())
    }
}

impl MessageHeader {
    /// Encoded size of a message header, in bytes.
    pub const SIZE: usize = RequestId::SIZE * 2 + RelayName::SIZE + 4;

    /// Return a header addressed to `name` with the given flags and invalid
    /// request ids.
    pub fn new(name: RelayName, flags: MessageFlags) -> Self {
        MessageHeader {
            sender_request_id: RequestId::invalid(),
            recipient_request_id: RequestId::invalid(),
            name,
            flags,
        }
    }

    /// Return the sender-side request id.
    pub fn sender_request_id(&self) -> RequestId {
        self.sender_request_id
    }

    /// Replace the sender-side request id.
    pub fn set_sender_request_id(&mut self, id: RequestId) {
        self.sender_request_id = id;
    }

    /// Return the recipient-side request id.
    pub fn recipient_request_id(&self) -> RequestId {
        self.recipient_request_id
    }

    /// Replace the recipient-side request id.
    pub fn set_recipient_request_id(&mut self, id: RequestId) {
        self.recipient_request_id = id;
    }

    /// Exchange the two request ids.
    pub fn swap_request_ids(&mut self) {
        std::mem::swap(&mut self.sender_request_id, &mut self.recipient_request_id);
    }

    /// Return the destination name.
    pub fn name(&self) -> RelayName {
        self.name
    }

    /// Return the lifecycle flags.
    pub fn flags(&self) -> MessageFlags {
        self.flags
    }

    /// Replace the lifecycle flags.
    pub fn set_flags(&mut self, flags: MessageFlags) {
        self.flags = flags;
    }

    /// Append the header bytes to `out`, swapping the request ids into
    /// their wire positions.
    pub fn encode<B: BufMut>(&self, out: &mut B) {
        // The wire swap: our id lands in the peer's "recipient" slot.
        self.recipient_request_id.encode(out);
        self.sender_request_id.encode(out);
        self.name.encode(out);
        out.put_u32(self.flags.bits());
    }

    /// Decode a header from the front of `input`.
    ///
    /// Unknown flag bits are dropped rather than rejected, so that flag
    /// additions do not break older relays.
    pub fn decode<B: Buf>(input: &mut B) -> Result<Self> {
        if input.remaining() < Self::SIZE {
            return Err(Error::Truncated {
                at: input.remaining(),
                needed: Self::SIZE,
            });
        }
        let sender_request_id = RequestId::decode(input)?;
        let recipient_request_id = RequestId::decode(input)?;
        let name = RelayName::decode(input)?;
        let flags = MessageFlags::from_bits_truncate(input.get_u32());
        Ok(MessageHeader {
            sender_request_id,
            recipient_request_id,
            name,
            flags,
        })
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn request_id_basics() {
        let id = RequestId::new(7, 1);
        assert!(id.is_valid());
        assert_eq!(id.to_string(), "7:1");
        let mut id = id;
        id.clear();
        assert!(!id.is_valid());
        assert_eq!(id, RequestId::default());
    }

    #[test]
    fn header_wire_swap() {
        let mut header = MessageHeader::new(
            RelayName::new(2, 0),
            MessageFlags::AWAIT_RESPONSE | MessageFlags::SYNCHRONOUS,
        );
        header.set_sender_request_id(RequestId::new(7, 1));

        let mut buf = Vec::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), MessageHeader::SIZE);

        let decoded = MessageHeader::decode(&mut &buf[..]).unwrap();
        // After decoding, the peer's id sits in the recipient slot and the
        // sender slot holds what the peer believed our id was: nothing.
        assert_eq!(decoded.recipient_request_id(), RequestId::new(7, 1));
        assert!(!decoded.sender_request_id().is_valid());
        assert_eq!(decoded.name(), RelayName::new(2, 0));
        assert_eq!(decoded.flags(), header.flags());
    }

    #[test]
    fn header_truncated() {
        let header = MessageHeader::new(RelayName::new(1, 0), MessageFlags::empty());
        let mut buf = Vec::new();
        header.encode(&mut buf);
        assert!(matches!(
            MessageHeader::decode(&mut &buf[..10]),
            Err(Error::Truncated { .. })
        ));
    }

    #[test]
    fn unknown_flag_bits_dropped() {
        let mut buf = Vec::new();
        MessageHeader::new(RelayName::new(1, 0), MessageFlags::SYNCHRONOUS).encode(&mut buf);
        let at = buf.len() - 4;
        buf[at] = 0xff; // stomp the top flag byte
        let decoded = MessageHeader::decode(&mut &buf[..]).unwrap();
        assert!(decoded.flags().contains(MessageFlags::SYNCHRONOUS));
    }
}
