//! Packet headers and the frame command set.
//!
//! A connection's byte stream is cut into packets.  Each packet starts with a
//! fixed four-byte [`PacketHeader`]; the body that follows is a sequence of
//! frames (see [`crate::frame`]), possibly compressed as a whole.  The frame
//! commands are defined here because the writer needs them too.

use bitflags::bitflags;
use bytes::{Buf, BufMut};
use caret::caret_int;

use crate::{Error, Result};

/// Largest packet body this implementation will produce or accept.
///
/// The size field is 16 bits wide, so this is also the hard ceiling.
pub const MAX_PACKET_DATA_SIZE: usize = 65_535;

caret_int! {
    /// What a packet as a whole is for.
    pub struct PacketKind(u8) {
        /// A packet whose body is a sequence of frames.
        DATA = 1,
        /// An empty packet sent to keep the link warm.
        KEEP_ALIVE = 2,
    }
}

caret_int! {
    /// Command starting a frame within a packet body.
    ///
    /// Message-bearing commands (`NEW_MESSAGE`, `FULL_MESSAGE`, `MESSAGE`,
    /// `END_MESSAGE`) are followed by a compact multiplex index and a
    /// length-prefixed chunk of message bytes.  Any of them may additionally
    /// carry [`END_MESSAGE_FLAG`] in its top bit.
    pub struct Command(u8) {
        /// First chunk of a new message; the chunk starts with the
        /// serialized message header.
        NEW_MESSAGE = 1,
        /// An entire message in one chunk, header included.
        FULL_MESSAGE = 2,
        /// A middle chunk of a message already in flight.
        MESSAGE = 3,
        /// The final chunk of a message already in flight.
        END_MESSAGE = 4,
        /// The sender abandoned the message with the given multiplex index.
        CANCEL_MESSAGE = 5,
        /// Ask the peer to abandon the message with the given request id.
        CANCEL_REQUEST = 6,
        /// Window/bookkeeping refresh; no operands.
        UPDATE = 7,
        /// Count of messages acknowledged by the peer.
        ACKD_COUNT = 8,
    }
}

/// Bit OR-ed onto a message-bearing [`Command`] when its chunk is the last
/// chunk of the message.
pub const END_MESSAGE_FLAG: u8 = 0x80;

impl Command {
    /// Return true if frames with this command carry message bytes.
    pub fn carries_message_data(self) -> bool {
        self == Command::NEW_MESSAGE
            || self == Command::FULL_MESSAGE
            || self == Command::MESSAGE
            || self == Command::END_MESSAGE
    }
}

bitflags! {
    /// Flags carried by a [`PacketHeader`].
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct PacketFlags: u8 {
        /// The packet body is compressed and must be expanded before the
        /// frame parser sees it.
        const COMPRESSED = 1 << 0;
    }
}

/// The fixed header in front of every packet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PacketHeader {
    /// What the packet is for.
    kind: PacketKind,
    /// Per-packet flags.
    flags: PacketFlags,
    /// Length of the body that follows, in bytes (before decompression).
    size: u16,
}

impl PacketHeader {
    /// Encoded size of a packet header, in bytes.
    pub const SIZE: usize = 4;

    /// Return a header for a `DATA` packet with the given body size.
    pub fn data(flags: PacketFlags, size: u16) -> Self {
        PacketHeader {
            kind: PacketKind::DATA,
            flags,
            size,
        }
    }

    /// Return a header for a `KEEP_ALIVE` packet.
    pub fn keep_alive() -> Self {
        PacketHeader {
            kind: PacketKind::KEEP_ALIVE,
            flags: PacketFlags::empty(),
            size: 0,
        }
    }

    /// Return this packet's kind.
    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    /// Return this packet's flags.
    pub fn flags(&self) -> PacketFlags {
        self.flags
    }

    /// Return the body size in bytes.
    pub fn size(&self) -> usize {
        usize::from(self.size)
    }

    /// Return true if the header passes its sanity checks: a recognized
    /// kind, no unknown flag bits, and a keep-alive with an empty body.
    pub fn is_ok(&self) -> bool {
        let kind_ok = self.kind == PacketKind::DATA || self.kind == PacketKind::KEEP_ALIVE;
        let keep_alive_ok = self.kind != PacketKind::KEEP_ALIVE || self.size == 0;
        kind_ok && keep_alive_ok
    }

    /// Append the four header bytes to `out`.
    pub fn encode<B: BufMut>(&self, out: &mut B) {
        out.put_u8(self.kind.into());
        out.put_u8(self.flags.bits());
        out.put_u16(self.size);
    }

    /// Decode a header from the front of `input`.
    ///
    /// Returns [`Error::InvalidPacketHeader`] if the decoded header fails
    /// [`PacketHeader::is_ok`].
    pub fn decode<B: Buf>(input: &mut B) -> Result<Self> {
        if input.remaining() < Self::SIZE {
            return Err(Error::Truncated {
                at: input.remaining(),
                needed: Self::SIZE,
            });
        }
        let kind = PacketKind::from(input.get_u8());
        let flags =
            PacketFlags::from_bits(input.get_u8()).ok_or(Error::InvalidPacketHeader)?;
        let size = input.get_u16();
        let header = PacketHeader { kind, flags, size };
        if !header.is_ok() {
            return Err(Error::InvalidPacketHeader);
        }
        Ok(header)
    }
}

/// Negotiable bounds a connection imposes on its peer's framing.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Limits {
    /// Upper bound (exclusive) on multiplex message indexes.
    max_message_count_multiplex: u32,
}

impl Limits {
    /// Return the limits with `max_message_count_multiplex` replaced.
    pub fn with_max_message_count_multiplex(self, limit: u32) -> Self {
        Limits {
            max_message_count_multiplex: limit,
        }
    }

    /// Return the bound (exclusive) on multiplex message indexes.
    pub fn max_message_count_multiplex(&self) -> u32 {
        self.max_message_count_multiplex
    }
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_message_count_multiplex: 64,
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = PacketHeader::data(PacketFlags::COMPRESSED, 1234);
        let mut buf = Vec::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), PacketHeader::SIZE);
        let decoded = PacketHeader::decode(&mut &buf[..]).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.size(), 1234);
        assert!(decoded.flags().contains(PacketFlags::COMPRESSED));
    }

    #[test]
    fn keep_alive_must_be_empty() {
        let buf = [u8::from(PacketKind::KEEP_ALIVE), 0, 0, 5];
        assert_eq!(
            PacketHeader::decode(&mut &buf[..]),
            Err(Error::InvalidPacketHeader)
        );
        let mut buf = Vec::new();
        PacketHeader::keep_alive().encode(&mut buf);
        assert!(PacketHeader::decode(&mut &buf[..]).unwrap().is_ok());
    }

    #[test]
    fn bad_kind_and_flags_rejected() {
        let buf = [99_u8, 0, 0, 0];
        assert_eq!(
            PacketHeader::decode(&mut &buf[..]),
            Err(Error::InvalidPacketHeader)
        );
        let buf = [u8::from(PacketKind::DATA), 0xf0, 0, 0];
        assert_eq!(
            PacketHeader::decode(&mut &buf[..]),
            Err(Error::InvalidPacketHeader)
        );
    }

    #[test]
    fn truncated_header() {
        let buf = [1_u8, 0];
        assert!(matches!(
            PacketHeader::decode(&mut &buf[..]),
            Err(Error::Truncated { at: 2, needed: 4 })
        ));
    }

    #[test]
    fn command_classification() {
        assert!(Command::NEW_MESSAGE.carries_message_data());
        assert!(Command::FULL_MESSAGE.carries_message_data());
        assert!(Command::MESSAGE.carries_message_data());
        assert!(Command::END_MESSAGE.carries_message_data());
        assert!(!Command::CANCEL_REQUEST.carries_message_data());
        assert!(!Command::UPDATE.carries_message_data());
    }
}
