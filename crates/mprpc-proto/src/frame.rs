//! Splitting packet bodies into frames, and writing frames back.
//!
//! The body of a `DATA` packet is a concatenation of frames.  A frame is a
//! [`Command`] byte (possibly carrying [`END_MESSAGE_FLAG`]), then operands
//! that depend on the command.  This module parses bodies that have already
//! been decompressed; compression is the packet layer's concern.

use bytes::{Buf, BufMut};

use crate::compact;
use crate::header::RequestId;
use crate::packet::{Command, END_MESSAGE_FLAG, Limits};
use crate::{Error, Result};

/// One frame parsed out of a packet body.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Frame<'a> {
    /// A chunk of message bytes for the message at `index`.
    Message {
        /// The message-bearing command that introduced the chunk.
        command: Command,
        /// Multiplex index of the message within this connection.
        index: u32,
        /// True if this chunk ends the message.
        is_last: bool,
        /// The chunk itself.  For `NEW_MESSAGE` and `FULL_MESSAGE` it starts
        /// with the serialized message header.
        data: &'a [u8],
    },
    /// The peer abandoned the message at `index`.
    CancelMessage {
        /// Multiplex index of the abandoned message.
        index: u32,
    },
    /// The peer asks us to abandon the request with the given id.
    CancelRequest {
        /// Request id to abandon.
        request_id: RequestId,
    },
    /// Count of messages the peer has acknowledged.
    AckdCount {
        /// The acknowledged count.
        count: u8,
    },
    /// Window/bookkeeping refresh.
    Update,
}

/// An iterator over the frames of one (decompressed) packet body.
///
/// Yields `Err` at the first malformed frame and nothing after it; a
/// protocol error is grounds for dropping the connection, not resynchronizing.
#[derive(Clone, Debug)]
pub struct FrameParser<'a> {
    /// Unconsumed remainder of the packet body.
    rest: &'a [u8],
    /// Bounds to enforce on multiplex indexes.
    limits: Limits,
    /// Set after an error; the parser yields nothing further.
    poisoned: bool,
}

impl<'a> FrameParser<'a> {
    /// Return a parser over `body` under the given limits.
    pub fn new(body: &'a [u8], limits: Limits) -> Self {
        FrameParser {
            rest: body,
            limits,
            poisoned: false,
        }
    }

    /// Parse the next frame from the remainder.
    fn parse_frame(&mut self) -> Result<Frame<'a>> {
        let raw = self.rest.get_u8();
        let is_last = raw & END_MESSAGE_FLAG != 0;
        let command = Command::from(raw & !END_MESSAGE_FLAG);

        if command.carries_message_data() {
            let index = compact::decode_u32(&mut self.rest)?;
            if index >= self.limits.max_message_count_multiplex() {
                return Err(Error::MessageIndexOutOfRange {
                    index,
                    limit: self.limits.max_message_count_multiplex(),
                });
            }
            if self.rest.len() < 2 {
                return Err(Error::Truncated {
                    at: self.rest.len(),
                    needed: 2,
                });
            }
            let size = usize::from(self.rest.get_u16());
            if self.rest.len() < size {
                return Err(Error::Truncated {
                    at: self.rest.len(),
                    needed: size,
                });
            }
            let (data, rest) = self.rest.split_at(size);
            self.rest = rest;
            // FULL_MESSAGE and END_MESSAGE end the message by definition.
            let is_last =
                is_last || command == Command::FULL_MESSAGE || command == Command::END_MESSAGE;
            return Ok(Frame::Message {
                command,
                index,
                is_last,
                data,
            });
        }

        if command == Command::CANCEL_MESSAGE {
            let index = compact::decode_u32(&mut self.rest)?;
            Ok(Frame::CancelMessage { index })
        } else if command == Command::CANCEL_REQUEST {
            let request_id = RequestId::decode(&mut self.rest)?;
            Ok(Frame::CancelRequest { request_id })
        } else if command == Command::ACKD_COUNT {
            if self.rest.is_empty() {
                return Err(Error::Truncated { at: 0, needed: 1 });
            }
            let count = self.rest.get_u8();
            Ok(Frame::AckdCount { count })
        } else if command == Command::UPDATE {
            Ok(Frame::Update)
        } else {
            Err(Error::UnrecognizedCommand(raw))
        }
    }
}

impl<'a> Iterator for FrameParser<'a> {
    type Item = Result<Frame<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.poisoned || self.rest.is_empty() {
            return None;
        }
        let result = self.parse_frame();
        if result.is_err() {
            self.poisoned = true;
        }
        Some(result)
    }
}

/// Append a message-bearing frame to `out`.
///
/// The end flag is set if `is_last` is true or the command implies it.
/// Returns [`Error::TooLarge`] if `data` does not fit a 16-bit length.
pub fn write_message_frame<B: BufMut>(
    out: &mut B,
    command: Command,
    index: u32,
    is_last: bool,
    data: &[u8],
) -> Result<()> {
    debug_assert!(command.carries_message_data());
    let size = u16::try_from(data.len()).map_err(|_| Error::TooLarge)?;
    let is_last = is_last || command == Command::FULL_MESSAGE || command == Command::END_MESSAGE;
    let mut raw = u8::from(command);
    if is_last {
        raw |= END_MESSAGE_FLAG;
    }
    out.put_u8(raw);
    compact::encode_u32(out, index);
    out.put_u16(size);
    out.put_slice(data);
    Ok(())
}

/// Append a `CANCEL_MESSAGE` frame to `out`.
pub fn write_cancel_message<B: BufMut>(out: &mut B, index: u32) {
    out.put_u8(Command::CANCEL_MESSAGE.into());
    compact::encode_u32(out, index);
}

/// Append a `CANCEL_REQUEST` frame to `out`.
pub fn write_cancel_request<B: BufMut>(out: &mut B, request_id: RequestId) {
    out.put_u8(Command::CANCEL_REQUEST.into());
    request_id.encode(out);
}

/// Append an `ACKD_COUNT` frame to `out`.
pub fn write_ackd_count<B: BufMut>(out: &mut B, count: u8) {
    out.put_u8(Command::ACKD_COUNT.into());
    out.put_u8(count);
}

/// Append an `UPDATE` frame to `out`.
pub fn write_update<B: BufMut>(out: &mut B) {
    out.put_u8(Command::UPDATE.into());
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn mixed_body_roundtrip() {
        let mut body = Vec::new();
        write_message_frame(&mut body, Command::NEW_MESSAGE, 3, false, b"hello ").unwrap();
        write_update(&mut body);
        write_message_frame(&mut body, Command::END_MESSAGE, 3, true, b"world").unwrap();
        write_cancel_request(&mut body, RequestId::new(9, 4));
        write_ackd_count(&mut body, 5);
        write_cancel_message(&mut body, 12);

        let frames: Vec<_> = FrameParser::new(&body, Limits::default())
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(
            frames,
            vec![
                Frame::Message {
                    command: Command::NEW_MESSAGE,
                    index: 3,
                    is_last: false,
                    data: b"hello ",
                },
                Frame::Update,
                Frame::Message {
                    command: Command::END_MESSAGE,
                    index: 3,
                    is_last: true,
                    data: b"world",
                },
                Frame::CancelRequest {
                    request_id: RequestId::new(9, 4),
                },
                Frame::AckdCount { count: 5 },
                Frame::CancelMessage { index: 12 },
            ]
        );
    }

    #[test]
    fn full_message_is_always_last() {
        let mut body = Vec::new();
        write_message_frame(&mut body, Command::FULL_MESSAGE, 0, false, b"x").unwrap();
        let frames: Vec<_> = FrameParser::new(&body, Limits::default())
            .collect::<Result<_>>()
            .unwrap();
        assert!(matches!(frames[0], Frame::Message { is_last: true, .. }));
    }

    #[test]
    fn index_out_of_range() {
        let limits = Limits::default().with_max_message_count_multiplex(4);
        let mut body = Vec::new();
        write_message_frame(&mut body, Command::MESSAGE, 4, false, b"x").unwrap();
        let mut parser = FrameParser::new(&body, limits);
        assert_eq!(
            parser.next().unwrap(),
            Err(Error::MessageIndexOutOfRange { index: 4, limit: 4 })
        );
        // The parser refuses to resynchronize after an error.
        assert!(parser.next().is_none());
    }

    #[test]
    fn truncated_data() {
        let mut body = Vec::new();
        write_message_frame(&mut body, Command::MESSAGE, 1, false, b"abcdef").unwrap();
        body.truncate(body.len() - 2);
        let mut parser = FrameParser::new(&body, Limits::default());
        assert!(matches!(
            parser.next().unwrap(),
            Err(Error::Truncated { .. })
        ));
    }

    #[test]
    fn unrecognized_command() {
        let body = [0x7f_u8];
        let mut parser = FrameParser::new(&body, Limits::default());
        assert_eq!(
            parser.next().unwrap(),
            Err(Error::UnrecognizedCommand(0x7f))
        );
    }

    #[test]
    fn oversized_chunk_rejected() {
        let data = vec![0_u8; 70_000];
        let mut body = Vec::new();
        assert_eq!(
            write_message_frame(&mut body, Command::MESSAGE, 0, false, &data),
            Err(Error::TooLarge)
        );
    }
}
