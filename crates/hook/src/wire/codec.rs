#![forbid(unsafe_code)]

use super::{Message, MessageKind};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the length prefix.
pub const LENGTH_LEN: usize = 4;
/// Length prefix, kind byte and subchannel.
pub const HEADER_LEN: usize = 9;
/// Largest frame either side buffers, length prefix included.
pub const MAX_FRAME_LEN: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// Not enough bytes are buffered yet. Nothing was consumed.
    #[error("Incomplete message in byte stream")]
    Incomplete,

    /// The length prefix cannot describe a message. A short length discards
    /// the bytes it claims; a length above [`MAX_FRAME_LEN`] discards only the
    /// prefix. Decoding resumes after whatever was discarded.
    #[error("Invalid length {0} encountered in byte stream")]
    InvalidLength(u32),

    /// The message does not fit in one frame.
    #[error("Message of {0} bytes exceeds the frame limit")]
    TooLarge(usize),
}

/// Encodes `message` as `u32 LE length | u8 kind | u32 LE subchannel | data`.
///
/// Frames longer than [`MAX_FRAME_LEN`] are refused since the reading side
/// would discard them.
pub fn encode(message: &Message) -> Result<Bytes, FrameError> {
    let wire_len = message.wire_len();
    let length = u32::try_from(wire_len)
        .ok()
        .filter(|_| wire_len <= MAX_FRAME_LEN)
        .ok_or(FrameError::TooLarge(wire_len))?;
    let mut buf = BytesMut::with_capacity(wire_len);
    buf.put_u32_le(length);
    buf.put_u8(message.kind.into());
    buf.put_u32_le(message.subchannel);
    buf.put_slice(&message.data);
    Ok(buf.freeze())
}

/// Decodes the next message at the front of `buf`.
///
/// On `Incomplete` the buffer is left untouched and the call can be retried
/// once more data has been appended. A length prefix below [`HEADER_LEN`]
/// consumes that many bytes (at least the prefix itself) once they are all
/// buffered, and one above [`MAX_FRAME_LEN`] consumes just the prefix. Both
/// report `InvalidLength`, so a corrupt length never stalls the stream.
pub fn decode(buf: &mut BytesMut) -> Result<Message, FrameError> {
    if buf.len() < LENGTH_LEN {
        return Err(FrameError::Incomplete);
    }

    let declared = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let length = declared.max(LENGTH_LEN as u32) as usize;
    if length > MAX_FRAME_LEN {
        buf.advance(LENGTH_LEN);
        return Err(FrameError::InvalidLength(declared));
    }

    if buf.len() < length {
        return Err(FrameError::Incomplete);
    }

    if length < HEADER_LEN {
        buf.advance(length);
        return Err(FrameError::InvalidLength(declared));
    }

    let mut frame = buf.split_to(length).freeze();
    frame.advance(LENGTH_LEN);
    let kind = MessageKind::from(frame.get_u8());
    let subchannel = frame.get_u32_le();
    Ok(Message {
        kind,
        subchannel,
        data: frame,
    })
}
