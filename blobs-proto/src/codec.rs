//! Binary codec for tunnel socket frames.
//!
//! Each socket frame holds exactly one postcard-encoded [`Message`]: a varint
//! variant tag followed by the variant's fields. Byte payloads are written
//! as a varint length and the raw bytes, never escaped.

use crate::Message;

/// Largest frame accepted by [`decode`] (16 MiB).
pub const MAX_MESSAGE: usize = 16 * 1024 * 1024;

/// Highest wire tag currently assigned (`Keepalive`).
const MAX_TAG: u8 = 6;

/// Why a frame could not be decoded.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DecodeError {
    /// The frame ends before the message is complete (includes empty frames).
    #[error("truncated message")]
    Truncated,

    /// The leading tag does not name any known message.
    #[error("unknown message tag {0:#04x}")]
    UnknownTag(u8),

    /// The payload does not match the shape its tag announces.
    #[error("malformed message payload")]
    Malformed(#[source] postcard::Error),

    /// A complete message was followed by extra bytes.
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    /// The frame is larger than [`MAX_MESSAGE`].
    #[error("message of {0} bytes exceeds the {MAX_MESSAGE} byte limit")]
    Oversized(usize),
}

/// Why a message could not be encoded.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EncodeError {
    /// postcard rejected the message.
    #[error("failed to serialize message")]
    Serialize(#[from] postcard::Error),

    /// The frame would be larger than [`MAX_MESSAGE`], so no peer could
    /// decode it.
    #[error("message of {0} bytes exceeds the {MAX_MESSAGE} byte limit")]
    Oversized(usize),
}

/// Encodes `msg` into a standalone frame.
pub fn encode(msg: &Message) -> Result<Vec<u8>, EncodeError> {
    let buf = postcard::to_allocvec(msg)?;
    if buf.len() > MAX_MESSAGE {
        return Err(EncodeError::Oversized(buf.len()));
    }
    Ok(buf)
}

/// Decodes one frame produced by [`encode`].
///
/// The whole buffer must be consumed: truncated frames, unknown tags,
/// lengths that overrun the buffer, and trailing garbage are all rejected.
pub fn decode(buf: &[u8]) -> Result<Message, DecodeError> {
    if buf.len() > MAX_MESSAGE {
        return Err(DecodeError::Oversized(buf.len()));
    }
    let Some(&tag) = buf.first() else {
        return Err(DecodeError::Truncated);
    };
    // Tags are single-byte varints; anything above MAX_TAG (including a
    // multi-byte varint prefix) is unassigned.
    if tag > MAX_TAG {
        return Err(DecodeError::UnknownTag(tag));
    }

    match postcard::take_from_bytes::<Message>(buf) {
        Ok((msg, [])) => Ok(msg),
        Ok((_, rest)) => Err(DecodeError::TrailingBytes(rest.len())),
        Err(postcard::Error::DeserializeUnexpectedEnd) => Err(DecodeError::Truncated),
        Err(e) => Err(DecodeError::Malformed(e)),
    }
}
