//! Wire protocol for the blobs relay.
//!
//! Peer sockets carry binary frames, one [`Message`] per frame, serialized
//! with [`postcard`]. The waiting-room socket carries [`SessionMessage`]s as
//! JSON text frames.

mod codec;
mod message;
mod session;

pub use codec::{DecodeError, EncodeError, MAX_MESSAGE, decode, encode};
pub use message::{BlobId, BlobMetadata, Message, ParsePeerIdError, PeerId};
pub use session::{SessionMessage, decode_session, encode_session};
