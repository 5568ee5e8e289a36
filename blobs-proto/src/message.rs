//! Message types exchanged between peers and the relay over a tunnel socket.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One of the two slots of a tunnel.
///
/// The text form is `"1"` for the creator and `"2"` for the joiner; that is
/// what appears in capability tokens and download query strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PeerId {
    /// The peer that created the tunnel.
    Creator,
    /// The peer that joined with the pairing secret.
    Joiner,
}

impl PeerId {
    /// Both slots, creator first.
    pub const ALL: [Self; 2] = [Self::Creator, Self::Joiner];

    /// Returns the opposite slot.
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Self::Creator => Self::Joiner,
            Self::Joiner => Self::Creator,
        }
    }

    /// Zero-based slot index, usable for fixed-size peer arrays.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Creator => 0,
            Self::Joiner => 1,
        }
    }

    /// Text form used on the HTTP surface.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Creator => "1",
            Self::Joiner => "2",
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing a [`PeerId`] from anything but `"1"` or `"2"`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid peer id {0:?}, expected \"1\" or \"2\"")]
pub struct ParsePeerIdError(pub String);

impl FromStr for PeerId {
    type Err = ParsePeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1" => Ok(Self::Creator),
            "2" => Ok(Self::Joiner),
            other => Err(ParsePeerIdError(other.to_owned())),
        }
    }
}

/// Identifies a blob within one tunnel: the uploading peer plus an id that
/// peer assigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobId {
    /// Peer holding the bytes.
    pub owner: PeerId,
    /// Uploader-assigned id, unique per owner.
    pub id: String,
}

impl BlobId {
    /// Creates a blob id.
    pub fn new(owner: PeerId, id: impl Into<String>) -> Self {
        Self {
            owner,
            id: id.into(),
        }
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.owner, self.id)
    }
}

/// Announcement of a blob, sent by its owner before any bytes flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMetadata {
    /// Blob being announced.
    pub id: BlobId,
    /// File name offered to the downloader.
    pub name: String,
    /// Uncompressed size in bytes. Advisory only: chunks are gzip-compressed
    /// by the uploader, so the transferred byte count differs.
    pub size: u64,
    /// MIME type of the file.
    pub mime_type: String,
}

/// A frame on a tunnel socket.
///
/// The declaration order fixes the wire tag (postcard variant index) and must
/// not change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Message {
    /// Relay → peer: the other slot now has an open socket.
    PeerConnected,
    /// Relay → peer: the other slot's socket closed.
    PeerDisconnected,
    /// Peer → relay → other peer: a blob is available.
    Metadata(BlobMetadata),
    /// Relay → uploader: send the next chunk of a blob.
    DataRequest {
        /// Blob to read from.
        id: BlobId,
    },
    /// Uploader → relay: part of one chunk. An empty `bytes` marks end of file.
    DataChunk {
        /// Blob the bytes belong to.
        id: BlobId,
        /// Offset of `bytes` within the chunk being answered.
        offset: u64,
        /// Raw, already-compressed payload.
        bytes: Bytes,
    },
    /// Uploader → relay: all parts of the requested chunk have been sent.
    DataChunkEnd {
        /// Blob the chunk belonged to.
        id: BlobId,
    },
    /// Either direction: keeps idle sockets open.
    Keepalive,
}

impl Message {
    /// Blob this message is addressed to, for the variants that carry one.
    pub fn blob_id(&self) -> Option<&BlobId> {
        match self {
            Self::Metadata(meta) => Some(&meta.id),
            Self::DataRequest { id } | Self::DataChunk { id, .. } | Self::DataChunkEnd { id } => {
                Some(id)
            }
            Self::PeerConnected | Self::PeerDisconnected | Self::Keepalive => None,
        }
    }

    /// Short variant name for logs.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::PeerConnected => "PeerConnected",
            Self::PeerDisconnected => "PeerDisconnected",
            Self::Metadata(_) => "Metadata",
            Self::DataRequest { .. } => "DataRequest",
            Self::DataChunk { .. } => "DataChunk",
            Self::DataChunkEnd { .. } => "DataChunkEnd",
            Self::Keepalive => "Keepalive",
        }
    }
}
