//! Error types for relay operations.

use blobs_proto::BlobId;

/// Alias for `Result<T, blobs::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to relay callers.
///
/// Every variant maps to one HTTP status; none of them is retried by the
/// relay itself.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed pairing input or query parameters.
    #[error("{0}")]
    BadRequest(String),

    /// Missing, forged or IP-mismatched capability token.
    #[error("{0}")]
    Unauthorized(&'static str),

    /// Unknown tunnel, unknown blob, or a blob whose uploader is offline.
    #[error("{0}")]
    NotFound(String),

    /// The tunnel slot the caller's token names already holds a socket.
    #[error("tunnel is full")]
    Capacity,

    /// Another download of the same blob is still in flight.
    #[error("blob {0} is already being downloaded")]
    Busy(BlobId),

    /// The relay was started with unusable settings.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Unexpected relay state.
    #[error("internal error: {0}")]
    Internal(String),

    /// An I/O error while binding or serving.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable, machine-readable name of the error kind.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BadRequest",
            Self::Unauthorized(_) => "Unauthorized",
            Self::NotFound(_) => "NotFound",
            Self::Capacity => "Capacity",
            Self::Busy(_) => "Busy",
            Self::Config(_) => "Config",
            Self::Internal(_) | Self::Io(_) => "Internal",
        }
    }
}

/// Terminal failure of a download body.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum DownloadError {
    /// The uploader's socket closed while the blob was being streamed.
    #[error("uploader disconnected while streaming {0}")]
    PeerGone(BlobId),

    /// The tunnel was torn down while the blob was being streamed.
    #[error("tunnel closed while streaming {0}")]
    TunnelClosed(BlobId),
}

/// Failure of a backing store (metadata or pairing secrets).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("store unavailable: {0}")]
pub struct StoreError(pub String);

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        Self::Internal(e.to_string())
    }
}
