//! Relay that streams files between two browser peers.
//!
//! A peer creates a tunnel and gets a six-character pairing secret; a second
//! peer redeems it. Both then attach a WebSocket to the tunnel and announce
//! files as [`BlobMetadata`](blobs_proto::BlobMetadata). Nothing is stored
//! on the relay: when one peer downloads a file over plain HTTP, the relay
//! pulls it chunk by chunk from the other peer's socket into the response
//! body.
//!
//! # Quick start
//!
//! ```no_run
//! use blobs::{Relay, RelayConfig};
//!
//! # async fn run() -> blobs::Result<()> {
//! let mut config = RelayConfig::default();
//! config.secret = "change me".into();
//!
//! let relay = Relay::new(config)?;
//! let listener = tokio::net::TcpListener::bind(relay.config().listen).await?;
//! blobs::serve(relay, listener, std::future::pending()).await
//! # }
//! ```

mod config;
mod error;
mod link;
mod mux;
mod pairing;
mod registry;
mod relay;
mod server;
mod source;
mod store;
mod token;
mod tunnel;

pub use config::{CLEANUP_RETRY, MAX_TIMER_SECS, PAIRING_TTL, RelayConfig, SESSION_TIMEOUT};
pub use error::{DownloadError, Error, Result, StoreError};
pub use link::PeerLink;
pub use pairing::{MemorySecretStore, SECRET_LEN, SecretStore, generate_secret};
pub use registry::{StoreFactory, Tunnels};
pub use relay::{Created, Joined, Relay};
pub use server::{Authorized, ClientIp, router, serve};
pub use source::BlobSource;
pub use store::{BlobStore, MemoryStore};
pub use token::{Grant, Signer};
pub use tunnel::{
    PeerInbound, PeerOutbound, PeerSession, TunnelHandle, TunnelSettings, TunnelState,
    TunnelStatus,
};
