//! Pull-driven byte source for one blob streamed over a peer socket.
//!
//! The HTTP response body pulls; the uploader can only be asked. A
//! [`BlobSource`] turns each pull into at most one outstanding
//! [`Message::DataRequest`]:
//!
//! ```text
//!   body ──pull──▶ BlobSource ──DataRequest──▶ uploader
//!                             ◀──DataChunk─────
//!                             ◀──DataChunk─────
//!                             ◀──DataChunkEnd──
//! ```
//!
//! Chunks are yielded as they arrive, but the next request is only sent
//! once `DataChunkEnd` has been seen and the body pulls again. That single
//! in-flight request is the whole flow-control scheme: the uploader splits
//! large reads into several socket messages and the body never outruns it.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use blobs_proto::{BlobId, BlobMetadata, Message};
use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::DownloadError;
use crate::link::PeerLink;

/// What the multiplexer hands to a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// Bytes for the outstanding request. Empty means end of file.
    Chunk(Bytes),
    /// The outstanding request is fully answered.
    End,
    /// The download was torn down by the tunnel.
    Closed(DownloadError),
}

/// Whether a download has a `DataRequest` outstanding.
///
/// The source raises it right before asking. The multiplexer lowers it on
/// `DataChunkEnd` and drops chunk traffic for the download while it is down,
/// so an uploader cannot answer a request that was never made.
#[derive(Debug, Clone, Default)]
pub(crate) struct Outstanding(Arc<AtomicBool>);

impl Outstanding {
    /// Marks a request as sent.
    pub(crate) fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Marks the request as answered.
    pub(crate) fn lower(&self) {
        self.0.store(false, Ordering::Release);
    }

    /// Whether a request is waiting for its answer.
    pub(crate) fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Request/response position of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// No request outstanding.
    Idle,
    /// A request was sent and its `DataChunkEnd` has not arrived.
    AwaitingData,
    /// End of file or failure; nothing more will be yielded.
    Done,
}

/// Runs once when the source is dropped, releasing its multiplexer slot.
pub(crate) struct Registration(Option<Box<dyn FnOnce() + Send>>);

impl Registration {
    /// Wraps the release action.
    pub(crate) fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(release)))
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Registration")
            .field(&self.0.is_some())
            .finish()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(release) = self.0.take() {
            release();
        }
    }
}

/// One in-flight blob download.
///
/// Dropping the source (for instance when the HTTP client aborts) releases
/// its multiplexer registration; the uploader's socket is left alone.
#[derive(Debug)]
pub struct BlobSource {
    /// Announcement of the blob being read.
    metadata: BlobMetadata,
    /// Uploader socket, used only to send requests.
    link: PeerLink,
    /// Messages routed to this download.
    inbox: mpsc::UnboundedReceiver<Delivery>,
    /// Shared with the multiplexer entry.
    outstanding: Outstanding,
    /// Position in the request/response cycle.
    state: State,
    /// Requests sent so far.
    requests: u64,
    /// Unregisters on drop.
    _registration: Registration,
}

impl BlobSource {
    /// Binds a source to the uploader's link and its routed inbox.
    pub(crate) fn new(
        metadata: BlobMetadata,
        link: PeerLink,
        inbox: mpsc::UnboundedReceiver<Delivery>,
        outstanding: Outstanding,
        registration: Registration,
    ) -> Self {
        Self {
            metadata,
            link,
            inbox,
            outstanding,
            state: State::Idle,
            requests: 0,
            _registration: registration,
        }
    }

    /// Announcement of the blob being streamed.
    pub const fn metadata(&self) -> &BlobMetadata {
        &self.metadata
    }

    /// Blob being streamed.
    pub const fn id(&self) -> &BlobId {
        &self.metadata.id
    }

    /// Number of `DataRequest`s sent so far.
    pub const fn requests(&self) -> u64 {
        self.requests
    }

    /// Waits for the next piece of the blob.
    ///
    /// Returns `None` at end of file. After an error, further calls return
    /// `None`. Cancelling the returned future is safe: the outstanding
    /// request stays outstanding and is not repeated.
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes, DownloadError>> {
        loop {
            match self.state {
                State::Done => return None,
                State::Idle => {
                    let id = self.metadata.id.clone();
                    self.outstanding.raise();
                    if !self.link.send(Message::DataRequest { id: id.clone() }) {
                        self.state = State::Done;
                        return Some(Err(DownloadError::PeerGone(id)));
                    }
                    self.requests += 1;
                    trace!(blob = %id, n = self.requests, "requested chunk");
                    self.state = State::AwaitingData;
                }
                State::AwaitingData => match self.inbox.recv().await {
                    Some(Delivery::Chunk(bytes)) if bytes.is_empty() => {
                        trace!(blob = %self.metadata.id, "end of file");
                        self.state = State::Done;
                        return None;
                    }
                    Some(Delivery::Chunk(bytes)) => return Some(Ok(bytes)),
                    Some(Delivery::End) => self.state = State::Idle,
                    Some(Delivery::Closed(err)) => {
                        self.state = State::Done;
                        return Some(Err(err));
                    }
                    None => {
                        self.state = State::Done;
                        return Some(Err(DownloadError::TunnelClosed(
                            self.metadata.id.clone(),
                        )));
                    }
                },
            }
        }
    }

    /// Adapts the source into a byte stream suitable for a response body.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, DownloadError>> + Send + 'static {
        futures::stream::unfold(self, |mut source| async move {
            let item = source.next_chunk().await?;
            Some((item, source))
        })
    }
}
