//! Routing of chunk messages to the downloads active on a tunnel.

use blobs_proto::{BlobId, Message, PeerId};
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::{DownloadError, Error, Result};
use crate::source::{Delivery, Outstanding};

/// A registered download.
#[derive(Debug)]
struct Download {
    /// Blob being streamed.
    id: BlobId,
    /// Registration number, so a late release cannot remove a newer
    /// download of the same blob.
    seq: u64,
    /// Inbox of the download's [`BlobSource`](crate::BlobSource).
    inbox: mpsc::UnboundedSender<Delivery>,
    /// Raised while the source waits for an answer.
    outstanding: Outstanding,
}

/// Result of [`DownloadMux::route`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Routed {
    /// Forwarded to a download that is still running.
    Delivered,
    /// Forwarded, and it was the end-of-file chunk: the download is removed.
    Finished,
    /// No live download matched, or it had no request outstanding; the
    /// message was discarded.
    Dropped,
}

/// The set of downloads active on one tunnel.
///
/// Downloads are few, so lookup is a linear scan. Messages for one blob are
/// forwarded in the order they are routed; nothing is ordered across blobs.
#[derive(Debug, Default)]
pub(crate) struct DownloadMux {
    /// Active downloads.
    downloads: Vec<Download>,
}

impl DownloadMux {
    /// Adds a download. Fails if `id` already has one.
    pub(crate) fn register(
        &mut self,
        id: BlobId,
        seq: u64,
        inbox: mpsc::UnboundedSender<Delivery>,
        outstanding: Outstanding,
    ) -> Result<()> {
        if self.contains(&id) {
            return Err(Error::Busy(id));
        }
        self.downloads.push(Download {
            id,
            seq,
            inbox,
            outstanding,
        });
        Ok(())
    }

    /// Forwards a `DataChunk` or `DataChunkEnd` to its download.
    pub(crate) fn route(&mut self, msg: Message) -> Routed {
        let (id, delivery) = match msg {
            Message::DataChunk { id, bytes, .. } => (id, Delivery::Chunk(bytes)),
            Message::DataChunkEnd { id } => (id, Delivery::End),
            other => {
                trace!(kind = other.kind(), "not a chunk message");
                return Routed::Dropped;
            }
        };
        let Some(idx) = self.position(&id) else {
            trace!(blob = %id, "no active download");
            return Routed::Dropped;
        };

        let download = &self.downloads[idx];
        if !download.outstanding.is_raised() {
            trace!(blob = %id, "no request outstanding");
            return Routed::Dropped;
        }
        if delivery == Delivery::End {
            download.outstanding.lower();
        }

        let eof = matches!(&delivery, Delivery::Chunk(bytes) if bytes.is_empty());
        if download.inbox.send(delivery).is_err() {
            // The body went away and its release is still queued.
            self.downloads.swap_remove(idx);
            return Routed::Dropped;
        }
        if eof {
            self.downloads.swap_remove(idx);
            return Routed::Finished;
        }
        Routed::Delivered
    }

    /// Removes the download registered as `seq`. Returns whether it existed.
    pub(crate) fn unregister(&mut self, id: &BlobId, seq: u64) -> bool {
        match self
            .downloads
            .iter()
            .position(|d| &d.id == id && d.seq == seq)
        {
            Some(idx) => {
                self.downloads.swap_remove(idx);
                true
            }
            None => false,
        }
    }

    /// Fails and removes every download of a blob owned by `owner`.
    pub(crate) fn close_owned_by(&mut self, owner: PeerId) -> usize {
        self.close_where(|d| d.id.owner == owner, DownloadError::PeerGone)
    }

    /// Fails and removes every download.
    pub(crate) fn close_all(&mut self) -> usize {
        self.close_where(|_| true, DownloadError::TunnelClosed)
    }

    /// Whether `id` has an active download.
    pub(crate) fn contains(&self, id: &BlobId) -> bool {
        self.position(id).is_some()
    }

    /// Number of active downloads.
    pub(crate) fn len(&self) -> usize {
        self.downloads.len()
    }

    /// Index of the download for `id`.
    fn position(&self, id: &BlobId) -> Option<usize> {
        self.downloads.iter().position(|d| &d.id == id)
    }

    /// Sends `reason` to matching downloads and removes them.
    fn close_where(
        &mut self,
        mut matches: impl FnMut(&Download) -> bool,
        reason: fn(BlobId) -> DownloadError,
    ) -> usize {
        let before = self.downloads.len();
        self.downloads.retain(|d| {
            if !matches(d) {
                return true;
            }
            let _ = d.inbox.send(Delivery::Closed(reason(d.id.clone())));
            false
        });
        before - self.downloads.len()
    }
}
