//! Per-tunnel storage of announced blob metadata.

use std::fmt;

use blobs_proto::{BlobId, BlobMetadata, PeerId};

use crate::error::StoreError;

/// Where a tunnel keeps the metadata its peers announce.
///
/// Only the owning tunnel actor touches its store, so implementations need
/// no internal locking.
pub trait BlobStore: Send + fmt::Debug + 'static {
    /// Records `meta`, replacing any earlier announcement of the same blob.
    fn put(&mut self, meta: BlobMetadata) -> Result<(), StoreError>;

    /// Looks up an announced blob.
    fn get(&self, id: &BlobId) -> Option<BlobMetadata>;

    /// All blobs announced by `owner`, in announcement order.
    fn owned_by(&self, owner: PeerId) -> Vec<BlobMetadata>;

    /// Forgets everything. May fail transiently; callers retry.
    fn clear(&mut self) -> Result<(), StoreError>;
}

/// In-process [`BlobStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    /// Announcements in arrival order.
    blobs: Vec<BlobMetadata>,
}

impl BlobStore for MemoryStore {
    fn put(&mut self, meta: BlobMetadata) -> Result<(), StoreError> {
        match self.blobs.iter_mut().find(|b| b.id == meta.id) {
            Some(existing) => *existing = meta,
            None => self.blobs.push(meta),
        }
        Ok(())
    }

    fn get(&self, id: &BlobId) -> Option<BlobMetadata> {
        self.blobs.iter().find(|b| &b.id == id).cloned()
    }

    fn owned_by(&self, owner: PeerId) -> Vec<BlobMetadata> {
        self.blobs
            .iter()
            .filter(|b| b.id.owner == owner)
            .cloned()
            .collect()
    }

    fn clear(&mut self) -> Result<(), StoreError> {
        self.blobs.clear();
        Ok(())
    }
}
