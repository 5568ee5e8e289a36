//! Lookup of running tunnels by id.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use rand::Rng;
use tracing::debug;

use crate::store::{BlobStore, MemoryStore};
use crate::tunnel::{TunnelHandle, TunnelSettings};

/// Builds the metadata store of a new tunnel.
pub type StoreFactory = Arc<dyn Fn() -> Box<dyn BlobStore> + Send + Sync>;

/// Id → handle map shared by every request handler.
type Map = Mutex<HashMap<Arc<str>, TunnelHandle>>;

/// Every live tunnel of a relay.
///
/// A tunnel stays registered until its own cleanup succeeds, at which point
/// it removes itself.
#[derive(Clone)]
pub struct Tunnels {
    /// Live tunnels.
    map: Arc<Map>,
    /// Timers handed to new tunnels.
    settings: TunnelSettings,
    /// Store constructor handed to new tunnels.
    stores: StoreFactory,
}

impl fmt::Debug for Tunnels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnels")
            .field("len", &self.len())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Default for Tunnels {
    fn default() -> Self {
        Self::new(TunnelSettings::default())
    }
}

impl Tunnels {
    /// Registry whose tunnels keep metadata in memory.
    pub fn new(settings: TunnelSettings) -> Self {
        Self::with_store(
            settings,
            Arc::new(|| -> Box<dyn BlobStore> { Box::<MemoryStore>::default() }),
        )
    }

    /// Registry whose tunnels get their store from `stores`.
    pub fn with_store(settings: TunnelSettings, stores: StoreFactory) -> Self {
        Self {
            map: Arc::default(),
            settings,
            stores,
        }
    }

    /// Spawns and registers a tunnel under a fresh random id.
    pub fn create(&self) -> TunnelHandle {
        let mut map = lock(&self.map);
        let id = loop {
            let candidate: Arc<str> = new_tunnel_id().into();
            if !map.contains_key(&candidate) {
                break candidate;
            }
        };

        let weak = Arc::downgrade(&self.map);
        let key = Arc::clone(&id);
        let handle = TunnelHandle::spawn(
            Arc::clone(&id),
            self.settings,
            (self.stores)(),
            move || unregister(&weak, &key),
        );
        map.insert(id, handle.clone());
        debug!(tunnel = handle.id(), tunnels = map.len(), "tunnel registered");
        handle
    }

    /// Looks up a live tunnel.
    pub fn get(&self, id: &str) -> Option<TunnelHandle> {
        lock(&self.map).get(id).cloned()
    }

    /// Number of live tunnels.
    pub fn len(&self) -> usize {
        lock(&self.map).len()
    }

    /// Whether no tunnel is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes `id` once its tunnel task has stopped.
fn unregister(map: &Weak<Map>, id: &str) {
    if let Some(map) = map.upgrade() {
        lock(&map).remove(id);
        debug!(tunnel = id, "tunnel unregistered");
    }
}

/// Locks the map. A panic while holding the lock cannot leave it half
/// updated, so poisoning is ignored.
fn lock(map: &Map) -> MutexGuard<'_, HashMap<Arc<str>, TunnelHandle>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 128 random bits as lowercase hex.
fn new_tunnel_id() -> String {
    format!("{:032x}", rand::rng().random::<u128>())
}
