//! Single-use pairing secrets that let a second peer find a tunnel.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::error::StoreError;

/// Characters a secret is drawn from.
const ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Length of a pairing secret.
pub const SECRET_LEN: usize = 6;

/// Where pairing secrets live until they are redeemed or expire.
pub trait SecretStore: Send + Sync + fmt::Debug + 'static {
    /// Records `secret` → `tunnel_id` for `ttl`.
    ///
    /// Returns `false` without changing anything if the secret is already
    /// taken.
    fn insert(&self, secret: &str, tunnel_id: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Redeems a secret: returns its tunnel id and forgets it.
    fn take(&self, secret: &str) -> Result<Option<String>, StoreError>;
}

/// A stored secret.
#[derive(Debug)]
struct Entry {
    /// Tunnel the secret joins.
    tunnel_id: String,
    /// When the secret stops working.
    expires: Instant,
}

/// In-process [`SecretStore`].
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    /// Secret → entry.
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemorySecretStore {
    /// Locks the map, ignoring poisoning.
    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SecretStore for MemorySecretStore {
    fn insert(&self, secret: &str, tunnel_id: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries();
        entries.retain(|_, e| e.expires > now);
        if entries.contains_key(secret) {
            return Ok(false);
        }
        entries.insert(
            secret.to_owned(),
            Entry {
                tunnel_id: tunnel_id.to_owned(),
                expires: now + ttl,
            },
        );
        Ok(true)
    }

    fn take(&self, secret: &str) -> Result<Option<String>, StoreError> {
        let entry = self.entries().remove(secret);
        Ok(entry
            .filter(|e| e.expires > Instant::now())
            .map(|e| e.tunnel_id))
    }
}

/// A fresh random secret of [`SECRET_LEN`] characters from `0-9A-Z`.
pub fn generate_secret() -> String {
    let mut rng = rand::rng();
    (0..SECRET_LEN)
        .map(|_| char::from(ALPHABET[rng.random_range(0..ALPHABET.len())]))
        .collect()
}
