//! Pairing and authorization on top of the tunnel registry.

use std::sync::Arc;

use blobs_proto::PeerId;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::pairing::{MemorySecretStore, SecretStore, generate_secret};
use crate::registry::Tunnels;
use crate::token::{Grant, Signer};
use crate::tunnel::{TunnelHandle, TunnelSettings};

/// Attempts at drawing an unused pairing secret before giving up.
const SECRET_ATTEMPTS: usize = 16;

/// Answer to creating a tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct Created {
    /// Pairing secret for the second peer.
    pub secret: String,
    /// Creator's capability token.
    pub token: String,
    /// New tunnel.
    pub tunnel_id: String,
}

/// Answer to joining a tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct Joined {
    /// Joiner's capability token.
    pub token: String,
    /// Joined tunnel.
    pub tunnel_id: String,
}

/// Shared relay state.
#[derive(Debug)]
struct Inner {
    /// Settings the relay was started with.
    config: RelayConfig,
    /// Live tunnels.
    tunnels: Tunnels,
    /// Unredeemed pairing secrets.
    secrets: Arc<dyn SecretStore>,
    /// Token issuer.
    signer: Signer,
}

/// Entry point for everything the HTTP surface does. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Relay {
    /// Shared state.
    inner: Arc<Inner>,
}

impl Relay {
    /// Relay with in-memory tunnel and secret stores.
    pub fn new(config: RelayConfig) -> Result<Self> {
        let tunnels = Tunnels::new(TunnelSettings::from(&config));
        Self::with_stores(config, tunnels, Arc::new(MemorySecretStore::default()))
    }

    /// Relay over caller-provided stores.
    pub fn with_stores(
        config: RelayConfig,
        tunnels: Tunnels,
        secrets: Arc<dyn SecretStore>,
    ) -> Result<Self> {
        config.validate()?;
        let signer = Signer::new(&config.secret);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                tunnels,
                secrets,
                signer,
            }),
        })
    }

    /// Settings in effect.
    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    /// Live tunnels.
    pub fn tunnels(&self) -> &Tunnels {
        &self.inner.tunnels
    }

    /// Token issuer.
    pub fn signer(&self) -> &Signer {
        &self.inner.signer
    }

    /// Opens a tunnel for a creator at `ip`.
    pub fn create(&self, ip: &str) -> Result<Created> {
        let tunnel = self.inner.tunnels.create();
        let ttl = self.inner.config.pairing_ttl();

        let mut secret = None;
        for _ in 0..SECRET_ATTEMPTS {
            let candidate = generate_secret();
            let inserted = match self.inner.secrets.insert(&candidate, tunnel.id(), ttl) {
                Ok(inserted) => inserted,
                Err(e) => {
                    tunnel.expire();
                    return Err(e.into());
                }
            };
            if inserted {
                secret = Some(candidate);
                break;
            }
            debug!("pairing secret collision");
        }
        let Some(secret) = secret else {
            tunnel.expire();
            return Err(Error::Internal("no free pairing secret".into()));
        };

        info!(tunnel = tunnel.id(), "tunnel created");
        Ok(Created {
            token: self.inner.signer.sign(PeerId::Creator, tunnel.id(), ip),
            tunnel_id: tunnel.id().to_owned(),
            secret,
        })
    }

    /// Redeems a pairing secret for a joiner at `ip`.
    pub fn join(&self, secret: &str, ip: &str) -> Result<Joined> {
        let normalized = secret.trim().to_ascii_uppercase();
        if normalized.is_empty() {
            return Err(Error::BadRequest("missing pairing secret".into()));
        }
        let tunnel_id = self
            .inner
            .secrets
            .take(&normalized)?
            .ok_or_else(|| Error::NotFound("unknown or used pairing secret".into()))?;
        if self.inner.tunnels.get(&tunnel_id).is_none() {
            return Err(Error::NotFound("tunnel is gone".into()));
        }

        info!(tunnel = %tunnel_id, "tunnel joined");
        Ok(Joined {
            token: self.inner.signer.sign(PeerId::Joiner, &tunnel_id, ip),
            tunnel_id,
        })
    }

    /// Checks a token presented from `ip` and finds its tunnel.
    pub fn authorize(&self, token: &str, ip: &str) -> Result<(Grant, TunnelHandle)> {
        let grant = self.inner.signer.verify(token)?;
        if grant.ip != ip {
            warn!(tunnel = %grant.tunnel_id, bound = %grant.ip, ip, "token used from another address");
            return Err(Error::Unauthorized("token was issued to another address"));
        }
        let tunnel = self
            .inner
            .tunnels
            .get(&grant.tunnel_id)
            .ok_or_else(|| Error::NotFound("tunnel is gone".into()))?;
        Ok((grant, tunnel))
    }
}
