//! Signed capability tokens binding a peer slot, a tunnel and a client IP.
//!
//! A token reads `peer|tunnel|ip|signature`, where the signature is the
//! HMAC-SHA256 of `peer|tunnel|ip` under the relay secret, as unpadded
//! standard base64.

use std::fmt;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use blobs_proto::PeerId;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// SHA-256 block size.
const BLOCK: usize = 64;

/// What a valid token grants.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Grant {
    /// Slot the bearer may occupy.
    pub peer: PeerId,
    /// Tunnel the slot belongs to.
    pub tunnel_id: String,
    /// Client IP the token was issued to.
    pub ip: String,
}

/// Issues and checks tokens with one relay secret.
#[derive(Clone)]
pub struct Signer {
    /// HMAC key.
    key: Arc<[u8]>,
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer").finish_non_exhaustive()
    }
}

impl Signer {
    /// Signer keyed by `secret`.
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            key: Arc::from(secret.as_ref()),
        }
    }

    /// Issues a token for `peer` of `tunnel_id`, bound to `ip`.
    pub fn sign(&self, peer: PeerId, tunnel_id: &str, ip: &str) -> String {
        let claims = format!("{peer}|{tunnel_id}|{ip}");
        let signature = STANDARD_NO_PAD.encode(hmac_sha256(&self.key, claims.as_bytes()));
        format!("{claims}|{signature}")
    }

    /// Checks a token's shape and signature.
    ///
    /// The bound IP is returned in the grant; comparing it with the caller
    /// is up to the caller.
    pub fn verify(&self, token: &str) -> Result<Grant> {
        let (claims, signature) = token
            .rsplit_once('|')
            .ok_or(Error::Unauthorized("malformed token"))?;
        let mut parts = claims.split('|');
        let (Some(peer), Some(tunnel_id), Some(ip), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::Unauthorized("malformed token"));
        };
        let peer: PeerId = peer
            .parse()
            .map_err(|_| Error::Unauthorized("malformed token"))?;
        if tunnel_id.is_empty() || ip.is_empty() {
            return Err(Error::Unauthorized("malformed token"));
        }

        let expected = STANDARD_NO_PAD.encode(hmac_sha256(&self.key, claims.as_bytes()));
        if !constant_time_eq(expected.as_bytes(), signature.as_bytes()) {
            return Err(Error::Unauthorized("invalid token signature"));
        }
        Ok(Grant {
            peer,
            tunnel_id: tunnel_id.to_owned(),
            ip: ip.to_owned(),
        })
    }
}

/// HMAC-SHA256 (RFC 2104).
fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut block = [0u8; BLOCK];
    if key.len() > BLOCK {
        block[..32].copy_from_slice(&Sha256::digest(key));
    } else {
        block[..key.len()].copy_from_slice(key);
    }

    let ipad = block.map(|b| b ^ 0x36);
    let opad = block.map(|b| b ^ 0x5c);

    let inner = Sha256::new().chain_update(ipad).chain_update(data).finalize();
    Sha256::new()
        .chain_update(opad)
        .chain_update(inner)
        .finalize()
        .into()
}

/// Compares without an early exit on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
