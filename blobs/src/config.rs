//! Relay configuration and JSON persistence.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use std::{fs, io};

use serde::{Deserialize, Serialize};

/// Tunnels self-destruct this long after their last peer connected (8 h).
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(8 * 60 * 60);

/// Pairing secrets expire after this long (1 h).
pub const PAIRING_TTL: Duration = Duration::from_secs(60 * 60);

/// Backoff between failed idle-cleanup attempts.
pub const CLEANUP_RETRY: Duration = Duration::from_secs(60);

/// Upper bound for every timer setting (30 days).
pub const MAX_TIMER_SECS: u64 = 30 * 24 * 60 * 60;

/// Relay settings. Every field has a default, so a config file only needs
/// the keys it overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct RelayConfig {
    /// Address the HTTP server binds to.
    pub listen: SocketAddr,
    /// Key for signing capability tokens. Must not be empty.
    pub secret: String,
    /// Idle lifetime of a tunnel, in seconds.
    pub session_timeout_secs: u64,
    /// Lifetime of an unused pairing secret, in seconds.
    pub pairing_ttl_secs: u64,
    /// Delay before retrying a failed tunnel cleanup, in seconds.
    pub cleanup_retry_secs: u64,
    /// Header carrying the client IP when running behind a proxy
    /// (e.g. `x-forwarded-for`). The TCP peer address is used otherwise.
    pub client_ip_header: Option<String>,
    /// Origins allowed to call the relay. Empty allows any origin.
    pub allowed_origins: Vec<String>,
    /// Largest WebSocket message accepted from a peer, in bytes.
    pub max_message_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8787)),
            secret: String::new(),
            session_timeout_secs: SESSION_TIMEOUT.as_secs(),
            pairing_ttl_secs: PAIRING_TTL.as_secs(),
            cleanup_retry_secs: CLEANUP_RETRY.as_secs(),
            client_ip_header: None,
            allowed_origins: Vec::new(),
            max_message_size: blobs_proto::MAX_MESSAGE,
        }
    }
}

impl RelayConfig {
    /// Loads a config from a JSON file.
    pub fn load(path: &Path) -> io::Result<Self> {
        let data = fs::read_to_string(path)?;
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Persists the config to a JSON file.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let file = fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(io::Error::other)
    }

    /// Checks values that have no usable default.
    pub fn validate(&self) -> crate::Result<()> {
        if self.secret.is_empty() {
            return Err(crate::Error::Config(
                "a token signing secret is required".into(),
            ));
        }
        for (name, secs) in [
            ("session_timeout_secs", self.session_timeout_secs),
            ("pairing_ttl_secs", self.pairing_ttl_secs),
            ("cleanup_retry_secs", self.cleanup_retry_secs),
        ] {
            if !(1..=MAX_TIMER_SECS).contains(&secs) {
                return Err(crate::Error::Config(format!(
                    "{name} must be between 1 and {MAX_TIMER_SECS}, got {secs}"
                )));
            }
        }
        Ok(())
    }

    /// Idle lifetime of a tunnel.
    pub const fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    /// Lifetime of a pairing secret.
    pub const fn pairing_ttl(&self) -> Duration {
        Duration::from_secs(self.pairing_ttl_secs)
    }

    /// Backoff for failed cleanups.
    pub const fn cleanup_retry(&self) -> Duration {
        Duration::from_secs(self.cleanup_retry_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.json");
        fs::write(
            &path,
            r#"{ "secret": "hunter2", "listen": "0.0.0.0:9000", "allowed_origins": ["https://blob.city"] }"#,
        )
        .unwrap();

        let config = RelayConfig::load(&path).unwrap();
        assert_eq!(config.secret, "hunter2");
        assert_eq!(config.listen.port(), 9000);
        assert_eq!(config.allowed_origins, vec!["https://blob.city"]);
        assert_eq!(config.session_timeout(), SESSION_TIMEOUT);
        assert_eq!(config.cleanup_retry(), CLEANUP_RETRY);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.json");
        let config = RelayConfig {
            secret: "s".into(),
            client_ip_header: Some("x-forwarded-for".into()),
            ..RelayConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(RelayConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn rejects_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.json");
        fs::write(&path, "{ not json").unwrap();
        let err = RelayConfig::load(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn empty_secret_is_invalid() {
        assert!(matches!(
            RelayConfig::default().validate(),
            Err(crate::Error::Config(_))
        ));
    }

    #[test]
    fn timers_must_be_in_range() {
        let valid = RelayConfig {
            secret: "s".into(),
            ..RelayConfig::default()
        };
        let cases = [
            RelayConfig {
                session_timeout_secs: u64::MAX,
                ..valid.clone()
            },
            RelayConfig {
                pairing_ttl_secs: 0,
                ..valid.clone()
            },
            RelayConfig {
                cleanup_retry_secs: 0,
                ..valid.clone()
            },
            RelayConfig {
                cleanup_retry_secs: MAX_TIMER_SECS + 1,
                ..valid.clone()
            },
        ];
        for config in cases {
            assert!(
                matches!(config.validate(), Err(crate::Error::Config(_))),
                "{config:?}"
            );
        }

        let longest = RelayConfig {
            session_timeout_secs: MAX_TIMER_SECS,
            ..valid
        };
        assert!(longest.validate().is_ok());
    }
}
