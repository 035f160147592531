//! Node configuration
//!
//! All values supplied by collaborators (device identifier, shared key,
//! bandwidth cap, ports, bind policy, directories) live in [`ShareConfig`].
//! Every field has a default so a partial JSON file is enough.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::{self, KEY_SIZE};
use crate::error::ShareError;

/// Default UDP port for discovery datagrams
pub const DEFAULT_DISCOVERY_PORT: u16 = 47100;

/// Default TCP port for the transfer protocol
pub const DEFAULT_TRANSFER_PORT: u16 = 47101;

/// Worst-case gap between two announces (steady interval + jitter)
pub const WORST_CASE_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(6);

/// Which local addresses the listeners bind to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BindPolicy {
    /// 0.0.0.0
    #[default]
    AllInterfaces,
    /// 127.0.0.1 only (tests, single-machine setups)
    Loopback,
    /// A specific local interface address
    Specific(IpAddr),
}

impl BindPolicy {
    /// The IP address listeners bind to
    pub fn ip(&self) -> IpAddr {
        match self {
            BindPolicy::AllInterfaces => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            BindPolicy::Loopback => IpAddr::V4(Ipv4Addr::LOCALHOST),
            BindPolicy::Specific(ip) => *ip,
        }
    }
}

/// Stream compression applied to file contents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompressionMode {
    /// Raw bytes
    #[default]
    None,
    /// zstd-compressed blocks
    Zstd,
}

/// Configuration for a lanshare node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShareConfig {
    /// Stable device identifier (used in vector clocks and handshakes)
    pub device_id: String,
    /// Human readable host label announced to peers
    pub host_name: String,
    /// UDP port for discovery
    pub discovery_port: u16,
    /// TCP port for transfers
    pub transfer_port: u16,
    /// Bind address policy for both listeners
    pub bind: BindPolicy,
    /// Where announces are sent. Empty means the limited broadcast address.
    pub announce_targets: Vec<SocketAddr>,
    /// Shared key: 64 hex chars or a passphrase. `None` disables encryption.
    pub shared_key: Option<String>,
    /// Sender bandwidth cap in bytes/sec, 0 = unlimited
    pub bandwidth_limit: u64,
    /// Compression for outgoing file data
    pub compression: CompressionMode,
    /// Accept incoming transfers without asking
    pub auto_accept: bool,
    /// How long an incoming transfer waits for approval
    #[serde(with = "duration_secs")]
    pub approval_timeout: Duration,
    /// How long a handshake may take
    #[serde(with = "duration_secs")]
    pub handshake_timeout: Duration,
    /// How long a transfer waits for the lock on its destination directory
    #[serde(with = "duration_secs")]
    pub lock_timeout: Duration,
    /// Silence after which a discovered peer is dropped
    #[serde(with = "duration_secs")]
    pub peer_timeout: Duration,
    /// Quiet period before a watched save directory is synced
    #[serde(with = "duration_secs")]
    pub save_debounce: Duration,
    /// Number of save versions kept per monitored directory
    pub max_save_versions: usize,
    /// Incoming packages land here
    pub receive_dir: PathBuf,
    /// Packages offered to peers (one top-level directory per package)
    pub library_dir: PathBuf,
    /// Database, save backups, logs
    pub data_dir: PathBuf,
}

impl Default for ShareConfig {
    fn default() -> Self {
        let base = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".lanshare");

        Self {
            device_id: ulid::Ulid::new().to_string(),
            host_name: default_host_name(),
            discovery_port: DEFAULT_DISCOVERY_PORT,
            transfer_port: DEFAULT_TRANSFER_PORT,
            bind: BindPolicy::AllInterfaces,
            announce_targets: Vec::new(),
            shared_key: None,
            bandwidth_limit: 0,
            compression: CompressionMode::None,
            auto_accept: false,
            approval_timeout: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(60),
            lock_timeout: Duration::from_secs(30),
            peer_timeout: Duration::from_secs(20),
            save_debounce: Duration::from_secs(5),
            max_save_versions: 10,
            receive_dir: base.join("received"),
            library_dir: base.join("library"),
            data_dir: base.join("data"),
        }
    }
}

impl ShareConfig {
    /// Config rooted in one directory (used by tests and the CLI `--data-dir`).
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            receive_dir: root.join("received"),
            library_dir: root.join("library"),
            data_dir: root.join("data"),
            ..Self::default()
        }
    }

    /// Load from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ShareError> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        let config: ShareConfig = serde_json::from_slice(&data)
            .map_err(|e| ShareError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Write as pretty JSON, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ShareError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Reject settings the protocols cannot work with.
    pub fn validate(&self) -> Result<(), ShareError> {
        if self.device_id.trim().is_empty() {
            return Err(ShareError::Config("device_id must not be empty".into()));
        }
        if self.peer_timeout <= WORST_CASE_ANNOUNCE_INTERVAL * 2 {
            return Err(ShareError::Config(format!(
                "peer_timeout ({:?}) must exceed twice the worst-case announce interval ({:?})",
                self.peer_timeout, WORST_CASE_ANNOUNCE_INTERVAL
            )));
        }
        if self.max_save_versions == 0 {
            return Err(ShareError::Config("max_save_versions must be at least 1".into()));
        }
        if let Some(key) = &self.shared_key {
            crypto::parse_shared_key(key)?;
        }
        Ok(())
    }

    /// The parsed shared key, if encryption is configured.
    pub fn channel_key(&self) -> Result<Option<[u8; KEY_SIZE]>, ShareError> {
        self.shared_key
            .as_deref()
            .map(crypto::parse_shared_key)
            .transpose()
    }

    /// Address the transfer listener binds to
    pub fn transfer_bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind.ip(), self.transfer_port)
    }

    /// Address the discovery socket binds to
    pub fn discovery_bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind.ip(), self.discovery_port)
    }

    /// Targets for announces, defaulting to the limited broadcast address
    pub fn effective_announce_targets(&self) -> Vec<SocketAddr> {
        if self.announce_targets.is_empty() {
            vec![SocketAddr::new(
                IpAddr::V4(Ipv4Addr::BROADCAST),
                self.discovery_port,
            )]
        } else {
            self.announce_targets.clone()
        }
    }

    /// Path of the redb database
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("lanshare.redb")
    }
}

fn default_host_name() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "lanshare-device".to_string())
}

/// Serialize durations as whole seconds in config files
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = ShareConfig::default();
        config.validate().unwrap();
        assert_eq!(config.discovery_port, DEFAULT_DISCOVERY_PORT);
        assert_eq!(config.approval_timeout, Duration::from_secs(60));
        assert!(config.channel_key().unwrap().is_none());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"device_id":"deck-1","bandwidth_limit":1048576,"bind":"loopback"}"#,
        )
        .unwrap();

        let config = ShareConfig::load(&path).unwrap();
        assert_eq!(config.device_id, "deck-1");
        assert_eq!(config.bandwidth_limit, 1_048_576);
        assert_eq!(config.bind, BindPolicy::Loopback);
        assert_eq!(config.transfer_port, DEFAULT_TRANSFER_PORT);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("config.json");

        let mut config = ShareConfig::with_root(temp.path());
        config.shared_key = Some("a passphrase".into());
        config.save(&path).unwrap();

        assert_eq!(ShareConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_short_peer_timeout_rejected() {
        let config = ShareConfig {
            peer_timeout: Duration::from_secs(10),
            ..ShareConfig::default()
        };
        assert!(matches!(config.validate(), Err(ShareError::Config(_))));
    }

    #[test]
    fn test_default_announce_target_is_broadcast() {
        let config = ShareConfig::default();
        let targets = config.effective_announce_targets();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].ip(), IpAddr::V4(Ipv4Addr::BROADCAST));
    }
}
