//! Node settings persistence via TOML.
//!
//! Settings are stored at `<config_dir>/icedrive/settings.toml`.
//! Missing or corrupted config files return sensible defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use icedrive_blob::transfer::DEFAULT_CHUNK_SIZE;
use icedrive_blob::ResolverConfig;
use icedrive_protocol::ticket::ServiceTicket;
use serde::{Deserialize, Serialize};

/// Default address the query server listens on.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:7400";

const SETTINGS_FILE: &str = "settings.toml";

/// Node configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root of the blob store.
    pub storage_dir: PathBuf,
    /// Address the query server binds.
    pub listen_addr: String,
    /// Service tickets of the peers to consult on a local miss.
    pub peers: Vec<String>,
    /// Bytes requested per read when moving blob content.
    pub chunk_size: usize,
    /// Bound on one federated resolution, in milliseconds.
    pub query_timeout_ms: u64,
    /// Bound on one remote read, in milliseconds.
    pub read_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        let storage_dir = directories::ProjectDirs::from("", "", "icedrive")
            .map(|d| d.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("icedrive-data"));
        let resolver = ResolverConfig::default();

        Self {
            storage_dir,
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            peers: Vec::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            query_timeout_ms: resolver.query_timeout.as_millis() as u64,
            read_timeout_ms: resolver.read_timeout.as_millis() as u64,
        }
    }
}

impl Settings {
    /// Load settings from the default config path.
    ///
    /// Returns defaults if the file doesn't exist or is corrupted.
    pub fn load() -> Self {
        Self::load_from_dir(Self::config_dir())
    }

    /// Save settings to the default config path.
    pub fn save(&self) -> Result<()> {
        self.save_to_dir(Self::config_dir())
    }

    /// Load settings from a specific config directory.
    pub fn load_from_dir(config_dir: impl AsRef<Path>) -> Self {
        let path = config_dir.as_ref().join(SETTINGS_FILE);
        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(settings) => {
                    tracing::info!(path = %path.display(), "settings loaded");
                    settings
                }
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "corrupted settings file, using defaults"
                    );
                    Self::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(
                    path = %path.display(),
                    "settings file not found, using defaults"
                );
                Self::default()
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to read settings file, using defaults"
                );
                Self::default()
            }
        }
    }

    /// Save settings to a specific config directory.
    pub fn save_to_dir(&self, config_dir: impl AsRef<Path>) -> Result<()> {
        let config_dir = config_dir.as_ref();
        std::fs::create_dir_all(config_dir).with_context(|| {
            format!(
                "failed to create config directory: {}",
                config_dir.display()
            )
        })?;

        let path = config_dir.join(SETTINGS_FILE);
        let contents = toml::to_string_pretty(self).context("failed to serialize settings")?;
        std::fs::write(&path, &contents)
            .with_context(|| format!("failed to write settings file: {}", path.display()))?;

        tracing::info!(path = %path.display(), "settings saved");
        Ok(())
    }

    /// The default config directory.
    pub fn config_dir() -> PathBuf {
        directories::ProjectDirs::from("", "", "icedrive")
            .map(|d| d.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("icedrive-config"))
    }

    /// Federation timeouts.
    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            query_timeout: Duration::from_millis(self.query_timeout_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
        }
    }

    /// Parsed peer tickets. Entries that do not parse are logged and skipped.
    pub fn peer_tickets(&self) -> Vec<ServiceTicket> {
        self.peers
            .iter()
            .filter_map(|raw| match raw.parse::<ServiceTicket>() {
                Ok(ticket) => Some(ticket),
                Err(e) => {
                    tracing::warn!(ticket = %raw, error = %e, "ignoring invalid peer ticket");
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use icedrive_net::testing::init_test_tracing;
    use icedrive_protocol::types::PeerId;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn default_settings_are_valid() {
        init_test_tracing();
        let settings = Settings::default();
        assert!(!settings.storage_dir.as_os_str().is_empty());
        assert_eq!(settings.listen_addr, DEFAULT_LISTEN_ADDR);
        assert_eq!(settings.chunk_size, 4096);
        assert!(settings.peers.is_empty());
        assert_eq!(settings.resolver_config().query_timeout, Duration::from_secs(5));
    }

    #[test]
    fn save_and_load_roundtrip() {
        init_test_tracing();
        let tmp = TempDir::new().unwrap();

        let settings = Settings {
            storage_dir: PathBuf::from("/tmp/icedrive-test"),
            listen_addr: "0.0.0.0:9000".to_string(),
            peers: vec!["icedrive1abc".to_string()],
            chunk_size: 65_536,
            query_timeout_ms: 1500,
            read_timeout_ms: 2500,
        };

        settings.save_to_dir(tmp.path()).unwrap();
        let loaded = Settings::load_from_dir(tmp.path());
        assert_eq!(settings, loaded);
    }

    #[test]
    fn missing_config_returns_defaults() {
        init_test_tracing();
        let tmp = TempDir::new().unwrap();
        let loaded = Settings::load_from_dir(tmp.path().join("nonexistent"));
        assert_eq!(loaded, Settings::default());
    }

    #[test]
    fn corrupted_config_returns_defaults() {
        init_test_tracing();
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(SETTINGS_FILE), "{{{{not valid toml}}}}").unwrap();

        let loaded = Settings::load_from_dir(tmp.path());
        assert_eq!(loaded, Settings::default());
    }

    #[test]
    fn partial_config_fills_in_defaults() {
        init_test_tracing();
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join(SETTINGS_FILE),
            "listen_addr = \"127.0.0.1:9999\"\nquery_timeout_ms = 250\n",
        )
        .unwrap();

        let loaded = Settings::load_from_dir(tmp.path());
        assert_eq!(loaded.listen_addr, "127.0.0.1:9999");
        assert_eq!(
            loaded.resolver_config().query_timeout,
            Duration::from_millis(250)
        );
        assert_eq!(loaded.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn invalid_peer_tickets_are_skipped() {
        init_test_tracing();
        let good = ServiceTicket {
            peer_id: PeerId([3; 32]),
            addr: "127.0.0.1:7401".into(),
        };
        let settings = Settings {
            peers: vec![good.to_string(), "not-a-ticket".into()],
            ..Settings::default()
        };
        assert_eq!(settings.peer_tickets(), vec![good]);
    }
}
