//! Application config file for the `chainfollow` binary.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use chainfollow_core::{FilterConfig, FollowerConfig, RetryConfig};
use chainfollow_ogmios::OgmiosConfig;

use crate::telemetry::LogConfig;

/// Where checkpoints and the block mirror live.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageConfig {
    #[default]
    Memory,
    Sqlite { path: String },
}

/// Everything the binary needs, loaded from one JSON file.
///
/// ```json
/// {
///   "follower": { "id": "wallets", "block_to_wait": 6 },
///   "filters": [
///     { "type": "wallet_address", "id": "treasury", "addresses": ["addr1..."] }
///   ],
///   "ogmios": { "host": "localhost", "port": 1337 },
///   "storage": { "type": "sqlite", "path": "./chainfollow.db" },
///   "log": { "level": "info" }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub follower: FollowerConfig,
    pub filters: Vec<FilterConfig>,
    pub ogmios: OgmiosConfig,
    pub storage: StorageConfig,
    /// Backoff for applying bus messages to the mirror.
    pub retry: RetryConfig,
    pub log: LogConfig,
}

impl AppConfig {
    /// Read `path` and apply `OGMIOS_HOST` / `OGMIOS_PORT` overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let mut config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = lookup("OGMIOS_HOST") {
            self.ogmios.host = host;
        }
        if let Some(port) = lookup("OGMIOS_PORT") {
            self.ogmios.port = port
                .parse()
                .with_context(|| format!("OGMIOS_PORT is not a port number: {port}"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainfollow_core::Point;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"{
        "follower": {
            "id": "wallets",
            "start_points": [{"id": "b9", "slot": 180, "height": 9}, "origin"],
            "block_to_wait": 3
        },
        "filters": [
            {"type": "wallet_address", "id": "treasury", "addresses": ["addr1"]},
            {"type": "vkey", "id": "signers", "keys": ["aa"]}
        ],
        "ogmios": {"host": "node.local"},
        "storage": {"type": "sqlite", "path": "/tmp/cf.db"}
    }"#;

    #[test]
    fn parses_full_file_with_defaults() {
        let config: AppConfig = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(config.follower.id, "wallets");
        assert_eq!(config.follower.block_to_wait, 3);
        assert_eq!(
            config.follower.start_points,
            vec![Point::at("b9", 180, 9), Point::Origin]
        );
        assert_eq!(config.follower.topic, "blocks");
        assert_eq!(config.filters.len(), 2);
        assert_eq!(config.ogmios.host, "node.local");
        assert_eq!(config.ogmios.port, 1337);
        assert_eq!(
            config.storage,
            StorageConfig::Sqlite { path: "/tmp/cf.db".into() }
        );
        assert_eq!(config.log, LogConfig::default());
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let config: AppConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.storage, StorageConfig::Memory);
    }

    #[test]
    fn environment_overrides_ogmios_endpoint() {
        let env: HashMap<&str, &str> = [("OGMIOS_HOST", "10.0.0.5"), ("OGMIOS_PORT", "1442")].into();
        let mut config = AppConfig::default();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.ogmios.url(), "ws://10.0.0.5:1442");
    }

    #[test]
    fn bad_port_is_rejected() {
        let mut config = AppConfig::default();
        let err = config
            .apply_env(|k| (k == "OGMIOS_PORT").then(|| "not-a-port".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("OGMIOS_PORT"));
    }

    #[test]
    fn load_reports_missing_file() {
        let err = AppConfig::load(Path::new("/nonexistent/chainfollow.json")).unwrap_err();
        assert!(err.to_string().contains("reading config"));
    }
}
