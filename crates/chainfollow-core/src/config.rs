//! Follower configuration, its fluent builder, and filter configuration.
//!
//! # Example
//!
//! ```rust
//! use chainfollow_core::config::FollowerBuilder;
//! use chainfollow_core::cursor::Point;
//!
//! let config = FollowerBuilder::new()
//!     .id("mainnet-wallets")
//!     .start_point(Point::at("9e4c...", 4_492_800, 4_490_510))
//!     .block_to_wait(10)
//!     .snapshot_interval_ms(60_000)
//!     .build_config();
//! assert_eq!(config.block_to_wait, 10);
//! ```

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::cursor::Point;
use crate::filter::Filter;
use crate::metrics::FollowerMetrics;
use crate::publisher::BLOCK_TOPIC;
use crate::retry::RetryConfig;

/// Configuration for a follower instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FollowerConfig {
    /// Unique name for this follower (used as the checkpoint key).
    pub id: String,
    /// Where to resume when no checkpoint is stored. The first point known
    /// upstream wins.
    pub start_points: Vec<Point>,
    /// Number of later blocks a matched block must be buried under before it
    /// is published. `0` publishes on match.
    pub block_to_wait: u64,
    /// How often the cursor is checkpointed (milliseconds).
    pub snapshot_interval_ms: u64,
    /// How often the watchdog checks for progress (milliseconds).
    pub watchdog_interval_ms: u64,
    /// Topic block messages and rollback notices are published to.
    pub topic: String,
    /// Backoff for the watchdog's restart after a stall.
    pub restart_retry: RetryConfig,
}

impl Default for FollowerConfig {
    fn default() -> Self {
        Self {
            id: "default".into(),
            start_points: vec![Point::Origin],
            block_to_wait: 6,
            snapshot_interval_ms: 300_000,
            watchdog_interval_ms: 900_000,
            topic: BLOCK_TOPIC.into(),
            restart_retry: RetryConfig::default(),
        }
    }
}

impl FollowerConfig {
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms.max(1))
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms.max(1))
    }
}

/// Fluent builder for [`FollowerConfig`].
#[derive(Default)]
pub struct FollowerBuilder {
    config: FollowerConfig,
}

impl FollowerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.config.id = id.into();
        self
    }

    /// Replace the start points with a single point.
    pub fn start_point(mut self, point: Point) -> Self {
        self.config.start_points = vec![point];
        self
    }

    pub fn start_points(mut self, points: Vec<Point>) -> Self {
        self.config.start_points = points;
        self
    }

    pub fn block_to_wait(mut self, depth: u64) -> Self {
        self.config.block_to_wait = depth;
        self
    }

    pub fn snapshot_interval_ms(mut self, ms: u64) -> Self {
        self.config.snapshot_interval_ms = ms;
        self
    }

    pub fn watchdog_interval_ms(mut self, ms: u64) -> Self {
        self.config.watchdog_interval_ms = ms;
        self
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.config.topic = topic.into();
        self
    }

    pub fn restart_retry(mut self, retry: RetryConfig) -> Self {
        self.config.restart_retry = retry;
        self
    }

    pub fn build_config(self) -> FollowerConfig {
        self.config
    }
}

// ─── Filters ──────────────────────────────────────────────────────────────────

/// Declarative form of a built-in filter.
///
/// ```json
/// {"type": "wallet_address", "id": "treasury", "addresses": ["addr1..."]}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterConfig {
    WalletAddress { id: String, addresses: Vec<String> },
    PolicyId { id: String, policy_ids: Vec<String> },
    Vkey { id: String, keys: Vec<String> },
}

impl FilterConfig {
    pub fn id(&self) -> &str {
        match self {
            Self::WalletAddress { id, .. } | Self::PolicyId { id, .. } | Self::Vkey { id, .. } => id,
        }
    }

    pub fn into_filter(self, metrics: Option<Arc<FollowerMetrics>>) -> Filter {
        let filter = match self {
            Self::WalletAddress { id, addresses } => Filter::wallet_address(id, addresses),
            Self::PolicyId { id, policy_ids } => Filter::policy_id(id, policy_ids),
            Self::Vkey { id, keys } => Filter::vkey(id, keys),
        };
        match metrics {
            Some(m) => filter.with_metrics(m),
            None => filter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterKind;

    #[test]
    fn defaults() {
        let cfg = FollowerBuilder::new().build_config();
        assert_eq!(cfg.id, "default");
        assert_eq!(cfg.start_points, vec![Point::Origin]);
        assert_eq!(cfg.block_to_wait, 6);
        assert_eq!(cfg.snapshot_interval(), Duration::from_secs(300));
        assert_eq!(cfg.watchdog_interval(), Duration::from_secs(900));
        assert_eq!(cfg.topic, "blocks");
        assert_eq!(cfg.restart_retry, RetryConfig::default());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: FollowerConfig = serde_json::from_str(
            r#"{"id": "wallets", "block_to_wait": 2,
                "start_points": [{"id": "ab", "slot": 10, "height": 5}, "origin"],
                "restart_retry": {"max_retries": 10}}"#,
        )
        .unwrap();
        assert_eq!(cfg.id, "wallets");
        assert_eq!(cfg.block_to_wait, 2);
        assert_eq!(cfg.start_points, vec![Point::at("ab", 10, 5), Point::Origin]);
        assert_eq!(cfg.snapshot_interval_ms, 300_000);
        assert_eq!(cfg.restart_retry.max_retries, 10);
        assert_eq!(cfg.restart_retry.initial_backoff_ms, 100);
    }

    #[test]
    fn filter_config_parses_tagged() {
        let filters: Vec<FilterConfig> = serde_json::from_str(
            r#"[
                {"type": "wallet_address", "id": "w", "addresses": ["addr1"]},
                {"type": "policy_id", "id": "p", "policy_ids": ["AB"]},
                {"type": "vkey", "id": "k", "keys": ["cd"]}
            ]"#,
        )
        .unwrap();
        assert_eq!(filters[1].id(), "p");

        let kinds: Vec<_> = filters
            .into_iter()
            .map(|f| f.into_filter(None).kind().clone())
            .collect();
        assert!(matches!(&kinds[0], FilterKind::WalletAddress(s) if s.contains("addr1")));
        assert!(matches!(&kinds[1], FilterKind::PolicyId(s) if s.contains("ab")));
        assert!(matches!(&kinds[2], FilterKind::VerificationKey(_)));
    }
}
