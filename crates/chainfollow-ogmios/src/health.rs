//! Ogmios server health over HTTP (`GET /health`).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use chainfollow_core::cursor::Point;
use chainfollow_core::error::FollowerError;

/// How long a health request may take.
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// The `/health` document. Only the fields the follower reports on are
/// typed; everything else is kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerHealth {
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub last_known_tip: Option<Point>,
    #[serde(default)]
    pub last_tip_update: Option<String>,
    /// Fraction of the chain the node has caught up with, `1.0` when synced.
    #[serde(default)]
    pub network_synchronization: Option<f64>,
    #[serde(default)]
    pub current_era: Option<String>,
    #[serde(default)]
    pub connection_status: Option<String>,
    #[serde(default)]
    pub current_epoch: Option<u64>,
    #[serde(default)]
    pub slot_in_epoch: Option<u64>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl ServerHealth {
    /// Ogmios holds a live connection to its node.
    pub fn is_connected(&self) -> bool {
        self.connection_status.as_deref() == Some("connected")
    }

    pub fn is_synced(&self) -> bool {
        self.network_synchronization.is_some_and(|s| s >= 1.0)
    }
}

/// Fetch and decode `url`.
pub(crate) async fn fetch(http: &reqwest::Client, url: &str) -> Result<ServerHealth, FollowerError> {
    debug!(url, "Querying Ogmios health");
    let resp = http
        .get(url)
        .timeout(HEALTH_TIMEOUT)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| FollowerError::Upstream(format!("health {url}: {e}")))?;
    resp.json()
        .await
        .map_err(|e| FollowerError::Upstream(format!("health {url}: invalid body: {e}")))
}
