//! Ogmios chain-sync JSON-RPC messages.
//!
//! Only the two mini-protocol calls the follower needs are modelled:
//! `findIntersection` and `nextBlock`. Blocks are passed through as
//! [`Block`], keeping every field Ogmios sends.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use chainfollow_core::cursor::Point;
use chainfollow_core::error::FollowerError;
use chainfollow_core::types::Block;

/// Ogmios error code for "none of the requested points is on chain".
pub const INTERSECTION_NOT_FOUND: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OriginTag {
    Origin,
}

/// A point as Ogmios encodes it: `"origin"` or `{slot, id}` (no height).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WirePoint {
    Origin(OriginTag),
    At { slot: u64, id: String },
}

impl WirePoint {
    pub fn origin() -> Self {
        Self::Origin(OriginTag::Origin)
    }
}

impl From<&Point> for WirePoint {
    fn from(point: &Point) -> Self {
        match point {
            Point::Origin => Self::origin(),
            Point::At(c) => Self::At {
                slot: c.slot,
                id: c.id.clone(),
            },
        }
    }
}

/// The upstream tip: `"origin"` or `{slot, id, height}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum WireTip {
    Origin(OriginTag),
    At { slot: u64, id: String, height: u64 },
}

impl From<WireTip> for Point {
    fn from(tip: WireTip) -> Self {
        match tip {
            WireTip::Origin(_) => Point::Origin,
            WireTip::At { slot, id, height } => Point::at(id, slot, height),
        }
    }
}

/// Result of `findIntersection`.
#[derive(Debug, Clone, Deserialize)]
pub struct IntersectionFound {
    pub intersection: WirePoint,
    pub tip: WireTip,
}

/// Result of `nextBlock`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "direction", rename_all = "lowercase")]
pub enum NextBlock {
    Forward { block: Block, tip: WireTip },
    Backward { point: WirePoint, tip: WireTip },
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// A JSON-RPC 2.0 response frame.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    /// The decoded result, or the RPC error mapped to an upstream error.
    pub fn into_result<T: serde::de::DeserializeOwned>(self) -> Result<T, FollowerError> {
        if let Some(err) = self.error {
            return Err(FollowerError::Upstream(format!(
                "ogmios error {}: {}",
                err.code, err.message
            )));
        }
        let result = self
            .result
            .ok_or_else(|| FollowerError::Upstream("response without result".into()))?;
        Ok(serde_json::from_value(result)?)
    }

    pub fn has_id(&self, id: u64) -> bool {
        self.id.as_ref().and_then(Value::as_u64) == Some(id)
    }
}

pub fn find_intersection_request(id: u64, points: &[Point]) -> Value {
    let points: Vec<WirePoint> = points.iter().map(WirePoint::from).collect();
    json!({
        "jsonrpc": "2.0",
        "method": "findIntersection",
        "params": { "points": points },
        "id": id,
    })
}

pub fn next_block_request(id: u64) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": "nextBlock",
        "id": id,
    })
}
