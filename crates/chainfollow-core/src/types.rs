//! Shared types for the chain-following pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::cursor::{Cursor, Point, Tip};

// ─── Block ────────────────────────────────────────────────────────────────────

/// A block as delivered by the chain-sync session.
///
/// Only the fields the follower and the filters read are typed; everything
/// else is kept in `extra` and republished untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: String,
    #[serde(default)]
    pub slot: u64,
    #[serde(default)]
    pub height: u64,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Block {
    pub fn new(id: impl Into<String>, slot: u64, height: u64) -> Self {
        Self {
            id: id.into(),
            slot,
            height,
            transactions: vec![],
            extra: Map::new(),
        }
    }

    pub fn with_transaction(mut self, tx: Transaction) -> Self {
        self.transactions.push(tx);
        self
    }

    /// The block's position in the chain.
    pub fn cursor(&self) -> Cursor {
        Cursor::new(self.id.clone(), self.slot, self.height)
    }

    pub fn point(&self) -> Point {
        Point::At(self.cursor())
    }
}

/// A transaction inside a [`Block`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub inputs: Vec<TxInput>,
    #[serde(default)]
    pub outputs: Vec<TxOutput>,
    /// Scripts carried by the transaction, keyed by script hash / policy id.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub scripts: Map<String, Value>,
    #[serde(default)]
    pub signatories: Vec<Signatory>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Transaction {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_output(mut self, address: impl Into<String>) -> Self {
        self.outputs.push(TxOutput {
            address: address.into(),
            extra: Map::new(),
        });
        self
    }

    pub fn with_script(mut self, policy_id: impl Into<String>) -> Self {
        self.scripts.insert(policy_id.into(), Value::Null);
        self
    }

    pub fn with_signatory(mut self, key: impl Into<String>) -> Self {
        self.signatories.push(Signatory {
            key: key.into(),
            extra: Map::new(),
        });
        self
    }
}

/// A reference to a previous output spent by a transaction.
///
/// `address` is only present when the session resolves inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxInput {
    #[serde(default)]
    pub transaction: Option<TxRef>,
    #[serde(default)]
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxRef {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxOutput {
    pub address: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signatory {
    pub key: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ─── Matches ──────────────────────────────────────────────────────────────────

/// One filter's verdict on a block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchOutput {
    /// Id of the filter that produced this verdict.
    pub id: String,
    pub matches: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl MatchOutput {
    pub fn hit(id: impl Into<String>, metadata: Value) -> Self {
        Self {
            id: id.into(),
            matches: true,
            metadata: Some(metadata),
        }
    }

    pub fn miss(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            matches: false,
            metadata: None,
        }
    }
}

/// Aggregate verdict for a block, keyed by filter id.
pub type Matches = BTreeMap<String, MatchOutput>;

/// Returns `true` if at least one filter matched.
pub fn any_match(matches: &Matches) -> bool {
    matches.values().any(|m| m.matches)
}

// ─── Status ───────────────────────────────────────────────────────────────────

/// Lifecycle state of the follower.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FollowerState {
    Active,
    Inactive,
}

impl std::fmt::Display for FollowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Inactive => write!(f, "INACTIVE"),
        }
    }
}

/// Process-wide lifecycle flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub state: FollowerState,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            started_at: None,
            stopped_at: None,
            state: FollowerState::Inactive,
        }
    }
}

// ─── Chain-sync events ────────────────────────────────────────────────────────

/// One event pulled from the upstream session.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    RollForward { block: Block, tip: Tip },
    RollBackward { point: Point, tip: Tip },
}

/// Answer to a resume request: where the session will continue from.
#[derive(Debug, Clone, PartialEq)]
pub struct Intersection {
    pub point: Point,
    pub tip: Tip,
}

// ─── Bus messages ─────────────────────────────────────────────────────────────

/// Payload carried on the block topic.
///
/// A block message has `block` set; a rollback notice has `block: null`,
/// empty `matches` and `rollback` set to the rollback target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockMessage {
    pub block: Option<Block>,
    #[serde(default)]
    pub matches: Matches,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<Point>,
}

impl BlockMessage {
    pub fn is_rollback(&self) -> bool {
        self.block.is_none() && self.rollback.is_some()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
