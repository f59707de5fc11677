//! Interest filters: decide whether a block matters to downstream consumers.
//!
//! The built-in matchers form a closed set ([`FilterKind`]); the
//! [`BlockFilter`] trait is the seam the hook composer dispatches through.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::FollowerError;
use crate::metrics::FollowerMetrics;
use crate::types::{Block, MatchOutput};

/// Anything that can render a verdict on a block.
///
/// Implementations must not mutate the block and only write to their own
/// counters; they are evaluated concurrently against the same block.
#[async_trait]
pub trait BlockFilter: Send + Sync {
    /// Unique id; used as the key in the aggregate match map.
    fn id(&self) -> &str;

    async fn evaluate(&self, block: &Block) -> Result<MatchOutput, FollowerError>;
}

/// The matching parameter of a built-in filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterKind {
    /// Any transaction output (or resolved input) pays to one of these addresses.
    WalletAddress(BTreeSet<String>),
    /// Any transaction carries a script keyed by one of these policy ids.
    PolicyId(BTreeSet<String>),
    /// Any transaction is signed by one of these verification keys.
    VerificationKey(BTreeSet<String>),
}

impl FilterKind {
    fn label(&self) -> &'static str {
        match self {
            Self::WalletAddress(_) => "wallet_addresses",
            Self::PolicyId(_) => "policy_ids",
            Self::VerificationKey(_) => "vkeys",
        }
    }

    fn values(&self) -> &BTreeSet<String> {
        match self {
            Self::WalletAddress(v) | Self::PolicyId(v) | Self::VerificationKey(v) => v,
        }
    }
}

/// A built-in filter with a static matching parameter.
pub struct Filter {
    id: String,
    kind: FilterKind,
    metrics: Option<Arc<FollowerMetrics>>,
    hits: AtomicU64,
}

impl Filter {
    pub fn new(id: impl Into<String>, kind: FilterKind) -> Self {
        let id = id.into();
        info!(filter = %id, kind = kind.label(), values = kind.values().len(), "Initializing filter");
        Self {
            id,
            kind,
            metrics: None,
            hits: AtomicU64::new(0),
        }
    }

    pub fn wallet_address<I, S>(id: impl Into<String>, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            id,
            FilterKind::WalletAddress(addresses.into_iter().map(Into::into).collect()),
        )
    }

    /// Policy ids are hex; they are compared case-insensitively.
    pub fn policy_id<I, S>(id: impl Into<String>, policy_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(id, FilterKind::PolicyId(lowercase_set(policy_ids)))
    }

    /// Verification keys are hex; they are compared case-insensitively.
    pub fn vkey<I, S>(id: impl Into<String>, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(id, FilterKind::VerificationKey(lowercase_set(keys)))
    }

    /// Attach the metrics provider; positive matches increment
    /// `chainfollow.filter_matches`.
    pub fn with_metrics(mut self, metrics: Arc<FollowerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn kind(&self) -> &FilterKind {
        &self.kind
    }

    /// Number of blocks this filter matched so far.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Collect the configured values found in `block`.
    fn scan(&self, block: &Block) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        match &self.kind {
            FilterKind::WalletAddress(addresses) => {
                for tx in &block.transactions {
                    let outputs = tx.outputs.iter().map(|o| o.address.as_str());
                    let inputs = tx.inputs.iter().filter_map(|i| i.address.as_deref());
                    for address in outputs.chain(inputs) {
                        if addresses.contains(address) {
                            found.insert(address.to_string());
                        }
                    }
                }
            }
            FilterKind::PolicyId(policy_ids) => {
                for tx in &block.transactions {
                    for key in tx.scripts.keys() {
                        let key = key.to_ascii_lowercase();
                        if policy_ids.contains(&key) {
                            found.insert(key);
                        }
                    }
                }
            }
            FilterKind::VerificationKey(keys) => {
                for tx in &block.transactions {
                    for signatory in &tx.signatories {
                        let key = signatory.key.to_ascii_lowercase();
                        if keys.contains(&key) {
                            found.insert(key);
                        }
                    }
                }
            }
        }
        found
    }
}

#[async_trait]
impl BlockFilter for Filter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn evaluate(&self, block: &Block) -> Result<MatchOutput, FollowerError> {
        let found = self.scan(block);
        if found.is_empty() {
            debug!(filter = %self.id, height = block.height, "no match");
            return Ok(MatchOutput::miss(&self.id));
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.record_filter_match(&self.id);
        }
        info!(
            filter = %self.id,
            height = block.height,
            found = found.len(),
            "Filter matched block"
        );
        let mut metadata = Map::new();
        metadata.insert(
            self.kind.label().to_string(),
            Value::from(found.into_iter().collect::<Vec<_>>()),
        );
        Ok(MatchOutput::hit(&self.id, Value::Object(metadata)))
    }
}

fn lowercase_set<I, S>(values: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    values
        .into_iter()
        .map(|v| v.into().to_ascii_lowercase())
        .collect()
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Transaction, TxInput};
    use serde_json::json;

    fn block_with(tx: Transaction) -> Block {
        Block::new("blk", 1_000, 100).with_transaction(tx)
    }

    #[tokio::test]
    async fn wallet_address_matches_output() {
        let f = Filter::wallet_address("wallets", ["addr1", "addr2"]);
        let block = block_with(Transaction::new("tx").with_output("addr1"));

        let out = f.evaluate(&block).await.unwrap();
        assert!(out.matches);
        assert_eq!(out.id, "wallets");
        assert_eq!(out.metadata.unwrap()["wallet_addresses"], json!(["addr1"]));
        assert_eq!(f.hits(), 1);
    }

    #[tokio::test]
    async fn wallet_address_matches_resolved_input() {
        let f = Filter::wallet_address("wallets", ["addr9"]);
        let mut tx = Transaction::new("tx").with_output("someone-else");
        tx.inputs.push(TxInput {
            transaction: None,
            index: 0,
            address: Some("addr9".into()),
        });

        assert!(f.evaluate(&block_with(tx)).await.unwrap().matches);
    }

    #[tokio::test]
    async fn empty_block_is_a_miss_not_an_error() {
        let f = Filter::wallet_address("wallets", ["addr1"]);
        let out = f.evaluate(&Block::new("empty", 1, 1)).await.unwrap();
        assert_eq!(out, MatchOutput::miss("wallets"));
        assert_eq!(f.hits(), 0);
    }

    #[tokio::test]
    async fn policy_id_matches_script_key_case_insensitively() {
        let f = Filter::policy_id("policies", ["ABCDEF01"]);
        let block = block_with(Transaction::new("tx").with_script("abcdef01"));
        let out = f.evaluate(&block).await.unwrap();
        assert!(out.matches);
        assert_eq!(out.metadata.unwrap()["policy_ids"], json!(["abcdef01"]));

        let other = block_with(Transaction::new("tx").with_output("addr1"));
        assert!(!f.evaluate(&other).await.unwrap().matches);
    }

    #[tokio::test]
    async fn vkey_matches_signatory() {
        let f = Filter::vkey("signers", ["aa11", "bb22"]);
        let block = block_with(Transaction::new("tx").with_signatory("BB22"));
        let out = f.evaluate(&block).await.unwrap();
        assert!(out.matches);
        assert_eq!(out.metadata.unwrap()["vkeys"], json!(["bb22"]));
    }

    #[tokio::test]
    async fn any_transaction_is_enough() {
        let f = Filter::vkey("signers", ["k"]);
        let block = Block::new("blk", 1, 1)
            .with_transaction(Transaction::new("a").with_signatory("x"))
            .with_transaction(Transaction::new("b").with_signatory("k"));
        assert!(f.evaluate(&block).await.unwrap().matches);
    }
}
