//! Hook composer: evaluates every enabled filter against a block and merges
//! their verdicts into one match map.

use futures::future::try_join_all;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::FollowerError;
use crate::filter::BlockFilter;
use crate::types::{Block, MatchOutput, Matches};

/// Id of the synthetic verdict returned when no filter is enabled.
pub const NO_FILTER: &str = "NO_FILTER";

/// Ordered set of filters, evaluated concurrently.
#[derive(Default)]
pub struct Hooks {
    filters: Vec<Arc<dyn BlockFilter>>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a filter. Filters are added before the follower starts;
    /// there is no removal.
    pub fn enable(&mut self, filter: Arc<dyn BlockFilter>) -> Result<&mut Self, FollowerError> {
        if self.filters.iter().any(|f| f.id() == filter.id()) {
            return Err(FollowerError::DuplicateFilter(filter.id().to_string()));
        }
        debug!(filter = filter.id(), "Enabling filter");
        self.filters.push(filter);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Evaluate all filters against `block`.
    ///
    /// Returns one entry per enabled filter. Any filter error fails the whole
    /// call; a partial verdict is never returned. With no filters the result
    /// is a single `NO_FILTER` miss.
    pub async fn match_block(&self, block: &Block) -> Result<Matches, FollowerError> {
        if self.filters.is_empty() {
            warn!(height = block.height, "No filters enabled");
            let mut matches = Matches::new();
            matches.insert(NO_FILTER.to_string(), MatchOutput::miss(NO_FILTER));
            return Ok(matches);
        }

        let outputs = try_join_all(self.filters.iter().map(|f| f.evaluate(block))).await?;
        Ok(outputs.into_iter().map(|m| (m.id.clone(), m)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Filter;
    use crate::types::{any_match, Transaction};
    use async_trait::async_trait;
    use std::time::Duration;

    struct Broken;

    #[async_trait]
    impl BlockFilter for Broken {
        fn id(&self) -> &str {
            "broken"
        }
        async fn evaluate(&self, _block: &Block) -> Result<MatchOutput, FollowerError> {
            Err(FollowerError::Filter {
                filter: "broken".into(),
                reason: "cannot read block".into(),
            })
        }
    }

    /// Answers late so the merge cannot depend on completion order.
    struct Slow(&'static str);

    #[async_trait]
    impl BlockFilter for Slow {
        fn id(&self) -> &str {
            self.0
        }
        async fn evaluate(&self, _block: &Block) -> Result<MatchOutput, FollowerError> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(MatchOutput::miss(self.0))
        }
    }

    fn block() -> Block {
        Block::new("blk", 10, 1).with_transaction(Transaction::new("tx").with_output("addr1"))
    }

    #[tokio::test]
    async fn no_filters_returns_sentinel() {
        let hooks = Hooks::new();
        let matches = hooks.match_block(&block()).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[NO_FILTER], MatchOutput::miss(NO_FILTER));
        assert!(!any_match(&matches));
    }

    #[tokio::test]
    async fn one_entry_per_filter() {
        let mut hooks = Hooks::new();
        hooks
            .enable(Arc::new(Slow("slow")))
            .unwrap()
            .enable(Arc::new(Filter::wallet_address("wallets", ["addr1"])))
            .unwrap()
            .enable(Arc::new(Filter::policy_id("policies", ["ff"])))
            .unwrap();

        let matches = hooks.match_block(&block()).await.unwrap();
        assert_eq!(matches.len(), 3);
        assert!(matches["wallets"].matches);
        assert!(!matches["policies"].matches);
        assert!(!matches["slow"].matches);
        assert!(any_match(&matches));
    }

    #[tokio::test]
    async fn filter_error_fails_the_whole_match() {
        let mut hooks = Hooks::new();
        hooks
            .enable(Arc::new(Filter::wallet_address("wallets", ["addr1"])))
            .unwrap()
            .enable(Arc::new(Broken))
            .unwrap();

        let err = hooks.match_block(&block()).await.unwrap_err();
        assert!(matches!(err, FollowerError::Filter { .. }));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut hooks = Hooks::new();
        hooks.enable(Arc::new(Filter::vkey("keys", ["a"]))).unwrap();
        let err = hooks.enable(Arc::new(Filter::vkey("keys", ["b"]))).err().unwrap();
        assert!(matches!(err, FollowerError::DuplicateFilter(id) if id == "keys"));
        assert_eq!(hooks.len(), 1);
    }
}
