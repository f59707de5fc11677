//! Downstream consumer: applies block-topic messages to a local mirror.
//!
//! Rollback notices delete mirrored blocks at or above the rollback height
//! before anything else in the message is applied, so a consumer that
//! replays the topic converges on the canonical chain.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::cursor::Point;
use crate::error::FollowerError;
use crate::publisher::PublishedMessage;
use crate::retry::RetryPolicy;
use crate::types::{Block, BlockMessage};

/// Storage the processor writes published blocks to.
#[async_trait]
pub trait BlockMirror: Send + Sync {
    /// Insert or replace a block, keyed by id.
    async fn upsert_block(&self, block: &Block) -> Result<(), FollowerError>;

    /// Delete blocks with height at or above `point`; everything for
    /// `origin`. Returns how many were deleted.
    async fn rollback(&self, point: &Point) -> Result<u64, FollowerError>;
}

/// Applies messages from one topic to a [`BlockMirror`].
pub struct Processor {
    mirror: Arc<dyn BlockMirror>,
    retry: RetryPolicy,
    topic: String,
}

impl Processor {
    pub fn new(mirror: Arc<dyn BlockMirror>, retry: RetryPolicy, topic: impl Into<String>) -> Self {
        Self {
            mirror,
            retry,
            topic: topic.into(),
        }
    }

    /// Apply one message without retrying.
    pub async fn process_message(&self, key: &str, value: &str) -> Result<(), FollowerError> {
        let msg: BlockMessage = serde_json::from_str(value)?;

        if let Some(point) = &msg.rollback {
            let deleted = self.mirror.rollback(point).await?;
            info!(key, rollback = %point, deleted, "Applied rollback");
        }
        if let Some(block) = &msg.block {
            self.mirror.upsert_block(block).await?;
            debug!(key, height = block.height, id = %block.id, "Mirrored block");
        }
        Ok(())
    }

    /// Apply one message, backing off between failed attempts. Malformed
    /// payloads are not retried.
    pub async fn process_with_retry(&self, key: &str, value: &str) -> Result<(), FollowerError> {
        if let Err(e) = serde_json::from_str::<BlockMessage>(value) {
            return Err(e.into());
        }
        self.retry
            .run("apply message", move || self.process_message(key, value))
            .await
    }

    /// Consume `rx` until cancelled or the channel closes. A message that
    /// still fails after all retries, or falling far enough behind that the
    /// bus drops messages, pauses the processor; the error is returned so
    /// the host can decide what to do.
    pub async fn run(
        &self,
        mut rx: broadcast::Receiver<PublishedMessage>,
        token: CancellationToken,
    ) -> Result<(), FollowerError> {
        info!(topic = %self.topic, "Processor started");
        loop {
            let msg = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                msg = rx.recv() => msg,
            };
            match msg {
                Ok(msg) if msg.topic != self.topic => continue,
                Ok(msg) => {
                    if let Err(e) = self.process_with_retry(&msg.key, &msg.value).await {
                        error!(key = %msg.key, error = %e, "Message could not be applied, pausing processor");
                        return Err(e);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    // Skipped messages may include rollback notices; the
                    // mirror can no longer be trusted to match the chain.
                    error!(skipped, "Processor lagged behind the bus, pausing processor");
                    return Err(FollowerError::Lagged(skipped));
                }
                Err(RecvError::Closed) => break,
            }
        }
        info!(topic = %self.topic, "Processor stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::{ChannelPublisher, Publisher, BLOCK_TOPIC};
    use crate::retry::RetryConfig;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct VecMirror {
        blocks: Mutex<BTreeMap<String, Block>>,
        ops: Mutex<Vec<String>>,
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl BlockMirror for VecMirror {
        async fn upsert_block(&self, block: &Block) -> Result<(), FollowerError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(FollowerError::Storage("mirror unavailable".into()));
            }
            self.ops.lock().unwrap().push(format!("upsert {}", block.id));
            self.blocks.lock().unwrap().insert(block.id.clone(), block.clone());
            Ok(())
        }

        async fn rollback(&self, point: &Point) -> Result<u64, FollowerError> {
            self.ops.lock().unwrap().push(format!("rollback {point}"));
            let mut blocks = self.blocks.lock().unwrap();
            let before = blocks.len();
            match point.height() {
                None => blocks.clear(),
                Some(h) => blocks.retain(|_, b| b.height < h),
            }
            Ok((before - blocks.len()) as u64)
        }
    }

    fn block_msg(id: &str, height: u64) -> String {
        serde_json::to_string(&BlockMessage {
            block: Some(Block::new(id, height * 10, height)),
            matches: Default::default(),
            rollback: None,
        })
        .unwrap()
    }

    fn processor(mirror: Arc<VecMirror>) -> Processor {
        Processor::new(mirror, RetryPolicy::default(), BLOCK_TOPIC)
    }

    #[tokio::test]
    async fn rollback_is_applied_before_block() {
        let mirror = Arc::new(VecMirror::default());
        let p = processor(mirror.clone());
        p.process_message("b1", &block_msg("b1", 1)).await.unwrap();
        p.process_message("b2", &block_msg("b2", 2)).await.unwrap();

        let mixed = serde_json::to_string(&BlockMessage {
            block: Some(Block::new("b2x", 20, 2)),
            matches: Default::default(),
            rollback: Some(Point::at("b2", 20, 2)),
        })
        .unwrap();
        p.process_message("b2x", &mixed).await.unwrap();

        let ops = mirror.ops.lock().unwrap().clone();
        assert_eq!(ops[2], "rollback b2@20/2");
        assert_eq!(ops[3], "upsert b2x");
        let ids: Vec<_> = mirror.blocks.lock().unwrap().keys().cloned().collect();
        assert_eq!(ids, vec!["b1", "b2x"]);
    }

    #[tokio::test]
    async fn origin_rollback_clears_mirror() {
        let mirror = Arc::new(VecMirror::default());
        let p = processor(mirror.clone());
        p.process_message("b1", &block_msg("b1", 1)).await.unwrap();
        p.process_message("origin", r#"{"block":null,"matches":{},"rollback":"origin"}"#)
            .await
            .unwrap();
        assert!(mirror.blocks.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let mirror = Arc::new(VecMirror::default());
        mirror.failures_left.store(3, Ordering::SeqCst);
        let p = processor(mirror.clone());
        p.process_with_retry("b1", &block_msg("b1", 1)).await.unwrap();
        assert!(mirror.blocks.lock().unwrap().contains_key("b1"));
    }

    #[tokio::test]
    async fn malformed_payload_is_not_retried() {
        let p = processor(Arc::new(VecMirror::default()));
        let err = p.process_with_retry("x", "not json").await.unwrap_err();
        assert!(matches!(err, FollowerError::Serialization(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_failure_pauses_run() {
        let mirror = Arc::new(VecMirror::default());
        mirror.failures_left.store(u32::MAX, Ordering::SeqCst);
        let p = Processor::new(
            mirror,
            RetryPolicy::new(RetryConfig {
                max_retries: 1,
                ..Default::default()
            }),
            BLOCK_TOPIC,
        );
        let (publisher, rx) = ChannelPublisher::new(8);
        publisher.connect().await.unwrap();
        publisher.send(BLOCK_TOPIC, "b1", block_msg("b1", 1)).await.unwrap();

        let err = p.run(rx, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, FollowerError::Storage(_)));
    }

    #[tokio::test]
    async fn missed_messages_pause_run_before_applying_more() {
        let mirror = Arc::new(VecMirror::default());
        let p = processor(mirror.clone());
        let (publisher, rx) = ChannelPublisher::new(1);
        publisher.connect().await.unwrap();
        publisher.send(BLOCK_TOPIC, "b5", block_msg("b5", 5)).await.unwrap();
        publisher
            .send(
                BLOCK_TOPIC,
                "50",
                r#"{"block":null,"matches":{},"rollback":{"id":"b5","slot":50,"height":5}}"#.into(),
            )
            .await
            .unwrap();
        publisher.send(BLOCK_TOPIC, "b6", block_msg("b6", 6)).await.unwrap();

        let err = p.run(rx, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, FollowerError::Lagged(2)));
        assert_eq!(err.kind(), "lagged");
        assert!(mirror.ops.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_ends_when_cancelled() {
        let p = processor(Arc::new(VecMirror::default()));
        let (_publisher, rx) = ChannelPublisher::new(8);
        let token = CancellationToken::new();
        token.cancel();
        p.run(rx, token).await.unwrap();
    }
}
