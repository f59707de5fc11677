//! In-memory storage backend.
//!
//! Stores checkpoints and mirrored blocks in RAM. Useful for tests and
//! short-lived followers that don't need persistence.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use chainfollow_core::checkpoint::{Checkpoint, CheckpointStore};
use chainfollow_core::cursor::Point;
use chainfollow_core::error::FollowerError;
use chainfollow_core::processor::BlockMirror;
use chainfollow_core::types::Block;

/// In-memory follower storage.
///
/// All data is lost when the process exits.
#[derive(Default)]
pub struct InMemoryStorage {
    checkpoints: Mutex<HashMap<String, Checkpoint>>,
    blocks: Mutex<HashMap<String, Block>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_block(&self, id: &str) -> Option<Block> {
        self.blocks.lock().unwrap().get(id).cloned()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.lock().unwrap().len()
    }

    /// Mirrored blocks ordered by height.
    pub fn blocks(&self) -> Vec<Block> {
        let mut blocks: Vec<_> = self.blocks.lock().unwrap().values().cloned().collect();
        blocks.sort_by_key(|b| (b.height, b.slot));
        blocks
    }
}

#[async_trait]
impl CheckpointStore for InMemoryStorage {
    async fn load(&self, follower_id: &str) -> Result<Option<Checkpoint>, FollowerError> {
        Ok(self.checkpoints.lock().unwrap().get(follower_id).cloned())
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<(), FollowerError> {
        self.checkpoints
            .lock()
            .unwrap()
            .insert(checkpoint.follower_id.clone(), checkpoint);
        Ok(())
    }

    async fn delete(&self, follower_id: &str) -> Result<(), FollowerError> {
        self.checkpoints.lock().unwrap().remove(follower_id);
        Ok(())
    }
}

#[async_trait]
impl BlockMirror for InMemoryStorage {
    async fn upsert_block(&self, block: &Block) -> Result<(), FollowerError> {
        self.blocks
            .lock()
            .unwrap()
            .insert(block.id.clone(), block.clone());
        Ok(())
    }

    async fn rollback(&self, point: &Point) -> Result<u64, FollowerError> {
        let mut blocks = self.blocks.lock().unwrap();
        let before = blocks.len();
        match point.height() {
            None => blocks.clear(),
            Some(height) => blocks.retain(|_, b| b.height < height),
        }
        Ok((before - blocks.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainfollow_core::cursor::Cursor;

    #[tokio::test]
    async fn rollback_clears_blocks_at_and_above() {
        let store = InMemoryStorage::new();
        for h in 100..=105 {
            store
                .upsert_block(&Block::new(format!("b{h}"), h * 20, h))
                .await
                .unwrap();
        }
        assert_eq!(store.block_count(), 6);

        let deleted = store.rollback(&Point::at("b103", 2060, 103)).await.unwrap();
        assert_eq!(deleted, 3);
        let heights: Vec<_> = store.blocks().iter().map(|b| b.height).collect();
        assert_eq!(heights, vec![100, 101, 102]);
    }

    #[tokio::test]
    async fn rollback_to_origin_clears_all() {
        let store = InMemoryStorage::new();
        store.upsert_block(&Block::new("a", 1, 1)).await.unwrap();
        assert_eq!(store.rollback(&Point::Origin).await.unwrap(), 1);
        assert_eq!(store.block_count(), 0);
    }

    #[tokio::test]
    async fn upsert_replaces_by_id() {
        let store = InMemoryStorage::new();
        store.upsert_block(&Block::new("a", 1, 1)).await.unwrap();
        store.upsert_block(&Block::new("a", 1, 2)).await.unwrap();
        assert_eq!(store.block_count(), 1);
        assert_eq!(store.get_block("a").unwrap().height, 2);
    }

    #[tokio::test]
    async fn checkpoint_roundtrip() {
        let store = InMemoryStorage::new();
        let cp = Checkpoint {
            follower_id: "test".into(),
            cursor: Cursor::new("abc", 1000, 50),
            updated_at: 0,
        };
        store.save(cp.clone()).await.unwrap();
        assert_eq!(store.load("test").await.unwrap(), Some(cp));
        store.delete("test").await.unwrap();
        assert!(store.load("test").await.unwrap().is_none());
    }
}
