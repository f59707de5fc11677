//! Checkpoint manager: persists the follower's resume position.
//!
//! A checkpoint stores the position to resume from after a restart. Writing
//! `origin` deletes the stored checkpoint, which both rewinds a full rollback
//! and makes the configured start points authoritative again.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::cursor::{Cursor, Point};
use crate::error::FollowerError;

/// A persisted checkpoint for a follower.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique follower identifier.
    pub follower_id: String,
    pub cursor: Cursor,
    /// Unix timestamp of when this checkpoint was saved.
    pub updated_at: i64,
}

/// Trait for storing and loading checkpoints.
///
/// Implementations include [`MemoryCheckpointStore`] and the backends of
/// `chainfollow-storage`.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, follower_id: &str) -> Result<Option<Checkpoint>, FollowerError>;

    /// Save (upsert) a checkpoint.
    async fn save(&self, checkpoint: Checkpoint) -> Result<(), FollowerError>;

    async fn delete(&self, follower_id: &str) -> Result<(), FollowerError>;
}

/// Reads and writes the checkpoint of one follower.
#[derive(Clone)]
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    follower_id: String,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>, follower_id: impl Into<String>) -> Self {
        Self {
            store,
            follower_id: follower_id.into(),
        }
    }

    pub fn follower_id(&self) -> &str {
        &self.follower_id
    }

    pub async fn load(&self) -> Result<Option<Checkpoint>, FollowerError> {
        self.store.load(&self.follower_id).await
    }

    /// The stored resume position, if any.
    pub async fn load_point(&self) -> Result<Option<Point>, FollowerError> {
        Ok(self.load().await?.map(|cp| Point::At(cp.cursor)))
    }

    /// Persist `point`. `origin` clears the checkpoint.
    pub async fn upsert(&self, point: &Point) -> Result<(), FollowerError> {
        match point {
            Point::Origin => {
                info!(follower = %self.follower_id, "Resetting checkpoint to origin");
                self.store.delete(&self.follower_id).await
            }
            Point::At(cursor) => {
                debug!(
                    follower = %self.follower_id,
                    height = cursor.height,
                    slot = cursor.slot,
                    "Saving checkpoint"
                );
                self.store
                    .save(Checkpoint {
                        follower_id: self.follower_id.clone(),
                        cursor: cursor.clone(),
                        updated_at: chrono::Utc::now().timestamp(),
                    })
                    .await
            }
        }
    }
}

// ─── In-memory store (for testing) ────────────────────────────────────────────

use std::collections::HashMap;
use std::sync::Mutex;

/// In-memory checkpoint store for tests and ephemeral followers.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    data: Mutex<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, follower_id: &str) -> Result<Option<Checkpoint>, FollowerError> {
        Ok(self.data.lock().unwrap().get(follower_id).cloned())
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<(), FollowerError> {
        self.data
            .lock()
            .unwrap()
            .insert(checkpoint.follower_id.clone(), checkpoint);
        Ok(())
    }

    async fn delete(&self, follower_id: &str) -> Result<(), FollowerError> {
        self.data.lock().unwrap().remove(follower_id);
        Ok(())
    }
}
