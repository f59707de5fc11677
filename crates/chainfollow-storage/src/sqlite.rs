//! SQLite storage backend.
//!
//! Persists checkpoints and mirrored blocks to a single SQLite file.
//! Uses `sqlx` with WAL mode for concurrent read performance.
//!
//! # Usage
//! ```rust,no_run
//! use chainfollow_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./follower.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use chainfollow_core::checkpoint::{Checkpoint, CheckpointStore};
use chainfollow_core::cursor::{Cursor, Point};
use chainfollow_core::error::FollowerError;
use chainfollow_core::processor::BlockMirror;
use chainfollow_core::types::Block;

fn storage_err(e: sqlx::Error) -> FollowerError {
    FollowerError::Storage(e.to_string())
}

/// SQLite-backed storage for checkpoints and mirrored blocks.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./follower.db"`) or a full
    /// SQLite URL (`"sqlite:./follower.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, FollowerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(storage_err)?;
        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Every connection to `:memory:` is its own database, so the pool is
    /// pinned to one connection. All data is lost when the pool is dropped.
    pub async fn in_memory() -> Result<Self, FollowerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    async fn init_schema(&self) -> Result<(), FollowerError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                follower_id  TEXT    NOT NULL PRIMARY KEY,
                block_id     TEXT    NOT NULL,
                slot         INTEGER NOT NULL,
                height       INTEGER NOT NULL,
                updated_at   INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS blocks (
                id           TEXT    NOT NULL PRIMARY KEY,
                slot         INTEGER NOT NULL,
                height       INTEGER NOT NULL,
                body         TEXT    NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_blocks_height ON blocks (height);")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        Ok(())
    }

    // ─── Block queries ──────────────────────────────────────────────────────────

    pub async fn get_block(&self, id: &str) -> Result<Option<Block>, FollowerError> {
        let row = sqlx::query("SELECT body FROM blocks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;

        match row {
            Some(r) => {
                let body: String = r.get("body");
                Ok(Some(serde_json::from_str(&body)?))
            }
            None => Ok(None),
        }
    }

    pub async fn block_count(&self) -> Result<u64, FollowerError> {
        let row = sqlx::query("SELECT COUNT(*) as cnt FROM blocks")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;

        let cnt: i64 = row.get("cnt");
        Ok(cnt as u64)
    }

    /// Highest mirrored block, if any.
    pub async fn highest_block(&self) -> Result<Option<Point>, FollowerError> {
        let row = sqlx::query("SELECT id, slot, height FROM blocks ORDER BY height DESC, slot DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;

        Ok(row.map(|r| {
            Point::at(
                r.get::<String, _>("id"),
                r.get::<i64, _>("slot") as u64,
                r.get::<i64, _>("height") as u64,
            )
        }))
    }
}

// ─── BlockMirror impl ────────────────────────────────────────────────────────

#[async_trait]
impl BlockMirror for SqliteStorage {
    async fn upsert_block(&self, block: &Block) -> Result<(), FollowerError> {
        let body = serde_json::to_string(block)?;
        sqlx::query(
            "INSERT OR REPLACE INTO blocks (id, slot, height, body)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&block.id)
        .bind(block.slot as i64)
        .bind(block.height as i64)
        .bind(&body)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        debug!(id = %block.id, height = block.height, "block stored");
        Ok(())
    }

    async fn rollback(&self, point: &Point) -> Result<u64, FollowerError> {
        let result = match point.height() {
            None => sqlx::query("DELETE FROM blocks").execute(&self.pool).await,
            Some(height) => {
                sqlx::query("DELETE FROM blocks WHERE height >= ?")
                    .bind(height as i64)
                    .execute(&self.pool)
                    .await
            }
        }
        .map_err(storage_err)?;

        let deleted = result.rows_affected();
        debug!(rollback = %point, deleted, "rolled back mirror");
        Ok(deleted)
    }
}

// ─── CheckpointStore impl ────────────────────────────────────────────────────

#[async_trait]
impl CheckpointStore for SqliteStorage {
    async fn load(&self, follower_id: &str) -> Result<Option<Checkpoint>, FollowerError> {
        let row = sqlx::query(
            "SELECT follower_id, block_id, slot, height, updated_at
             FROM checkpoints WHERE follower_id = ?",
        )
        .bind(follower_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(row.map(|r| Checkpoint {
            follower_id: r.get("follower_id"),
            cursor: Cursor::new(
                r.get::<String, _>("block_id"),
                r.get::<i64, _>("slot") as u64,
                r.get::<i64, _>("height") as u64,
            ),
            updated_at: r.get("updated_at"),
        }))
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<(), FollowerError> {
        sqlx::query(
            "INSERT OR REPLACE INTO checkpoints
             (follower_id, block_id, slot, height, updated_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&checkpoint.follower_id)
        .bind(&checkpoint.cursor.id)
        .bind(checkpoint.cursor.slot as i64)
        .bind(checkpoint.cursor.height as i64)
        .bind(checkpoint.updated_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        debug!(
            follower_id = %checkpoint.follower_id,
            height = checkpoint.cursor.height,
            "checkpoint saved"
        );
        Ok(())
    }

    async fn delete(&self, follower_id: &str) -> Result<(), FollowerError> {
        sqlx::query("DELETE FROM checkpoints WHERE follower_id = ?")
            .bind(follower_id)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chainfollow_core::types::Transaction;

    fn checkpoint(id: &str, height: u64) -> Checkpoint {
        Checkpoint {
            follower_id: id.into(),
            cursor: Cursor::new(format!("b{height}"), height * 20, height),
            updated_at: 1_700_000_000,
        }
    }

    fn block(height: u64) -> Block {
        Block::new(format!("b{height}"), height * 20, height)
            .with_transaction(Transaction::new(format!("tx{height}")).with_output("addr1"))
    }

    // ── CheckpointStore ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn checkpoint_roundtrip() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store.save(checkpoint("wallets", 1_000)).await.unwrap();

        let loaded = store.load("wallets").await.unwrap().unwrap();
        assert_eq!(loaded, checkpoint("wallets", 1_000));
    }

    #[tokio::test]
    async fn checkpoint_upsert() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store.save(checkpoint("wallets", 100)).await.unwrap();
        store.save(checkpoint("wallets", 200)).await.unwrap();

        // Only one row; second save overwrites the first
        let loaded = store.load("wallets").await.unwrap().unwrap();
        assert_eq!(loaded.cursor.height, 200);
        assert_eq!(loaded.cursor.id, "b200");
    }

    #[tokio::test]
    async fn checkpoint_missing_returns_none() {
        let store = SqliteStorage::in_memory().await.unwrap();
        assert!(store.load("unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn checkpoint_delete() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store.save(checkpoint("del-test", 500)).await.unwrap();
        store.delete("del-test").await.unwrap();
        assert!(store.load("del-test").await.unwrap().is_none());
    }

    // ── BlockMirror ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn block_body_roundtrip() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store.upsert_block(&block(42)).await.unwrap();

        let loaded = store.get_block("b42").await.unwrap().unwrap();
        assert_eq!(loaded, block(42));
        assert!(store.get_block("b43").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rollback_removes_blocks_at_and_above() {
        let store = SqliteStorage::in_memory().await.unwrap();
        for h in 100u64..=105 {
            store.upsert_block(&block(h)).await.unwrap();
        }

        let deleted = store.rollback(&Point::at("b103", 2060, 103)).await.unwrap();
        assert_eq!(deleted, 3);
        assert_eq!(store.block_count().await.unwrap(), 3);
        assert_eq!(store.highest_block().await.unwrap(), Some(Point::at("b102", 2040, 102)));
    }

    #[tokio::test]
    async fn rollback_to_origin_empties_mirror() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store.upsert_block(&block(1)).await.unwrap();
        store.upsert_block(&block(2)).await.unwrap();

        assert_eq!(store.rollback(&Point::Origin).await.unwrap(), 2);
        assert!(store.highest_block().await.unwrap().is_none());
    }
}
