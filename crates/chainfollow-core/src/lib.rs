//! chainfollow-core — the chain-following engine.
//!
//! # Architecture
//!
//! ```text
//! ChainSyncSession ──next_event──▶ ChainFollower
//!                                      ├── Hooks              (concurrent filter evaluation)
//!                                      ├── ConfirmationQueue  (publish only once buried k blocks deep)
//!                                      ├── CursorTracker      (current vs. queued checkpoint)
//!                                      ├── CheckpointManager  (crash recovery)
//!                                      ├── Watchdog           (restart on stalled cursor)
//!                                      └── Publisher ──▶ block topic ──▶ Processor ──▶ BlockMirror
//! ```

pub mod checkpoint;
pub mod config;
pub mod cursor;
pub mod error;
pub mod filter;
pub mod follower;
pub mod hooks;
pub mod metrics;
pub mod processor;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod session;
pub mod types;
pub mod watchdog;

pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointStore, MemoryCheckpointStore};
pub use config::{FilterConfig, FollowerBuilder, FollowerConfig};
pub use cursor::{Cursor, CursorTracker, Point, Tip};
pub use error::FollowerError;
pub use filter::{BlockFilter, Filter, FilterKind};
pub use follower::ChainFollower;
pub use hooks::{Hooks, NO_FILTER};
pub use metrics::{FollowerMetrics, MetricsSnapshot};
pub use processor::{BlockMirror, Processor};
pub use publisher::{ChannelPublisher, PublishedMessage, Publisher, BLOCK_TOPIC};
pub use queue::{ConfirmationQueue, QueueEntry};
pub use retry::{RetryConfig, RetryPolicy};
pub use session::{ChainSyncConnector, ChainSyncSession};
pub use types::{
    any_match, Block, BlockMessage, ChainEvent, FollowerState, Intersection, MatchOutput,
    Matches, Status, Transaction,
};
