//! Upstream chain-sync seam.
//!
//! The session is pull-based: the follower asks for one event with
//! [`ChainSyncSession::next_event`] and only asks again once that event has
//! been fully handled.

use async_trait::async_trait;
use std::sync::Arc;

use crate::cursor::Point;
use crate::error::FollowerError;
use crate::types::{ChainEvent, Intersection};

/// Opens chain-sync sessions.
#[async_trait]
pub trait ChainSyncConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn ChainSyncSession>, FollowerError>;
}

/// An open chain-sync session.
#[async_trait]
pub trait ChainSyncSession: Send + Sync {
    /// Resume from the first of `points` known upstream.
    async fn find_intersection(&self, points: &[Point]) -> Result<Intersection, FollowerError>;

    /// Request and wait for the next event.
    async fn next_event(&self) -> Result<ChainEvent, FollowerError>;

    /// Close the session. Must tolerate an already closed session.
    async fn shutdown(&self) -> Result<(), FollowerError>;

    fn is_connected(&self) -> bool;
}
