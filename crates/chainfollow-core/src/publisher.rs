//! Message-bus seam and an in-process broadcast implementation.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::FollowerError;

/// Default topic block messages and rollback notices are written to.
pub const BLOCK_TOPIC: &str = "blocks";

/// Outbound connection to the message bus.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn connect(&self) -> Result<(), FollowerError>;

    async fn disconnect(&self) -> Result<(), FollowerError>;

    /// Write one message. `value` is the JSON payload.
    async fn send(&self, topic: &str, key: &str, value: String) -> Result<(), FollowerError>;

    fn is_connected(&self) -> bool;
}

/// A message as seen by bus subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub key: String,
    pub value: String,
}

/// [`Publisher`] backed by a `tokio::sync::broadcast` channel.
///
/// Sending succeeds while connected even if nobody subscribes; a lagging
/// subscriber sees `RecvError::Lagged` rather than slowing the follower.
pub struct ChannelPublisher {
    tx: broadcast::Sender<PublishedMessage>,
    connected: AtomicBool,
}

impl ChannelPublisher {
    pub fn new(capacity: usize) -> (Self, broadcast::Receiver<PublishedMessage>) {
        let (tx, rx) = broadcast::channel(capacity);
        (
            Self {
                tx,
                connected: AtomicBool::new(false),
            },
            rx,
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PublishedMessage> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl Publisher for ChannelPublisher {
    async fn connect(&self) -> Result<(), FollowerError> {
        if !self.connected.swap(true, Ordering::SeqCst) {
            info!("Publisher connected");
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), FollowerError> {
        if self.connected.swap(false, Ordering::SeqCst) {
            info!("Publisher disconnected");
        }
        Ok(())
    }

    async fn send(&self, topic: &str, key: &str, value: String) -> Result<(), FollowerError> {
        if !self.is_connected() {
            return Err(FollowerError::Publish("publisher is not connected".into()));
        }
        let msg = PublishedMessage {
            topic: topic.to_string(),
            key: key.to_string(),
            value,
        };
        // No receivers is not an error for a bus.
        let receivers = self.tx.send(msg).unwrap_or(0);
        debug!(topic, key, receivers, "Published message");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
