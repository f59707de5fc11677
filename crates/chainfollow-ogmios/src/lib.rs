//! chainfollow-ogmios — chain-sync over an Ogmios WebSocket.
//!
//! [`OgmiosConnector`] implements [`chainfollow_core::ChainSyncConnector`];
//! hand it to a [`chainfollow_core::ChainFollower`]. Ogmios reports rollback
//! points as `{slot, id}` only, so each session keeps a bounded
//! [`PointWindow`] of recent positions to recover their heights.
//! [`OgmiosConnector::health`] reads the server's `/health` document.

pub mod client;
pub mod codec;
pub mod health;
pub mod tracker;

pub use client::{OgmiosConfig, OgmiosConnector, OgmiosSession};
pub use health::ServerHealth;
pub use tracker::{PointWindow, DEFAULT_WINDOW};
