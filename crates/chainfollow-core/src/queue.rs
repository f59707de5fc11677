//! Confirmation queue: holds matched blocks until enough later blocks bury
//! them that a short rollback can no longer retract them.

use std::collections::VecDeque;
use tracing::debug;

use crate::cursor::Point;
use crate::types::{Block, Matches};

/// A matched block waiting for confirmation.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub block: Block,
    pub matches: Matches,
    /// The position the follower held right before this block was processed.
    /// Resuming from here replays this block.
    pub resume_from: Point,
}

/// FIFO of [`QueueEntry`] in chain order.
#[derive(Debug, Clone)]
pub struct ConfirmationQueue {
    entries: VecDeque<QueueEntry>,
    block_to_wait: u64,
}

impl ConfirmationQueue {
    pub fn new(block_to_wait: u64) -> Self {
        Self {
            entries: VecDeque::new(),
            block_to_wait,
        }
    }

    /// Blocks are confirmed on arrival when the depth is zero.
    pub fn is_bypassed(&self) -> bool {
        self.block_to_wait == 0
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn oldest(&self) -> Option<&QueueEntry> {
        self.entries.front()
    }

    /// Append at the tail. Entries arrive through sequential roll-forward so
    /// the tail is always the highest block.
    pub fn enqueue(&mut self, entry: QueueEntry) {
        debug!(height = entry.block.height, id = %entry.block.id, "Queueing block");
        self.entries.push_back(entry);
    }

    fn is_ready(&self, entry: &QueueEntry, tip_height: u64) -> bool {
        tip_height.saturating_sub(entry.block.height) > self.block_to_wait
    }

    /// Index of the first entry buried deeper than `block_to_wait` under
    /// `tip_height`.
    pub fn first_ready(&self, tip_height: u64) -> Option<usize> {
        self.entries.iter().position(|e| self.is_ready(e, tip_height))
    }

    pub fn remove(&mut self, idx: usize) -> Option<QueueEntry> {
        self.entries.remove(idx)
    }

    /// Put an entry back at `idx`, e.g. after a failed publish.
    pub fn insert(&mut self, idx: usize, entry: QueueEntry) {
        let idx = idx.min(self.entries.len());
        self.entries.insert(idx, entry);
    }

    /// Drop every entry at or above the rollback target; all of them for
    /// `origin`. Returns how many were dropped.
    pub fn discard_from(&mut self, point: &Point) -> usize {
        let before = self.entries.len();
        match point.height() {
            None => self.entries.clear(),
            Some(height) => self.entries.retain(|e| e.block.height < height),
        }
        let dropped = before - self.entries.len();
        if dropped > 0 {
            debug!(dropped, rollback = %point, "Discarded queued blocks");
        }
        dropped
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
