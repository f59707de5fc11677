//! Point window: a sliding window of recently seen block positions.
//!
//! Ogmios reports rollback targets and intersections as `{slot, id}` only.
//! The follower orders everything by height, so the session keeps the last
//! N positions it saw and resolves heights from them.

use std::collections::VecDeque;

use chainfollow_core::cursor::{Cursor, Point};

/// Default depth, the Cardano security parameter: no rollback can go deeper.
pub const DEFAULT_WINDOW: usize = 2160;

pub struct PointWindow {
    /// Oldest first.
    window: VecDeque<Cursor>,
    window_size: usize,
}

impl PointWindow {
    pub fn new(window_size: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            window: VecDeque::with_capacity(window_size.min(DEFAULT_WINDOW)),
            window_size,
        }
    }

    /// Record a position. A position at or below the current head replaces
    /// everything from its height up.
    pub fn push(&mut self, cursor: Cursor) {
        self.rewind_below(cursor.height);
        if self.window.len() >= self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(cursor);
    }

    /// Start over from a set of known positions (the resume candidates).
    pub fn seed(&mut self, points: &[Point]) {
        self.window.clear();
        let mut cursors: Vec<_> = points.iter().filter_map(Point::cursor).cloned().collect();
        cursors.sort();
        for c in cursors {
            self.push(c);
        }
    }

    /// Look up the full position of `{slot, id}`.
    pub fn resolve(&self, slot: u64, id: &str) -> Option<Cursor> {
        self.window
            .iter()
            .rev()
            .find(|c| c.id == id && c.slot == slot)
            .cloned()
    }

    /// Drop everything above `cursor`, which becomes the head.
    pub fn rewind_to(&mut self, cursor: &Cursor) {
        while let Some(back) = self.window.back() {
            if back.height > cursor.height {
                self.window.pop_back();
            } else {
                break;
            }
        }
    }

    pub fn clear(&mut self) {
        self.window.clear();
    }

    pub fn head(&self) -> Option<&Cursor> {
        self.window.back()
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    fn rewind_below(&mut self, height: u64) {
        while let Some(back) = self.window.back() {
            if back.height >= height {
                self.window.pop_back();
            } else {
                break;
            }
        }
    }
}

impl Default for PointWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}
