//! Chain positions and the cursor tracker that decides which one to persist.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A block's position in the canonical chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor {
    /// Block header hash.
    pub id: String,
    /// Absolute slot number.
    pub slot: u64,
    /// Block height (number of blocks since genesis).
    pub height: u64,
}

impl Cursor {
    pub fn new(id: impl Into<String>, slot: u64, height: u64) -> Self {
        Self {
            id: id.into(),
            slot,
            height,
        }
    }
}

impl Ord for Cursor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.height
            .cmp(&other.height)
            .then(self.slot.cmp(&other.slot))
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for Cursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A resumable chain position: either a concrete block or the `origin`
/// sentinel ("before the first block").
///
/// Serialises as the string `"origin"` or as `{id, slot, height}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "PointRepr", into = "PointRepr")]
pub enum Point {
    Origin,
    At(Cursor),
}

/// The tip is the highest block known upstream; it shares the point shape.
pub type Tip = Point;

impl Point {
    pub fn at(id: impl Into<String>, slot: u64, height: u64) -> Self {
        Self::At(Cursor::new(id, slot, height))
    }

    pub fn is_origin(&self) -> bool {
        matches!(self, Self::Origin)
    }

    pub fn cursor(&self) -> Option<&Cursor> {
        match self {
            Self::Origin => None,
            Self::At(c) => Some(c),
        }
    }

    pub fn height(&self) -> Option<u64> {
        self.cursor().map(|c| c.height)
    }

    pub fn slot(&self) -> Option<u64> {
        self.cursor().map(|c| c.slot)
    }

    /// Message-bus key for rollback notices: the slot, or `"origin"`.
    pub fn bus_key(&self) -> String {
        match self {
            Self::Origin => "origin".to_string(),
            Self::At(c) => c.slot.to_string(),
        }
    }
}

impl From<Cursor> for Point {
    fn from(cursor: Cursor) -> Self {
        Self::At(cursor)
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Origin => write!(f, "origin"),
            Self::At(c) => write!(f, "{}@{}/{}", c.id, c.slot, c.height),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum OriginTag {
    Origin,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum PointRepr {
    Origin(OriginTag),
    At(Cursor),
}

impl From<PointRepr> for Point {
    fn from(repr: PointRepr) -> Self {
        match repr {
            PointRepr::Origin(_) => Point::Origin,
            PointRepr::At(c) => Point::At(c),
        }
    }
}

impl From<Point> for PointRepr {
    fn from(point: Point) -> Self {
        match point {
            Point::Origin => PointRepr::Origin(OriginTag::Origin),
            Point::At(c) => PointRepr::At(c),
        }
    }
}

// ─── CursorTracker ────────────────────────────────────────────────────────────

/// Holds the two checkpoint candidates.
///
/// - `current`: position of the most recently processed (or published) block.
///   `None` until the first resume, `Some(Point::Origin)` when the follower is
///   positioned before the first block.
/// - `queued`: where to resume so that the oldest block still waiting in the
///   confirmation queue gets replayed. Set whenever the queue is non-empty.
#[derive(Debug, Clone, Default)]
pub struct CursorTracker {
    current: Option<Point>,
    queued: Option<Point>,
}

impl CursorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&Point> {
        self.current.as_ref()
    }

    pub fn queued(&self) -> Option<&Point> {
        self.queued.as_ref()
    }

    pub fn set_current(&mut self, point: Point) {
        self.current = Some(point);
    }

    pub fn set_queued(&mut self, point: Option<Point>) {
        self.queued = point;
    }

    /// The position that must be persisted: the queued one whenever blocks
    /// are still waiting, otherwise the current one.
    pub fn checkpoint(&self) -> Option<&Point> {
        self.queued.as_ref().or(self.current.as_ref())
    }

    pub fn reset(&mut self) {
        self.current = None;
        self.queued = None;
    }
}
