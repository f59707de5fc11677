//! Follower metrics.
//!
//! All instruments use OpenTelemetry conventions and are exported through
//! whatever meter provider the host installs. A local snapshot of the same
//! numbers is kept so status queries do not depend on an exporter.

use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Histogram, Meter},
    KeyValue,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::cursor::Point;

/// Central metrics handle for the follower.
pub struct FollowerMetrics {
    blocks_processed: Counter<u64>,
    blocks_published: Counter<u64>,
    filter_matches: Counter<u64>,
    errors: Counter<u64>,
    starts: Counter<u64>,
    stops: Counter<u64>,
    stalls: Counter<u64>,
    processing_seconds: Histogram<f64>,
    block_size_bytes: Histogram<u64>,
    queue_size: Gauge<u64>,
    tip_slot: Gauge<u64>,
    tip_height: Gauge<u64>,
    tip_synced: Gauge<u64>,
    running: Gauge<u64>,
    local: LocalCounters,
}

#[derive(Default)]
struct LocalCounters {
    processed: AtomicU64,
    published: AtomicU64,
    errors: AtomicU64,
    starts: AtomicU64,
    stops: AtomicU64,
    stalls: AtomicU64,
    queue_size: AtomicU64,
    tip_slot: AtomicU64,
    tip_height: AtomicU64,
    tip_synced: AtomicU64,
    running: AtomicU64,
    filter_matches: Mutex<BTreeMap<String, u64>>,
}

/// Point-in-time copy of the follower's counters and gauges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub blocks_processed: u64,
    pub blocks_published: u64,
    pub errors: u64,
    pub starts: u64,
    pub stops: u64,
    pub stalls: u64,
    pub queue_size: u64,
    pub tip_slot: u64,
    pub tip_height: u64,
    pub tip_synced: bool,
    pub running: bool,
    pub filter_matches: BTreeMap<String, u64>,
}

impl FollowerMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            blocks_processed: meter
                .u64_counter("chainfollow.blocks_processed")
                .with_description("Chain-sync events handled, by task")
                .build(),
            blocks_published: meter
                .u64_counter("chainfollow.blocks_published")
                .with_description("Messages written to the block topic")
                .build(),
            filter_matches: meter
                .u64_counter("chainfollow.filter_matches")
                .with_description("Blocks matched, by filter")
                .build(),
            errors: meter
                .u64_counter("chainfollow.errors")
                .with_description("Errors raised while following, by kind")
                .build(),
            starts: meter
                .u64_counter("chainfollow.starts")
                .with_description("Times the follower entered the active state")
                .build(),
            stops: meter
                .u64_counter("chainfollow.stops")
                .with_description("Times the follower was stopped")
                .build(),
            stalls: meter
                .u64_counter("chainfollow.stalls")
                .with_description("Watchdog detections of a stuck cursor")
                .build(),
            processing_seconds: meter
                .f64_histogram("chainfollow.processing_seconds")
                .with_description("Time to handle a single chain-sync event")
                .with_unit("s")
                .build(),
            block_size_bytes: meter
                .u64_histogram("chainfollow.block_size_bytes")
                .with_description("Serialized size of received blocks")
                .with_unit("By")
                .build(),
            queue_size: meter
                .u64_gauge("chainfollow.queue_size")
                .with_description("Blocks waiting for confirmation")
                .build(),
            tip_slot: meter
                .u64_gauge("chainfollow.tip_slot")
                .with_description("Slot of the upstream tip")
                .build(),
            tip_height: meter
                .u64_gauge("chainfollow.tip_height")
                .with_description("Height of the upstream tip")
                .build(),
            tip_synced: meter
                .u64_gauge("chainfollow.tip_synced")
                .with_description("1 when the last block received was the tip")
                .build(),
            running: meter
                .u64_gauge("chainfollow.running")
                .with_description("1 while the follower is active")
                .build(),
            local: LocalCounters::default(),
        }
    }

    /// Metrics bound to the global meter provider. Without an installed
    /// provider the instruments are no-ops but the snapshot still works.
    pub fn noop() -> Self {
        Self::new(&global::meter("chainfollow"))
    }

    pub fn record_processed(&self, task: &str, seconds: f64) {
        let attrs = [KeyValue::new("task", task.to_string())];
        self.blocks_processed.add(1, &attrs);
        self.processing_seconds.record(seconds, &attrs);
        self.local.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_block_size(&self, bytes: u64) {
        self.block_size_bytes.record(bytes, &[]);
    }

    pub fn record_published(&self) {
        self.blocks_published.add(1, &[]);
        self.local.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_filter_match(&self, filter: &str) {
        self.filter_matches
            .add(1, &[KeyValue::new("filter", filter.to_string())]);
        if let Ok(mut matches) = self.local.filter_matches.lock() {
            *matches.entry(filter.to_string()).or_default() += 1;
        }
    }

    pub fn record_error(&self, kind: &str) {
        self.errors.add(1, &[KeyValue::new("kind", kind.to_string())]);
        self.local.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_start(&self) {
        self.starts.add(1, &[]);
        self.local.starts.fetch_add(1, Ordering::Relaxed);
        self.set_running(true);
    }

    pub fn record_stop(&self) {
        self.stops.add(1, &[]);
        self.local.stops.fetch_add(1, Ordering::Relaxed);
        self.set_running(false);
        self.set_tip_synced(false);
    }

    pub fn record_stall(&self) {
        self.stalls.add(1, &[]);
        self.local.stalls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_queue_size(&self, len: usize) {
        let len = len as u64;
        self.queue_size.record(len, &[]);
        self.local.queue_size.store(len, Ordering::Relaxed);
    }

    /// Record the upstream tip. The origin tip reports zero for both gauges.
    pub fn set_tip(&self, tip: &Point) {
        let slot = tip.slot().unwrap_or(0);
        let height = tip.height().unwrap_or(0);
        self.tip_slot.record(slot, &[]);
        self.tip_height.record(height, &[]);
        self.local.tip_slot.store(slot, Ordering::Relaxed);
        self.local.tip_height.store(height, Ordering::Relaxed);
    }

    pub fn set_tip_synced(&self, synced: bool) {
        let v = u64::from(synced);
        self.tip_synced.record(v, &[]);
        self.local.tip_synced.store(v, Ordering::Relaxed);
    }

    pub fn set_running(&self, running: bool) {
        let v = u64::from(running);
        self.running.record(v, &[]);
        self.local.running.store(v, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let l = &self.local;
        MetricsSnapshot {
            blocks_processed: l.processed.load(Ordering::Relaxed),
            blocks_published: l.published.load(Ordering::Relaxed),
            errors: l.errors.load(Ordering::Relaxed),
            starts: l.starts.load(Ordering::Relaxed),
            stops: l.stops.load(Ordering::Relaxed),
            stalls: l.stalls.load(Ordering::Relaxed),
            queue_size: l.queue_size.load(Ordering::Relaxed),
            tip_slot: l.tip_slot.load(Ordering::Relaxed),
            tip_height: l.tip_height.load(Ordering::Relaxed),
            tip_synced: l.tip_synced.load(Ordering::Relaxed) == 1,
            running: l.running.load(Ordering::Relaxed) == 1,
            filter_matches: l
                .filter_matches
                .lock()
                .map(|m| m.clone())
                .unwrap_or_default(),
        }
    }
}

impl Default for FollowerMetrics {
    fn default() -> Self {
        Self::noop()
    }
}
