//! The chain follower: owns the upstream session and drives the
//! roll-forward / roll-backward state machine.
//!
//! Lifecycle transitions (`initialize`, `connect_and_start`, `stop`) are
//! serialised by one lock; event handling and the timers share the follower
//! state through a second one. Event handling never takes the lifecycle lock
//! while holding the state lock, so a stop requested from inside the event
//! loop or a timer cannot deadlock.
//!
//! The watchdog reads a `Progress` snapshot published after each event and
//! never waits on the state lock. `stop` cancels the event loop before it
//! takes that lock, so a handler stuck on a collaborator is abandoned rather
//! than waited for.

use chrono::Utc;
use serde::Serialize;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointManager, CheckpointStore};
use crate::config::FollowerConfig;
use crate::cursor::{CursorTracker, Point, Tip};
use crate::error::FollowerError;
use crate::hooks::Hooks;
use crate::metrics::FollowerMetrics;
use crate::publisher::Publisher;
use crate::queue::{ConfirmationQueue, QueueEntry};
use crate::session::{ChainSyncConnector, ChainSyncSession};
use crate::types::{any_match, Block, ChainEvent, FollowerState, Matches, Status};
use crate::watchdog;

/// Wire form of a block-topic message, borrowing from the follower's state.
#[derive(Serialize)]
struct OutgoingMessage<'a> {
    block: Option<&'a Block>,
    matches: &'a Matches,
    #[serde(skip_serializing_if = "Option::is_none")]
    rollback: Option<&'a Point>,
}

struct FollowerInner {
    status: Status,
    session: Option<Arc<dyn ChainSyncSession>>,
    /// Where the next `connect_and_start` resumes from.
    start_points: Vec<Point>,
    cursor: CursorTracker,
    queue: ConfirmationQueue,
    tip_synced: bool,
    /// Bumped on every start; events from an older session are dropped.
    epoch: u64,
    watchdog_token: Option<CancellationToken>,
}

impl FollowerInner {
    fn holds_resources(&self) -> bool {
        self.session.is_some() || self.watchdog_token.is_some()
    }
}

/// Last fully handled state, as seen by the watchdog.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Progress {
    pub(crate) active: bool,
    pub(crate) current: Option<Point>,
}

/// Follows the chain, filters blocks and publishes the confirmed matches.
pub struct ChainFollower {
    config: FollowerConfig,
    connector: Arc<dyn ChainSyncConnector>,
    publisher: Arc<dyn Publisher>,
    checkpoints: CheckpointManager,
    hooks: Hooks,
    metrics: Arc<FollowerMetrics>,
    lifecycle: Mutex<()>,
    inner: Mutex<FollowerInner>,
    progress: watch::Sender<Progress>,
    /// Cancels the event loop and the checkpoint timer.
    run_token: StdMutex<Option<CancellationToken>>,
}

impl ChainFollower {
    pub fn new(
        config: FollowerConfig,
        connector: Arc<dyn ChainSyncConnector>,
        publisher: Arc<dyn Publisher>,
        store: Arc<dyn CheckpointStore>,
        hooks: Hooks,
        metrics: Arc<FollowerMetrics>,
    ) -> Arc<Self> {
        let inner = FollowerInner {
            status: Status::default(),
            session: None,
            start_points: config.start_points.clone(),
            cursor: CursorTracker::new(),
            queue: ConfirmationQueue::new(config.block_to_wait),
            tip_synced: false,
            epoch: 0,
            watchdog_token: None,
        };
        Arc::new(Self {
            checkpoints: CheckpointManager::new(store, config.id.clone()),
            config,
            connector,
            publisher,
            hooks,
            metrics,
            lifecycle: Mutex::new(()),
            inner: Mutex::new(inner),
            progress: watch::channel(Progress::default()).0,
            run_token: StdMutex::new(None),
        })
    }

    // ─── Status ───────────────────────────────────────────────────────────────

    pub fn config(&self) -> &FollowerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<FollowerMetrics> {
        &self.metrics
    }

    pub(crate) fn progress(&self) -> Progress {
        self.progress.borrow().clone()
    }

    pub async fn status(&self) -> Status {
        self.inner.lock().await.status.clone()
    }

    pub async fn is_active(&self) -> bool {
        self.inner.lock().await.status.state == FollowerState::Active
    }

    /// Position of the most recently processed or published block.
    pub async fn current_intersection(&self) -> Option<Point> {
        self.inner.lock().await.cursor.current().cloned()
    }

    /// Resume position covering the oldest block still waiting for
    /// confirmation.
    pub async fn queued_intersection(&self) -> Option<Point> {
        self.inner.lock().await.cursor.queued().cloned()
    }

    pub async fn queue_len(&self) -> usize {
        self.inner.lock().await.queue.len()
    }

    pub async fn is_tip_synced(&self) -> bool {
        self.inner.lock().await.tip_synced
    }

    pub async fn start_points(&self) -> Vec<Point> {
        self.inner.lock().await.start_points.clone()
    }

    /// `true` while an upstream session is open and reports itself healthy.
    pub async fn is_session_connected(&self) -> bool {
        self.inner
            .lock()
            .await
            .session
            .as_ref()
            .is_some_and(|s| s.is_connected())
    }

    // ─── Lifecycle ────────────────────────────────────────────────────────────

    /// Replace the start points with the stored checkpoint, if there is one.
    pub async fn resume_from_store(&self) -> Result<Option<Point>, FollowerError> {
        let point = self.checkpoints.load_point().await?;
        match &point {
            Some(p) => {
                info!(follower = %self.config.id, checkpoint = %p, "Resuming from checkpoint");
                self.inner.lock().await.start_points = vec![p.clone()];
            }
            None => info!(follower = %self.config.id, "No checkpoint stored, using start points"),
        }
        Ok(point)
    }

    /// Open the upstream session and start the watchdog.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), FollowerError> {
        let _guard = self.lifecycle.lock().await;
        {
            let inner = self.inner.lock().await;
            if inner.status.state == FollowerState::Active || inner.session.is_some() {
                debug!("Follower already initialized");
                return Ok(());
            }
        }

        info!(follower = %self.config.id, "Opening chain-sync session");
        let session = match self.connector.connect().await {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "Failed to open chain-sync session");
                self.metrics.record_error(e.kind());
                self.shutdown_locked().await;
                return Err(e);
            }
        };

        let token = CancellationToken::new();
        let mut inner = self.inner.lock().await;
        inner.session = Some(session);
        inner.watchdog_token = Some(token.clone());
        tokio::spawn(watchdog::run(
            Arc::clone(self),
            token,
            self.config.watchdog_interval(),
        ));
        Ok(())
    }

    /// Connect the publisher, start checkpointing and resume the session from
    /// the start points. Flips the follower to `ACTIVE`.
    pub async fn connect_and_start(self: &Arc<Self>) -> Result<(), FollowerError> {
        let _guard = self.lifecycle.lock().await;
        let mut inner = self.inner.lock().await;
        if inner.status.state == FollowerState::Active {
            debug!("Follower already active");
            return Ok(());
        }
        let Some(session) = inner.session.clone() else {
            return Err(FollowerError::NotInitialized);
        };

        if let Err(e) = self.start_locked(&mut inner, session).await {
            drop(inner);
            error!(error = %e, "Failed to start follower");
            self.metrics.record_error(e.kind());
            self.shutdown_locked().await;
            return Err(e);
        }
        Ok(())
    }

    async fn start_locked(
        self: &Arc<Self>,
        inner: &mut FollowerInner,
        session: Arc<dyn ChainSyncSession>,
    ) -> Result<(), FollowerError> {
        self.publisher.connect().await?;

        let run_token = CancellationToken::new();
        self.set_run_token(Some(run_token.clone()));
        tokio::spawn(run_snapshots(
            Arc::clone(self),
            run_token.clone(),
            self.config.snapshot_interval(),
        ));

        let intersection = session.find_intersection(&inner.start_points).await?;
        info!(
            follower = %self.config.id,
            intersection = %intersection.point,
            tip = %intersection.tip,
            "Chain-sync intersection found"
        );

        // Anything still queued is replayed from the checkpoint it produced.
        inner.queue.clear();
        inner.cursor.reset();
        inner.cursor.set_current(intersection.point);
        inner.tip_synced = false;
        self.metrics.set_queue_size(0);
        self.metrics.set_tip(&intersection.tip);

        inner.status = Status {
            started_at: Some(Utc::now()),
            stopped_at: None,
            state: FollowerState::Active,
        };
        inner.epoch += 1;
        self.metrics.record_start();
        self.publish_progress(inner);

        tokio::spawn(run_events(Arc::clone(self), session, inner.epoch, run_token));
        Ok(())
    }

    /// Tear everything down and write a final checkpoint. Safe to call at any
    /// time; stopping an already stopped follower changes nothing.
    pub async fn stop(&self) {
        let _guard = self.lifecycle.lock().await;
        self.shutdown_locked().await;
    }

    /// Stop, but only if the session started at `epoch` is still the running
    /// one.
    async fn stop_if_epoch(&self, epoch: u64) {
        let _guard = self.lifecycle.lock().await;
        {
            let inner = self.inner.lock().await;
            if inner.epoch != epoch || inner.status.state != FollowerState::Active {
                debug!(epoch, "Ignoring stop from a stale session");
                return;
            }
        }
        self.shutdown_locked().await;
    }

    /// Stop, re-open and restart from the last checkpoint.
    pub async fn restart(self: &Arc<Self>) -> Result<(), FollowerError> {
        self.stop().await;
        self.initialize().await?;
        self.connect_and_start().await
    }

    /// Best-effort teardown. Caller holds the lifecycle lock.
    async fn shutdown_locked(&self) {
        // Cancelled before taking the state lock: an in-flight handler holds
        // it and is dropped by the event loop on cancellation.
        let run_token = self.set_run_token(None);
        if let Some(token) = &run_token {
            token.cancel();
        }
        let mut inner = self.inner.lock().await;
        if inner.status.state == FollowerState::Inactive
            && !inner.holds_resources()
            && run_token.is_none()
        {
            warn!(follower = %self.config.id, "Follower already stopped");
            return;
        }
        info!(follower = %self.config.id, "Stopping follower");

        if let Some(session) = inner.session.take() {
            if let Err(e) = session.shutdown().await {
                warn!(error = %e, "Failed to close chain-sync session");
            }
        }
        if self.publisher.is_connected() {
            if let Err(e) = self.publisher.disconnect().await {
                warn!(error = %e, "Failed to disconnect publisher");
            }
        }
        if let Some(token) = inner.watchdog_token.take() {
            token.cancel();
        }
        match self.persist_checkpoint(&mut inner).await {
            Ok(point) => info!(checkpoint = %point, "Final checkpoint saved"),
            Err(e) => warn!(error = %e, "Final checkpoint not saved"),
        }

        inner.status = Status {
            started_at: None,
            stopped_at: Some(Utc::now()),
            state: FollowerState::Inactive,
        };
        inner.tip_synced = false;
        self.metrics.record_stop();
        self.publish_progress(&inner);
    }

    /// Swap the run token, returning the previous one.
    fn set_run_token(&self, token: Option<CancellationToken>) -> Option<CancellationToken> {
        let mut slot = self.run_token.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, token)
    }

    fn publish_progress(&self, inner: &FollowerInner) {
        self.progress.send_replace(Progress {
            active: inner.status.state == FollowerState::Active,
            current: inner.cursor.current().cloned(),
        });
    }

    // ─── Checkpointing ────────────────────────────────────────────────────────

    /// Persist the queued intersection if blocks are waiting, else the
    /// current one. With neither known the follower stops.
    pub async fn save_cursor(&self) -> Result<Point, FollowerError> {
        let result = {
            let mut inner = self.inner.lock().await;
            self.persist_checkpoint(&mut inner).await
        };
        match &result {
            Ok(point) => info!(checkpoint = %point, "Cursor saved"),
            Err(FollowerError::NoCheckpoint) => {
                error!("No position to checkpoint, stopping follower");
                self.metrics.record_error("checkpoint");
                self.stop().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to save cursor");
                self.metrics.record_error(e.kind());
            }
        }
        result
    }

    async fn persist_checkpoint(&self, inner: &mut FollowerInner) -> Result<Point, FollowerError> {
        let point = inner
            .cursor
            .checkpoint()
            .cloned()
            .ok_or(FollowerError::NoCheckpoint)?;
        self.checkpoints.upsert(&point).await?;
        inner.start_points = vec![point.clone()];
        Ok(point)
    }

    // ─── Event handling ───────────────────────────────────────────────────────

    /// Returns `false` when the event belongs to a session that is no longer
    /// running.
    async fn handle_event(&self, epoch: u64, event: ChainEvent) -> Result<bool, FollowerError> {
        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch || inner.status.state != FollowerState::Active {
            debug!(epoch, "Dropping event from a stale session");
            return Ok(false);
        }

        let started = Instant::now();
        let outcome = match event {
            ChainEvent::RollForward { block, tip } => self
                .on_roll_forward(&mut inner, block, tip)
                .await
                .map(|_| "roll_forward"),
            ChainEvent::RollBackward { point, tip } => self
                .on_roll_backward(&mut inner, point, tip)
                .await
                .map(|_| "roll_backward"),
        };
        self.publish_progress(&inner);
        let task = outcome?;
        self.metrics
            .record_processed(task, started.elapsed().as_secs_f64());
        Ok(true)
    }

    async fn on_roll_forward(
        &self,
        inner: &mut FollowerInner,
        block: Block,
        tip: Tip,
    ) -> Result<(), FollowerError> {
        if let Ok(bytes) = serde_json::to_vec(&block) {
            self.metrics.record_block_size(bytes.len() as u64);
        }

        let height = block.height;
        let previous = inner.cursor.current().cloned();
        if let Some(prev) = previous.as_ref().and_then(Point::cursor) {
            if height <= prev.height || tip.slot() == Some(prev.slot) {
                warn!(
                    height,
                    previous = prev.height,
                    tip_slot = ?tip.slot(),
                    "Roll forward without progress"
                );
            }
        }
        let resume_from = previous.unwrap_or(Point::Origin);
        inner.cursor.set_current(block.point());

        let tip_height = tip.height().unwrap_or(0);
        self.release_ready(inner, tip_height).await?;
        self.metrics.set_tip(&tip);

        let matches = self.hooks.match_block(&block).await?;
        if any_match(&matches) {
            if inner.queue.is_bypassed() {
                self.publish_block(inner, &block, &matches).await?;
            } else {
                inner.queue.enqueue(QueueEntry {
                    block,
                    matches,
                    resume_from,
                });
            }
        }
        self.sync_queued(inner);

        self.set_tip_synced(inner, tip.height() == Some(height));
        Ok(())
    }

    async fn on_roll_backward(
        &self,
        inner: &mut FollowerInner,
        point: Point,
        tip: Tip,
    ) -> Result<(), FollowerError> {
        info!(rollback = %point, tip = %tip, "Rolling back");

        let dropped = inner.queue.discard_from(&point);
        inner.cursor.set_current(point.clone());
        self.sync_queued(inner);
        if dropped > 0 {
            info!(dropped, "Discarded unconfirmed blocks");
        }

        // Written now rather than on the next snapshot so a crash mid-reorg
        // cannot resume past the rollback.
        self.persist_checkpoint(inner).await?;

        self.metrics.set_tip(&tip);
        self.set_tip_synced(inner, false);

        let payload = serde_json::to_string(&OutgoingMessage {
            block: None,
            matches: &Matches::new(),
            rollback: Some(&point),
        })?;
        self.publisher
            .send(&self.config.topic, &point.bus_key(), payload)
            .await?;
        info!(rollback = %point, "Published rollback notice");
        Ok(())
    }

    /// Publish every queued block buried deep enough under `tip_height`.
    /// A failed publish puts the block back where it was.
    async fn release_ready(
        &self,
        inner: &mut FollowerInner,
        tip_height: u64,
    ) -> Result<(), FollowerError> {
        while let Some(idx) = inner.queue.first_ready(tip_height) {
            let Some(entry) = inner.queue.remove(idx) else {
                break;
            };
            if let Err(e) = self.publish_block(inner, &entry.block, &entry.matches).await {
                inner.queue.insert(idx, entry);
                return Err(e);
            }
        }
        Ok(())
    }

    async fn publish_block(
        &self,
        inner: &mut FollowerInner,
        block: &Block,
        matches: &Matches,
    ) -> Result<(), FollowerError> {
        let payload = serde_json::to_string(&OutgoingMessage {
            block: Some(block),
            matches,
            rollback: None,
        })?;
        self.publisher
            .send(&self.config.topic, &block.id, payload)
            .await?;
        inner.cursor.set_current(block.point());
        self.metrics.record_published();
        info!(height = block.height, id = %block.id, "Published block");
        Ok(())
    }

    fn sync_queued(&self, inner: &mut FollowerInner) {
        let queued = inner.queue.oldest().map(|e| e.resume_from.clone());
        inner.cursor.set_queued(queued);
        self.metrics.set_queue_size(inner.queue.len());
    }

    fn set_tip_synced(&self, inner: &mut FollowerInner, synced: bool) {
        if inner.tip_synced != synced {
            inner.tip_synced = synced;
            self.metrics.set_tip_synced(synced);
            info!(synced, "Tip sync changed");
        }
    }
}

// ─── Background tasks ─────────────────────────────────────────────────────────

/// Pull events one at a time; the next one is requested only after the
/// current one is fully handled.
async fn run_events(
    follower: Arc<ChainFollower>,
    session: Arc<dyn ChainSyncSession>,
    epoch: u64,
    token: CancellationToken,
) {
    debug!(epoch, "Event loop started");
    loop {
        let event = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            event = session.next_event() => event,
        };
        let outcome = match event {
            Ok(event) => tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!(epoch, "Event handling interrupted by stop");
                    break;
                }
                outcome = follower.handle_event(epoch, event) => outcome,
            },
            Err(e) => Err(e),
        };
        match outcome {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                error!(error = %e, "Event handling failed, stopping follower");
                follower.metrics.record_error(e.kind());
                follower.stop_if_epoch(epoch).await;
                break;
            }
        }
    }
    debug!(epoch, "Event loop finished");
}

async fn run_snapshots(follower: Arc<ChainFollower>, token: CancellationToken, period: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                // Outcome is logged by save_cursor.
                let _ = follower.save_cursor().await;
            }
        }
    }
}
