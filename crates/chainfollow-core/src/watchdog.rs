//! Liveness check: restarts the follower when its cursor stops moving.

use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cursor::Point;
use crate::follower::ChainFollower;
use crate::retry::RetryPolicy;

/// Compares successive snapshots of the current intersection.
#[derive(Debug, Default)]
pub struct Watchdog {
    last: Option<Option<Point>>,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `current` and report whether it is unchanged since the previous
    /// observation. The first observation only sets the baseline.
    pub fn observe(&mut self, current: Option<Point>) -> bool {
        let stalled = self.last.as_ref() == Some(&current);
        self.last = Some(current);
        stalled
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// The watchdog loop. Boxed because a restart spawns a new watchdog from
/// inside this future.
pub(crate) fn run(
    follower: Arc<ChainFollower>,
    token: CancellationToken,
    period: Duration,
) -> BoxFuture<'static, ()> {
    Box::pin(watch(follower, token, period))
}

async fn watch(follower: Arc<ChainFollower>, token: CancellationToken, period: Duration) {
    let mut watchdog = Watchdog::new();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let progress = follower.progress();
        if !progress.active {
            watchdog.reset();
            continue;
        }
        debug!(current = ?progress.current, "Watchdog tick");
        if watchdog.observe(progress.current.clone()) {
            warn!(
                current = ?progress.current,
                interval_ms = period.as_millis() as u64,
                "No progress since last watchdog tick, restarting follower"
            );
            follower.metrics().record_stall();
            follower.metrics().record_error("stall");
            restart(&follower).await;
            // Stopping cancelled this task's token; the restart spawned a
            // fresh watchdog.
            break;
        }
    }
}

async fn restart(follower: &Arc<ChainFollower>) {
    let policy = RetryPolicy::new(follower.config().restart_retry.clone());
    match policy.run("restart follower", move || follower.restart()).await {
        Ok(()) => info!("Follower restarted after stall"),
        Err(e) => error!(error = %e, "Giving up restarting follower"),
    }
}
