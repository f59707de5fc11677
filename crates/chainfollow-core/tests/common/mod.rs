//! Scripted chain-sync session shared by the follower tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

use chainfollow_core::{
    Block, BlockFilter, ChainEvent, ChainFollower, ChainSyncConnector, ChainSyncSession,
    ChannelPublisher, FollowerConfig, FollowerError, FollowerMetrics, Hooks, Intersection,
    MemoryCheckpointStore, Point, PublishedMessage, Transaction,
};

/// A fake upstream. Events pushed with [`ScriptedChain::push`] are handed out
/// one per `next_event` call, across sessions.
pub struct ScriptedChain {
    tx: mpsc::UnboundedSender<Result<ChainEvent, FollowerError>>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Result<ChainEvent, FollowerError>>>>,
    pub connects: AtomicUsize,
    pub fail_connect: AtomicBool,
    pub intersections: StdMutex<Vec<Vec<Point>>>,
    pub tip: StdMutex<Point>,
}

impl ScriptedChain {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            connects: AtomicUsize::new(0),
            fail_connect: AtomicBool::new(false),
            intersections: StdMutex::new(vec![]),
            tip: StdMutex::new(Point::Origin),
        })
    }

    pub fn push(&self, event: ChainEvent) {
        self.tx.send(Ok(event)).unwrap();
    }

    pub fn push_error(&self, error: FollowerError) {
        self.tx.send(Err(error)).unwrap();
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn last_intersection_request(&self) -> Vec<Point> {
        self.intersections.lock().unwrap().last().cloned().unwrap_or_default()
    }
}

pub struct ScriptedConnector(pub Arc<ScriptedChain>);

#[async_trait]
impl ChainSyncConnector for ScriptedConnector {
    async fn connect(&self) -> Result<Arc<dyn ChainSyncSession>, FollowerError> {
        if self.0.fail_connect.load(Ordering::SeqCst) {
            return Err(FollowerError::Upstream("connection refused".into()));
        }
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ScriptedSession {
            chain: self.0.clone(),
            connected: AtomicBool::new(true),
        }))
    }
}

struct ScriptedSession {
    chain: Arc<ScriptedChain>,
    connected: AtomicBool,
}

#[async_trait]
impl ChainSyncSession for ScriptedSession {
    async fn find_intersection(&self, points: &[Point]) -> Result<Intersection, FollowerError> {
        self.chain.intersections.lock().unwrap().push(points.to_vec());
        Ok(Intersection {
            point: points.first().cloned().unwrap_or(Point::Origin),
            tip: self.chain.tip.lock().unwrap().clone(),
        })
    }

    async fn next_event(&self) -> Result<ChainEvent, FollowerError> {
        if !self.is_connected() {
            return Err(FollowerError::Upstream("session closed".into()));
        }
        let mut rx = self.chain.rx.lock().await;
        match rx.recv().await {
            Some(event) => event,
            None => Err(FollowerError::Upstream("script ended".into())),
        }
    }

    async fn shutdown(&self) -> Result<(), FollowerError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

// ─── Fixtures ─────────────────────────────────────────────────────────────────

pub const WATCHED: &str = "addr1";

pub fn block(height: u64, matching: bool) -> Block {
    let address = if matching { WATCHED } else { "addr_other" };
    Block::new(format!("b{height}"), height * 20, height)
        .with_transaction(Transaction::new(format!("tx{height}")).with_output(address))
}

pub fn point(height: u64) -> Point {
    Point::at(format!("b{height}"), height * 20, height)
}

pub fn forward(height: u64, tip: u64, matching: bool) -> ChainEvent {
    ChainEvent::RollForward {
        block: block(height, matching),
        tip: point(tip),
    }
}

pub fn backward(height: u64, tip: u64) -> ChainEvent {
    ChainEvent::RollBackward {
        point: point(height),
        tip: point(tip),
    }
}

/// Config with timers far enough out not to fire unless a test asks.
pub fn config(block_to_wait: u64) -> FollowerConfig {
    FollowerConfig {
        id: "test".into(),
        block_to_wait,
        snapshot_interval_ms: 3_600_000,
        watchdog_interval_ms: 3_600_000,
        ..Default::default()
    }
}

pub struct Harness {
    pub follower: Arc<ChainFollower>,
    pub chain: Arc<ScriptedChain>,
    pub publisher: Arc<ChannelPublisher>,
    pub bus: tokio::sync::broadcast::Receiver<PublishedMessage>,
    pub store: Arc<MemoryCheckpointStore>,
}

pub fn wallet_hooks() -> Hooks {
    let mut hooks = Hooks::new();
    hooks
        .enable(Arc::new(chainfollow_core::Filter::wallet_address("wallets", [WATCHED])))
        .unwrap();
    hooks
}

pub fn harness(config: FollowerConfig, hooks: Hooks) -> Harness {
    let chain = ScriptedChain::new();
    let (publisher, bus) = ChannelPublisher::new(64);
    let publisher = Arc::new(publisher);
    let store = Arc::new(MemoryCheckpointStore::new());
    let follower = ChainFollower::new(
        config,
        Arc::new(ScriptedConnector(chain.clone())),
        publisher.clone(),
        store.clone(),
        hooks,
        Arc::new(FollowerMetrics::noop()),
    );
    Harness {
        follower,
        chain,
        publisher,
        bus,
        store,
    }
}

pub fn hooks_with(filter: Arc<dyn BlockFilter>) -> Hooks {
    let mut hooks = Hooks::new();
    hooks.enable(filter).unwrap();
    hooks
}

impl Harness {
    pub async fn start(&self) {
        self.follower.initialize().await.unwrap();
        self.follower.connect_and_start().await.unwrap();
    }

    /// Wait until `n` events have been handled successfully.
    pub async fn processed(&self, n: u64) {
        for _ in 0..5_000 {
            if self.follower.metrics().snapshot().blocks_processed >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("follower did not process {n} events");
    }

    /// Wait until the follower has stopped.
    pub async fn stopped(&self) {
        for _ in 0..5_000 {
            if !self.follower.is_active().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("follower did not stop");
    }

    /// Everything published so far.
    pub fn drain_bus(&mut self) -> Vec<PublishedMessage> {
        let mut out = vec![];
        while let Ok(msg) = self.bus.try_recv() {
            out.push(msg);
        }
        out
    }
}
