//! Chain-sync session over an Ogmios WebSocket.
//!
//! Requests are issued strictly one at a time: `next_event` sends one
//! `nextBlock` and waits for its response before anything else is sent.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use chainfollow_core::cursor::Point;
use chainfollow_core::error::FollowerError;
use chainfollow_core::session::{ChainSyncConnector, ChainSyncSession};
use chainfollow_core::types::{ChainEvent, Intersection};

use crate::codec::{self, IntersectionFound, NextBlock, RpcResponse, WirePoint};
use crate::health::{self, ServerHealth};
use crate::tracker::{PointWindow, DEFAULT_WINDOW};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Where to reach Ogmios.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OgmiosConfig {
    pub host: String,
    pub port: u16,
    /// Use `wss://`.
    pub secure: bool,
    /// How many recent positions to keep for resolving rollback heights.
    pub window: usize,
}

impl Default for OgmiosConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1337,
            secure: false,
            window: DEFAULT_WINDOW,
        }
    }
}

impl OgmiosConfig {
    pub fn url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }

    /// The HTTP health endpoint on the same host and port.
    pub fn health_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}:{}/health", self.host, self.port)
    }
}

/// Opens [`OgmiosSession`]s and queries server health.
pub struct OgmiosConnector {
    config: OgmiosConfig,
    http: reqwest::Client,
}

impl OgmiosConnector {
    pub fn new(config: OgmiosConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    pub fn config(&self) -> &OgmiosConfig {
        &self.config
    }

    /// `GET /health` on the configured server.
    pub async fn health(&self) -> Result<ServerHealth, FollowerError> {
        health::fetch(&self.http, &self.config.health_url()).await
    }
}

#[async_trait]
impl ChainSyncConnector for OgmiosConnector {
    async fn connect(&self) -> Result<Arc<dyn ChainSyncSession>, FollowerError> {
        let session = OgmiosSession::connect(&self.config).await?;
        Ok(Arc::new(session))
    }
}

/// One open Ogmios chain-sync connection.
pub struct OgmiosSession {
    url: String,
    sink: Mutex<SplitSink<WsStream, Message>>,
    stream: Mutex<SplitStream<WsStream>>,
    window: Mutex<PointWindow>,
    next_id: AtomicU64,
    connected: AtomicBool,
}

impl OgmiosSession {
    pub async fn connect(config: &OgmiosConfig) -> Result<Self, FollowerError> {
        let url = config.url();
        info!(url = %url, "Connecting to Ogmios");
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| FollowerError::Upstream(format!("connect {url}: {e}")))?;
        let (sink, stream) = ws.split();
        Ok(Self {
            url,
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            window: Mutex::new(PointWindow::new(config.window)),
            next_id: AtomicU64::new(1),
            connected: AtomicBool::new(true),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn closed(&self, reason: impl Into<String>) -> FollowerError {
        self.connected.store(false, Ordering::SeqCst);
        FollowerError::Upstream(reason.into())
    }

    /// Send one request and wait for the response carrying its id.
    async fn request<T: DeserializeOwned>(
        &self,
        build: impl FnOnce(u64) -> Value,
    ) -> Result<T, FollowerError> {
        if !self.is_connected() {
            return Err(FollowerError::Upstream("session closed".into()));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let text = serde_json::to_string(&build(id))?;

        let mut stream = self.stream.lock().await;
        self.sink
            .lock()
            .await
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| self.closed(format!("send failed: {e}")))?;

        loop {
            match stream.next().await {
                None => return Err(self.closed("connection closed by Ogmios")),
                Some(Err(e)) => return Err(self.closed(format!("receive failed: {e}"))),
                Some(Ok(Message::Text(text))) => {
                    let resp: RpcResponse = serde_json::from_str(text.as_str())?;
                    if !resp.has_id(id) {
                        debug!(id, "Skipping unrelated response");
                        continue;
                    }
                    return resp.into_result();
                }
                Some(Ok(Message::Close(frame))) => {
                    return Err(self.closed(format!("closed by Ogmios: {frame:?}")));
                }
                Some(Ok(_)) => continue,
            }
        }
    }

    /// Give a `{slot, id}` point its height from the recent window.
    async fn resolve(&self, point: WirePoint) -> Result<Point, FollowerError> {
        match point {
            WirePoint::Origin(_) => Ok(Point::Origin),
            WirePoint::At { slot, id } => self
                .window
                .lock()
                .await
                .resolve(slot, &id)
                .map(Point::At)
                .ok_or_else(|| {
                    FollowerError::Upstream(format!(
                        "point {id}@{slot} is outside the tracked window"
                    ))
                }),
        }
    }
}

#[async_trait]
impl ChainSyncSession for OgmiosSession {
    async fn find_intersection(&self, points: &[Point]) -> Result<Intersection, FollowerError> {
        self.window.lock().await.seed(points);
        let found: IntersectionFound = self
            .request(|id| codec::find_intersection_request(id, points))
            .await?;
        let point = self.resolve(found.intersection).await?;
        if let Some(c) = point.cursor() {
            self.window.lock().await.rewind_to(c);
        }
        Ok(Intersection {
            point,
            tip: found.tip.into(),
        })
    }

    async fn next_event(&self) -> Result<ChainEvent, FollowerError> {
        let next: NextBlock = self.request(codec::next_block_request).await?;
        match next {
            NextBlock::Forward { block, tip } => {
                self.window.lock().await.push(block.cursor());
                Ok(ChainEvent::RollForward {
                    block,
                    tip: tip.into(),
                })
            }
            NextBlock::Backward { point, tip } => {
                let point = self.resolve(point).await?;
                let mut window = self.window.lock().await;
                match point.cursor() {
                    Some(c) => window.rewind_to(c),
                    None => window.clear(),
                }
                Ok(ChainEvent::RollBackward {
                    point,
                    tip: tip.into(),
                })
            }
        }
    }

    async fn shutdown(&self) -> Result<(), FollowerError> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!(url = %self.url, "Closing Ogmios session");
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(Message::Close(None)).await {
            warn!(error = %e, "Close frame not delivered");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
