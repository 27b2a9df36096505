//! Ledger-node client: request/response JSON-RPC over HTTP plus a single
//! duplex WebSocket carrying stream subscriptions.
//!
//! The client never reconnects on its own; the transaction listener's
//! supervisor owns that decision. A read error only flips `is_connected`
//! to false so the supervisor can observe it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::WS_HANDSHAKE_TIMEOUT;
use crate::error_handling::PipelineStats;

/// Callback invoked for every inbound frame on the subscription socket.
pub type MessageCallback = Arc<dyn Fn(&Value) + Send + Sync>;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Interface to the upstream ledger node.
///
/// Components accept this trait so tests can substitute a stub node.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Establishes the WebSocket connection and starts the read loop.
    async fn connect(&self) -> Result<()>;

    /// Closes the connection; safe to call when already closed.
    async fn close(&self) -> Result<()>;

    /// Current connection status; false after any read error.
    fn is_connected(&self) -> bool;

    /// Sends a JSON-RPC command over HTTP and returns the decoded body.
    async fn command(&self, method: &str, params: Value) -> Result<Value>;

    /// Subscribes to streams on the duplex socket. A callback, when given,
    /// is registered before the subscribe frame goes out and stays
    /// registered across reconnects; pass `None` when re-subscribing.
    async fn subscribe(&self, streams: &[String], callback: Option<MessageCallback>) -> Result<()>;

    /// Unsubscribes from streams; registered callbacks are kept.
    async fn unsubscribe(&self, streams: &[String]) -> Result<()>;

    /// `server_info` convenience command.
    async fn get_server_info(&self) -> Result<Value> {
        self.command("server_info", json!({})).await
    }

    /// `validators` convenience command.
    async fn get_validators(&self) -> Result<Value> {
        self.command("validators", json!({})).await
    }
}

/// Production [`NodeClient`] backed by reqwest and tokio-tungstenite.
pub struct Client {
    json_rpc_url: String,
    websocket_url: String,
    http: reqwest::Client,
    stats: Arc<PipelineStats>,
    connected: Arc<AtomicBool>,
    sink: tokio::sync::Mutex<Option<WsSink>>,
    callbacks: Arc<std::sync::Mutex<Vec<MessageCallback>>>,
    read_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    pub fn new(
        json_rpc_url: impl Into<String>,
        websocket_url: impl Into<String>,
        http: reqwest::Client,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Client {
            json_rpc_url: json_rpc_url.into(),
            websocket_url: websocket_url.into(),
            http,
            stats,
            connected: Arc::new(AtomicBool::new(false)),
            sink: tokio::sync::Mutex::new(None),
            callbacks: Arc::new(std::sync::Mutex::new(Vec::new())),
            read_task: std::sync::Mutex::new(None),
        }
    }

    fn spawn_read_loop(&self, mut stream: WsStream) {
        let connected = Arc::clone(&self.connected);
        let callbacks = Arc::clone(&self.callbacks);
        let url = self.websocket_url.clone();

        let handle = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<Value>(&text) {
                        Ok(value) => {
                            let snapshot: Vec<MessageCallback> = callbacks
                                .lock()
                                .map(|cbs| cbs.clone())
                                .unwrap_or_default();
                            for callback in snapshot {
                                callback(&value);
                            }
                        }
                        Err(err) => {
                            debug!("Dropping malformed frame from {url}: {err}");
                        }
                    },
                    Ok(Message::Close(_)) => {
                        info!("Upstream WebSocket closed by {url}");
                        break;
                    }
                    // Control frames carry no stream payload.
                    Ok(_) => {}
                    Err(err) => {
                        warn!("WebSocket read error from {url}: {err}");
                        break;
                    }
                }
            }
            connected.store(false, Ordering::SeqCst);
        });

        if let Ok(mut slot) = self.read_task.lock() {
            if let Some(previous) = slot.replace(handle) {
                previous.abort();
            }
        }
    }
}

#[async_trait]
impl NodeClient for Client {
    async fn connect(&self) -> Result<()> {
        let dial = tokio::time::timeout(
            WS_HANDSHAKE_TIMEOUT,
            connect_async(self.websocket_url.as_str()),
        )
        .await
            .map_err(|_| anyhow!("WebSocket handshake to {} timed out", self.websocket_url))?
            .with_context(|| format!("failed to connect to {}", self.websocket_url))?;

        let (ws, _response) = dial;
        let (sink, stream) = ws.split();

        *self.sink.lock().await = Some(sink);
        self.connected.store(true, Ordering::SeqCst);
        self.spawn_read_loop(stream);
        info!("Connected to ledger WebSocket at {}", self.websocket_url);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
        }
        if let Ok(mut slot) = self.read_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn command(&self, method: &str, params: Value) -> Result<Value> {
        self.stats.record_upstream_command();
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": [params],
        });

        let response = self
            .http
            .post(&self.json_rpc_url)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("RPC command {method} failed"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("RPC command {method} returned HTTP {status}"));
        }

        let body: Value = response
            .json()
            .await
            .with_context(|| format!("failed to decode {method} response"))?;

        if let Some(error) = body.get("error") {
            return Err(anyhow!("JSON-RPC error from {method}: {error}"));
        }
        Ok(body)
    }

    async fn subscribe(&self, streams: &[String], callback: Option<MessageCallback>) -> Result<()> {
        if !self.is_connected() {
            return Err(anyhow!("not connected to ledger node"));
        }
        if let Some(callback) = callback {
            if let Ok(mut cbs) = self.callbacks.lock() {
                cbs.push(callback);
            }
        }

        let frame = json!({ "command": "subscribe", "streams": streams });
        let mut guard = self.sink.lock().await;
        let sink = guard
            .as_mut()
            .ok_or_else(|| anyhow!("not connected to ledger node"))?;
        sink.send(Message::Text(frame.to_string()))
            .await
            .context("failed to send subscribe command")?;
        Ok(())
    }

    async fn unsubscribe(&self, streams: &[String]) -> Result<()> {
        if !self.is_connected() {
            return Err(anyhow!("not connected to ledger node"));
        }
        let frame = json!({ "command": "unsubscribe", "streams": streams });
        let mut guard = self.sink.lock().await;
        let sink = guard
            .as_mut()
            .ok_or_else(|| anyhow!("not connected to ledger node"))?;
        sink.send(Message::Text(frame.to_string()))
            .await
            .context("failed to send unsubscribe command")?;
        Ok(())
    }
}
