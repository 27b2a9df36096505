//! Per-client WebSocket plumbing.
//!
//! Each accepted client runs a reader and a writer task. The reader only
//! enforces liveness (any inbound frame, pongs included, resets a 60 s
//! deadline; payloads are discarded). The writer drains the client's
//! private queue, pings every 54 s, and gives up after a 10 s write stall.
//! Either side closing tears the client down exactly once.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use log::debug;

use crate::config::{WS_PING_INTERVAL, WS_READ_DEADLINE, WS_WRITE_TIMEOUT};

use super::hub::Hub;

/// Runs one upgraded client socket until it disconnects.
pub async fn handle_socket(socket: WebSocket, hub: Arc<Hub>) {
    let (client_id, mut queue, cancel) = hub.register_client();
    let (mut sender, mut receiver) = socket.split();

    let writer_hub = Arc::clone(&hub);
    let writer_cancel = cancel.clone();
    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(WS_PING_INTERVAL);
        ping.tick().await; // fires immediately; the first real ping waits

        loop {
            tokio::select! {
                _ = writer_cancel.cancelled() => break,
                received = queue.recv() => {
                    let Some(tx) = received else { break };
                    let payload = match serde_json::to_string(tx.as_ref()) {
                        Ok(payload) => payload,
                        Err(err) => {
                            debug!("Failed to serialize transaction for client {client_id}: {err}");
                            continue;
                        }
                    };
                    let send = tokio::time::timeout(
                        WS_WRITE_TIMEOUT,
                        sender.send(Message::Text(payload)),
                    )
                    .await;
                    if !matches!(send, Ok(Ok(()))) {
                        break;
                    }
                }
                _ = ping.tick() => {
                    let send = tokio::time::timeout(
                        WS_WRITE_TIMEOUT,
                        sender.send(Message::Ping(Vec::new())),
                    )
                    .await;
                    if !matches!(send, Ok(Ok(()))) {
                        break;
                    }
                }
            }
        }
        let _ = sender.close().await;
        writer_hub.close_client(client_id);
    });

    let reader_hub = Arc::clone(&hub);
    let reader_cancel = cancel;
    let reader = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = reader_cancel.cancelled() => break,
                frame = tokio::time::timeout(WS_READ_DEADLINE, receiver.next()) => {
                    match frame {
                        // No frame inside the deadline: the peer is gone.
                        Err(_) => break,
                        Ok(None) | Ok(Some(Err(_))) => break,
                        // Any frame counts as liveness; content ignored.
                        Ok(Some(Ok(_))) => {}
                    }
                }
            }
        }
        reader_hub.close_client(client_id);
    });

    let _ = tokio::join!(writer, reader);
}
