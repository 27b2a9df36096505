//! Broadcast hub: fans enriched transactions out to WebSocket clients.
//!
//! One bounded most-recent ring feeds a dedicated dispatcher; each client
//! gets a bounded private queue. A slow client either keeps up or is
//! closed; it can never slow another client or the listener.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, info};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error_handling::{DropReason, PipelineStats};
use crate::models::Transaction;

struct ClientHandle {
    sender: mpsc::Sender<Arc<Transaction>>,
    cancel: CancellationToken,
}

struct HubState {
    queue: VecDeque<Arc<Transaction>>,
    clients: HashMap<u64, ClientHandle>,
}

/// The fan-out hub.
pub struct Hub {
    capacity: usize,
    client_buffer: usize,
    stats: Arc<PipelineStats>,
    state: Mutex<HubState>,
    notify: Notify,
    cancel: CancellationToken,
    stopped: AtomicBool,
    next_client_id: AtomicU64,
}

impl Hub {
    pub fn new(capacity: usize, client_buffer: usize, stats: Arc<PipelineStats>) -> Self {
        Hub {
            capacity,
            client_buffer,
            stats,
            state: Mutex::new(HubState {
                queue: VecDeque::new(),
                clients: HashMap::new(),
            }),
            notify: Notify::new(),
            cancel: CancellationToken::new(),
            stopped: AtomicBool::new(false),
            next_client_id: AtomicU64::new(1),
        }
    }

    /// Starts the dispatcher task.
    pub fn start(self: &Arc<Self>) {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = hub.cancel.cancelled() => return,
                    _ = hub.notify.notified() => {}
                }
                hub.dispatch_pending();
            }
        });
    }

    /// Stops the dispatcher; later transactions are silently dropped.
    /// Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        info!("Broadcast hub stopped");
    }

    /// Accepts a transaction from the listener callback. Never blocks:
    /// when the ring is full the oldest queued transaction is evicted so
    /// clients always see the most recent stream.
    pub fn on_transaction(&self, tx: &Transaction) {
        if self.stopped.load(Ordering::SeqCst) {
            self.stats.record_drop(DropReason::HubStopped);
            return;
        }
        let tx = Arc::new(tx.clone());
        if let Ok(mut state) = self.state.lock() {
            while state.queue.len() >= self.capacity {
                state.queue.pop_front();
                self.stats.record_drop(DropReason::BroadcastEvicted);
            }
            state.queue.push_back(tx);
        }
        self.notify.notify_one();
    }

    /// Registers a fan-out client, returning its id, private receive
    /// queue, and per-connection cancellation token.
    pub fn register_client(&self) -> (u64, mpsc::Receiver<Arc<Transaction>>, CancellationToken) {
        let id = self.next_client_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = mpsc::channel(self.client_buffer);
        let cancel = CancellationToken::new();
        if let Ok(mut state) = self.state.lock() {
            state.clients.insert(
                id,
                ClientHandle {
                    sender,
                    cancel: cancel.clone(),
                },
            );
        }
        self.stats.client_connected();
        info!("WebSocket client {id} connected");
        (id, receiver, cancel)
    }

    /// Removes a client and cancels its connection tasks. Safe to call
    /// from the reader, the writer, or the hub itself; only the first
    /// call has any effect.
    pub fn close_client(&self, id: u64) {
        let removed = self
            .state
            .lock()
            .ok()
            .and_then(|mut state| state.clients.remove(&id));
        if let Some(handle) = removed {
            handle.cancel.cancel();
            self.stats.client_disconnected();
            info!("WebSocket client {id} disconnected");
        }
    }

    /// Number of currently connected clients.
    pub fn client_count(&self) -> usize {
        self.state.lock().map(|state| state.clients.len()).unwrap_or(0)
    }

    fn dispatch_pending(&self) {
        loop {
            let (batch, clients) = {
                let Ok(mut state) = self.state.lock() else {
                    return;
                };
                if state.queue.is_empty() {
                    return;
                }
                let batch: Vec<Arc<Transaction>> = state.queue.drain(..).collect();
                let clients: Vec<(u64, mpsc::Sender<Arc<Transaction>>)> = state
                    .clients
                    .iter()
                    .map(|(id, handle)| (*id, handle.sender.clone()))
                    .collect();
                (batch, clients)
            };

            for tx in &batch {
                for (id, sender) in &clients {
                    match sender.try_send(Arc::clone(tx)) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            // This client stopped draining; cut it loose
                            // rather than let it pool memory.
                            self.stats.record_drop(DropReason::ClientQueueFull);
                            debug!("Client {id} queue full; closing");
                            self.close_client(*id);
                        }
                        Err(TrySendError::Closed(_)) => {
                            self.close_client(*id);
                        }
                    }
                }
            }
        }
    }
}
