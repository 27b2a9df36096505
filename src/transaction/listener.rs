//! The transaction listener pipeline.
//!
//! ```text
//! upstream → (parse, inline) → geo_queue → (N workers enrich) → tx_buffer → dispatcher → callbacks
//! ```
//!
//! Every producer-side send is non-blocking: a full enrichment queue
//! forwards the transaction unenriched, a full dispatch buffer drops it
//! and bumps a counter. The upstream read loop is never stalled.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::config::{ACCOUNT_RESOLVE_TIMEOUT, RECONNECT_TIMEOUT, SUPERVISOR_TICK};
use crate::error_handling::{DropReason, PipelineStats};
use crate::geolocation::Resolver;
use crate::models::{GeoLocation, Transaction};
use crate::xrpl::{MessageCallback, NodeClient};

use super::parse::parse_transaction;

/// Callback invoked serially, in pipeline-completion order, for every
/// dispatched transaction.
pub type TransactionCallback = Arc<dyn Fn(&Transaction) + Send + Sync>;

/// Account-to-location seam; implemented by the geolocation resolver and
/// by test stubs.
#[async_trait]
pub trait AccountResolver: Send + Sync {
    async fn resolve_account(
        &self,
        client: &dyn NodeClient,
        account: &str,
    ) -> Result<Option<GeoLocation>>;
}

#[async_trait]
impl AccountResolver for Resolver {
    async fn resolve_account(
        &self,
        client: &dyn NodeClient,
        account: &str,
    ) -> Result<Option<GeoLocation>> {
        Resolver::resolve_account(self, client, account).await
    }
}

/// Pipeline sizing knobs.
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    pub transaction_buffer_size: usize,
    pub geo_enrichment_q_size: usize,
    pub geo_worker_count: usize,
    pub max_geo_candidates: usize,
}

struct Channels {
    geo_tx: mpsc::Sender<Transaction>,
    geo_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Transaction>>>,
    buffer_tx: mpsc::Sender<Transaction>,
    buffer_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Transaction>>>,
}

/// Subscribes to the upstream transaction stream and drives the pipeline.
pub struct Listener {
    client: Arc<dyn NodeClient>,
    resolver: Option<Arc<dyn AccountResolver>>,
    stats: Arc<PipelineStats>,
    min_payment_drops: i64,
    options: ListenerOptions,
    channels: Channels,
    callbacks: Arc<std::sync::Mutex<Vec<TransactionCallback>>>,
    subscribed: Arc<AtomicBool>,
    run_cancel: std::sync::Mutex<Option<CancellationToken>>,
}

impl Listener {
    pub fn new(
        client: Arc<dyn NodeClient>,
        resolver: Option<Arc<dyn AccountResolver>>,
        min_payment_drops: i64,
        stats: Arc<PipelineStats>,
        options: ListenerOptions,
    ) -> Self {
        let (geo_tx, geo_rx) = mpsc::channel(options.geo_enrichment_q_size);
        let (buffer_tx, buffer_rx) = mpsc::channel(options.transaction_buffer_size);
        Listener {
            client,
            resolver,
            stats,
            min_payment_drops,
            options,
            channels: Channels {
                geo_tx,
                geo_rx: Arc::new(tokio::sync::Mutex::new(geo_rx)),
                buffer_tx,
                buffer_rx: Arc::new(tokio::sync::Mutex::new(buffer_rx)),
            },
            callbacks: Arc::new(std::sync::Mutex::new(Vec::new())),
            subscribed: Arc::new(AtomicBool::new(false)),
            run_cancel: std::sync::Mutex::new(None),
        }
    }

    /// Registers a callback for dispatched transactions.
    pub fn add_callback(&self, callback: TransactionCallback) {
        if let Ok(mut callbacks) = self.callbacks.lock() {
            callbacks.push(callback);
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    pub fn min_payment_drops(&self) -> i64 {
        self.min_payment_drops
    }

    /// Connects (when needed), subscribes, and starts the pipeline tasks.
    /// Rejected when already subscribed.
    pub async fn start(&self) -> Result<()> {
        if self.is_subscribed() {
            bail!("already subscribed");
        }

        if !self.client.is_connected() {
            self.client
                .connect()
                .await
                .context("failed to connect to ledger websocket")?;
        }

        let parse_callback = self.make_message_callback();
        self.client
            .subscribe(&stream_names(), Some(parse_callback))
            .await
            .context("failed to subscribe to transactions")?;

        self.subscribed.store(true, Ordering::SeqCst);

        let cancel = CancellationToken::new();
        if let Ok(mut slot) = self.run_cancel.lock() {
            if let Some(previous) = slot.replace(cancel.clone()) {
                previous.cancel();
            }
        }

        if self.resolver.is_some() {
            self.spawn_enrichment_workers(&cancel);
        }
        self.spawn_dispatcher(&cancel);
        self.spawn_supervisor(&cancel);

        info!(
            "Transaction listener started (min_payment_drops={})",
            self.min_payment_drops
        );
        Ok(())
    }

    /// Stops the pipeline and unsubscribes; idempotent.
    pub async fn stop(&self) -> Result<()> {
        if !self.subscribed.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        if let Ok(mut slot) = self.run_cancel.lock() {
            if let Some(cancel) = slot.take() {
                cancel.cancel();
            }
        }

        if self.client.is_connected() {
            if let Err(err) = self.client.unsubscribe(&stream_names()).await {
                error!("Failed to unsubscribe from transactions: {err:#}");
                return Err(err);
            }
        }

        info!("Transaction listener stopped");
        Ok(())
    }

    /// Builds the inline parse callback handed to the upstream client.
    fn make_message_callback(&self) -> MessageCallback {
        let geo_tx = self.channels.geo_tx.clone();
        let buffer_tx = self.channels.buffer_tx.clone();
        let stats = Arc::clone(&self.stats);
        let min_drops = self.min_payment_drops;
        let max_candidates = self.options.max_geo_candidates;
        let enrich = self.resolver.is_some();

        Arc::new(move |msg: &Value| {
            match parse_transaction(msg, min_drops, max_candidates) {
                Ok(Some(tx)) => {
                    stats.record_parsed();
                    route_parsed(tx, &geo_tx, &buffer_tx, enrich, &stats);
                }
                Ok(None) => {}
                Err(err) => debug!("Skipping transaction: {err:#}"),
            }
        })
    }

    fn spawn_enrichment_workers(&self, cancel: &CancellationToken) {
        let Some(resolver) = self.resolver.as_ref() else {
            return;
        };
        for _ in 0..self.options.geo_worker_count {
            let geo_rx = Arc::clone(&self.channels.geo_rx);
            let buffer_tx = self.channels.buffer_tx.clone();
            let resolver = Arc::clone(resolver);
            let client = Arc::clone(&self.client);
            let stats = Arc::clone(&self.stats);
            let cancel = cancel.clone();

            tokio::spawn(async move {
                loop {
                    // The receiver lock is only held while pulling; the
                    // slow enrichment happens outside it.
                    let mut tx = {
                        let mut rx = geo_rx.lock().await;
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            received = rx.recv() => match received {
                                Some(tx) => tx,
                                None => return,
                            },
                        }
                    };

                    enrich_transaction(resolver.as_ref(), client.as_ref(), &mut tx, &stats).await;

                    if buffer_tx.try_send(tx).is_err() {
                        stats.record_drop(DropReason::TxBufferFull);
                    }
                }
            });
        }
    }

    fn spawn_dispatcher(&self, cancel: &CancellationToken) {
        let buffer_rx = Arc::clone(&self.channels.buffer_rx);
        let callbacks = Arc::clone(&self.callbacks);
        let stats = Arc::clone(&self.stats);
        let cancel = cancel.clone();

        tokio::spawn(async move {
            let mut rx = buffer_rx.lock().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    received = rx.recv() => {
                        let Some(tx) = received else { return };
                        stats.record_dispatched();
                        let snapshot: Vec<TransactionCallback> = callbacks
                            .lock()
                            .map(|cbs| cbs.clone())
                            .unwrap_or_default();
                        for callback in snapshot {
                            callback(&tx);
                        }
                    }
                }
            }
        });
    }

    fn spawn_supervisor(&self, cancel: &CancellationToken) {
        let client = Arc::clone(&self.client);
        let subscribed = Arc::clone(&self.subscribed);
        let cancel = cancel.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SUPERVISOR_TICK);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if !subscribed.load(Ordering::SeqCst) || client.is_connected() {
                            continue;
                        }
                        warn!("Upstream connection lost; reconnecting");
                        match tokio::time::timeout(RECONNECT_TIMEOUT, client.connect()).await {
                            Ok(Ok(())) => {
                                // The parse callback stays registered on
                                // the client; only the subscription frame
                                // needs re-sending.
                                match client.subscribe(&stream_names(), None).await {
                                    Ok(()) => info!("Re-subscribed to transaction stream"),
                                    Err(err) => {
                                        warn!("Failed to re-subscribe after reconnect: {err:#}")
                                    }
                                }
                            }
                            Ok(Err(err)) => warn!("Reconnect failed: {err:#}"),
                            Err(_) => warn!("Reconnect timed out"),
                        }
                    }
                }
            }
        });
    }
}

fn stream_names() -> Vec<String> {
    vec!["transactions".to_string()]
}

/// Routes a freshly parsed transaction into the pipeline without ever
/// blocking the caller.
fn route_parsed(
    tx: Transaction,
    geo_tx: &mpsc::Sender<Transaction>,
    buffer_tx: &mpsc::Sender<Transaction>,
    enrich: bool,
    stats: &PipelineStats,
) {
    if !enrich {
        if buffer_tx.try_send(tx).is_err() {
            stats.record_drop(DropReason::TxBufferFull);
        }
        return;
    }

    match geo_tx.try_send(tx) {
        Ok(()) => {}
        Err(TrySendError::Full(tx)) => {
            // Enrichment is saturated; deliver unenriched rather than
            // stall or lose the transaction outright.
            stats.record_drop(DropReason::GeoQueueFull);
            if buffer_tx.try_send(tx).is_err() {
                stats.record_drop(DropReason::TxBufferFull);
            }
        }
        Err(TrySendError::Closed(_)) => {}
    }
}

/// Resolves each candidate with a per-call deadline and fills
/// `tx.locations`: source first, destination second, then extras, with
/// duplicates suppressed by `(account, lat·1e4, lng·1e4)`.
async fn enrich_transaction(
    resolver: &dyn AccountResolver,
    client: &dyn NodeClient,
    tx: &mut Transaction,
    stats: &PipelineStats,
) {
    let mut candidates: Vec<String> = Vec::new();
    for lead in [tx.account.clone(), tx.destination.clone()] {
        if !lead.is_empty() && !candidates.contains(&lead) {
            candidates.push(lead);
        }
    }
    for extra in &tx.geo_candidates {
        if !candidates.contains(extra) {
            candidates.push(extra.clone());
        }
    }

    let mut seen: HashSet<(String, i64, i64)> = HashSet::new();
    for candidate in candidates {
        let resolved =
            tokio::time::timeout(ACCOUNT_RESOLVE_TIMEOUT, resolver.resolve_account(client, &candidate))
                .await;
        match resolved {
            Ok(Ok(Some(geo))) => {
                stats.record_geo_enrich(true);
                let key = (
                    geo.validator_address.clone(),
                    (geo.latitude * 1e4).round() as i64,
                    (geo.longitude * 1e4).round() as i64,
                );
                if seen.insert(key) {
                    tx.locations.push(geo);
                }
            }
            Ok(Ok(None)) => {}
            Ok(Err(err)) => {
                stats.record_geo_enrich(false);
                debug!("Failed to resolve geolocation for {candidate}: {err:#}");
            }
            Err(_) => {
                stats.record_geo_enrich(false);
                debug!("Geolocation lookup for {candidate} timed out");
            }
        }
    }
}
