//! Error type definitions.

use log::SetLoggerError;
use reqwest::Error as ReqwestError;
use strum_macros::EnumIter as EnumIterMacro;
use thiserror::Error;

/// Fatal startup failures.
#[derive(Error, Debug)]
pub enum InitializationError {
    /// Error initializing the logger.
    #[error("Logger initialization error: {0}")]
    LoggerError(#[from] SetLoggerError),

    /// Error initializing an HTTP client.
    #[error("HTTP client initialization error: {0}")]
    HttpClientError(#[from] ReqwestError),

    /// Error opening or downloading the GeoLite database.
    #[error("GeoLite database error: {0}")]
    GeoLiteError(String),
}

/// Why a transaction was dropped somewhere in the pipeline.
///
/// Every drop increments exactly one of these counters; the stream never
/// blocks on a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIterMacro)]
pub enum DropReason {
    /// Enrichment queue was full; the transaction went out unenriched.
    /// Counted for visibility, the transaction itself is not lost.
    GeoQueueFull,
    /// Ready-for-dispatch buffer was full; the transaction is gone.
    TxBufferFull,
    /// Broadcast ring was full; the oldest queued transaction was evicted.
    BroadcastEvicted,
    /// A client's send queue was full; that client was closed.
    ClientQueueFull,
    /// The hub was already stopped when the transaction arrived.
    HubStopped,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::GeoQueueFull => "geo_queue_full",
            DropReason::TxBufferFull => "tx_buffer_full",
            DropReason::BroadcastEvicted => "broadcast_evicted",
            DropReason::ClientQueueFull => "client_queue_full",
            DropReason::HubStopped => "hub_stopped",
        }
    }
}
