//! xrpl-atlas: live visualization backend for the XRP Ledger.
//!
//! The service maintains a geolocated view of the active validator set,
//! subscribes to the ledger's transaction firehose, filters and enriches
//! validated XRP payments with coordinates derived from on-ledger account
//! domains, and fans the result out to visualization clients over
//! WebSocket.
//!
//! # Example
//!
//! ```no_run
//! use xrpl_atlas::Config;
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let config = Config::from_env();
//! config.validate()?;
//! xrpl_atlas::run(config).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Requirements
//!
//! This library requires a Tokio runtime and a local GeoLite2 City
//! database (auto-downloaded by default).

pub mod config;
pub mod error_handling;
pub mod geolocation;
pub mod initialization;
pub mod models;
pub mod server;
pub mod transaction;
pub mod validator;
pub mod xrpl;

// Re-export the surface the binary and most embedders need.
pub use config::{Config, ConfigError, LogFormat, LogLevel};
pub use error_handling::PipelineStats;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::config::SHUTDOWN_TIMEOUT;
use crate::geolocation::{DnsHostResolver, GeoLiteDb, Resolver};
use crate::server::{AppState, Hub};
use crate::transaction::{AccountResolver, Listener, ListenerOptions};
use crate::validator::Fetcher;
use crate::xrpl::{Client, NodeClient};

/// Runs the service until a shutdown signal arrives.
///
/// Fatal startup failures (GeoLite database, upstream subscription, HTTP
/// bind) surface as errors; the binary maps them to a non-zero exit.
pub async fn run(config: Config) -> Result<()> {
    let stats = Arc::new(PipelineStats::new());

    let city_db = GeoLiteDb::open(
        &config.geolite_db_path,
        &config.geolite_download_url,
        config.geolite_auto_download,
    )
    .await
    .context("failed to initialize GeoLite resolver")?;

    let resolver = Arc::new(Resolver::new(
        Arc::new(DnsHostResolver::new(initialization::init_resolver())),
        Arc::new(city_db),
        &config.geo_cache_path,
        Duration::from_secs(config.missing_account_ttl),
    ));

    let rpc_http = initialization::init_rpc_client().context("failed to build RPC client")?;
    let validator_client: Arc<dyn NodeClient> = Arc::new(Client::new(
        config.json_rpc_url.clone(),
        config.websocket_url.clone(),
        rpc_http.clone(),
        Arc::clone(&stats),
    ));
    let tx_client: Arc<dyn NodeClient> = Arc::new(Client::new(
        config.transaction_json_rpc_url.clone(),
        config.transaction_websocket_url.clone(),
        rpc_http,
        Arc::clone(&stats),
    ));

    let source_http =
        initialization::init_source_client().context("failed to build source client")?;
    let fetcher = Arc::new(Fetcher::new(
        Arc::clone(&validator_client),
        Some(Arc::clone(&resolver)),
        source_http,
        Arc::clone(&stats),
        &config,
    ));
    fetcher.start();

    let listener = Arc::new(Listener::new(
        Arc::clone(&tx_client),
        Some(Arc::clone(&resolver) as Arc<dyn AccountResolver>),
        config.min_payment_drops,
        Arc::clone(&stats),
        ListenerOptions {
            transaction_buffer_size: config.transaction_buffer_size,
            geo_enrichment_q_size: config.geo_enrichment_q_size,
            geo_worker_count: config.geo_worker_count,
            max_geo_candidates: config.max_geo_candidates,
        },
    ));
    listener
        .start()
        .await
        .context("failed to start transaction listener")?;

    let hub = Arc::new(Hub::new(
        config.broadcast_buffer_size,
        config.ws_client_buffer_size,
        Arc::clone(&stats),
    ));
    hub.start();
    let hub_sink = Arc::clone(&hub);
    listener.add_callback(Arc::new(move |tx| hub_sink.on_transaction(tx)));

    let state = Arc::new(AppState {
        fetcher: Arc::clone(&fetcher),
        listener: Arc::clone(&listener),
        hub: Arc::clone(&hub),
        stats: Arc::clone(&stats),
        allowed_origins: config.cors_allowed_origins.clone(),
    });

    let cancel = CancellationToken::new();
    let server_task = {
        let state = Arc::clone(&state);
        let cancel = cancel.child_token();
        let listen_addr = config.listen_addr.clone();
        let listen_port = config.listen_port;
        tokio::spawn(
            async move { server::serve(state, &listen_addr, listen_port, cancel).await },
        )
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");
    cancel.cancel();

    let shutdown = async {
        if let Err(err) = listener.stop().await {
            error!("Error stopping transaction listener: {err:#}");
        }
        fetcher.stop();
        hub.stop();
        if let Err(err) = tx_client.close().await {
            error!("Error closing transaction client: {err:#}");
        }
        if let Err(err) = validator_client.close().await {
            error!("Error closing validator client: {err:#}");
        }
    };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, shutdown).await.is_err() {
        warn!("Component shutdown exceeded the deadline");
    }

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, server_task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(err))) => error!("HTTP server error during shutdown: {err:#}"),
        Ok(Err(join_err)) => error!("HTTP server task panicked: {join_err}"),
        Err(_) => warn!("HTTP server shutdown exceeded the deadline"),
    }

    info!("Service shutdown complete");
    Ok(())
}
