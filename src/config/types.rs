//! Configuration types, environment loading, and validation.

use std::collections::HashSet;
use std::env;

use clap::ValueEnum;
use thiserror::Error;

/// Logging level for the application.
#[derive(Clone, Debug, ValueEnum)]
pub enum LogLevel {
    /// Only error messages
    Error,
    /// Error and warning messages
    Warn,
    /// Error, warning, and informational messages
    Info,
    /// All messages except trace
    Debug,
    /// All messages including trace
    Trace,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(l: LogLevel) -> Self {
        match l {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(ConfigError::Invalid(format!("unknown log level: {other}"))),
        }
    }
}

/// Log output format.
#[derive(Clone, Debug, ValueEnum)]
pub enum LogFormat {
    /// Human-readable format with colors (default)
    Plain,
    /// Structured JSON format for machine parsing
    Json,
}

/// Configuration validation failure; fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Service configuration, loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// JSON-RPC endpoint for validator-related commands.
    pub json_rpc_url: String,
    /// WebSocket endpoint for validator-related subscriptions.
    pub websocket_url: String,
    /// JSON-RPC endpoint backing transaction enrichment lookups.
    pub transaction_json_rpc_url: String,
    /// WebSocket endpoint carrying the transaction firehose.
    pub transaction_websocket_url: String,
    /// Network tag stamped on validators ("mainnet", "altnet", ...).
    pub network: String,

    pub listen_addr: String,
    pub listen_port: u16,
    pub cors_allowed_origins: Vec<String>,

    /// Seconds between validator refresh cycles.
    pub validator_refresh_interval: u64,
    pub validator_list_sites: Vec<String>,
    pub secondary_registry_url: String,
    pub validator_metadata_cache_path: String,
    pub network_health_json_rpc_urls: Vec<String>,
    pub network_health_retries: u32,

    pub geo_cache_path: String,
    pub geolite_db_path: String,
    pub geolite_download_url: String,
    pub geolite_auto_download: bool,
    /// Seconds a confirmed-missing account stays negative-cached.
    pub missing_account_ttl: u64,

    /// Minimum delivered drops for a payment to pass the filter.
    pub min_payment_drops: i64,
    pub transaction_buffer_size: usize,
    pub geo_enrichment_q_size: usize,
    pub geo_worker_count: usize,
    pub max_geo_candidates: usize,
    pub broadcast_buffer_size: usize,
    pub ws_client_buffer_size: usize,

    pub log_level: LogLevel,
    pub log_format: LogFormat,
}

impl Config {
    /// Builds a configuration from environment variables with defaults.
    pub fn from_env() -> Self {
        let json_rpc_url = get_env("XRPL_JSON_RPC_URL", "https://xrplcluster.com");
        let websocket_url = get_env("XRPL_WEBSOCKET_URL", "wss://xrplcluster.com");
        let health_default = format!("{json_rpc_url},https://s2.ripple.com:51234");

        Config {
            transaction_json_rpc_url: get_env("TRANSACTION_JSON_RPC_URL", &json_rpc_url),
            transaction_websocket_url: get_env("TRANSACTION_WEBSOCKET_URL", &websocket_url),
            network: get_env("XRPL_NETWORK", "mainnet").to_lowercase(),
            listen_addr: get_env("LISTEN_ADDR", "0.0.0.0"),
            listen_port: get_env_parsed("LISTEN_PORT", 8080u16),
            cors_allowed_origins: split_csv_sorted(&get_env(
                "CORS_ALLOWED_ORIGINS",
                "http://localhost:3000,http://127.0.0.1:3000,http://localhost:5173,http://127.0.0.1:5173",
            )),
            validator_refresh_interval: get_env_parsed("VALIDATOR_REFRESH_INTERVAL", 300u64),
            validator_list_sites: split_csv_sorted(&get_env(
                "VALIDATOR_LIST_SITES",
                "https://vl.ripple.com,https://unl.xrplf.org",
            )),
            secondary_registry_url: get_env(
                "SECONDARY_VALIDATOR_REGISTRY_URL",
                "https://api.xrpscan.com/api/v1/validatorregistry",
            ),
            validator_metadata_cache_path: get_env(
                "VALIDATOR_METADATA_CACHE_PATH",
                "data/validator-metadata-cache.json",
            ),
            network_health_json_rpc_urls: split_csv_preserve_order(&get_env(
                "NETWORK_HEALTH_JSON_RPC_URLS",
                &health_default,
            )),
            network_health_retries: get_env_parsed("NETWORK_HEALTH_RETRIES", 2u32),
            geo_cache_path: get_env("GEO_CACHE_PATH", "data/geolocation-cache.json"),
            geolite_db_path: get_env("GEOLITE_DB_PATH", "data/GeoLite2-City.mmdb"),
            geolite_download_url: get_env(
                "GEOLITE_DOWNLOAD_URL",
                "https://github.com/P3TERX/GeoLite.mmdb/raw/download/GeoLite2-City.mmdb",
            ),
            geolite_auto_download: get_env_bool("GEOLITE_AUTO_DOWNLOAD", true),
            missing_account_ttl: get_env_parsed("MISSING_ACCOUNT_TTL", 3600u64),
            min_payment_drops: get_env_parsed("MIN_PAYMENT_DROPS", 1_000_000i64),
            transaction_buffer_size: get_env_parsed("TRANSACTION_BUFFER_SIZE", 2048usize),
            geo_enrichment_q_size: get_env_parsed("GEO_ENRICHMENT_QUEUE_SIZE", 2048usize),
            geo_worker_count: get_env_parsed("GEO_ENRICHMENT_WORKERS", 8usize),
            max_geo_candidates: get_env_parsed("MAX_GEO_CANDIDATES", 6usize),
            broadcast_buffer_size: get_env_parsed("BROADCAST_BUFFER_SIZE", 2048usize),
            ws_client_buffer_size: get_env_parsed("WS_CLIENT_BUFFER_SIZE", 512usize),
            log_level: get_env("LOG_LEVEL", "info").parse().unwrap_or(LogLevel::Info),
            log_format: match get_env("LOG_FORMAT", "plain").to_lowercase().as_str() {
                "json" => LogFormat::Json,
                _ => LogFormat::Plain,
            },
            json_rpc_url,
            websocket_url,
        }
    }

    /// Checks the configuration for validity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_port == 0 {
            return Err(ConfigError::Invalid("listen port cannot be 0".into()));
        }
        require_non_empty(&self.listen_addr, "listen address")?;
        require_non_empty(&self.json_rpc_url, "XRPL JSON-RPC URL")?;
        require_non_empty(&self.websocket_url, "XRPL WebSocket URL")?;
        require_non_empty(&self.transaction_json_rpc_url, "transaction JSON-RPC URL")?;
        require_non_empty(&self.transaction_websocket_url, "transaction WebSocket URL")?;
        require_non_empty(&self.network, "network")?;
        if self.validator_refresh_interval == 0 {
            return Err(ConfigError::Invalid(
                "validator refresh interval must be positive".into(),
            ));
        }
        if self.validator_list_sites.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one validator list site must be specified".into(),
            ));
        }
        require_non_empty(&self.secondary_registry_url, "secondary validator registry URL")?;
        require_non_empty(&self.validator_metadata_cache_path, "validator metadata cache path")?;
        if self.network_health_json_rpc_urls.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one network health JSON-RPC URL must be specified".into(),
            ));
        }
        if self.network_health_retries == 0 {
            return Err(ConfigError::Invalid(
                "network health retries must be positive".into(),
            ));
        }
        require_non_empty(&self.geo_cache_path, "geo cache path")?;
        require_non_empty(&self.geolite_db_path, "GeoLite DB path")?;
        if self.geolite_auto_download && self.geolite_download_url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "GeoLite download URL cannot be empty when auto-download is enabled".into(),
            ));
        }
        if self.missing_account_ttl == 0 {
            return Err(ConfigError::Invalid(
                "missing-account TTL must be positive".into(),
            ));
        }
        if self.min_payment_drops <= 0 {
            return Err(ConfigError::Invalid(format!(
                "minimum payment drops must be positive: {}",
                self.min_payment_drops
            )));
        }
        for (value, name) in [
            (self.transaction_buffer_size, "transaction buffer size"),
            (self.geo_enrichment_q_size, "geo enrichment queue size"),
            (self.geo_worker_count, "geo enrichment workers"),
            (self.max_geo_candidates, "max geo candidates"),
            (self.broadcast_buffer_size, "broadcast buffer size"),
            (self.ws_client_buffer_size, "websocket client buffer size"),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }
        if self.cors_allowed_origins.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one CORS allowed origin must be specified".into(),
            ));
        }
        Ok(())
    }
}

fn require_non_empty(value: &str, name: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Invalid(format!("{name} cannot be empty")));
    }
    Ok(())
}

fn get_env(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn get_env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn get_env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|v| match v.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

fn split_csv_sorted(value: &str) -> Vec<String> {
    let mut out: Vec<String> = value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    out.sort();
    out.dedup();
    out
}

fn split_csv_preserve_order(value: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter(|s| seen.insert(s.to_string()))
        .map(str::to_string)
        .collect()
}
