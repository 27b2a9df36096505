use clap::Parser;
use log::{error, info};

use xrpl_atlas::initialization::init_logger_with;
use xrpl_atlas::{Config, LogFormat, LogLevel};

/// Live geolocated view of the XRP Ledger.
///
/// All service options come from environment variables; the flags here
/// only override logging for quick local runs.
#[derive(Parser)]
#[command(name = "xrpl-atlas", version, about)]
struct Cli {
    /// Log level (overrides LOG_LEVEL)
    #[arg(long, value_enum)]
    log_level: Option<LogLevel>,

    /// Log format (overrides LOG_FORMAT)
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut config = Config::from_env();
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    if let Some(format) = cli.log_format {
        config.log_format = format;
    }

    if let Err(err) = config.validate() {
        eprintln!("Invalid configuration: {err}");
        std::process::exit(2);
    }
    if let Err(err) = init_logger_with(config.log_level.clone().into(), config.log_format.clone()) {
        eprintln!("Failed to initialize logger: {err}");
        std::process::exit(2);
    }

    info!(
        "xrpl-atlas starting (network={}, listen={}:{}, min_payment_drops={}, geo_workers={})",
        config.network,
        config.listen_addr,
        config.listen_port,
        config.min_payment_drops,
        config.geo_worker_count
    );

    if let Err(err) = xrpl_atlas::run(config).await {
        error!("Fatal: {err:#}");
        std::process::exit(1);
    }
}
