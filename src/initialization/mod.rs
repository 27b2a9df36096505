//! Startup wiring: logger, HTTP clients, DNS resolver.

mod client;
mod logger;
mod resolver;

pub use client::{init_rpc_client, init_source_client};
pub use logger::init_logger_with;
pub use resolver::init_resolver;
