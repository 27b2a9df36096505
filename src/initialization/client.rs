//! HTTP client initialization.

use reqwest::Client;

use crate::config::{RPC_COMMAND_TIMEOUT, SOURCE_FETCH_TIMEOUT};
use crate::error_handling::InitializationError;

/// Client used for JSON-RPC commands against the ledger node.
pub fn init_rpc_client() -> Result<Client, InitializationError> {
    Client::builder()
        .timeout(RPC_COMMAND_TIMEOUT)
        .build()
        .map_err(InitializationError::from)
}

/// Client used for validator list and registry fetches; those payloads are
/// larger and the sites slower, so the timeout is wider.
pub fn init_source_client() -> Result<Client, InitializationError> {
    Client::builder()
        .timeout(SOURCE_FETCH_TIMEOUT)
        .build()
        .map_err(InitializationError::from)
}
