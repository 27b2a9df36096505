//! Upstream ledger-node access: JSON-RPC commands and the WebSocket
//! subscription stream.

mod client;

pub use client::{Client, MessageCallback, NodeClient};
