//! Upstream network health probing.

use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use serde_json::{json, Value};

use crate::models::ServerStatus;

use super::Fetcher;

impl Fetcher {
    /// Probes the configured health endpoints in order and reports the
    /// first success. When every endpoint fails, the general upstream
    /// client gets one last try before the aggregate error surfaces.
    pub async fn get_server_status(&self) -> Result<ServerStatus> {
        let mut endpoint_errors = Vec::new();
        for endpoint in &self.network_health_urls {
            match self.status_from_endpoint(endpoint).await {
                Ok(status) => return Ok(status),
                Err(err) => endpoint_errors.push(format!("{endpoint}: {err:#}")),
            }
        }

        match self.client().get_server_info().await {
            Ok(result) => parse_server_status(&result),
            Err(err) => {
                endpoint_errors.push(format!("upstream client: {err:#}"));
                bail!(
                    "all network health endpoints failed: {}",
                    endpoint_errors.join(" | ")
                )
            }
        }
    }

    async fn status_from_endpoint(&self, endpoint: &str) -> Result<ServerStatus> {
        let mut last_err = anyhow!("no attempts made");
        for attempt in 1..=self.network_health_retries {
            match self.fetch_server_info_json_rpc(endpoint).await {
                Ok(result) => match parse_server_status(&result) {
                    Ok(status) => return Ok(status),
                    Err(err) => last_err = err,
                },
                Err(err) => last_err = err,
            }
            if attempt == self.network_health_retries {
                break;
            }
            tokio::time::sleep(Duration::from_millis(150) * attempt).await;
        }
        Err(last_err)
    }

    async fn fetch_server_info_json_rpc(&self, endpoint: &str) -> Result<Value> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "server_info",
            "params": [{}],
        });

        let response = self.http().post(endpoint).json(&payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            let snippet: String = response
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(120)
                .collect();
            bail!("http {status}: {}", snippet.trim());
        }

        let parsed: Value = response.json().await?;
        if let Some(error) = parsed.get("error") {
            bail!("JSON-RPC error: {error}");
        }
        Ok(parsed)
    }
}

fn parse_server_status(result: &Value) -> Result<ServerStatus> {
    let payload = result
        .get("result")
        .ok_or_else(|| anyhow!("missing server_info result payload"))?;
    let info = payload
        .get("info")
        .ok_or_else(|| anyhow!("missing server_info info payload"))?;

    Ok(ServerStatus {
        connected: true,
        server_state: get_string(info, "server_state"),
        ledger_index: get_i64(info.get("validated_ledger").unwrap_or(&Value::Null), "seq") as u32,
        network_id: get_i64(info, "network_id") as u16,
        peer_count: get_i64(info, "peers"),
        complete_ledgers: get_string(info, "complete_ledgers"),
        uptime: get_i64(info, "uptime"),
        last_sync: Utc::now().timestamp(),
    })
}

fn get_string(parent: &Value, key: &str) -> String {
    parent
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn get_i64(parent: &Value, key: &str) -> i64 {
    match parent.get(key) {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).unwrap_or(0),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_server_info() {
        let result = json!({
            "result": {
                "info": {
                    "server_state": "full",
                    "validated_ledger": { "seq": 87654321 },
                    "network_id": 0,
                    "peers": 42,
                    "complete_ledgers": "32570-87654321",
                    "uptime": 86400
                }
            }
        });

        let status = parse_server_status(&result).unwrap();
        assert_eq!(status.server_state, "full");
        assert_eq!(status.ledger_index, 87_654_321);
        assert_eq!(status.peer_count, 42);
        assert_eq!(status.complete_ledgers, "32570-87654321");
        assert_eq!(status.uptime, 86_400);
        assert!(status.connected);
        assert!(status.last_sync > 0);
    }

    #[test]
    fn missing_payload_is_an_error() {
        assert!(parse_server_status(&json!({})).is_err());
        assert!(parse_server_status(&json!({ "result": {} })).is_err());
    }

    #[test]
    fn missing_numeric_fields_default_to_zero() {
        let result = json!({ "result": { "info": { "server_state": "connected" } } });
        let status = parse_server_status(&result).unwrap();
        assert_eq!(status.ledger_index, 0);
        assert_eq!(status.peer_count, 0);
        assert_eq!(status.network_id, 0);
    }
}
