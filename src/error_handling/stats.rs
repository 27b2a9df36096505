//! Process-wide counters for the ingestion pipeline and fan-out.
//!
//! One instance is created at startup and injected into every component;
//! the HTTP surface renders these counters on `/metrics`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use strum::IntoEnumIterator;

use super::DropReason;

/// Shared pipeline statistics.
#[derive(Debug)]
pub struct PipelineStats {
    drops: Mutex<HashMap<DropReason, AtomicU64>>,
    transactions_parsed: AtomicU64,
    transactions_dispatched: AtomicU64,
    geo_enrich_success: AtomicU64,
    geo_enrich_failure: AtomicU64,
    validator_refresh_success: AtomicU64,
    validator_refresh_failure: AtomicU64,
    upstream_commands: AtomicU64,
    ws_clients_active: AtomicUsize,
    ws_clients_total: AtomicU64,
}

impl PipelineStats {
    pub fn new() -> Self {
        let mut drops = HashMap::new();
        for reason in DropReason::iter() {
            drops.insert(reason, AtomicU64::new(0));
        }
        PipelineStats {
            drops: Mutex::new(drops),
            transactions_parsed: AtomicU64::new(0),
            transactions_dispatched: AtomicU64::new(0),
            geo_enrich_success: AtomicU64::new(0),
            geo_enrich_failure: AtomicU64::new(0),
            validator_refresh_success: AtomicU64::new(0),
            validator_refresh_failure: AtomicU64::new(0),
            upstream_commands: AtomicU64::new(0),
            ws_clients_active: AtomicUsize::new(0),
            ws_clients_total: AtomicU64::new(0),
        }
    }

    pub fn record_drop(&self, reason: DropReason) {
        if let Ok(drops) = self.drops.lock() {
            if let Some(counter) = drops.get(&reason) {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn drop_count(&self, reason: DropReason) -> u64 {
        self.drops
            .lock()
            .ok()
            .and_then(|drops| drops.get(&reason).map(|c| c.load(Ordering::Relaxed)))
            .unwrap_or(0)
    }

    pub fn record_parsed(&self) {
        self.transactions_parsed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatched(&self) {
        self.transactions_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_geo_enrich(&self, success: bool) {
        if success {
            self.geo_enrich_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.geo_enrich_failure.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_validator_refresh(&self, success: bool) {
        if success {
            self.validator_refresh_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.validator_refresh_failure.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_upstream_command(&self) {
        self.upstream_commands.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_connected(&self) {
        self.ws_clients_active.fetch_add(1, Ordering::Relaxed);
        self.ws_clients_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_disconnected(&self) {
        // Close paths are idempotent upstream, but saturate anyway.
        let _ = self
            .ws_clients_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn ws_clients_active(&self) -> usize {
        self.ws_clients_active.load(Ordering::Relaxed)
    }

    pub fn transactions_parsed(&self) -> u64 {
        self.transactions_parsed.load(Ordering::Relaxed)
    }

    pub fn transactions_dispatched(&self) -> u64 {
        self.transactions_dispatched.load(Ordering::Relaxed)
    }

    /// Renders all counters in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        out.push_str(
            "# HELP xrpl_atlas_transactions_parsed_total Payments that passed the stream filter\n\
             # TYPE xrpl_atlas_transactions_parsed_total counter\n",
        );
        out.push_str(&format!(
            "xrpl_atlas_transactions_parsed_total {}\n\n",
            self.transactions_parsed.load(Ordering::Relaxed)
        ));
        out.push_str(
            "# HELP xrpl_atlas_transactions_dispatched_total Transactions delivered to callbacks\n\
             # TYPE xrpl_atlas_transactions_dispatched_total counter\n",
        );
        out.push_str(&format!(
            "xrpl_atlas_transactions_dispatched_total {}\n\n",
            self.transactions_dispatched.load(Ordering::Relaxed)
        ));
        out.push_str(
            "# HELP xrpl_atlas_transactions_dropped_total Transactions dropped, by pipeline stage\n\
             # TYPE xrpl_atlas_transactions_dropped_total counter\n",
        );
        for reason in DropReason::iter() {
            out.push_str(&format!(
                "xrpl_atlas_transactions_dropped_total{{reason=\"{}\"}} {}\n",
                reason.as_str(),
                self.drop_count(reason)
            ));
        }
        out.push('\n');
        out.push_str(
            "# HELP xrpl_atlas_geo_enrich_total Account geolocation attempts\n\
             # TYPE xrpl_atlas_geo_enrich_total counter\n",
        );
        out.push_str(&format!(
            "xrpl_atlas_geo_enrich_total{{status=\"success\"}} {}\n",
            self.geo_enrich_success.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "xrpl_atlas_geo_enrich_total{{status=\"failure\"}} {}\n\n",
            self.geo_enrich_failure.load(Ordering::Relaxed)
        ));
        out.push_str(
            "# HELP xrpl_atlas_validator_refresh_total Validator refresh cycles\n\
             # TYPE xrpl_atlas_validator_refresh_total counter\n",
        );
        out.push_str(&format!(
            "xrpl_atlas_validator_refresh_total{{status=\"success\"}} {}\n",
            self.validator_refresh_success.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "xrpl_atlas_validator_refresh_total{{status=\"failure\"}} {}\n\n",
            self.validator_refresh_failure.load(Ordering::Relaxed)
        ));
        out.push_str(
            "# HELP xrpl_atlas_upstream_commands_total JSON-RPC commands issued upstream\n\
             # TYPE xrpl_atlas_upstream_commands_total counter\n",
        );
        out.push_str(&format!(
            "xrpl_atlas_upstream_commands_total {}\n\n",
            self.upstream_commands.load(Ordering::Relaxed)
        ));
        out.push_str(
            "# HELP xrpl_atlas_websocket_clients_active Currently connected fan-out clients\n\
             # TYPE xrpl_atlas_websocket_clients_active gauge\n",
        );
        out.push_str(&format!(
            "xrpl_atlas_websocket_clients_active {}\n\n",
            self.ws_clients_active.load(Ordering::Relaxed)
        ));
        out.push_str(
            "# HELP xrpl_atlas_websocket_clients_total Fan-out clients ever connected\n\
             # TYPE xrpl_atlas_websocket_clients_total counter\n",
        );
        out.push_str(&format!(
            "xrpl_atlas_websocket_clients_total {}\n",
            self.ws_clients_total.load(Ordering::Relaxed)
        ));
        out
    }
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_counters_start_at_zero_and_increment() {
        let stats = PipelineStats::new();
        for reason in DropReason::iter() {
            assert_eq!(stats.drop_count(reason), 0);
        }
        stats.record_drop(DropReason::TxBufferFull);
        stats.record_drop(DropReason::TxBufferFull);
        stats.record_drop(DropReason::ClientQueueFull);
        assert_eq!(stats.drop_count(DropReason::TxBufferFull), 2);
        assert_eq!(stats.drop_count(DropReason::ClientQueueFull), 1);
        assert_eq!(stats.drop_count(DropReason::GeoQueueFull), 0);
    }

    #[test]
    fn client_gauge_never_underflows() {
        let stats = PipelineStats::new();
        stats.client_disconnected();
        assert_eq!(stats.ws_clients_active(), 0);
        stats.client_connected();
        stats.client_connected();
        stats.client_disconnected();
        assert_eq!(stats.ws_clients_active(), 1);
    }

    #[test]
    fn prometheus_rendering_includes_every_drop_reason() {
        let stats = PipelineStats::new();
        stats.record_drop(DropReason::BroadcastEvicted);
        let text = stats.render_prometheus();
        for reason in DropReason::iter() {
            assert!(
                text.contains(reason.as_str()),
                "missing reason {} in metrics output",
                reason.as_str()
            );
        }
        assert!(text.contains("xrpl_atlas_transactions_dropped_total{reason=\"broadcast_evicted\"} 1"));
    }
}
