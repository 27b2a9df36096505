//! End-to-end pipeline test: stream frames in through a stub ledger node,
//! observe enriched transactions coming out of the broadcast hub.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use xrpl_atlas::error_handling::PipelineStats;
use xrpl_atlas::models::{GeoLocation, Transaction};
use xrpl_atlas::server::Hub;
use xrpl_atlas::transaction::{AccountResolver, Listener, ListenerOptions};
use xrpl_atlas::xrpl::{MessageCallback, NodeClient};

const SOURCE: &str = "rHb9CJAWyB4rj91VRWn96DkukG4bwdtyTh";
const DESTINATION: &str = "rLHzPsX6oXkzU9cRHEwKmMSWJfpJ9nE4VY";

struct StubNode {
    connected: AtomicBool,
    callback: Mutex<Option<MessageCallback>>,
}

impl StubNode {
    fn new() -> Self {
        StubNode {
            connected: AtomicBool::new(true),
            callback: Mutex::new(None),
        }
    }

    fn deliver(&self, msg: &Value) {
        let callback = self.callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(msg);
        }
    }
}

#[async_trait]
impl NodeClient for StubNode {
    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }
    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
    async fn command(&self, _method: &str, _params: Value) -> Result<Value> {
        Ok(json!({}))
    }
    async fn subscribe(&self, _streams: &[String], callback: Option<MessageCallback>) -> Result<()> {
        if let Some(callback) = callback {
            *self.callback.lock().unwrap() = Some(callback);
        }
        Ok(())
    }
    async fn unsubscribe(&self, _streams: &[String]) -> Result<()> {
        Ok(())
    }
}

struct MapResolver {
    locations: HashMap<String, GeoLocation>,
}

#[async_trait]
impl AccountResolver for MapResolver {
    async fn resolve_account(
        &self,
        _client: &dyn NodeClient,
        account: &str,
    ) -> Result<Option<GeoLocation>> {
        Ok(self.locations.get(account).cloned())
    }
}

fn payment_frame(hash: &str, amount: &str) -> Value {
    json!({
        "type": "transaction",
        "validated": true,
        "date": 760_000_000,
        "ledger_index": 87_654_321,
        "transaction": {
            "TransactionType": "Payment",
            "hash": hash,
            "Account": SOURCE,
            "Destination": DESTINATION,
            "Amount": amount,
            "Fee": "12",
            "Flags": 0,
        },
        "meta": { "TransactionResult": "tesSUCCESS" },
    })
}

#[tokio::test]
async fn payments_flow_from_stream_to_hub_clients() {
    let stats = Arc::new(PipelineStats::new());
    let node = Arc::new(StubNode::new());

    let resolver = MapResolver {
        locations: HashMap::from([
            (
                SOURCE.to_string(),
                GeoLocation {
                    latitude: 37.7749,
                    longitude: -122.4194,
                    country_code: "US".into(),
                    city: "San Francisco".into(),
                    validator_address: SOURCE.into(),
                },
            ),
            (
                DESTINATION.to_string(),
                GeoLocation {
                    latitude: 51.5074,
                    longitude: -0.1278,
                    country_code: "GB".into(),
                    city: "London".into(),
                    validator_address: DESTINATION.into(),
                },
            ),
        ]),
    };

    let listener = Arc::new(Listener::new(
        Arc::clone(&node) as Arc<dyn NodeClient>,
        Some(Arc::new(resolver) as Arc<dyn AccountResolver>),
        10_000_000_000,
        Arc::clone(&stats),
        ListenerOptions {
            transaction_buffer_size: 64,
            geo_enrichment_q_size: 64,
            geo_worker_count: 2,
            max_geo_candidates: 6,
        },
    ));

    let hub = Arc::new(Hub::new(64, 16, Arc::clone(&stats)));
    hub.start();
    let hub_sink = Arc::clone(&hub);
    listener.add_callback(Arc::new(move |tx: &Transaction| hub_sink.on_transaction(tx)));

    listener.start().await.unwrap();
    let (_client_id, mut client_rx, _cancel) = hub.register_client();

    // A qualifying payment, one below the minimum, and a non-payment.
    node.deliver(&payment_frame("KEEP", "50000000000"));
    node.deliver(&payment_frame("TOO_SMALL", "100"));
    node.deliver(&json!({ "type": "ledgerClosed", "ledger_index": 1 }));

    let received = tokio::time::timeout(Duration::from_secs(2), client_rx.recv())
        .await
        .expect("expected a fanned-out transaction")
        .expect("hub closed the client queue");

    assert_eq!(received.hash, "KEEP");
    assert_eq!(received.amount, "50000000000");
    assert_eq!(received.transaction_result, "tesSUCCESS");
    assert!(received.validated);
    assert_eq!(received.locations.len(), 2);
    assert_eq!(received.locations[0].city, "San Francisco");
    assert_eq!(received.locations[1].city, "London");

    // Nothing else may arrive.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(client_rx.try_recv().is_err());

    listener.stop().await.unwrap();
    hub.stop();
}

#[tokio::test]
async fn wire_format_hides_internal_fields() {
    let frame = payment_frame("WIRE", "50000000000");
    let tx = xrpl_atlas::transaction::parse_transaction(&frame, 1, 6)
        .unwrap()
        .unwrap();
    assert!(!tx.geo_candidates.is_empty());

    let json = serde_json::to_value(&tx).unwrap();
    assert!(json.get("geo_candidates").is_none());
    assert_eq!(json["hash"], "WIRE");
    assert_eq!(json["transaction_type"], "Payment");
    // Unenriched transactions omit the locations array entirely.
    assert!(json.get("locations").is_none());
}
