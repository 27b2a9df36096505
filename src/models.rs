//! Core data model shared across the service.
//!
//! These types are the wire contract for the HTTP endpoints and the client
//! WebSocket stream, so field names are stable snake_case JSON.

use serde::{Deserialize, Serialize};

/// An XRPL validator with geolocation data.
///
/// Identity is the `address` field; when a list source supplies no separate
/// address the validation public key is used. Coordinates of `(0, 0)` mean
/// the validator has not been mapped yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Validator {
    /// Base58 validator address (falls back to the public key).
    pub address: String,
    /// Hex-encoded validation public key.
    pub public_key: String,
    /// Domain name, if any source provided one.
    pub domain: String,
    /// Human-readable name (defaults to the domain or address).
    pub name: String,
    /// Network tag: "mainnet", "altnet", ...
    pub network: String,
    pub latitude: f64,
    pub longitude: f64,
    /// ISO-2 country code, "XX" when unknown.
    pub country_code: String,
    /// City name, "Unknown" when unresolved.
    pub city: String,
    /// Unix timestamp of the last refresh that touched this entry.
    pub last_updated: i64,
    pub is_active: bool,
}

impl Validator {
    /// Whether the validator has non-zero coordinates.
    pub fn is_mapped(&self) -> bool {
        self.latitude != 0.0 || self.longitude != 0.0
    }
}

/// A validated XRP payment, filtered and optionally geo-enriched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: String,
    pub ledger_index: u32,
    /// Source account.
    pub account: String,
    /// Destination account.
    pub destination: String,
    /// Always "Payment" after filtering.
    pub transaction_type: String,
    /// Delivered amount in drops.
    pub amount: String,
    /// Fee in drops.
    pub fee: String,
    /// Always "tesSUCCESS" after filtering.
    pub transaction_result: String,
    /// Unix timestamp derived from the ledger close time.
    pub timestamp: i64,
    /// Raw ledger close time (seconds since the Ripple epoch).
    pub close_time: u32,
    pub validated: bool,
    /// Mapped account endpoints, source first, destination second.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<GeoLocation>,
    /// Candidate accounts for enrichment; never serialized.
    #[serde(skip)]
    pub geo_candidates: Vec<String>,
}

/// Geographic coordinates with country/city labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub country_code: String,
    pub city: String,
    /// Account or validator address this location belongs to.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub validator_address: String,
}

/// Upstream ledger-node health snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub connected: bool,
    pub server_state: String,
    pub ledger_index: u32,
    pub network_id: u16,
    pub peer_count: i64,
    pub complete_ledgers: String,
    pub uptime: i64,
    pub last_sync: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_validator() -> Validator {
        Validator {
            address: "nHB8QMKGt9VB4Vg71VszjBVQnDW3v3QudM4DwFaJfy96bj4Pv9fA".into(),
            public_key: "ED2677ABFFD1B33AC6FBC3062B71F1E8397C1505E1C42C64D11AD1B28FF73F4734".into(),
            domain: "ripple.com".into(),
            name: "ripple.com".into(),
            network: "mainnet".into(),
            latitude: 37.7749,
            longitude: -122.4194,
            country_code: "US".into(),
            city: "San Francisco".into(),
            last_updated: 1_700_000_000,
            is_active: true,
        }
    }

    #[test]
    fn validator_serde_round_trip() {
        let validator = sample_validator();
        let json = serde_json::to_string(&validator).unwrap();
        let back: Validator = serde_json::from_str(&json).unwrap();
        assert_eq!(validator, back);
    }

    #[test]
    fn transaction_round_trip_drops_geo_candidates() {
        let tx = Transaction {
            hash: "ABC123".into(),
            ledger_index: 87_654_321,
            account: "rHb9CJAWyB4rj91VRWn96DkukG4bwdtyTh".into(),
            destination: "rLHzPsX6oXkzU9cRHEwKmMSWJfpJ9nE4VY".into(),
            transaction_type: "Payment".into(),
            amount: "15000000000".into(),
            fee: "12".into(),
            transaction_result: "tesSUCCESS".into(),
            timestamp: 1_706_684_800,
            close_time: 760_000_000,
            validated: true,
            locations: vec![GeoLocation {
                latitude: 51.5074,
                longitude: -0.1278,
                country_code: "GB".into(),
                city: "London".into(),
                validator_address: "rHb9CJAWyB4rj91VRWn96DkukG4bwdtyTh".into(),
            }],
            geo_candidates: vec!["rHb9CJAWyB4rj91VRWn96DkukG4bwdtyTh".into()],
        };

        let json = serde_json::to_string(&tx).unwrap();
        assert!(
            !json.contains("geo_candidates"),
            "internal candidates must not leak onto the wire"
        );

        let back: Transaction = serde_json::from_str(&json).unwrap();
        assert!(back.geo_candidates.is_empty());
        assert_eq!(back.hash, tx.hash);
        assert_eq!(back.locations, tx.locations);
    }

    #[test]
    fn empty_locations_are_omitted() {
        let mut tx: Transaction = serde_json::from_str(
            r#"{"hash":"H","ledger_index":1,"account":"rA","destination":"rB",
                "transaction_type":"Payment","amount":"1","fee":"1",
                "transaction_result":"tesSUCCESS","timestamp":1,"close_time":1,
                "validated":true}"#,
        )
        .unwrap();
        tx.locations.clear();
        let json = serde_json::to_string(&tx).unwrap();
        assert!(!json.contains("locations"));
    }

    #[test]
    fn geolocation_validator_address_optional() {
        let geo = GeoLocation {
            latitude: 48.8566,
            longitude: 2.3522,
            country_code: "FR".into(),
            city: "Paris".into(),
            validator_address: String::new(),
        };
        let json = serde_json::to_string(&geo).unwrap();
        assert!(!json.contains("validator_address"));

        let back: GeoLocation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, geo);
    }

    #[test]
    fn is_mapped_treats_zero_pair_as_unmapped() {
        let mut validator = sample_validator();
        assert!(validator.is_mapped());
        validator.latitude = 0.0;
        validator.longitude = 0.0;
        assert!(!validator.is_mapped());
        // A single non-zero axis still counts as mapped.
        validator.longitude = -122.4194;
        assert!(validator.is_mapped());
    }
}
