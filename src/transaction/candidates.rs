//! Candidate account extraction from raw stream payloads.
//!
//! Stream messages are arbitrarily nested JSON; any string sitting under a
//! key that names an account-ish role is a potential enrichment candidate.

use std::collections::HashSet;

use serde_json::Value;

/// Key fragments that mark a value as an account reference.
const CANDIDATE_KEY_HINTS: [&str; 6] = [
    "account",
    "destination",
    "issuer",
    "owner",
    "counterparty",
    "regularkey",
];

/// The 58-character base58 alphabet used by XRPL addresses.
const XRPL_BASE58_ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// Whether a string is shaped like an XRPL classic address: 25-40 chars,
/// leading `r`, base58 alphabet throughout.
pub(crate) fn is_xrpl_address_shaped(candidate: &str) -> bool {
    if !(25..=40).contains(&candidate.len()) {
        return false;
    }
    if !candidate.starts_with('r') {
        return false;
    }
    candidate.chars().all(|c| XRPL_BASE58_ALPHABET.contains(c))
}

/// Walks `transaction` and `meta` collecting candidate accounts.
///
/// The source and destination lead the list in that order; the remainder
/// keeps discovery order, de-duplicated and truncated to `limit`.
pub fn gather_geo_candidates(
    txn: &Value,
    meta: Option<&Value>,
    source: &str,
    destination: &str,
    limit: usize,
) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut ordered = Vec::new();

    for lead in [source, destination] {
        if is_xrpl_address_shaped(lead) && seen.insert(lead.to_string()) {
            ordered.push(lead.to_string());
        }
    }

    let mut discovered = Vec::new();
    collect_candidates(txn, &mut discovered);
    if let Some(meta) = meta {
        collect_candidates(meta, &mut discovered);
    }

    for candidate in discovered {
        if ordered.len() >= limit {
            break;
        }
        if is_xrpl_address_shaped(&candidate) && seen.insert(candidate.clone()) {
            ordered.push(candidate);
        }
    }

    ordered.truncate(limit);
    ordered
}

fn collect_candidates(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if let Value::String(s) = child {
                    let key_lower = key.to_lowercase();
                    if CANDIDATE_KEY_HINTS.iter().any(|hint| key_lower.contains(hint)) {
                        out.push(s.clone());
                    }
                }
                collect_candidates(child, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_candidates(item, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const SOURCE: &str = "rHb9CJAWyB4rj91VRWn96DkukG4bwdtyTh";
    const DESTINATION: &str = "rLHzPsX6oXkzU9cRHEwKmMSWJfpJ9nE4VY";
    const ISSUER: &str = "rPT1Sjq2YGrBMTttX4GZHjKu9dyfzbpAYe";
    const OWNER: &str = "rDsbeomae4FXwgQTJp9Rs64Qg9vDiTCdBv";

    #[test]
    fn address_shape_filter() {
        assert!(is_xrpl_address_shaped(SOURCE));
        // Too short, wrong prefix, bad alphabet (0, O, I, l excluded).
        assert!(!is_xrpl_address_shaped("rShort"));
        assert!(!is_xrpl_address_shaped("xHb9CJAWyB4rj91VRWn96DkukG4bwdtyTh"));
        assert!(!is_xrpl_address_shaped("rHb9CJAWyB4rj91VRWn96DkukG4bwdty0O"));
        assert!(!is_xrpl_address_shaped(""));
    }

    #[test]
    fn collects_from_nested_transaction_and_meta() {
        let txn = json!({
            "Account": SOURCE,
            "Destination": DESTINATION,
            "SendMax": { "currency": "USD", "issuer": ISSUER, "value": "100" }
        });
        let meta = json!({
            "AffectedNodes": [
                { "ModifiedNode": { "FinalFields": { "Owner": OWNER } } }
            ]
        });

        let candidates = gather_geo_candidates(&txn, Some(&meta), SOURCE, DESTINATION, 10);
        assert!(candidates.contains(&SOURCE.to_string()));
        assert!(candidates.contains(&DESTINATION.to_string()));
        assert!(candidates.contains(&ISSUER.to_string()));
        assert!(candidates.contains(&OWNER.to_string()));
    }

    #[test]
    fn limit_preserves_source_and_destination() {
        let txn = json!({
            "Account": SOURCE,
            "Destination": DESTINATION,
            "SendMax": { "issuer": ISSUER }
        });
        let meta = json!({
            "AffectedNodes": [
                { "ModifiedNode": { "FinalFields": { "Issuer": OWNER } } }
            ]
        });

        let candidates = gather_geo_candidates(&txn, Some(&meta), SOURCE, DESTINATION, 3);
        assert_eq!(candidates.len(), 3);
        assert_eq!(candidates[0], SOURCE);
        assert_eq!(candidates[1], DESTINATION);
        assert_eq!(candidates[2], ISSUER);
    }

    #[test]
    fn duplicates_are_collapsed() {
        // Account appears again under meta; it must not repeat.
        let txn = json!({ "Account": SOURCE, "Destination": DESTINATION });
        let meta = json!({ "DeliveredAccount": SOURCE });

        let candidates = gather_geo_candidates(&txn, Some(&meta), SOURCE, DESTINATION, 10);
        assert_eq!(candidates.len(), 2);
    }

    #[test]
    fn non_address_strings_are_rejected() {
        let txn = json!({
            "Account": SOURCE,
            "Destination": DESTINATION,
            "OwnerNode": "0000000000000000",
            "RegularKey": "not an address at all"
        });
        let candidates = gather_geo_candidates(&txn, None, SOURCE, DESTINATION, 10);
        assert_eq!(candidates.len(), 2);
    }

    #[test]
    fn keys_match_case_insensitively_and_by_substring() {
        let txn = json!({
            "Account": SOURCE,
            "Destination": DESTINATION,
            "LowLimit": { "issuer": ISSUER },
            "HighCounterparty": OWNER
        });
        let candidates = gather_geo_candidates(&txn, None, SOURCE, DESTINATION, 10);
        assert!(candidates.contains(&ISSUER.to_string()));
        assert!(candidates.contains(&OWNER.to_string()));
    }
}
