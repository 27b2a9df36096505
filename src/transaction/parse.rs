//! Stream message parsing and payment filtering.

use anyhow::{bail, Result};
use chrono::Utc;
use serde_json::Value;

use crate::config::RIPPLE_EPOCH_OFFSET;
use crate::models::Transaction;

use super::candidates::gather_geo_candidates;

/// Payment flag: the stated `Amount` is only an upper bound.
const TF_PARTIAL_PAYMENT: u64 = 0x0002_0000;

/// Parses one stream envelope into a [`Transaction`].
///
/// `Ok(None)` means the message was filtered (wrong type, not validated,
/// not a qualifying payment); `Err` means a payment-shaped message was
/// malformed and should be dropped with a debug log.
pub fn parse_transaction(
    msg: &Value,
    min_payment_drops: i64,
    max_geo_candidates: usize,
) -> Result<Option<Transaction>> {
    if msg.get("type").and_then(Value::as_str) != Some("transaction") {
        return Ok(None);
    }
    if msg.get("validated").and_then(Value::as_bool) != Some(true) {
        return Ok(None);
    }

    let Some(txn) = msg.get("transaction") else {
        bail!("missing transaction payload");
    };
    if !txn.is_object() {
        bail!("transaction payload is not an object");
    }

    if txn.get("TransactionType").and_then(Value::as_str) != Some("Payment") {
        return Ok(None);
    }

    let meta = msg.get("meta");
    let Some(amount_drops) = delivered_drops(txn, meta) else {
        return Ok(None);
    };
    if amount_drops < min_payment_drops {
        return Ok(None);
    }

    let mut transaction_result = meta
        .and_then(|m| m.get("TransactionResult"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if transaction_result.is_empty() {
        transaction_result = msg
            .get("engine_result")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
    }
    if transaction_result != "tesSUCCESS" {
        return Ok(None);
    }

    let hash = stringify(txn.get("hash"));
    let account = stringify(txn.get("Account"));
    let destination = stringify(txn.get("Destination"));
    if hash.is_empty() || account.is_empty() || destination.is_empty() {
        bail!("missing required payment fields");
    }

    let close_time = msg
        .get("date")
        .and_then(Value::as_i64)
        .filter(|d| *d >= 0)
        .unwrap_or(0);
    let timestamp = if close_time > 0 {
        close_time + RIPPLE_EPOCH_OFFSET
    } else {
        Utc::now().timestamp()
    };

    let geo_candidates =
        gather_geo_candidates(txn, meta, &account, &destination, max_geo_candidates);

    Ok(Some(Transaction {
        hash,
        ledger_index: msg
            .get("ledger_index")
            .and_then(Value::as_u64)
            .map(|v| v as u32)
            .unwrap_or(0),
        account,
        destination,
        transaction_type: "Payment".to_string(),
        amount: amount_drops.to_string(),
        fee: stringify(txn.get("Fee")),
        transaction_result,
        timestamp,
        close_time: close_time as u32,
        validated: true,
        locations: Vec::new(),
        geo_candidates,
    }))
}

/// Computes the drops actually delivered.
///
/// Precedence: `meta.delivered_amount` / `meta.DeliveredAmount` when it is
/// a numeric string; `"unavailable"` (or any non-numeric delivered value)
/// kills the transaction; a partial payment without a delivered amount is
/// also killed; otherwise the stated `Amount`. A non-string `Amount` is an
/// IOU payment and never qualifies.
fn delivered_drops(txn: &Value, meta: Option<&Value>) -> Option<i64> {
    let delivered = meta.and_then(|m| {
        m.get("delivered_amount")
            .or_else(|| m.get("DeliveredAmount"))
    });

    if let Some(delivered) = delivered {
        let Some(as_str) = delivered.as_str() else {
            // Delivered an IOU object; not an XRP payment.
            return None;
        };
        return as_str.parse::<i64>().ok();
    }

    let flags = txn.get("Flags").and_then(Value::as_u64).unwrap_or(0);
    if flags & TF_PARTIAL_PAYMENT != 0 {
        // The stated Amount is an upper bound and nothing says what was
        // actually delivered.
        return None;
    }

    txn.get("Amount").and_then(Value::as_str)?.parse::<i64>().ok()
}

fn stringify(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.as_i64().map(|v| v.to_string()).unwrap_or_default(),
        _ => String::new(),
    }
}
