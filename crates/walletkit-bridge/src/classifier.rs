//! Native TON transaction classification.
//!
//! Turns raw transaction records returned by the script into typed
//! [`Transaction`]s and filters out jetton transfers.
//!
//! The jetton check is a heuristic, not a protocol rule. A message is
//! treated as a token transfer when it has an op code, a body other than the
//! empty cell, or a comment longer than 200 UTF-16 code units. One such message,
//! incoming or outgoing, excludes the whole transaction.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Base64 BOC of an empty cell
pub const EMPTY_CELL_BOC: &str = "te6cckEBAQEAAgAAAEysuc0=";

/// Comments longer than this many UTF-16 code units mark a message as a token transfer
pub const MAX_NATIVE_COMMENT_CHARS: usize = 200;

/// Direction of a transaction relative to the wallet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionType {
    /// Value arrived
    Incoming,
    /// Value left
    Outgoing,
    /// No value moved
    Unknown,
}

/// A classified native transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Transaction hash, hex when available
    pub hash: String,
    /// Block time in milliseconds
    pub timestamp_ms: i64,
    /// Amount in nanotons
    pub amount: String,
    /// Total fees in nanotons
    pub fee: Option<String>,
    /// Text comment
    pub comment: Option<String>,
    /// Sender of the incoming message
    pub sender: Option<String>,
    /// Destination of the first outgoing message
    pub recipient: Option<String>,
    /// Direction
    pub transaction_type: TransactionType,
    /// Logical time
    pub logical_time: Option<String>,
    /// Masterchain block sequence number
    pub block_seqno: Option<i64>,
}

/// Raw transaction record as returned by the indexer
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawTransaction {
    /// Hex hash
    #[serde(default)]
    pub hash_hex: Option<String>,
    /// Base64 hash
    #[serde(default)]
    pub hash: Option<String>,
    /// Unix time in seconds
    #[serde(default, deserialize_with = "lenient_i64")]
    pub now: Option<i64>,
    /// Logical time
    #[serde(default, deserialize_with = "lenient_string")]
    pub lt: Option<String>,
    /// Masterchain block sequence number
    #[serde(default, deserialize_with = "lenient_i64")]
    pub mc_block_seqno: Option<i64>,
    /// Total fees
    #[serde(default, alias = "fee", deserialize_with = "lenient_string")]
    pub total_fees: Option<String>,
    /// Incoming message
    #[serde(default)]
    pub in_msg: Option<RawMessage>,
    /// Outgoing messages
    #[serde(default, deserialize_with = "null_as_empty")]
    pub out_msgs: Vec<RawMessage>,
}

/// Raw message inside a [`RawTransaction`]
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawMessage {
    /// Raw source address
    #[serde(default)]
    pub source: Option<String>,
    /// User-friendly source address
    #[serde(default)]
    pub source_friendly: Option<String>,
    /// Raw destination address
    #[serde(default)]
    pub destination: Option<String>,
    /// User-friendly destination address
    #[serde(default)]
    pub destination_friendly: Option<String>,
    /// Value in nanotons
    #[serde(default, deserialize_with = "lenient_string")]
    pub value: Option<String>,
    /// Op code
    #[serde(default, alias = "op_code", deserialize_with = "lenient_string")]
    pub opcode: Option<String>,
    /// Text comment
    #[serde(default)]
    pub message: Option<String>,
    /// Message body
    #[serde(default)]
    pub message_content: Option<MessageContent>,
}

/// Body of a [`RawMessage`]
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MessageContent {
    /// Base64 BOC body
    #[serde(default)]
    pub body: Option<String>,
    /// Decoded body
    #[serde(default)]
    pub decoded: Option<DecodedContent>,
}

/// Decoded message body
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DecodedContent {
    /// Text comment
    #[serde(default)]
    pub comment: Option<String>,
}

fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn lenient_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<RawMessage>, D::Error> {
    Ok(Option::<Vec<RawMessage>>::deserialize(deserializer)?.unwrap_or_default())
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

/// Parses a nanoton value; anything unparsable counts as zero
fn nanotons(value: &Option<String>) -> u128 {
    present(value)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}

impl RawMessage {
    fn decoded_comment(&self) -> Option<&str> {
        self.message_content
            .as_ref()
            .and_then(|c| c.decoded.as_ref())
            .and_then(|d| present(&d.comment))
    }

    fn comment(&self) -> Option<&str> {
        present(&self.message).or_else(|| self.decoded_comment())
    }

    fn body(&self) -> Option<&str> {
        self.message_content.as_ref().and_then(|c| present(&c.body))
    }

    /// Returns true if the message looks like a token transfer
    pub fn looks_like_token_transfer(&self) -> bool {
        let has_opcode = present(&self.opcode).is_some_and(|op| !op.trim().is_empty());
        let has_body = self.body().is_some_and(|body| body != EMPTY_CELL_BOC);
        let long_comment = [present(&self.message), self.decoded_comment()]
            .into_iter()
            .flatten()
            .any(|text| text.encode_utf16().count() > MAX_NATIVE_COMMENT_CHARS);
        has_opcode || has_body || long_comment
    }

    fn sender(&self) -> Option<String> {
        present(&self.source_friendly)
            .or_else(|| present(&self.source))
            .map(str::to_string)
    }

    fn recipient(&self) -> Option<String> {
        present(&self.destination_friendly)
            .or_else(|| present(&self.destination))
            .map(str::to_string)
    }
}

impl RawTransaction {
    /// Returns true if any message looks like a token transfer
    pub fn is_token_transfer(&self) -> bool {
        self.in_msg
            .iter()
            .chain(self.out_msgs.iter())
            .any(RawMessage::looks_like_token_transfer)
    }
}

/// Classifies a raw record; `None` for jetton transfers
pub fn classify(raw: &RawTransaction) -> Option<Transaction> {
    if raw.is_token_transfer() {
        return None;
    }

    let incoming = raw.in_msg.as_ref().map(|m| nanotons(&m.value)).unwrap_or(0);
    let outgoing: u128 = raw
        .out_msgs
        .iter()
        .map(|m| nanotons(&m.value))
        .fold(0u128, u128::saturating_add);

    let (transaction_type, amount) = if incoming > 0 {
        (TransactionType::Incoming, incoming)
    } else if outgoing > 0 {
        (TransactionType::Outgoing, outgoing)
    } else {
        (TransactionType::Unknown, 0)
    };

    let comment = match transaction_type {
        TransactionType::Outgoing => raw.out_msgs.first().and_then(RawMessage::comment),
        _ => raw.in_msg.as_ref().and_then(RawMessage::comment),
    };

    Some(Transaction {
        hash: present(&raw.hash_hex)
            .or_else(|| present(&raw.hash))
            .unwrap_or_default()
            .to_string(),
        timestamp_ms: raw.now.unwrap_or(0).saturating_mul(1000),
        amount: amount.to_string(),
        fee: present(&raw.total_fees).map(str::to_string),
        comment: comment.map(str::to_string),
        sender: raw.in_msg.as_ref().and_then(RawMessage::sender),
        recipient: raw.out_msgs.first().and_then(RawMessage::recipient),
        transaction_type,
        logical_time: present(&raw.lt).map(str::to_string),
        block_seqno: raw.mc_block_seqno,
    })
}

/// Classifies a JSON record; records that do not parse are skipped
pub fn classify_value(value: &Value) -> Option<Transaction> {
    match RawTransaction::deserialize(value) {
        Ok(raw) => classify(&raw),
        Err(e) => {
            tracing::debug!(error = %e, "Skipping unparsable transaction record");
            None
        }
    }
}

/// Classifies a list of JSON records, dropping jettons and bad records
pub fn classify_all(values: &[Value]) -> Vec<Transaction> {
    values.iter().filter_map(classify_value).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn incoming(value: &str) -> Value {
        json!({
            "hash_hex": "ab12",
            "hash": "qxI=",
            "now": 1_700_000_000,
            "lt": 4200,
            "mc_block_seqno": 36000000,
            "total_fees": "1000",
            "in_msg": {
                "source": "0:abc",
                "source_friendly": "EQabc",
                "value": value,
                "message": "thanks"
            },
            "out_msgs": []
        })
    }

    #[test]
    fn test_incoming_native_transfer() {
        let tx = classify_value(&incoming("5000000000")).unwrap();
        assert_eq!(tx.transaction_type, TransactionType::Incoming);
        assert_eq!(tx.amount, "5000000000");
        assert_eq!(tx.hash, "ab12");
        assert_eq!(tx.timestamp_ms, 1_700_000_000_000);
        assert_eq!(tx.sender.as_deref(), Some("EQabc"));
        assert_eq!(tx.recipient, None);
        assert_eq!(tx.comment.as_deref(), Some("thanks"));
        assert_eq!(tx.fee.as_deref(), Some("1000"));
        assert_eq!(tx.logical_time.as_deref(), Some("4200"));
        assert_eq!(tx.block_seqno, Some(36_000_000));
    }

    #[test]
    fn test_opcode_marks_jetton() {
        let mut record = incoming("5000000000");
        record["in_msg"]["opcode"] = json!("0x7362d09c");
        assert_eq!(classify_value(&record), None);

        let mut record = incoming("5000000000");
        record["in_msg"]["op_code"] = json!(0x0f8a7ea5);
        assert_eq!(classify_value(&record), None);
    }

    #[test]
    fn test_empty_cell_body_is_native() {
        let mut record = incoming("1");
        record["in_msg"]["message_content"] = json!({"body": EMPTY_CELL_BOC});
        assert!(classify_value(&record).is_some());

        record["in_msg"]["message_content"] = json!({"body": "te6cckEBAQEADgAAGAAAAABoZWxsbz8="});
        assert!(classify_value(&record).is_none());
    }

    #[test]
    fn test_long_comment_marks_jetton() {
        let mut record = incoming("1");
        record["in_msg"]["message"] = json!("x".repeat(MAX_NATIVE_COMMENT_CHARS));
        assert!(classify_value(&record).is_some());

        record["in_msg"]["message"] = json!("x".repeat(MAX_NATIVE_COMMENT_CHARS + 1));
        assert!(classify_value(&record).is_none());
    }

    #[test]
    fn test_comment_length_counts_utf16_units() {
        // each emoji is a surrogate pair
        let mut record = incoming("1");
        record["in_msg"]["message"] = json!("\u{1F48E}".repeat(150));
        assert!(classify_value(&record).is_none());

        record["in_msg"]["message"] = json!("\u{1F48E}".repeat(MAX_NATIVE_COMMENT_CHARS / 2));
        assert!(classify_value(&record).is_some());

        record["in_msg"]["message"] = json!("é".repeat(MAX_NATIVE_COMMENT_CHARS));
        assert!(classify_value(&record).is_some());
    }

    #[test]
    fn test_outgoing_sums_values_and_prefers_friendly_recipient() {
        let record = json!({
            "hash": "base64hash",
            "now": 10,
            "in_msg": {"source": null, "value": "0"},
            "out_msgs": [
                {"destination": "0:raw", "destination_friendly": "UQfriendly", "value": "300"},
                {"destination": "0:other", "value": 200}
            ]
        });
        let tx = classify_value(&record).unwrap();
        assert_eq!(tx.transaction_type, TransactionType::Outgoing);
        assert_eq!(tx.amount, "500");
        assert_eq!(tx.hash, "base64hash");
        assert_eq!(tx.recipient.as_deref(), Some("UQfriendly"));
        assert_eq!(tx.sender, None);
    }

    #[test]
    fn test_jetton_in_outgoing_message_excludes_transaction() {
        let record = json!({
            "hash": "h",
            "out_msgs": [
                {"destination": "0:a", "value": "10"},
                {"destination": "0:b", "value": "10", "opcode": "0x0f8a7ea5"}
            ]
        });
        assert!(classify_value(&record).is_none());
    }

    #[test]
    fn test_no_value_is_unknown() {
        let tx = classify_value(&json!({"hash": "h", "out_msgs": null})).unwrap();
        assert_eq!(tx.transaction_type, TransactionType::Unknown);
        assert_eq!(tx.amount, "0");
        assert_eq!(tx.timestamp_ms, 0);
    }

    #[test]
    fn test_unparsable_value_counts_as_zero() {
        let tx = classify_value(&incoming("lots")).unwrap();
        assert_eq!(tx.transaction_type, TransactionType::Unknown);
    }

    #[test]
    fn test_classify_all_drops_jettons() {
        let mut jetton = incoming("1");
        jetton["in_msg"]["opcode"] = json!("0x7362d09c");
        let list = vec![incoming("1"), jetton, json!("not a record"), incoming("2")];
        let txs = classify_all(&list);
        assert_eq!(txs.len(), 2);
        assert_eq!(txs[1].amount, "2");
    }
}
