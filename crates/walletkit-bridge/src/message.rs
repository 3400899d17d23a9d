//! Messages posted by the script through `WalletKitNative.postMessage`.
//!
//! Every message is a JSON object with a `kind` discriminator:
//!
//! ```text
//! {"kind":"ready","network":"testnet","tonApiUrl":"..."}
//! {"kind":"response","id":"<call id>","result":{...}}
//! {"kind":"response","id":"<call id>","error":{"message":"..."}}
//! {"kind":"event","event":{"type":"connectRequest","id":"42","data":{...}}}
//! {"kind":"event","type":"disconnect","data":{"sessionId":"..."}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use walletkit_error::{Result, WalletKitError};

/// Default failure message when an error envelope carries none
pub const DEFAULT_CALL_ERROR: &str = "Bridge call failed";

/// Network and endpoint data echoed by the script on startup
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyInfo {
    /// Network name or chain id
    #[serde(default)]
    pub network: Option<String>,
    /// TON API URL in use
    #[serde(default)]
    pub ton_api_url: Option<String>,
    /// TON client endpoint in use
    #[serde(default)]
    pub ton_client_endpoint: Option<String>,
}

/// An `event` message before typed decoding
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    /// Event type tag
    pub event_type: String,
    /// Event payload
    pub data: Value,
    /// Correlation id used for retry
    pub id: Option<String>,
}

impl EventEnvelope {
    /// Builds an envelope
    pub fn new(event_type: impl Into<String>, data: Value, id: Option<String>) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            id,
        }
    }

    /// Envelope in its nested wire form
    pub fn to_json(&self) -> Value {
        let mut event = json!({ "type": self.event_type, "data": self.data });
        if let Some(id) = &self.id {
            event["id"] = Value::from(id.as_str());
        }
        json!({ "kind": "event", "event": event })
    }
}

/// A `response` message answering a call
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseMessage {
    /// Call id being answered
    pub id: String,
    /// Result value, if any
    pub result: Option<Value>,
    /// Error message, if the call failed
    pub error: Option<String>,
}

impl ResponseMessage {
    /// Converts the response into the value handed to the caller.
    ///
    /// Objects pass through, arrays become `{items}`, other values become
    /// `{value}` and a missing result becomes `{}`.
    pub fn into_result(self) -> Result<Value> {
        if let Some(message) = self.error {
            return Err(WalletKitError::Bridge(message));
        }
        Ok(normalize_result(self.result))
    }
}

/// Wraps a call result into an object
pub fn normalize_result(result: Option<Value>) -> Value {
    match result {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(Value::Object(map)) => Value::Object(map),
        Some(Value::Array(items)) => json!({ "items": items }),
        Some(primitive) => json!({ "value": primitive }),
    }
}

/// A decoded message from the script
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeMessage {
    /// The bundle finished its own startup
    Ready(ReadyInfo),
    /// An unsolicited event
    Event(EventEnvelope),
    /// A reply to a call
    Response(ResponseMessage),
}

impl BridgeMessage {
    /// Parses raw message text
    pub fn parse(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| WalletKitError::decode("message", format!("invalid JSON: {e}")))?;
        Self::from_value(value)
    }

    /// Decodes an already parsed message
    pub fn from_value(value: Value) -> Result<Self> {
        let kind = value
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| WalletKitError::decode("message", "missing kind"))?;

        match kind {
            "ready" => {
                let info = serde_json::from_value(value.clone())
                    .map_err(|e| WalletKitError::decode("ready", e.to_string()))?;
                Ok(BridgeMessage::Ready(info))
            }
            "response" => decode_response(&value).map(BridgeMessage::Response),
            "event" => decode_event(&value).map(BridgeMessage::Event),
            other => Err(WalletKitError::decode(
                "message",
                format!("unknown kind '{other}'"),
            )),
        }
    }
}

fn decode_response(value: &Value) -> Result<ResponseMessage> {
    let id = value
        .get("id")
        .and_then(id_string)
        .ok_or_else(|| WalletKitError::decode("response", "missing id"))?;

    let error = match value.get("error") {
        None | Some(Value::Null) => None,
        Some(Value::String(message)) if !message.is_empty() => Some(message.clone()),
        Some(other) => Some(
            other
                .get("message")
                .and_then(Value::as_str)
                .filter(|m| !m.is_empty())
                .unwrap_or(DEFAULT_CALL_ERROR)
                .to_string(),
        ),
    };

    Ok(ResponseMessage {
        id,
        result: value.get("result").cloned(),
        error,
    })
}

fn decode_event(value: &Value) -> Result<EventEnvelope> {
    let nested = value.get("event").filter(|e| e.is_object());
    let field = |name: &str| -> Option<&Value> {
        nested
            .and_then(|e| e.get(name))
            .filter(|v| !v.is_null())
            .or_else(|| value.get(name).filter(|v| !v.is_null()))
    };

    let event_type = field("type")
        .and_then(Value::as_str)
        .ok_or_else(|| WalletKitError::decode("event", "missing type"))?
        .to_string();
    let data = field("data").cloned().unwrap_or(Value::Null);
    let id = field("id").and_then(id_string);

    Ok(EventEnvelope {
        event_type,
        data,
        id,
    })
}

/// Accepts string or numeric ids
pub(crate) fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ready() {
        let msg = BridgeMessage::parse(
            r#"{"kind":"ready","network":"-3","tonApiUrl":"https://testnet.tonapi.io"}"#,
        )
        .unwrap();
        match msg {
            BridgeMessage::Ready(info) => {
                assert_eq!(info.network.as_deref(), Some("-3"));
                assert_eq!(info.ton_api_url.as_deref(), Some("https://testnet.tonapi.io"));
                assert!(info.ton_client_endpoint.is_none());
            }
            other => panic!("expected ready, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_nested_event_wins_over_flattened() {
        let msg = BridgeMessage::parse(
            r#"{"kind":"event","type":"disconnect","event":{"type":"connectRequest","id":7,"data":{"a":1}}}"#,
        )
        .unwrap();
        let BridgeMessage::Event(event) = msg else {
            panic!("expected event");
        };
        assert_eq!(event.event_type, "connectRequest");
        assert_eq!(event.id.as_deref(), Some("7"));
        assert_eq!(event.data["a"], 1);
    }

    #[test]
    fn test_parse_flattened_event() {
        let msg = BridgeMessage::parse(
            r#"{"kind":"event","type":"disconnect","data":{"sessionId":"s1"}}"#,
        )
        .unwrap();
        let BridgeMessage::Event(event) = msg else {
            panic!("expected event");
        };
        assert_eq!(event.event_type, "disconnect");
        assert!(event.id.is_none());
    }

    #[test]
    fn test_response_error_default_message() {
        let msg = BridgeMessage::parse(r#"{"kind":"response","id":"c1","error":{}}"#).unwrap();
        let BridgeMessage::Response(response) = msg else {
            panic!("expected response");
        };
        assert_eq!(
            response.into_result().unwrap_err(),
            WalletKitError::bridge(DEFAULT_CALL_ERROR)
        );
    }

    #[test]
    fn test_response_error_message() {
        let msg = BridgeMessage::parse(
            r#"{"kind":"response","id":"c1","error":{"message":"Wallet not found"}}"#,
        )
        .unwrap();
        let BridgeMessage::Response(response) = msg else {
            panic!("expected response");
        };
        assert_eq!(response.into_result().unwrap_err().to_string(), "Wallet not found");
    }

    #[test]
    fn test_normalize_result() {
        assert_eq!(normalize_result(None), json!({}));
        assert_eq!(normalize_result(Some(Value::Null)), json!({}));
        assert_eq!(normalize_result(Some(json!({"a": 1}))), json!({"a": 1}));
        assert_eq!(normalize_result(Some(json!([1, 2]))), json!({"items": [1, 2]}));
        assert_eq!(normalize_result(Some(json!("x"))), json!({"value": "x"}));
        assert_eq!(normalize_result(Some(json!(false))), json!({"value": false}));
    }

    #[test]
    fn test_unknown_kind_and_bad_json() {
        assert!(matches!(
            BridgeMessage::parse(r#"{"kind":"telemetry"}"#),
            Err(WalletKitError::Decode { .. })
        ));
        assert!(matches!(
            BridgeMessage::parse("not json"),
            Err(WalletKitError::Decode { .. })
        ));
    }

    #[test]
    fn test_envelope_round_trips_through_parse() {
        let envelope = EventEnvelope::new("signDataRequest", json!({"id": "r1"}), Some("r1".into()));
        let parsed = BridgeMessage::from_value(envelope.to_json()).unwrap();
        assert_eq!(parsed, BridgeMessage::Event(envelope));
    }
}
