//! Typed decoding of `event` messages.
//!
//! The script has shipped several payload layouts for the same concepts, so
//! each field is read through an ordered list of locations and the first
//! one present wins.

use crate::message::{id_string, EventEnvelope, ReadyInfo};
use crate::requests::{ConnectRequest, SignDataRequest, TransactionRequest};
use crate::rpc::RpcClient;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use walletkit_error::{Result, WalletKitError};

/// Event type tags sent by the script
pub mod tags {
    /// Synthetic startup event
    pub const READY: &str = "ready";
    /// dApp asks to connect
    pub const CONNECT_REQUEST: &str = "connectRequest";
    /// dApp asks to send a transaction
    pub const TRANSACTION_REQUEST: &str = "transactionRequest";
    /// dApp asks to sign data
    pub const SIGN_DATA_REQUEST: &str = "signDataRequest";
    /// A session ended
    pub const DISCONNECT: &str = "disconnect";
    /// Wallet state changed
    pub const STATE_CHANGED: &str = "stateChanged";
    /// Session list changed
    pub const SESSIONS_CHANGED: &str = "sessionsChanged";
    /// Internal session bookkeeping, ignored
    pub const SESSION_STATE_CHANGED: &str = "sessionStateChanged";
}

/// Events delivered to handlers
#[derive(Debug, Clone)]
pub enum WalletKitEvent {
    /// The bundle finished starting up
    Ready(ReadyInfo),
    /// A dApp wants to connect
    ConnectRequest(ConnectRequest),
    /// A dApp wants a transaction signed and sent
    TransactionRequest(TransactionRequest),
    /// A dApp wants data signed
    SignDataRequest(SignDataRequest),
    /// A session was closed
    Disconnect {
        /// The closed session
        session_id: String,
    },
    /// A wallet's state changed
    StateChanged {
        /// Affected wallet, if known
        address: Option<String>,
    },
    /// Sessions were added or removed
    SessionsChanged,
}

impl WalletKitEvent {
    /// The wire tag of this event
    pub fn event_type(&self) -> &'static str {
        match self {
            WalletKitEvent::Ready(_) => tags::READY,
            WalletKitEvent::ConnectRequest(_) => tags::CONNECT_REQUEST,
            WalletKitEvent::TransactionRequest(_) => tags::TRANSACTION_REQUEST,
            WalletKitEvent::SignDataRequest(_) => tags::SIGN_DATA_REQUEST,
            WalletKitEvent::Disconnect { .. } => tags::DISCONNECT,
            WalletKitEvent::StateChanged { .. } => tags::STATE_CHANGED,
            WalletKitEvent::SessionsChanged => tags::SESSIONS_CHANGED,
        }
    }
}

/// dApp metadata attached to session requests
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DAppInfo {
    /// Display name
    pub name: Option<String>,
    /// Site URL
    pub url: Option<String>,
    /// Icon URL
    pub icon_url: Option<String>,
    /// TonConnect manifest URL
    pub manifest_url: Option<String>,
}

impl DAppInfo {
    fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.url.is_none()
            && self.icon_url.is_none()
            && self.manifest_url.is_none()
    }
}

/// A permission requested in a connect request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectPermission {
    /// Item name such as `ton_addr` or `ton_proof`
    pub name: String,
    /// Item payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// One outgoing message of a transaction request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionMessage {
    /// Destination address
    pub address: String,
    /// Amount in nanotons
    pub amount: String,
    /// Base64 BOC payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    /// Base64 BOC state init
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_init: Option<String>,
}

/// Decodes an envelope into a typed event.
///
/// Returns `Ok(None)` for event types that are deliberately ignored.
pub fn decode_event(envelope: &EventEnvelope, rpc: &Arc<RpcClient>) -> Result<Option<WalletKitEvent>> {
    let data = &envelope.data;
    let event_type = envelope.event_type.as_str();

    let event = match event_type {
        tags::CONNECT_REQUEST => {
            let id = require_id(event_type, data)?;
            WalletKitEvent::ConnectRequest(ConnectRequest::new(
                id,
                extract_dapp_info(data),
                extract_permissions(data),
                data.clone(),
                Arc::clone(rpc),
            ))
        }
        tags::TRANSACTION_REQUEST => {
            let id = require_id(event_type, data)?;
            let messages = extract_messages(data);
            if messages.is_empty() {
                return Err(WalletKitError::decode(event_type, "no messages"));
            }
            WalletKitEvent::TransactionRequest(TransactionRequest::new(
                id,
                extract_dapp_info(data),
                messages,
                extract_valid_until(data),
                data.clone(),
                Arc::clone(rpc),
            ))
        }
        tags::SIGN_DATA_REQUEST => {
            let id = require_id(event_type, data)?;
            let payload = extract_sign_payload(data)
                .ok_or_else(|| WalletKitError::decode(event_type, "missing payload"))?;
            let payload_type = payload.get("type").and_then(non_empty_str);
            let schema = first_str(data, &[&["payload", "schema"], &["request", "schema"], &["schema"]]);
            WalletKitEvent::SignDataRequest(SignDataRequest::new(
                id,
                extract_dapp_info(data),
                payload.clone(),
                payload_type,
                schema,
                data.clone(),
                Arc::clone(rpc),
            ))
        }
        tags::DISCONNECT => {
            let session_id = first(data, &[&["sessionId"], &["id"]])
                .and_then(id_string)
                .ok_or_else(|| WalletKitError::decode(event_type, "missing session id"))?;
            WalletKitEvent::Disconnect { session_id }
        }
        tags::STATE_CHANGED => WalletKitEvent::StateChanged {
            address: first_str(data, &[&["address"], &["walletAddress"]]),
        },
        tags::SESSIONS_CHANGED => WalletKitEvent::SessionsChanged,
        tags::SESSION_STATE_CHANGED => return Ok(None),
        other => {
            tracing::debug!(event_type = %other, "Ignoring unknown event type");
            return Ok(None);
        }
    };
    Ok(Some(event))
}

fn require_id(event_type: &str, data: &Value) -> Result<String> {
    first(data, &[&["id"], &["requestId"]])
        .and_then(id_string)
        .ok_or_else(|| WalletKitError::decode(event_type, "missing request id"))
}

/// First non-null value among `paths`
fn first<'a>(data: &'a Value, paths: &[&[&str]]) -> Option<&'a Value> {
    paths.iter().find_map(|path| {
        path.iter()
            .try_fold(data, |value, key| value.get(*key))
            .filter(|value| !value.is_null())
    })
}

fn first_str(data: &Value, paths: &[&[&str]]) -> Option<String> {
    paths
        .iter()
        .find_map(|path| first(data, &[*path]).and_then(non_empty_str))
}

fn non_empty_str(value: &Value) -> Option<String> {
    value.as_str().filter(|s| !s.is_empty()).map(str::to_string)
}

fn amount_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn extract_dapp_info(data: &Value) -> Option<DAppInfo> {
    const SOURCES: &[&[&str]] = &[&["preview", "manifest"], &["dAppInfo"], &["manifest"]];
    let field = |name: &str| {
        SOURCES
            .iter()
            .find_map(|source| first(data, &[*source])?.get(name).and_then(non_empty_str))
    };

    let info = DAppInfo {
        name: field("name"),
        url: field("url"),
        icon_url: field("iconUrl"),
        manifest_url: field("manifestUrl")
            .or_else(|| first_str(data, &[&["preview", "manifestUrl"], &["manifestUrl"]])),
    };
    (!info.is_empty()).then_some(info)
}

fn extract_permissions(data: &Value) -> Vec<ConnectPermission> {
    let Some(Value::Array(items)) = first(data, &[&["request", "items"], &["items"], &["permissions"]])
    else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(name) => Some(ConnectPermission {
                name: name.clone(),
                payload: None,
            }),
            Value::Object(_) => Some(ConnectPermission {
                name: item.get("name").and_then(non_empty_str)?,
                payload: item.get("payload").filter(|p| !p.is_null()).cloned(),
            }),
            _ => None,
        })
        .collect()
}

fn extract_messages(data: &Value) -> Vec<TransactionMessage> {
    if let Some(Value::Array(messages)) = first(data, &[&["request", "messages"], &["messages"]]) {
        return messages
            .iter()
            .filter_map(|message| {
                Some(TransactionMessage {
                    address: message.get("address").and_then(non_empty_str)?,
                    amount: message.get("amount").and_then(amount_string)?,
                    payload: message.get("payload").and_then(non_empty_str),
                    state_init: message.get("stateInit").and_then(non_empty_str),
                })
            })
            .collect();
    }

    let recipient = first_str(data, &[&["to"], &["recipient"]]);
    let amount = first(data, &[&["amount"], &["value"]]).and_then(amount_string);
    match (recipient, amount) {
        (Some(address), Some(amount)) => vec![TransactionMessage {
            address,
            amount,
            payload: first_str(data, &[&["payload"]]),
            state_init: first_str(data, &[&["stateInit"]]),
        }],
        _ => Vec::new(),
    }
}

fn extract_valid_until(data: &Value) -> Option<i64> {
    first(data, &[&["request", "validUntil"], &["validUntil"]]).and_then(|v| {
        v.as_i64()
            .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
    })
}

fn extract_sign_payload(data: &Value) -> Option<&Value> {
    first(data, &[&["request", "payload"], &["payload"], &["request"]])
}

/// Amount summary of a transaction request payload
pub(crate) fn summary_amount(data: &Value, messages: &[TransactionMessage]) -> Option<String> {
    messages
        .first()
        .map(|m| m.amount.clone())
        .or_else(|| first(data, &[&["amount"], &["value"]]).and_then(amount_string))
}

/// Recipient summary of a transaction request payload
pub(crate) fn summary_recipient(data: &Value, messages: &[TransactionMessage]) -> Option<String> {
    messages
        .first()
        .map(|m| m.address.clone())
        .or_else(|| first_str(data, &[&["to"], &["recipient"]]))
}
