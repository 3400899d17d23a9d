//! Session requests raised by dApps.
//!
//! Each request keeps the raw event it was decoded from and hands it back
//! to the script when the user approves or rejects it. Deciding twice is
//! not prevented here; the script rejects a second decision for the same
//! request.

use crate::events::{summary_amount, summary_recipient, ConnectPermission, DAppInfo, TransactionMessage};
use crate::rpc::RpcClient;
use serde_json::{json, Value};
use std::sync::Arc;
use walletkit_error::{Result, WalletKitError};

/// Bridge method names for request decisions
pub mod methods {
    /// Approve a connect request
    pub const APPROVE_CONNECT: &str = "approveConnectRequest";
    /// Reject a connect request
    pub const REJECT_CONNECT: &str = "rejectConnectRequest";
    /// Approve a transaction request
    pub const APPROVE_TRANSACTION: &str = "approveTransactionRequest";
    /// Reject a transaction request
    pub const REJECT_TRANSACTION: &str = "rejectTransactionRequest";
    /// Approve a sign-data request
    pub const APPROVE_SIGN_DATA: &str = "approveSignDataRequest";
    /// Reject a sign-data request
    pub const REJECT_SIGN_DATA: &str = "rejectSignDataRequest";
}

fn reject_params(event: &Value, reason: Option<&str>) -> Value {
    let mut params = json!({ "event": event });
    if let Some(reason) = reason {
        params["reason"] = Value::from(reason);
    }
    params
}

/// A dApp asking to connect to a wallet
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    id: String,
    dapp_info: Option<DAppInfo>,
    permissions: Vec<ConnectPermission>,
    event: Value,
    rpc: Arc<RpcClient>,
}

impl ConnectRequest {
    pub(crate) fn new(
        id: String,
        dapp_info: Option<DAppInfo>,
        permissions: Vec<ConnectPermission>,
        event: Value,
        rpc: Arc<RpcClient>,
    ) -> Self {
        Self {
            id,
            dapp_info,
            permissions,
            event,
            rpc,
        }
    }

    /// Request id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// dApp metadata, if the event carried any
    pub fn dapp_info(&self) -> Option<&DAppInfo> {
        self.dapp_info.as_ref()
    }

    /// Requested permissions
    pub fn permissions(&self) -> &[ConnectPermission] {
        &self.permissions
    }

    /// The raw event payload
    pub fn event(&self) -> &Value {
        &self.event
    }

    /// Connects `wallet_address` to the dApp
    pub async fn approve(&self, wallet_address: &str) -> Result<()> {
        let params = json!({ "event": self.event, "walletAddress": wallet_address });
        self.rpc.call(methods::APPROVE_CONNECT, Some(params)).await?;
        tracing::info!(request_id = %self.id, wallet = %wallet_address, "Connect request approved");
        Ok(())
    }

    /// Declines the connection
    pub async fn reject(&self, reason: Option<&str>) -> Result<()> {
        self.rpc
            .call(methods::REJECT_CONNECT, Some(reject_params(&self.event, reason)))
            .await?;
        tracing::info!(request_id = %self.id, "Connect request rejected");
        Ok(())
    }
}

/// A dApp asking for a transaction to be signed and sent
#[derive(Debug, Clone)]
pub struct TransactionRequest {
    id: String,
    dapp_info: Option<DAppInfo>,
    messages: Vec<TransactionMessage>,
    valid_until: Option<i64>,
    event: Value,
    rpc: Arc<RpcClient>,
}

impl TransactionRequest {
    pub(crate) fn new(
        id: String,
        dapp_info: Option<DAppInfo>,
        messages: Vec<TransactionMessage>,
        valid_until: Option<i64>,
        event: Value,
        rpc: Arc<RpcClient>,
    ) -> Self {
        Self {
            id,
            dapp_info,
            messages,
            valid_until,
            event,
            rpc,
        }
    }

    /// Request id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// dApp metadata, if the event carried any
    pub fn dapp_info(&self) -> Option<&DAppInfo> {
        self.dapp_info.as_ref()
    }

    /// Outgoing messages, never empty
    pub fn messages(&self) -> &[TransactionMessage] {
        &self.messages
    }

    /// Amount of the first message in nanotons
    pub fn amount(&self) -> Option<String> {
        summary_amount(&self.event, &self.messages)
    }

    /// Destination of the first message
    pub fn recipient(&self) -> Option<String> {
        summary_recipient(&self.event, &self.messages)
    }

    /// Unix time after which the dApp no longer accepts the transaction
    pub fn valid_until(&self) -> Option<i64> {
        self.valid_until
    }

    /// The raw event payload
    pub fn event(&self) -> &Value {
        &self.event
    }

    /// Signs and sends the transaction, returning the script's result
    pub async fn approve(&self) -> Result<Value> {
        let result = self
            .rpc
            .call(methods::APPROVE_TRANSACTION, Some(json!({ "event": self.event })))
            .await?;
        tracing::info!(request_id = %self.id, "Transaction request approved");
        Ok(result)
    }

    /// Declines the transaction
    pub async fn reject(&self, reason: Option<&str>) -> Result<()> {
        self.rpc
            .call(methods::REJECT_TRANSACTION, Some(reject_params(&self.event, reason)))
            .await?;
        tracing::info!(request_id = %self.id, "Transaction request rejected");
        Ok(())
    }
}

/// A dApp asking for data to be signed
#[derive(Debug, Clone)]
pub struct SignDataRequest {
    id: String,
    dapp_info: Option<DAppInfo>,
    payload: Value,
    payload_type: Option<String>,
    schema: Option<String>,
    event: Value,
    rpc: Arc<RpcClient>,
}

impl SignDataRequest {
    pub(crate) fn new(
        id: String,
        dapp_info: Option<DAppInfo>,
        payload: Value,
        payload_type: Option<String>,
        schema: Option<String>,
        event: Value,
        rpc: Arc<RpcClient>,
    ) -> Self {
        Self {
            id,
            dapp_info,
            payload,
            payload_type,
            schema,
            event,
            rpc,
        }
    }

    /// Request id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// dApp metadata, if the event carried any
    pub fn dapp_info(&self) -> Option<&DAppInfo> {
        self.dapp_info.as_ref()
    }

    /// The data to sign
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Payload kind: `text`, `binary` or `cell`
    pub fn payload_type(&self) -> Option<&str> {
        self.payload_type.as_deref()
    }

    /// TL-B schema for cell payloads
    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    /// The raw event payload
    pub fn event(&self) -> &Value {
        &self.event
    }

    /// Signs the payload and returns the signature
    pub async fn approve(&self) -> Result<String> {
        let result = self
            .rpc
            .call(methods::APPROVE_SIGN_DATA, Some(json!({ "event": self.event })))
            .await?;
        let signature = extract_signature(&result).ok_or_else(|| {
            WalletKitError::bridge(format!("No signature in {} response", methods::APPROVE_SIGN_DATA))
        })?;
        tracing::info!(request_id = %self.id, "Sign-data request approved");
        Ok(signature)
    }

    /// Declines signing
    pub async fn reject(&self, reason: Option<&str>) -> Result<()> {
        self.rpc
            .call(methods::REJECT_SIGN_DATA, Some(reject_params(&self.event, reason)))
            .await?;
        tracing::info!(request_id = %self.id, "Sign-data request rejected");
        Ok(())
    }
}

/// Looks for the signature at `signature`, `result.signature`, `data.signature`
pub(crate) fn extract_signature(result: &Value) -> Option<String> {
    [
        result.get("signature"),
        result.get("result").and_then(|r| r.get("signature")),
        result.get("data").and_then(|d| d.get("signature")),
    ]
    .into_iter()
    .flatten()
    .find_map(|value| value.as_str().filter(|s| !s.is_empty()).map(str::to_string))
}
