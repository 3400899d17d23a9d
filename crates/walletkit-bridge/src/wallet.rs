//! Wallet and session data returned by the script, plus the wallet records
//! the host keeps so wallets survive restarts.

use crate::config::TonNetwork;
use crate::storage::KeyValueStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use walletkit_error::{Result, WalletKitError};

/// Default wallet contract version
pub const DEFAULT_WALLET_VERSION: &str = "v5r1";

/// A wallet known to the script
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletAccount {
    /// User-friendly address
    pub address: String,
    /// Hex public key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    /// Contract version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Network name or chain id
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_opt_string")]
    pub network: Option<String>,
    /// Index in the script's wallet list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
}

/// Balance and recent activity of a wallet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletState {
    /// Balance in nanotons
    #[serde(deserialize_with = "lenient_string")]
    pub balance: String,
    /// Raw transaction records, when the script includes them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transactions: Option<Vec<Value>>,
}

/// An active TonConnect session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletSession {
    /// Session id
    pub session_id: String,
    /// dApp name
    #[serde(default, rename = "dAppName", alias = "dappName")]
    pub dapp_name: String,
    /// Connected wallet
    #[serde(default)]
    pub wallet_address: String,
    /// dApp URL
    #[serde(default, rename = "dAppUrl", alias = "dappUrl")]
    pub dapp_url: Option<String>,
    /// Manifest URL
    #[serde(default)]
    pub manifest_url: Option<String>,
    /// Icon URL
    #[serde(default)]
    pub icon_url: Option<String>,
    /// Creation time as reported by the script
    #[serde(default)]
    pub created_at: Option<Value>,
    /// Last activity as reported by the script
    #[serde(default)]
    pub last_activity: Option<Value>,
}

/// Parameters for a plain TON transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferParams {
    /// Sending wallet
    pub wallet_address: String,
    /// Destination
    pub to_address: String,
    /// Amount in nanotons
    pub amount: String,
    /// Optional text comment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl TransferParams {
    /// Transfer of `amount` nanotons from `wallet_address` to `to_address`
    pub fn new(
        wallet_address: impl Into<String>,
        to_address: impl Into<String>,
        amount: impl Into<String>,
    ) -> Self {
        Self {
            wallet_address: wallet_address.into(),
            to_address: to_address.into(),
            amount: amount.into(),
            comment: None,
        }
    }

    /// Attaches a comment
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Checks the amount is a positive integer
    pub fn validate(&self) -> Result<()> {
        match self.amount.parse::<u128>() {
            Ok(0) | Err(_) => Err(WalletKitError::bridge(format!(
                "Invalid transfer amount '{}'",
                self.amount
            ))),
            Ok(_) => Ok(()),
        }
    }
}

/// A wallet the host re-adds after every initialization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletRecord {
    /// Address reported when the wallet was added
    pub address: String,
    /// Mnemonic words
    pub mnemonic: Vec<String>,
    /// Display name
    #[serde(default)]
    pub name: Option<String>,
    /// Network the wallet belongs to
    pub network: TonNetwork,
    /// Contract version
    pub version: String,
    /// When the wallet was added
    pub created_at: DateTime<Utc>,
}

const RECORDS_KEY: &str = "wallets";

/// Wallet records kept in the host's key-value store.
///
/// Updates are read-modify-write and run one at a time.
#[derive(Clone)]
pub struct WalletRecordStore {
    kv: Arc<dyn KeyValueStore>,
    update: Arc<Mutex<()>>,
}

impl WalletRecordStore {
    /// Uses `kv` for persistence
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            update: Arc::new(Mutex::new(())),
        }
    }

    /// Every stored record
    pub async fn load(&self) -> Result<Vec<WalletRecord>> {
        let kv = Arc::clone(&self.kv);
        blocking(move || read_records(kv.as_ref())).await
    }

    /// Stores a record, replacing one with the same address
    pub async fn upsert(&self, record: WalletRecord) -> Result<()> {
        let _update = self.update.lock().await;
        let kv = Arc::clone(&self.kv);
        blocking(move || {
            let mut records = read_records(kv.as_ref())?;
            records.retain(|r| r.address != record.address);
            records.push(record);
            write_records(kv.as_ref(), &records)
        })
        .await
    }

    /// Deletes the record for `address`, returning whether one existed
    pub async fn remove(&self, address: &str) -> Result<bool> {
        let _update = self.update.lock().await;
        let kv = Arc::clone(&self.kv);
        let address = address.to_string();
        blocking(move || {
            let mut records = read_records(kv.as_ref())?;
            let before = records.len();
            records.retain(|r| r.address != address);
            if records.len() == before {
                return Ok(false);
            }
            write_records(kv.as_ref(), &records)?;
            Ok(true)
        })
        .await
    }
}

impl std::fmt::Debug for WalletRecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletRecordStore").finish_non_exhaustive()
    }
}

fn read_records(kv: &dyn KeyValueStore) -> Result<Vec<WalletRecord>> {
    match kv.get(RECORDS_KEY)? {
        Some(text) => serde_json::from_str(&text)
            .map_err(|e| WalletKitError::storage(format!("Corrupt wallet records: {e}"))),
        None => Ok(Vec::new()),
    }
}

fn write_records(kv: &dyn KeyValueStore, records: &[WalletRecord]) -> Result<()> {
    kv.set(RECORDS_KEY, &serde_json::to_string(records)?)
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| WalletKitError::storage(format!("Storage task failed: {e}")))?
}

fn lenient_string<'de, D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("expected string or number, got {other}"))),
    }
}

fn lenient_opt_string<'de, D: serde::Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// Reads a list out of a call result: the result itself, `items`, or `key`
pub(crate) fn result_list(result: &Value, key: &str) -> Vec<Value> {
    [Some(result), result.get("items"), result.get(key)]
        .into_iter()
        .flatten()
        .find_map(|v| v.as_array().cloned())
        .unwrap_or_default()
}

/// Decodes every element that matches `T`, logging the rest
pub(crate) fn decode_list<T: serde::de::DeserializeOwned>(items: Vec<Value>, what: &str) -> Vec<T> {
    items
        .into_iter()
        .filter_map(|item| match serde_json::from_value(item) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                tracing::warn!(error = %e, kind = what, "Skipping malformed entry");
                None
            }
        })
        .collect()
}
