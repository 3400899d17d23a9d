//! Bridge configuration

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;
use walletkit_error::{Result, WalletKitError};
use walletkit_resilience::ReplayPolicy;

/// TON network the script bundle talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TonNetwork {
    /// TON Mainnet
    #[default]
    Mainnet,
    /// TON Testnet
    Testnet,
}

impl TonNetwork {
    /// TonConnect chain id
    pub fn chain_id(&self) -> &'static str {
        match self {
            TonNetwork::Mainnet => "-239",
            TonNetwork::Testnet => "-3",
        }
    }

    /// Default TON Center API endpoint
    pub fn api_url(&self) -> &'static str {
        match self {
            TonNetwork::Mainnet => "https://toncenter.com",
            TonNetwork::Testnet => "https://testnet.toncenter.com",
        }
    }

    /// Parses a network name or TonConnect chain id
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mainnet" | "-239" => Some(TonNetwork::Mainnet),
            "testnet" | "-3" => Some(TonNetwork::Testnet),
            _ => None,
        }
    }
}

impl std::fmt::Display for TonNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TonNetwork::Mainnet => write!(f, "mainnet"),
            TonNetwork::Testnet => write!(f, "testnet"),
        }
    }
}

/// Wallet manifest advertised to dApps during TonConnect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletManifest {
    /// Wallet name
    pub name: String,
    /// Application name (`appName` in TonConnect device info)
    pub app_name: String,
    /// Icon URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// About page URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub about_url: Option<String>,
    /// Universal link for TonConnect
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub universal_url: Option<String>,
    /// Supported platforms
    #[serde(default)]
    pub platforms: Vec<String>,
}

impl Default for WalletManifest {
    fn default() -> Self {
        Self {
            name: "walletkit".to_string(),
            app_name: "walletkit".to_string(),
            image_url: None,
            about_url: None,
            universal_url: None,
            platforms: vec!["linux".to_string(), "macos".to_string(), "windows".to_string()],
        }
    }
}

/// Device description sent with TonConnect replies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Operating system name
    pub platform: String,
    /// Application name
    pub app_name: String,
    /// Application version
    pub app_version: String,
    /// Highest supported TonConnect protocol version
    pub max_protocol_version: u32,
    /// Supported features, passed through verbatim
    #[serde(default)]
    pub features: Vec<Value>,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            platform: std::env::consts::OS.to_string(),
            app_name: "walletkit".to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            max_protocol_version: 2,
            features: vec![Value::from("SendTransaction")],
        }
    }
}

/// Configuration handed to the script's `init` call.
///
/// `call_timeout` and `replay` stay on the host and are never sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletKitConfig {
    /// Network to operate on
    #[serde(default)]
    pub network: TonNetwork,
    /// API endpoint override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    /// API key for the endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// TonConnect HTTP bridge URL
    #[serde(default = "default_bridge_url")]
    pub bridge_url: String,
    /// Name of this wallet on the TonConnect bridge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge_name: Option<String>,
    /// Wallet manifest
    #[serde(default)]
    pub wallet_manifest: WalletManifest,
    /// Device info
    #[serde(default)]
    pub device_info: DeviceInfo,
    /// Default deadline for calls issued through the engine
    #[serde(skip)]
    pub call_timeout: Option<Duration>,
    /// Bounds for replaying undelivered events.
    ///
    /// Read once by [`EngineOptions::with_config`](crate::EngineOptions::with_config)
    /// when the engine starts; the copy passed to `init` is not applied.
    #[serde(skip)]
    pub replay: ReplayPolicy,
}

fn default_bridge_url() -> String {
    "https://bridge.tonapi.io/bridge".to_string()
}

impl Default for WalletKitConfig {
    fn default() -> Self {
        Self {
            network: TonNetwork::default(),
            api_url: None,
            api_key: None,
            bridge_url: default_bridge_url(),
            bridge_name: None,
            wallet_manifest: WalletManifest::default(),
            device_info: DeviceInfo::default(),
            call_timeout: None,
            replay: ReplayPolicy::default(),
        }
    }
}

impl WalletKitConfig {
    /// Creates a configuration for `network`
    pub fn new(network: TonNetwork) -> Self {
        Self {
            network,
            ..Self::default()
        }
    }

    /// Creates a testnet configuration
    pub fn testnet() -> Self {
        Self::new(TonNetwork::Testnet)
    }

    /// Sets the API endpoint
    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = Some(url.into());
        self
    }

    /// Sets the API key
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Sets the TonConnect bridge URL
    pub fn with_bridge_url(mut self, url: impl Into<String>) -> Self {
        self.bridge_url = url.into();
        self
    }

    /// Sets the TonConnect bridge name
    pub fn with_bridge_name(mut self, name: impl Into<String>) -> Self {
        self.bridge_name = Some(name.into());
        self
    }

    /// Sets the wallet manifest
    pub fn with_manifest(mut self, manifest: WalletManifest) -> Self {
        self.wallet_manifest = manifest;
        self
    }

    /// Sets a default deadline for engine calls
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Sets the replay policy
    pub fn with_replay_policy(mut self, policy: ReplayPolicy) -> Self {
        self.replay = policy;
        self
    }

    /// Effective API endpoint
    pub fn effective_api_url(&self) -> &str {
        self.api_url
            .as_deref()
            .unwrap_or_else(|| self.network.api_url())
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        parse_url("bridgeUrl", &self.bridge_url)?;
        if let Some(url) = &self.api_url {
            parse_url("apiUrl", url)?;
        }
        for (field, url) in [
            ("walletManifest.imageUrl", &self.wallet_manifest.image_url),
            ("walletManifest.aboutUrl", &self.wallet_manifest.about_url),
            ("walletManifest.universalUrl", &self.wallet_manifest.universal_url),
        ] {
            if let Some(url) = url {
                parse_url(field, url)?;
            }
        }
        if self.wallet_manifest.name.trim().is_empty() {
            return Err(WalletKitError::Config("walletManifest.name is empty".into()));
        }
        Ok(())
    }

    /// The JSON object passed to the script's `init` method
    pub fn to_init_params(&self) -> Result<Value> {
        let mut params = serde_json::to_value(self)?;
        params["chainId"] = Value::from(self.network.chain_id());
        params["apiUrl"] = Value::from(self.effective_api_url());
        Ok(params)
    }

    /// Loads a configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            WalletKitError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|e| {
            WalletKitError::Config(format!("Invalid config {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Saves the configuration as pretty JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|e| {
            WalletKitError::Config(format!("Failed to write {}: {e}", path.display()))
        })
    }
}

fn parse_url(field: &str, value: &str) -> Result<Url> {
    Url::parse(value).map_err(|e| WalletKitError::Config(format!("{field}: invalid URL '{value}': {e}")))
}

/// Where the script bundle is read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleSource {
    /// Bundle text held in memory
    Inline {
        /// Script source
        source: String,
        /// Name used in stack traces
        filename: String,
    },
    /// Bundle read from disk at startup
    File(PathBuf),
}

impl BundleSource {
    /// In-memory bundle named `filename`
    pub fn inline(source: impl Into<String>, filename: impl Into<String>) -> Self {
        BundleSource::Inline {
            source: source.into(),
            filename: filename.into(),
        }
    }

    /// Name used in stack traces
    pub fn filename(&self) -> String {
        match self {
            BundleSource::Inline { filename, .. } => filename.clone(),
            BundleSource::File(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "walletkit.js".to_string()),
        }
    }

    /// Reads the bundle text
    pub async fn load(&self) -> Result<String> {
        match self {
            BundleSource::Inline { source, .. } => Ok(source.clone()),
            BundleSource::File(path) => tokio::fs::read_to_string(path).await.map_err(|e| {
                WalletKitError::transport(format!("Failed to read bundle {}: {e}", path.display()))
            }),
        }
    }
}
