//! Configuration

use crate::Cli;
use anyhow::Context;
use std::path::{Path, PathBuf};
use walletkit_bridge::WalletKitConfig;

const CONFIG_FILE: &str = "config.json";
const BUNDLE_FILE: &str = "walletkit.js";

/// Paths and configuration resolved from flags and the data directory
#[derive(Debug, Clone)]
pub struct CliSettings {
    pub data_dir: PathBuf,
    pub bundle: PathBuf,
    pub config: WalletKitConfig,
}

impl CliSettings {
    pub fn resolve(cli: &Cli) -> anyhow::Result<Self> {
        let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("creating {}", data_dir.display()))?;

        let bundle = cli
            .bundle
            .clone()
            .unwrap_or_else(|| data_dir.join(BUNDLE_FILE));
        let config = match &cli.config {
            Some(path) => WalletKitConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => load_or_create(&data_dir.join(CONFIG_FILE))?,
        };
        config.validate()?;

        Ok(Self {
            data_dir,
            bundle,
            config,
        })
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("walletkit")
}

/// Loads the data directory config, writing a testnet default on first run
fn load_or_create(path: &Path) -> anyhow::Result<WalletKitConfig> {
    if path.exists() {
        return WalletKitConfig::load(path).with_context(|| format!("loading {}", path.display()));
    }
    let config = WalletKitConfig::testnet();
    if let Err(e) = config.save(path) {
        tracing::warn!(path = %path.display(), error = %e, "Could not write default config");
    }
    Ok(config)
}
