//! WalletKit CLI
//!
//! Runs the TON WalletKit bundle in a Node.js script host and exposes its
//! wallet, transaction and TonConnect operations as subcommands.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use config::CliSettings;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use walletkit_bridge::{
    BundleSource, EngineOptions, FileStore, ProcessHostConfig, ProcessScriptHost, StorageHandles,
    WalletKitEngine,
};

#[derive(Debug, Parser)]
#[command(name = "walletkit", version, about = "TON WalletKit host")]
pub struct Cli {
    /// WalletKit script bundle [default: <data-dir>/walletkit.js]
    #[arg(long, global = true)]
    pub bundle: Option<PathBuf>,

    /// Configuration file [default: <data-dir>/config.json]
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory for wallet records and pending events
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Node.js executable
    #[arg(long, global = true)]
    pub node: Option<PathBuf>,

    /// Log at debug level
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// List wallets
    Wallets,
    /// Add a wallet from a mnemonic phrase
    AddWallet {
        /// Space separated mnemonic words
        #[arg(long)]
        mnemonic: String,
        /// Display name
        #[arg(long)]
        name: Option<String>,
        /// Wallet contract version
        #[arg(long)]
        version: Option<String>,
    },
    /// Remove a wallet
    RemoveWallet { address: String },
    /// Show a wallet's balance
    State { address: String },
    /// Show recent native transactions
    Transactions {
        address: String,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Handle a TonConnect link
    Connect {
        url: String,
        /// Wallet to connect [default: first wallet]
        #[arg(long)]
        wallet: Option<String>,
        /// Approve instead of reject
        #[arg(long)]
        approve: bool,
    },
    /// List TonConnect sessions
    Sessions,
    /// Disconnect one session, or all of them
    Disconnect { session_id: Option<String> },
    /// Print events until Ctrl-C
    Watch,
}

fn init_tracing(verbose: bool) {
    let filter = match verbose {
        true => EnvFilter::new("debug"),
        false => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = CliSettings::resolve(&cli)?;
    tracing::debug!(data_dir = %settings.data_dir.display(), bundle = %settings.bundle.display(), "Starting WalletKit");

    let store = Arc::new(FileStore::open(&settings.data_dir)?);
    let mut host_config = ProcessHostConfig::default();
    if let Some(node) = &cli.node {
        host_config = host_config.with_node_path(node);
    }
    let host = Arc::new(ProcessScriptHost::spawn(host_config)?);
    let options = EngineOptions::new(BundleSource::File(settings.bundle.clone()))
        .with_config(settings.config.clone());

    let engine = WalletKitEngine::start(host, StorageHandles::from_store(store), options).await?;
    let result = match engine.init(settings.config).await {
        Ok(()) => commands::run(&engine, cli.command).await,
        Err(e) => Err(e.into()),
    };
    engine.destroy().await;
    result
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
