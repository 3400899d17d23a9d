//! Subcommand handlers

use crate::Command;
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use walletkit_bridge::{ConnectRequest, WalletKitEngine, WalletKitEvent};

const CONNECT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CLI_REJECT_REASON: &str = "Rejected from walletkit CLI";

pub async fn run(engine: &WalletKitEngine, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Wallets => {
            let wallets = engine.get_wallets().await?;
            if wallets.is_empty() {
                println!("No wallets");
            }
            for wallet in wallets {
                println!(
                    "{}  {}",
                    wallet.address,
                    wallet.version.as_deref().unwrap_or("-")
                );
            }
        }
        Command::AddWallet {
            mnemonic,
            name,
            version,
        } => {
            let words: Vec<String> = mnemonic.split_whitespace().map(str::to_string).collect();
            let account = engine
                .add_wallet_from_mnemonic(&words, name.as_deref(), version.as_deref())
                .await?;
            println!("Added {}", account.address);
        }
        Command::RemoveWallet { address } => {
            engine.remove_wallet(&address).await?;
            println!("Removed {address}");
        }
        Command::State { address } => {
            let state = engine.get_wallet_state(&address).await?;
            println!("{address}: {} nanoton", state.balance);
        }
        Command::Transactions { address, limit } => {
            for tx in engine.get_recent_transactions(&address, limit).await? {
                println!(
                    "{}  {:?}  {}  {}",
                    tx.timestamp_ms / 1000,
                    tx.transaction_type,
                    tx.amount,
                    tx.comment.unwrap_or_default()
                );
            }
        }
        Command::Connect {
            url,
            wallet,
            approve,
        } => connect(engine, &url, wallet, approve).await?,
        Command::Sessions => {
            for session in engine.list_sessions().await? {
                println!(
                    "{}  {}  {}",
                    session.session_id, session.dapp_name, session.wallet_address
                );
            }
        }
        Command::Disconnect { session_id } => {
            engine.disconnect_session(session_id.as_deref()).await?;
            println!("Disconnected");
        }
        Command::Watch => watch(engine).await?,
    }
    Ok(())
}

async fn connect(
    engine: &WalletKitEngine,
    url: &str,
    wallet: Option<String>,
    approve: bool,
) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<ConnectRequest>();
    let handler = engine.add_event_handler(Arc::new(move |event: &WalletKitEvent| {
        if let WalletKitEvent::ConnectRequest(request) = event {
            tx.send(request.clone())
                .map_err(|_| anyhow::anyhow!("connect command finished"))?;
        }
        Ok(())
    }));

    engine.handle_ton_connect_url(url).await?;
    let request = tokio::time::timeout(CONNECT_REQUEST_TIMEOUT, rx.recv())
        .await
        .context("timed out waiting for the connect request")?
        .context("event handler stopped")?;
    engine.remove_event_handler(handler);

    let dapp = request
        .dapp_info()
        .and_then(|d| d.name.clone())
        .unwrap_or_else(|| "unknown dApp".to_string());
    println!("Connect request {} from {dapp}", request.id());

    if !approve {
        engine.reject_connect(&request, Some(CLI_REJECT_REASON)).await?;
        println!("Rejected");
        return Ok(());
    }

    let wallet = match wallet {
        Some(wallet) => wallet,
        None => engine
            .get_wallets()
            .await?
            .into_iter()
            .next()
            .map(|w| w.address)
            .context("no wallet to connect; add one with `walletkit add-wallet`")?,
    };
    engine.approve_connect(&request, &wallet).await?;
    println!("Connected {wallet} to {dapp}");
    Ok(())
}

async fn watch(engine: &WalletKitEngine) -> anyhow::Result<()> {
    engine.add_event_handler(Arc::new(|event: &WalletKitEvent| {
        println!("{}", describe(event));
        Ok(())
    }));
    println!("Watching for events, Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    Ok(())
}

fn describe(event: &WalletKitEvent) -> String {
    match event {
        WalletKitEvent::Ready(info) => format!(
            "ready  network={}",
            info.network.as_deref().unwrap_or("-")
        ),
        WalletKitEvent::ConnectRequest(request) => format!(
            "connectRequest  id={}  dapp={}",
            request.id(),
            request
                .dapp_info()
                .and_then(|d| d.name.as_deref())
                .unwrap_or("-")
        ),
        WalletKitEvent::TransactionRequest(request) => format!(
            "transactionRequest  id={}  to={}  amount={}",
            request.id(),
            request.recipient().unwrap_or_default(),
            request.amount().unwrap_or_default()
        ),
        WalletKitEvent::SignDataRequest(request) => format!(
            "signDataRequest  id={}  type={}",
            request.id(),
            request.payload_type().unwrap_or("-")
        ),
        WalletKitEvent::Disconnect { session_id } => format!("disconnect  session={session_id}"),
        WalletKitEvent::StateChanged { address } => format!(
            "stateChanged  address={}",
            address.as_deref().unwrap_or("-")
        ),
        WalletKitEvent::SessionsChanged => "sessionsChanged".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use walletkit_bridge::ReadyInfo;

    #[test]
    fn test_describe_events() {
        let ready = WalletKitEvent::Ready(ReadyInfo {
            network: Some("testnet".to_string()),
            ..ReadyInfo::default()
        });
        assert_eq!(describe(&ready), "ready  network=testnet");
        assert_eq!(
            describe(&WalletKitEvent::Disconnect {
                session_id: "s1".to_string()
            }),
            "disconnect  session=s1"
        );
        assert_eq!(describe(&WalletKitEvent::SessionsChanged), "sessionsChanged");
    }
}
