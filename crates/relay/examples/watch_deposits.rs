//! Example: watch a bridge contract and print one-line JSON per confirmed deposit.
//!
//! Runs the scheduler against an in-memory replay guard (state is lost on exit) with a
//! destination action that prints instead of minting. Works with local chains e.g. Anvil.
//!
//! Usage:
//!
//!   cargo run -p relay --example watch_deposits -- --http-url <HTTP_URL> --contract <BRIDGE_ADDRESS>
//!
//! Options:
//!   --from <N>    First block to scan. Default: a few blocks behind the confirmed tip.
//!   --depth <K>   Confirmations before an event is relayed. Default: 12.

use async_trait::async_trait;
use relay::{
    event_topic, genesis_watermark, Ack, ActionError, DestinationAction, JsonRpcGateway,
    LedgerGateway, MemoryReplayGuard, ProcessedEvent, ScanSettings, SchedulerBuilder,
    DEFAULT_EVENT_SIGNATURE,
};
use std::sync::Arc;
use std::time::Duration;

struct PrintAction;

#[async_trait]
impl DestinationAction for PrintAction {
    async fn submit(&self, event: &ProcessedEvent) -> Result<Ack, ActionError> {
        let line = serde_json::json!({
            "key": event.key.to_string(),
            "block": event.block_number,
            "sender": event.sender.to_string(),
            "recipient": event.recipient.to_string(),
            "token": event.source_token.to_string(),
            "amount": event.amount.to_string(),
            "destination_chain_id": event.destination_chain_id.to_string(),
            "nonce": event.nonce.to_string(),
        });
        println!("{}", line);
        Ok(Ack {
            reference: format!("stdout:{}", event.key),
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let args: Vec<String> = std::env::args().collect();
    let mut http_url = String::new();
    let mut contract = String::new();
    let mut from: Option<u64> = None;
    let mut depth: u64 = 12;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--http-url" => {
                i += 1;
                http_url = args.get(i).cloned().unwrap_or_default();
            }
            "--contract" => {
                i += 1;
                contract = args.get(i).cloned().unwrap_or_default();
            }
            "--from" => {
                i += 1;
                from = args.get(i).and_then(|s| s.parse().ok());
            }
            "--depth" => {
                i += 1;
                if let Some(s) = args.get(i) {
                    depth = s.parse().unwrap_or(12);
                }
            }
            "--help" | "-h" => {
                eprintln!(
                    "Usage: watch_deposits --http-url <HTTP_URL> --contract <BRIDGE_ADDRESS> [--from N] [--depth K]\n\
                     Prints one-line JSON per confirmed TokensLocked event.\n\
                     --from N   First block to scan. Optional.\n\
                     --depth K  Confirmations before relaying. Default: 12."
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }
    if http_url.is_empty() || contract.is_empty() {
        eprintln!("Usage: watch_deposits --http-url <HTTP_URL> --contract <BRIDGE_ADDRESS> [--from N] [--depth K]");
        std::process::exit(1);
    }
    let contract_address = match relay::abi::parse_address(&contract) {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("--contract: {}", e);
            std::process::exit(1);
        }
    };

    let gateway: Arc<dyn LedgerGateway> =
        Arc::new(JsonRpcGateway::new(&http_url, Duration::from_secs(10))?);
    let watermark = genesis_watermark(gateway.as_ref(), from, depth).await?;
    let scheduler = SchedulerBuilder::new()
        .gateway(gateway)
        .guard(Arc::new(MemoryReplayGuard::new(watermark)))
        .action(Arc::new(PrintAction))
        .contract_address(contract_address)
        .event_topic(event_topic(DEFAULT_EVENT_SIGNATURE))
        .settings(ScanSettings {
            confirmations: depth,
            poll_interval: Duration::from_secs(2),
            ..ScanSettings::default()
        })
        .build()?;

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = stop_tx.send(true);
    });
    scheduler.run(stop_rx).await?;
    Ok(())
}
