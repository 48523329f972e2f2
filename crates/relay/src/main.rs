//! Relay binary: load config, open the persisted state, and run the scan loop until Ctrl-C
//! or SIGTERM.
//!
//! Usage: relay --config relay.yaml [--once]

use anyhow::Context;
use clap::Parser;
use relay::{
    genesis_watermark, EnrichmentPolicy, FileReplayGuard, HttpPriceSource, JsonRpcGateway,
    LedgerGateway, LoggingAction, RelayConfig, ScanSettings, SchedulerBuilder,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "relay", about = "Relay confirmed bridge deposits to the destination chain")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long, short, default_value = "relay.yaml")]
    config: PathBuf,

    /// Run a single cycle and exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("relay=info")),
        )
        .init();
    let args = Args::parse();
    let config = RelayConfig::from_file(&args.config)?;
    let contract = config.contract_address()?;

    let gateway: Arc<dyn LedgerGateway> = Arc::new(
        JsonRpcGateway::new(&config.source_rpc_url, Duration::from_secs(config.rpc_timeout_secs))
            .context("build source RPC client")?,
    );

    let scope = config.state_scope()?;
    let guard = match FileReplayGuard::load(&config.state_file, &scope).await? {
        Some(guard) => guard,
        None => {
            let watermark =
                genesis_watermark(gateway.as_ref(), config.start_block, config.confirmations)
                    .await
                    .context("determine first block to scan")?;
            FileReplayGuard::create(&config.state_file, &scope, watermark).await?
        }
    };

    let mut builder = SchedulerBuilder::new()
        .gateway(Arc::clone(&gateway))
        .guard(Arc::new(guard))
        .action(Arc::new(LoggingAction::new(&config.destination_rpc_url)))
        .contract_address(contract)
        .event_topic(config.topic0())
        .settings(ScanSettings::from_config(&config));
    if let Some(price) = &config.price {
        let timeout = Duration::from_secs(price.timeout_secs);
        let source = HttpPriceSource::new(&price.api_url, &price.platform, timeout)
            .context("build price client")?;
        builder = builder.price_source(
            Arc::new(source),
            EnrichmentPolicy {
                timeout,
                strict: config.enrichment_strict,
                token_decimals: price.token_decimals,
            },
        );
    }
    let scheduler = builder.build()?;

    tracing::info!(
        contract = %contract,
        event = %config.event_signature,
        state_file = %config.state_file.display(),
        "bridge relay configured"
    );

    if args.once {
        let outcome = scheduler.run_cycle().await?;
        tracing::info!(?outcome, "single cycle complete");
        return Ok(());
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_stop_signal().await;
        tracing::info!("stop signal received, shutting down");
        let _ = stop_tx.send(true);
    });
    scheduler.run(stop_rx).await?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_stop_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(reason = %e, "cannot install SIGTERM handler, Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_stop_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
