//! Scan scheduler: drives the relay one cycle at a time.
//!
//! A cycle reads the chain tip, derives a [ScanWindow] that stays `confirmations` blocks behind
//! it, fetches the window's logs, and walks them in `(block_number, log_index)` order through
//! the processor, the destination action and the replay guard. The watermark moves to the end
//! of the window only after every event in it was relayed, recognized as a duplicate, or
//! explicitly skipped. Any abort leaves the watermark where it was, so the same window is
//! fetched again next cycle and already-committed keys are filtered out.

use crate::action::{ActionError, DestinationAction};
use crate::config::{ActionFailurePolicy, BackoffConfig, RelayConfig};
use crate::cursor::EventKey;
use crate::enrich::PriceSource;
use crate::gateway::{GatewayError, LedgerGateway};
use crate::processor::{EnrichmentPolicy, EventProcessor, ProcessError, Processed, ProcessedEvent};
use crate::replay::{BoundedGuard, GuardError, ReplayGuard};
use alloy::primitives::{Address, B256};
use futures_util::stream::{self, StreamExt};
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Blocks behind the confirmed tip to start from on a first-ever run without `start_block`.
pub const FIRST_RUN_LOOKBACK: u64 = 10;

/// Inclusive block range scanned in one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanWindow {
    pub from_block: u64,
    pub to_block: u64,
}

impl ScanWindow {
    /// Next window after `watermark`, or `None` if no confirmed block lies beyond it.
    ///
    /// `to_block <= latest_height - confirmations` and `len() <= max_window_size`.
    pub fn next(
        watermark: u64,
        latest_height: u64,
        confirmations: u64,
        max_window_size: u64,
    ) -> Option<Self> {
        let safe_height = latest_height.checked_sub(confirmations)?;
        if safe_height <= watermark || max_window_size == 0 {
            return None;
        }
        let from_block = watermark + 1;
        let to_block = safe_height.min(watermark.saturating_add(max_window_size));
        Some(Self {
            from_block,
            to_block,
        })
    }

    #[allow(clippy::len_without_is_empty)] // a window always holds at least one block
    pub fn len(&self) -> u64 {
        self.to_block - self.from_block + 1
    }

    pub fn contains(&self, block: u64) -> bool {
        (self.from_block..=self.to_block).contains(&block)
    }
}

impl fmt::Display for ScanWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.from_block, self.to_block)
    }
}

/// Successful cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing confirmed beyond the watermark.
    NoWork { latest_height: u64, watermark: u64 },
    /// The window was walked and the watermark moved to `window.to_block`.
    Advanced { window: ScanWindow, tally: Tally },
}

/// Per-window counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    /// Acknowledged by the destination and committed.
    pub relayed: usize,
    /// Already committed in an earlier cycle.
    pub duplicates: usize,
    /// Rejected as invalid.
    pub skipped: usize,
    /// Rejected because strict enrichment found no price.
    pub rejected: usize,
    /// Destination did not acknowledge (only under [ActionFailurePolicy::Advance]).
    pub failed_actions: usize,
}

pub type CycleResult = Result<CycleOutcome, RelayError>;

/// Error classification used for logging and for deciding whether the loop may continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    RpcConnection,
    InvalidEvent,
    EventProcessing,
    StateStore,
    DestinationAction,
    WatermarkMonotonicity,
    Config,
}

impl ProcessError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProcessError::Invalid { .. } => ErrorKind::InvalidEvent,
            ProcessError::Enrichment { .. } => ErrorKind::EventProcessing,
            ProcessError::Store(GuardError::WatermarkRegression(_)) => {
                ErrorKind::WatermarkMonotonicity
            }
            ProcessError::Store(_) => ErrorKind::StateStore,
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("RPC connection error: {0}")]
    Rpc(#[from] GatewayError),
    #[error("state store error: {0}")]
    StateStore(GuardError),
    #[error("destination action failed for event {key}: {source}")]
    Action {
        key: EventKey,
        #[source]
        source: ActionError,
    },
    #[error("watermark monotonicity violated: current {current}, requested {requested}")]
    WatermarkRegression { current: u64, requested: u64 },
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<GuardError> for RelayError {
    fn from(e: GuardError) -> Self {
        match e {
            GuardError::WatermarkRegression(r) => RelayError::WatermarkRegression {
                current: r.current,
                requested: r.requested,
            },
            other => RelayError::StateStore(other),
        }
    }
}

impl RelayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::Rpc(_) => ErrorKind::RpcConnection,
            RelayError::StateStore(_) => ErrorKind::StateStore,
            RelayError::Action { .. } => ErrorKind::DestinationAction,
            RelayError::WatermarkRegression { .. } => ErrorKind::WatermarkMonotonicity,
            RelayError::Config(_) => ErrorKind::Config,
        }
    }

    /// Only a watermark regression stops the loop: it means the state is corrupt.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RelayError::WatermarkRegression { .. })
    }
}

/// Tunables of the scan loop.
#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub confirmations: u64,
    pub max_window_size: u64,
    pub poll_interval: Duration,
    pub rpc_timeout: Duration,
    pub store_timeout: Duration,
    pub processing_concurrency: usize,
    pub action_failure_policy: ActionFailurePolicy,
    pub backoff: BackoffConfig,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            confirmations: 12,
            max_window_size: 1000,
            poll_interval: Duration::from_secs(10),
            rpc_timeout: Duration::from_secs(10),
            store_timeout: Duration::from_secs(5),
            processing_concurrency: 4,
            action_failure_policy: ActionFailurePolicy::Advance,
            backoff: BackoffConfig::default(),
        }
    }
}

impl ScanSettings {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            confirmations: config.confirmations,
            max_window_size: config.max_window_size,
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            rpc_timeout: Duration::from_secs(config.rpc_timeout_secs),
            store_timeout: Duration::from_secs(config.store_timeout_secs),
            processing_concurrency: config.processing_concurrency,
            action_failure_policy: config.action_failure_policy,
            backoff: config.backoff.clone(),
        }
    }
}

/// Watermark to initialize a fresh state with: `start_block - 1`, or a short distance behind
/// the confirmed tip when no start block is configured.
///
/// The watermark counts blocks already scanned, so scanning starts at block 1 at the
/// earliest. `start_block: 0` is treated as 1: the genesis block carries no transactions and
/// therefore no logs.
pub async fn genesis_watermark(
    gateway: &dyn LedgerGateway,
    start_block: Option<u64>,
    confirmations: u64,
) -> Result<u64, RelayError> {
    if let Some(start) = start_block {
        if start == 0 {
            tracing::info!("start_block 0 is the genesis block, scanning from block 1");
        }
        return Ok(start.saturating_sub(1));
    }
    let latest = gateway.latest_height().await?;
    let start = latest
        .saturating_sub(confirmations)
        .saturating_sub(FIRST_RUN_LOOKBACK);
    tracing::info!(latest, start, "no start block configured, starting behind the confirmed tip");
    Ok(start.saturating_sub(1))
}

/// Builder for the scheduler.
pub struct SchedulerBuilder {
    gateway: Option<Arc<dyn LedgerGateway>>,
    guard: Option<Arc<dyn ReplayGuard>>,
    action: Option<Arc<dyn DestinationAction>>,
    price_source: Option<(Arc<dyn PriceSource>, EnrichmentPolicy)>,
    contract_address: Option<Address>,
    topic0: Option<B256>,
    settings: ScanSettings,
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        Self {
            gateway: None,
            guard: None,
            action: None,
            price_source: None,
            contract_address: None,
            topic0: None,
            settings: ScanSettings::default(),
        }
    }

    pub fn gateway(mut self, gateway: Arc<dyn LedgerGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn guard(mut self, guard: Arc<dyn ReplayGuard>) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn action(mut self, action: Arc<dyn DestinationAction>) -> Self {
        self.action = Some(action);
        self
    }

    pub fn price_source(mut self, source: Arc<dyn PriceSource>, policy: EnrichmentPolicy) -> Self {
        self.price_source = Some((source, policy));
        self
    }

    pub fn contract_address(mut self, addr: Address) -> Self {
        self.contract_address = Some(addr);
        self
    }

    /// topic0 of the watched event, usually `event_topic(signature)`.
    pub fn event_topic(mut self, topic0: B256) -> Self {
        self.topic0 = Some(topic0);
        self
    }

    pub fn settings(mut self, settings: ScanSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> Result<Scheduler, RelayError> {
        let gateway = self
            .gateway
            .ok_or_else(|| RelayError::Config("gateway required".into()))?;
        let guard = self
            .guard
            .ok_or_else(|| RelayError::Config("replay guard required".into()))?;
        let action = self
            .action
            .ok_or_else(|| RelayError::Config("destination action required".into()))?;
        let contract = self
            .contract_address
            .ok_or_else(|| RelayError::Config("contract_address required".into()))?;
        let topic0 = self
            .topic0
            .ok_or_else(|| RelayError::Config("event topic required".into()))?;
        if self.settings.max_window_size == 0 {
            return Err(RelayError::Config("max_window_size must be > 0".into()));
        }
        if self.settings.processing_concurrency == 0 {
            return Err(RelayError::Config("processing_concurrency must be > 0".into()));
        }
        let guard: Arc<dyn ReplayGuard> =
            Arc::new(BoundedGuard::new(guard, self.settings.store_timeout));
        let mut processor = EventProcessor::new(contract, topic0, Arc::clone(&guard));
        if let Some((source, policy)) = self.price_source {
            processor = processor.with_enrichment(source, policy);
        }
        Ok(Scheduler {
            gateway,
            guard,
            processor,
            action,
            contract,
            topic0,
            settings: self.settings,
        })
    }
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Scan scheduler. Single writer of the relay state; do not run two against the same store.
pub struct Scheduler {
    gateway: Arc<dyn LedgerGateway>,
    guard: Arc<dyn ReplayGuard>,
    processor: EventProcessor,
    action: Arc<dyn DestinationAction>,
    contract: Address,
    topic0: B256,
    settings: ScanSettings,
}

impl Scheduler {
    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }

    /// Run one scan cycle.
    pub async fn run_cycle(&self) -> CycleResult {
        let latest_height = self.rpc(self.gateway.latest_height()).await?;
        let watermark = self.guard.watermark().await?;
        let Some(window) = ScanWindow::next(
            watermark,
            latest_height,
            self.settings.confirmations,
            self.settings.max_window_size,
        ) else {
            tracing::debug!(latest_height, watermark, "no new confirmed blocks");
            return Ok(CycleOutcome::NoWork {
                latest_height,
                watermark,
            });
        };

        tracing::info!(
            from = window.from_block,
            to = window.to_block,
            latest_height,
            "scanning window"
        );
        match self.scan(window).await {
            Ok(tally) => {
                tracing::info!(
                    from = window.from_block,
                    to = window.to_block,
                    relayed = tally.relayed,
                    duplicates = tally.duplicates,
                    skipped = tally.skipped,
                    rejected = tally.rejected,
                    failed_actions = tally.failed_actions,
                    "window complete, watermark advanced"
                );
                Ok(CycleOutcome::Advanced { window, tally })
            }
            Err(e) => {
                tracing::warn!(
                    from = window.from_block,
                    to = window.to_block,
                    kind = ?e.kind(),
                    reason = %e,
                    "cycle aborted, window will be retried"
                );
                Err(e)
            }
        }
    }

    async fn scan(&self, window: ScanWindow) -> Result<Tally, RelayError> {
        let mut raws = self
            .rpc(self.gateway.get_logs(
                self.contract,
                self.topic0,
                window.from_block,
                window.to_block,
            ))
            .await?;
        raws.retain(|raw| {
            let inside = window.contains(raw.block_number);
            if !inside {
                tracing::warn!(key = %raw.key(), block = raw.block_number, "dropping log outside the requested window");
            }
            inside
        });
        raws.sort_by_key(|raw| (raw.block_number, raw.log_index, raw.tx_hash));
        // A key reported at two block numbers is not adjacent after sorting.
        let mut seen = HashSet::with_capacity(raws.len());
        raws.retain(|raw| {
            let first = seen.insert(raw.key());
            if !first {
                tracing::warn!(key = %raw.key(), block = raw.block_number, "dropping repeated log in response");
            }
            first
        });
        if !raws.is_empty() {
            tracing::debug!(count = raws.len(), "fetched raw events");
        }

        // Decoding and enrichment may overlap; delivery and commits stay in order.
        let mut tally = Tally::default();
        let mut processed = std::pin::pin!(stream::iter(raws.iter())
            .map(|raw| self.processor.process(raw))
            .buffered(self.settings.processing_concurrency));
        while let Some(result) = processed.next().await {
            match result {
                Ok(Processed::Fresh(event)) => self.deliver(event, &mut tally).await?,
                Ok(Processed::AlreadyCommitted(key)) => {
                    tracing::debug!(%key, "skipping already processed event");
                    tally.duplicates += 1;
                }
                Err(ProcessError::Invalid { key, reason }) => {
                    tracing::warn!(%key, %reason, "skipping invalid event");
                    tally.skipped += 1;
                }
                Err(ProcessError::Enrichment { key, reason }) => {
                    tracing::warn!(
                        %key,
                        %reason,
                        "rejecting event without a price (strict enrichment)"
                    );
                    tally.rejected += 1;
                }
                Err(ProcessError::Store(e)) => return Err(e.into()),
            }
        }

        self.guard.advance_watermark(window.to_block).await?;
        Ok(tally)
    }

    async fn deliver(&self, event: ProcessedEvent, tally: &mut Tally) -> Result<(), RelayError> {
        let key = event.key;
        // Lookups run ahead of commits under `buffered`, so the processor's check may be stale.
        if self.guard.is_processed(&key).await? {
            tracing::debug!(%key, "skipping event committed while in flight");
            tally.duplicates += 1;
            return Ok(());
        }
        let timeout = self.settings.rpc_timeout;
        let submitted = match tokio::time::timeout(timeout, self.action.submit(&event)).await {
            Ok(res) => res,
            Err(_) => Err(ActionError::Timeout(timeout)),
        };
        match submitted {
            Ok(ack) => {
                self.guard.commit(&key).await?;
                tally.relayed += 1;
                tracing::info!(%key, reference = %ack.reference, "relayed event");
                Ok(())
            }
            Err(e) => match self.settings.action_failure_policy {
                ActionFailurePolicy::Advance => {
                    tracing::error!(%key, reason = %e, "destination action failed, event not committed");
                    tally.failed_actions += 1;
                    Ok(())
                }
                ActionFailurePolicy::Block => Err(RelayError::Action { key, source: e }),
            },
        }
    }

    async fn rpc<T>(
        &self,
        fut: impl Future<Output = Result<T, GatewayError>>,
    ) -> Result<T, RelayError> {
        let timeout = self.settings.rpc_timeout;
        match tokio::time::timeout(timeout, fut).await {
            Ok(res) => Ok(res?),
            Err(_) => Err(GatewayError::Timeout(timeout).into()),
        }
    }

    /// Run cycles until `shutdown` changes (or its sender is dropped).
    ///
    /// The stop signal is observed between cycles, during the sleep, and while a cycle is in
    /// flight; an interrupted cycle has not advanced the watermark. Returns an error only for
    /// fatal conditions.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), RelayError> {
        tracing::info!(
            contract = %self.contract,
            confirmations = self.settings.confirmations,
            poll_interval = ?self.settings.poll_interval,
            "relay starting"
        );
        let mut failures: u32 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let result = tokio::select! {
                result = self.run_cycle() => result,
                _ = shutdown.changed() => break,
            };
            let pause = match result {
                Ok(_) => {
                    failures = 0;
                    self.settings.poll_interval
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!(kind = ?e.kind(), reason = %e, "fatal relay error, operator intervention required");
                    return Err(e);
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = self.settings.backoff.delay(failures);
                    tracing::warn!(kind = ?e.kind(), reason = %e, failures, ?delay, "cycle failed, backing off");
                    delay
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("relay stopped");
        Ok(())
    }
}
