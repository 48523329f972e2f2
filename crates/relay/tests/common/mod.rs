//! Common helpers for integration tests: in-process fakes for the ledger, the destination,
//! the price reference and the state store.

#![allow(dead_code)]

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use relay::{
    event_topic, Ack, ActionError, DestinationAction, EnrichmentError, EventKey, GatewayError,
    GuardError, LedgerGateway, MemoryReplayGuard, PriceSource, ProcessedEvent, RawEvent,
    ReplayGuard, ScanSettings, Scheduler, SchedulerBuilder, DEFAULT_EVENT_SIGNATURE,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("relay=debug"))
        .with_test_writer()
        .try_init();
}

pub fn contract() -> Address {
    Address::repeat_byte(0xaa)
}

pub fn topic0() -> B256 {
    event_topic(DEFAULT_EVENT_SIGNATURE)
}

fn hex_word(w: [u8; 32]) -> String {
    format!("0x{}", hex::encode(w))
}

pub fn address_word(byte: u8) -> String {
    let mut w = [0u8; 32];
    w[12..].copy_from_slice(&[byte; 20]);
    hex_word(w)
}

fn uint_word(n: u64) -> [u8; 32] {
    let mut w = [0u8; 32];
    w[24..].copy_from_slice(&n.to_be_bytes());
    w
}

/// A well-formed TokensLocked log.
pub fn deposit(block: u64, tx: u8, log_index: u64, amount: u64) -> RawEvent {
    let mut data = Vec::with_capacity(96);
    data.extend_from_slice(&uint_word(amount));
    data.extend_from_slice(&uint_word(10));
    data.extend_from_slice(&uint_word(log_index));
    RawEvent {
        tx_hash: B256::repeat_byte(tx),
        log_index,
        block_number: block,
        address: format!("0x{}", hex::encode(contract().as_slice())),
        topics: vec![
            hex_word(topic0().0),
            address_word(0x11),
            address_word(0x22),
            address_word(0x33),
        ],
        data: format!("0x{}", hex::encode(data)),
    }
}

/// A TokensLocked log whose data is not decodable.
pub fn malformed(block: u64, tx: u8, log_index: u64) -> RawEvent {
    RawEvent {
        data: "abc".into(),
        ..deposit(block, tx, log_index, 1)
    }
}

pub fn key(tx: u8, log_index: u64) -> EventKey {
    EventKey::new(B256::repeat_byte(tx), log_index)
}

/// Ledger with a settable tip and a fixed set of logs; records every requested range.
#[derive(Default)]
pub struct FakeLedger {
    pub height: Mutex<u64>,
    pub logs: Mutex<Vec<RawEvent>>,
    pub ranges: Mutex<Vec<(u64, u64)>>,
    pub height_calls: AtomicUsize,
    pub fail_height: AtomicBool,
    pub fail_logs: AtomicBool,
}

impl FakeLedger {
    pub fn new(height: u64, logs: Vec<RawEvent>) -> Arc<Self> {
        Arc::new(Self {
            height: Mutex::new(height),
            logs: Mutex::new(logs),
            ..Default::default()
        })
    }

    pub fn set_height(&self, h: u64) {
        *self.height.lock().unwrap() = h;
    }

    pub fn ranges(&self) -> Vec<(u64, u64)> {
        self.ranges.lock().unwrap().clone()
    }
}

#[async_trait]
impl LedgerGateway for FakeLedger {
    async fn latest_height(&self) -> Result<u64, GatewayError> {
        self.height_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_height.load(Ordering::SeqCst) {
            return Err(GatewayError::Rpc("connection refused".into()));
        }
        Ok(*self.height.lock().unwrap())
    }

    async fn get_logs(
        &self,
        requested_contract: Address,
        requested_topic0: B256,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawEvent>, GatewayError> {
        assert_eq!(requested_contract, contract());
        assert_eq!(requested_topic0, topic0());
        self.ranges.lock().unwrap().push((from_block, to_block));
        if self.fail_logs.load(Ordering::SeqCst) {
            return Err(GatewayError::Malformed("getLogs not array".into()));
        }
        // Reverse so the scheduler has to sort.
        Ok(self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|l| (from_block..=to_block).contains(&l.block_number))
            .rev()
            .cloned()
            .collect())
    }
}

/// Destination that records every submission.
#[derive(Default)]
pub struct RecordingAction {
    pub submitted: Mutex<Vec<ProcessedEvent>>,
    pub fail: AtomicBool,
}

impl RecordingAction {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn keys(&self) -> Vec<EventKey> {
        self.submitted.lock().unwrap().iter().map(|e| e.key).collect()
    }
}

#[async_trait]
impl DestinationAction for RecordingAction {
    async fn submit(&self, event: &ProcessedEvent) -> Result<Ack, ActionError> {
        self.submitted.lock().unwrap().push(event.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(ActionError::Unavailable("destination RPC down".into()));
        }
        Ok(Ack {
            reference: format!("ack:{}", event.key),
        })
    }
}

/// Price source with a scripted behaviour.
pub enum StubPrice {
    Fixed(f64),
    /// Price for one token only; every other token is unknown.
    Only(Address, f64),
    Unknown,
    Fails,
    Hangs,
}

#[async_trait]
impl PriceSource for StubPrice {
    async fn price_usd(&self, token: Address) -> Result<Option<f64>, EnrichmentError> {
        match self {
            StubPrice::Fixed(p) => Ok(Some(*p)),
            StubPrice::Only(known, p) => Ok((*known == token).then_some(*p)),
            StubPrice::Unknown => Ok(None),
            StubPrice::Fails => Err(EnrichmentError::Malformed("HTTP 429".into())),
            StubPrice::Hangs => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Some(1.0))
            }
        }
    }
}

/// Guard wrapper with switchable failures.
pub struct FlakyGuard {
    pub inner: Arc<dyn ReplayGuard>,
    /// Fail `commit` after this many successful commits.
    pub commits_before_failure: Mutex<Option<usize>>,
    pub fail_advance: AtomicBool,
    pub regress_on_advance: AtomicBool,
}

impl FlakyGuard {
    pub fn new(inner: Arc<dyn ReplayGuard>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            commits_before_failure: Mutex::new(None),
            fail_advance: AtomicBool::new(false),
            regress_on_advance: AtomicBool::new(false),
        })
    }

    pub fn heal(&self) {
        *self.commits_before_failure.lock().unwrap() = None;
        self.fail_advance.store(false, Ordering::SeqCst);
        self.regress_on_advance.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl ReplayGuard for FlakyGuard {
    async fn is_processed(&self, key: &EventKey) -> Result<bool, GuardError> {
        self.inner.is_processed(key).await
    }

    async fn commit(&self, key: &EventKey) -> Result<(), GuardError> {
        {
            let mut budget = self.commits_before_failure.lock().unwrap();
            if let Some(n) = budget.as_mut() {
                if *n == 0 {
                    return Err(GuardError::Unavailable("store connection lost".into()));
                }
                *n -= 1;
            }
        }
        self.inner.commit(key).await
    }

    async fn watermark(&self) -> Result<u64, GuardError> {
        self.inner.watermark().await
    }

    async fn advance_watermark(&self, block: u64) -> Result<(), GuardError> {
        if self.regress_on_advance.load(Ordering::SeqCst) {
            let current = self.inner.watermark().await?;
            return Err(GuardError::WatermarkRegression(
                relay::cursor::WatermarkRegression {
                    current: current + 1_000,
                    requested: block,
                },
            ));
        }
        if self.fail_advance.load(Ordering::SeqCst) {
            return Err(GuardError::Unavailable("store connection lost".into()));
        }
        self.inner.advance_watermark(block).await
    }
}

/// Guard whose lookups yield once, so buffered processing runs ahead of commits.
pub struct YieldingGuard {
    pub inner: Arc<dyn ReplayGuard>,
}

impl YieldingGuard {
    pub fn new(inner: Arc<dyn ReplayGuard>) -> Arc<Self> {
        Arc::new(Self { inner })
    }
}

#[async_trait]
impl ReplayGuard for YieldingGuard {
    async fn is_processed(&self, key: &EventKey) -> Result<bool, GuardError> {
        tokio::task::yield_now().await;
        self.inner.is_processed(key).await
    }

    async fn commit(&self, key: &EventKey) -> Result<(), GuardError> {
        self.inner.commit(key).await
    }

    async fn watermark(&self) -> Result<u64, GuardError> {
        self.inner.watermark().await
    }

    async fn advance_watermark(&self, block: u64) -> Result<(), GuardError> {
        self.inner.advance_watermark(block).await
    }
}

pub fn settings(confirmations: u64, max_window_size: u64) -> ScanSettings {
    ScanSettings {
        confirmations,
        max_window_size,
        poll_interval: Duration::from_secs(1),
        ..ScanSettings::default()
    }
}

pub fn scheduler(
    ledger: Arc<FakeLedger>,
    guard: Arc<dyn ReplayGuard>,
    action: Arc<RecordingAction>,
    settings: ScanSettings,
) -> Scheduler {
    SchedulerBuilder::new()
        .gateway(ledger)
        .guard(guard)
        .action(action)
        .contract_address(contract())
        .event_topic(topic0())
        .settings(settings)
        .build()
        .expect("scheduler build")
}

pub fn memory_guard(watermark: u64) -> Arc<MemoryReplayGuard> {
    Arc::new(MemoryReplayGuard::new(watermark))
}
