//! Off-chain bridge relay: confirmed deposit scanning, replay protection, and enrichment for
//! the bridge contract.
//!
//! - **Scheduler**: polls the source chain, scans only blocks at least `confirmations` deep,
//!   in bounded windows, and advances the watermark only after a whole window is drained.
//! - **EventProcessor**: checks the [ReplayGuard], decodes TokensLocked logs, validates them,
//!   and optionally attaches a USD price from a [PriceSource].
//! - **ReplayGuard**: dedup authority keyed by `(tx_hash, log_index)`, owner of the watermark
//!   ([MemoryReplayGuard], or [FileReplayGuard] for restarts without data loss).
//! - **DestinationAction**: receives each validated event exactly once per committed key.

pub mod abi;
pub mod action;
pub mod config;
pub mod cursor;
pub mod enrich;
pub mod gateway;
pub mod processor;
pub mod replay;
pub mod scheduler;

pub use abi::{event_topic, RawEvent, TokensLocked, DEFAULT_EVENT_SIGNATURE};
pub use action::{Ack, ActionError, DestinationAction, LoggingAction};
pub use config::{ActionFailurePolicy, BackoffConfig, ConfigError, PriceConfig, RelayConfig};
pub use cursor::{EventKey, RelayState};
pub use enrich::{EnrichmentError, HttpPriceSource, PriceSource};
pub use gateway::{GatewayError, JsonRpcGateway, LedgerGateway};
pub use processor::{EnrichmentPolicy, EventProcessor, ProcessError, Processed, ProcessedEvent};
pub use replay::{BoundedGuard, FileReplayGuard, GuardError, MemoryReplayGuard, ReplayGuard};
pub use scheduler::{
    genesis_watermark, CycleOutcome, CycleResult, ErrorKind, RelayError, ScanSettings,
    ScanWindow, Scheduler, SchedulerBuilder, Tally,
};
