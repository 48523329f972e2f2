//! Event processor: replay check, schema decode, structural validation, price enrichment.
//!
//! The replay guard is consulted before anything else so that an already-committed event
//! never reaches decoding, enrichment, or the destination action. Enrichment is bounded by a
//! timeout; in lenient mode any failure degrades to "no price", in strict mode the event is
//! rejected.

use crate::abi::{decode_tokens_locked, parse_address, RawEvent};
use crate::cursor::EventKey;
use crate::enrich::{EnrichmentError, PriceSource};
use crate::replay::{GuardError, ReplayGuard};
use alloy::primitives::{Address, B256, U256};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// A validated deposit, ready for the destination action.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedEvent {
    pub key: EventKey,
    pub block_number: u64,
    pub sender: Address,
    pub recipient: Address,
    pub source_token: Address,
    pub amount: U256,
    pub destination_chain_id: U256,
    pub nonce: U256,
    pub enriched_price_usd: Option<f64>,
    /// `amount / 10^decimals * price`, when a price is known.
    pub amount_usd_estimate: Option<f64>,
}

/// Result of processing one raw event.
#[derive(Debug, Clone, PartialEq)]
pub enum Processed {
    Fresh(ProcessedEvent),
    AlreadyCommitted(EventKey),
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("invalid event {key}: {reason}")]
    Invalid { key: EventKey, reason: String },
    #[error("enrichment failed for event {key}: {reason}")]
    Enrichment { key: EventKey, reason: String },
    #[error(transparent)]
    Store(#[from] GuardError),
}

/// How enrichment failures are treated.
#[derive(Debug, Clone)]
pub struct EnrichmentPolicy {
    pub timeout: Duration,
    /// Reject the event instead of dropping the price.
    pub strict: bool,
    pub token_decimals: u32,
}

impl Default for EnrichmentPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            strict: false,
            token_decimals: 18,
        }
    }
}

struct Enricher {
    source: Arc<dyn PriceSource>,
    policy: EnrichmentPolicy,
}

pub struct EventProcessor {
    contract: Address,
    topic0: B256,
    guard: Arc<dyn ReplayGuard>,
    enricher: Option<Enricher>,
}

impl EventProcessor {
    pub fn new(contract: Address, topic0: B256, guard: Arc<dyn ReplayGuard>) -> Self {
        Self {
            contract,
            topic0,
            guard,
            enricher: None,
        }
    }

    pub fn with_enrichment(mut self, source: Arc<dyn PriceSource>, policy: EnrichmentPolicy) -> Self {
        self.enricher = Some(Enricher { source, policy });
        self
    }

    pub async fn process(&self, raw: &RawEvent) -> Result<Processed, ProcessError> {
        let key = raw.key();
        if self.guard.is_processed(&key).await? {
            return Ok(Processed::AlreadyCommitted(key));
        }
        let invalid = |reason: String| ProcessError::Invalid { key, reason };

        if !raw.address.is_empty() {
            let emitter = parse_address(&raw.address).map_err(|e| invalid(e.to_string()))?;
            if emitter != self.contract {
                return Err(invalid(format!("emitted by {}, not the bridge contract", emitter)));
            }
        }
        let decoded = decode_tokens_locked(raw, &self.topic0).map_err(|e| invalid(e.to_string()))?;

        // Zero values are treated as missing fields.
        if decoded.sender == Address::ZERO {
            return Err(invalid("sender is the zero address".into()));
        }
        if decoded.recipient == Address::ZERO {
            return Err(invalid("recipient is the zero address".into()));
        }
        if decoded.token == Address::ZERO {
            return Err(invalid("token is the zero address".into()));
        }
        if decoded.amount.is_zero() {
            return Err(invalid("amount must be positive".into()));
        }
        if decoded.destination_chain_id.is_zero() {
            return Err(invalid("destination chain id is zero".into()));
        }

        let enriched_price_usd = self.enrich(&key, decoded.token).await?;
        let amount_usd_estimate = match (&self.enricher, enriched_price_usd) {
            (Some(e), Some(price)) => usd_estimate(decoded.amount, e.policy.token_decimals, price),
            _ => None,
        };

        tracing::info!(
            %key,
            block = raw.block_number,
            nonce = %decoded.nonce,
            "processed deposit"
        );
        Ok(Processed::Fresh(ProcessedEvent {
            key,
            block_number: raw.block_number,
            sender: decoded.sender,
            recipient: decoded.recipient,
            source_token: decoded.token,
            amount: decoded.amount,
            destination_chain_id: decoded.destination_chain_id,
            nonce: decoded.nonce,
            enriched_price_usd,
            amount_usd_estimate,
        }))
    }

    async fn enrich(&self, key: &EventKey, token: Address) -> Result<Option<f64>, ProcessError> {
        let Some(enricher) = &self.enricher else {
            return Ok(None);
        };
        let timeout = enricher.policy.timeout;
        let lookup = match tokio::time::timeout(timeout, enricher.source.price_usd(token)).await {
            Ok(res) => res,
            Err(_) => Err(EnrichmentError::Timeout(timeout)),
        };
        match lookup {
            Ok(Some(price)) => Ok(Some(price)),
            Ok(None) if !enricher.policy.strict => {
                tracing::debug!(%key, %token, "no price available");
                Ok(None)
            }
            Ok(None) => Err(ProcessError::Enrichment {
                key: *key,
                reason: format!("no price for token {}", token),
            }),
            Err(e) if !enricher.policy.strict => {
                tracing::warn!(%key, %token, reason = %e, "could not fetch token price");
                Ok(None)
            }
            Err(e) => Err(ProcessError::Enrichment {
                key: *key,
                reason: e.to_string(),
            }),
        }
    }
}

fn usd_estimate(amount: U256, decimals: u32, price: f64) -> Option<f64> {
    let units: f64 = amount.to_string().parse().ok()?;
    let estimate = units / 10f64.powi(decimals as i32) * price;
    estimate.is_finite().then_some(estimate)
}
