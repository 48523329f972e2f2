//! Destination action hook.
//!
//! The relay only prepares the validated payload; signing and broadcasting on the destination
//! chain belong to whatever implements [DestinationAction].

use crate::processor::ProcessedEvent;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Acknowledgement returned by the destination side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub reference: String,
}

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("destination rejected the action: {0}")]
    Rejected(String),
    #[error("destination unavailable: {0}")]
    Unavailable(String),
    #[error("destination action timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait DestinationAction: Send + Sync {
    async fn submit(&self, event: &ProcessedEvent) -> Result<Ack, ActionError>;
}

/// Logs the mint that would be sent to the destination chain and acknowledges it.
pub struct LoggingAction {
    destination_rpc_url: String,
}

impl LoggingAction {
    pub fn new(destination_rpc_url: impl Into<String>) -> Self {
        Self {
            destination_rpc_url: destination_rpc_url.into(),
        }
    }
}

#[async_trait]
impl DestinationAction for LoggingAction {
    async fn submit(&self, event: &ProcessedEvent) -> Result<Ack, ActionError> {
        tracing::info!(
            destination = %self.destination_rpc_url,
            source_tx = %event.key,
            recipient = %event.recipient,
            token = %event.source_token,
            amount = %event.amount,
            destination_chain_id = %event.destination_chain_id,
            nonce = %event.nonce,
            amount_usd = ?event.amount_usd_estimate,
            "simulated mint on destination chain"
        );
        Ok(Ack {
            reference: format!("simulated:{}", event.key),
        })
    }
}
