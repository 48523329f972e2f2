//! Relay configuration.
//!
//! Loaded from YAML; `${VAR}` placeholders are substituted from the environment before
//! parsing so that RPC URLs and keys can stay out of the file.

use crate::abi::{event_topic, parse_address, DEFAULT_EVENT_SIGNATURE};
use alloy::primitives::{Address, B256};
use anyhow::Context;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// HTTP JSON-RPC URL of the source chain.
    pub source_rpc_url: String,
    /// Destination chain endpoint, handed to the destination action.
    #[serde(default)]
    pub destination_rpc_url: String,
    /// Bridge contract on the source chain (0x-prefixed, 20 bytes).
    pub bridge_contract_address: String,
    #[serde(default = "default_event_signature")]
    pub event_signature: String,
    /// Source chain id; with the contract it scopes the persisted state.
    #[serde(default)]
    pub source_chain_id: u64,
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_window_size")]
    pub max_window_size: u64,
    /// First block to scan; only used when no state has been persisted yet.
    #[serde(default)]
    pub start_block: Option<u64>,
    #[serde(default)]
    pub enrichment_strict: bool,
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    #[serde(default = "default_rpc_timeout_secs")]
    pub rpc_timeout_secs: u64,
    #[serde(default = "default_store_timeout_secs")]
    pub store_timeout_secs: u64,
    #[serde(default = "default_processing_concurrency")]
    pub processing_concurrency: usize,
    #[serde(default)]
    pub action_failure_policy: ActionFailurePolicy,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub price: Option<PriceConfig>,
}

fn default_event_signature() -> String {
    DEFAULT_EVENT_SIGNATURE.to_string()
}
fn default_confirmations() -> u64 {
    12
}
fn default_poll_interval_secs() -> u64 {
    10
}
fn default_max_window_size() -> u64 {
    1000
}
fn default_state_file() -> PathBuf {
    PathBuf::from("relay-state.json")
}
fn default_rpc_timeout_secs() -> u64 {
    10
}
fn default_store_timeout_secs() -> u64 {
    5
}
fn default_processing_concurrency() -> usize {
    4
}

/// What a failed destination submission does to the cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionFailurePolicy {
    /// Log the failure with the event key and keep walking; the watermark still advances.
    #[default]
    Advance,
    /// Abort the cycle so the window is retried.
    Block,
}

/// Price reference endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceConfig {
    pub api_url: String,
    #[serde(default = "default_platform")]
    pub platform: String,
    #[serde(default = "default_price_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_token_decimals")]
    pub token_decimals: u32,
}

fn default_platform() -> String {
    "ethereum".to_string()
}
fn default_price_timeout_secs() -> u64 {
    5
}
fn default_token_decimals() -> u32 {
    18
}

/// Backoff after failed cycles (initial and max seconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_backoff_secs: 1,
            max_backoff_secs: 60,
        }
    }
}

/// Upper bound of the random jitter added to every backoff.
pub const BACKOFF_JITTER_MS: u64 = 500;

impl BackoffConfig {
    /// Exponential delay for the `failures`-th consecutive failure (1-based), capped at
    /// `max_backoff_secs`, plus up to [BACKOFF_JITTER_MS] of jitter.
    pub fn delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(32);
        let base = Duration::from_secs(self.initial_backoff_secs)
            .saturating_mul(2u32.saturating_pow(exp))
            .min(Duration::from_secs(self.max_backoff_secs));
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..BACKOFF_JITTER_MS));
        base + jitter
    }
}

impl RelayConfig {
    /// Load configuration from a YAML file with environment variable substitution.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config = Self::from_yaml_str(&contents)
            .with_context(|| format!("failed to load config file {}", path.display()))?;
        Ok(config)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let contents = substitute_env_vars(contents)?;
        let config: RelayConfig =
            serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source_rpc_url.trim().is_empty() {
            return Err(ConfigError::Invalid("source_rpc_url is empty".into()));
        }
        self.contract_address()?;
        if self.event_signature.trim().is_empty() {
            return Err(ConfigError::Invalid("event_signature is empty".into()));
        }
        if self.max_window_size == 0 {
            return Err(ConfigError::Invalid("max_window_size must be > 0".into()));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid("poll_interval_secs must be > 0".into()));
        }
        if self.processing_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "processing_concurrency must be > 0".into(),
            ));
        }
        match &self.price {
            Some(price) if price.api_url.trim().is_empty() => {
                return Err(ConfigError::Invalid("price.api_url is empty".into()));
            }
            None if self.enrichment_strict => {
                return Err(ConfigError::Invalid(
                    "enrichment_strict requires a price section".into(),
                ));
            }
            _ => {}
        }
        Ok(())
    }

    pub fn contract_address(&self) -> Result<Address, ConfigError> {
        parse_address(&self.bridge_contract_address)
            .map_err(|e| ConfigError::Invalid(format!("bridge_contract_address: {}", e)))
    }

    pub fn topic0(&self) -> B256 {
        event_topic(&self.event_signature)
    }

    /// `<chain_id>:<contract>`, the key the persisted state is bound to.
    /// `<chain_id>:<lowercase 0x contract>`, normalized so that any spelling of the same
    /// address maps to one scope.
    pub fn state_scope(&self) -> Result<String, ConfigError> {
        let contract = self.contract_address()?;
        Ok(format!(
            "{}:0x{}",
            self.source_chain_id,
            hex::encode(contract.as_slice())
        ))
    }
}

/// Substitute environment variables in the format `${VAR_NAME}`. Unset variables keep their
/// placeholder.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .map_err(|e| ConfigError::Parse(e.to_string()))?;
    let out = re.replace_all(content, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        match std::env::var(name) {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(var = name, "environment variable not set, keeping placeholder");
                caps[0].to_string()
            }
        }
    });
    Ok(out.into_owned())
}
