//! Relay state: the scan watermark plus the set of committed event keys.
//!
//! [RelayState] is the in-memory form; [StateDocument] is the persisted layout.

use alloy::primitives::B256;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Current persisted layout version.
pub const STATE_VERSION: u32 = 1;

/// Identity of a log: `(tx_hash, log_index)`. Stable across re-fetches of the same block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventKey {
    pub tx_hash: B256,
    pub log_index: u64,
}

impl EventKey {
    pub fn new(tx_hash: B256, log_index: u64) -> Self {
        Self { tx_hash, log_index }
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}:{}", hex::encode(self.tx_hash), self.log_index)
    }
}

/// Attempt to move the watermark backwards.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("watermark regression: current {current}, requested {requested}")]
pub struct WatermarkRegression {
    pub current: u64,
    pub requested: u64,
}

/// Watermark and committed keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayState {
    pub last_scanned_block: u64,
    pub processed_keys: BTreeSet<EventKey>,
}

impl RelayState {
    pub fn new(last_scanned_block: u64) -> Self {
        Self {
            last_scanned_block,
            processed_keys: BTreeSet::new(),
        }
    }

    pub fn is_processed(&self, key: &EventKey) -> bool {
        self.processed_keys.contains(key)
    }

    /// Returns false if the key was already committed.
    pub fn commit(&mut self, key: EventKey) -> bool {
        self.processed_keys.insert(key)
    }

    /// Move the watermark to `block`. Equal is a no-op; lower is an error.
    pub fn advance_to(&mut self, block: u64) -> Result<bool, WatermarkRegression> {
        if block < self.last_scanned_block {
            return Err(WatermarkRegression {
                current: self.last_scanned_block,
                requested: block,
            });
        }
        let moved = block > self.last_scanned_block;
        self.last_scanned_block = block;
        Ok(moved)
    }

    pub fn to_document(&self, scope: &str) -> StateDocument {
        StateDocument {
            version: STATE_VERSION,
            scope: scope.to_string(),
            last_scanned_block: self.last_scanned_block,
            processed_keys: self
                .processed_keys
                .iter()
                .map(|k| PersistedKey {
                    tx_hash: format!("0x{}", hex::encode(k.tx_hash)),
                    log_index: k.log_index,
                })
                .collect(),
        }
    }

    pub fn from_document(doc: &StateDocument) -> Result<Self, String> {
        if doc.version != STATE_VERSION {
            return Err(format!("unsupported state version {}", doc.version));
        }
        let mut processed_keys = BTreeSet::new();
        for k in &doc.processed_keys {
            let s = k.tx_hash.strip_prefix("0x").unwrap_or(&k.tx_hash);
            let bytes = hex::decode(s).map_err(|e| format!("tx_hash {}: {}", k.tx_hash, e))?;
            if bytes.len() != 32 {
                return Err(format!("tx_hash {}: expected 32 bytes", k.tx_hash));
            }
            processed_keys.insert(EventKey::new(B256::from_slice(&bytes), k.log_index));
        }
        Ok(Self {
            last_scanned_block: doc.last_scanned_block,
            processed_keys,
        })
    }
}

/// On-disk layout. `scope` binds the file to one `<chain_id>:<contract>` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDocument {
    pub version: u32,
    pub scope: String,
    pub last_scanned_block: u64,
    #[serde(default)]
    pub processed_keys: Vec<PersistedKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedKey {
    pub tx_hash: String,
    pub log_index: u64,
}
