//! ABI types and decoding for the bridge contract.
//!
//! TokensLocked event. Decode from JSON-RPC log shape into [RawEvent], then from the raw
//! topics/data into a typed [TokensLocked].

use crate::cursor::EventKey;
use alloy::primitives::{Address, B256, U256};
use serde_json::Value;
use sha3::{Digest, Keccak256};
use thiserror::Error;

/// Canonical signature of the deposit event emitted by the bridge contract.
pub const DEFAULT_EVENT_SIGNATURE: &str =
    "TokensLocked(address,address,address,uint256,uint256,uint256)";

/// topic0 + three indexed addresses (sender, recipient, token).
const TOKENS_LOCKED_TOPICS: usize = 4;

/// Three non-indexed uint256 words: amount, destinationChainId, nonce.
const TOKENS_LOCKED_DATA_LEN: usize = 96;

/// keccak256 of an event signature, i.e. the log's topic0.
pub fn event_topic(signature: &str) -> B256 {
    B256::from_slice(&Keccak256::digest(signature.as_bytes()))
}

/// Errors produced when a log does not match the expected shape or event schema.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AbiError {
    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("malformed {0}: {1}")]
    Malformed(&'static str, String),

    #[error("expected {expected} topics, got {got}")]
    TopicCount { expected: usize, got: usize },

    #[error("topic0 {0} does not match the configured event signature")]
    WrongTopic(String),

    #[error("data must be {expected} bytes, got {got}")]
    DataLength { expected: usize, got: usize },

    #[error("{0} is not a left-padded address word")]
    NotAnAddress(&'static str),
}

/// A log entry as returned by the ledger: identity fields parsed, payload left opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub tx_hash: B256,
    pub log_index: u64,
    pub block_number: u64,
    /// Emitting contract, hex as delivered by the node (may be empty).
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
}

impl RawEvent {
    pub fn key(&self) -> EventKey {
        EventKey::new(self.tx_hash, self.log_index)
    }
}

/// Decoded TokensLocked payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokensLocked {
    pub sender: Address,
    pub recipient: Address,
    pub token: Address,
    pub amount: U256,
    pub destination_chain_id: U256,
    pub nonce: U256,
}

/// Parse a JSON-RPC log (eth_getLogs result entry) into a [RawEvent].
///
/// Only the identity fields (`transactionHash`, `logIndex`, `blockNumber`) are required here;
/// topics and data are validated later against the event schema so that a malformed payload
/// is reported per event instead of failing the whole response.
pub fn raw_event_from_log(log: &Value) -> Result<RawEvent, AbiError> {
    let tx_hash = parse_hex_b256(
        log.get("transactionHash")
            .and_then(|h| h.as_str())
            .ok_or(AbiError::MissingField("transactionHash"))?,
        "transactionHash",
    )?;
    let log_index = parse_hex_u64(
        log.get("logIndex")
            .and_then(|n| n.as_str())
            .ok_or(AbiError::MissingField("logIndex"))?,
        "logIndex",
    )?;
    let block_number = parse_hex_u64(
        log.get("blockNumber")
            .and_then(|n| n.as_str())
            .ok_or(AbiError::MissingField("blockNumber"))?,
        "blockNumber",
    )?;
    let address = log
        .get("address")
        .and_then(|a| a.as_str())
        .unwrap_or_default()
        .to_string();
    let topics = log
        .get("topics")
        .and_then(|t| t.as_array())
        .map(|t| {
            t.iter()
                .map(|topic| topic.as_str().unwrap_or_default().to_string())
                .collect()
        })
        .unwrap_or_default();
    let data = log
        .get("data")
        .and_then(|d| d.as_str())
        .unwrap_or_default()
        .to_string();
    Ok(RawEvent {
        tx_hash,
        log_index,
        block_number,
        address,
        topics,
        data,
    })
}

/// True if the log was flagged `removed` by the node (dropped by a reorg).
pub fn log_is_removed(log: &Value) -> bool {
    log.get("removed").and_then(|r| r.as_bool()).unwrap_or(false)
}

/// True if the log's first topic equals `topic0`.
pub fn log_matches_topic(log: &Value, topic0: &B256) -> bool {
    log.get("topics")
        .and_then(|t| t.as_array())
        .and_then(|t| t.first())
        .and_then(|t| t.as_str())
        .and_then(|s| parse_hex_b256(s, "topic0").ok())
        .map(|t| &t == topic0)
        .unwrap_or(false)
}

/// Decode a [RawEvent] as TokensLocked, checking topic0 against `topic0`.
pub fn decode_tokens_locked(raw: &RawEvent, topic0: &B256) -> Result<TokensLocked, AbiError> {
    if raw.topics.len() != TOKENS_LOCKED_TOPICS {
        return Err(AbiError::TopicCount {
            expected: TOKENS_LOCKED_TOPICS,
            got: raw.topics.len(),
        });
    }
    let t0 = parse_hex_b256(&raw.topics[0], "topic0")?;
    if &t0 != topic0 {
        return Err(AbiError::WrongTopic(raw.topics[0].clone()));
    }
    let sender = address_from_topic(&raw.topics[1], "sender")?;
    let recipient = address_from_topic(&raw.topics[2], "recipient")?;
    let token = address_from_topic(&raw.topics[3], "token")?;

    let data = parse_hex_bytes(&raw.data, "data")?;
    if data.len() != TOKENS_LOCKED_DATA_LEN {
        return Err(AbiError::DataLength {
            expected: TOKENS_LOCKED_DATA_LEN,
            got: data.len(),
        });
    }
    Ok(TokensLocked {
        sender,
        recipient,
        token,
        amount: U256::from_be_slice(&data[0..32]),
        destination_chain_id: U256::from_be_slice(&data[32..64]),
        nonce: U256::from_be_slice(&data[64..96]),
    })
}

/// Parse a 20-byte address, with or without `0x`.
pub fn parse_address(s: &str) -> Result<Address, AbiError> {
    let bytes = parse_hex_bytes(s, "address")?;
    if bytes.len() != 20 {
        return Err(AbiError::Malformed(
            "address",
            format!("expected 20 bytes, got {}", bytes.len()),
        ));
    }
    Ok(Address::from_slice(&bytes))
}

// Indexed address in EVM is a 32-byte word, left-padded with zeros.
fn address_from_topic(topic: &str, field: &'static str) -> Result<Address, AbiError> {
    let word = parse_hex_b256(topic, field)?;
    if word[..12].iter().any(|b| *b != 0) {
        return Err(AbiError::NotAnAddress(field));
    }
    Ok(Address::from_slice(&word[12..]))
}

fn parse_hex_u64(s: &str, field: &'static str) -> Result<u64, AbiError> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).map_err(|e| AbiError::Malformed(field, e.to_string()))
}

fn parse_hex_bytes(s: &str, field: &'static str) -> Result<Vec<u8>, AbiError> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(s).map_err(|e| AbiError::Malformed(field, e.to_string()))
}

fn parse_hex_b256(s: &str, field: &'static str) -> Result<B256, AbiError> {
    let bytes = parse_hex_bytes(s, field)?;
    if bytes.len() != 32 {
        return Err(AbiError::Malformed(
            field,
            format!("expected 32 bytes, got {}", bytes.len()),
        ));
    }
    Ok(B256::from_slice(&bytes))
}
