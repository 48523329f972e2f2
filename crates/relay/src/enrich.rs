//! Reference-data enrichment (token USD price).

use alloy::primitives::Address;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnrichmentError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("malformed price response: {0}")]
    Malformed(String),
    #[error("price lookup timed out after {0:?}")]
    Timeout(Duration),
}

/// External price reference.
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// USD price of `token`. `Ok(None)` means the source knows no price for it.
    async fn price_usd(&self, token: Address) -> Result<Option<f64>, EnrichmentError>;
}

/// CoinGecko-style `simple/token_price/{platform}` endpoint.
pub struct HttpPriceSource {
    client: reqwest::Client,
    api_url: String,
    platform: String,
}

impl HttpPriceSource {
    pub fn new(
        api_url: impl Into<String>,
        platform: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, EnrichmentError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            platform: platform.into(),
        })
    }
}

#[async_trait]
impl PriceSource for HttpPriceSource {
    async fn price_usd(&self, token: Address) -> Result<Option<f64>, EnrichmentError> {
        let token_hex = format!("0x{}", hex::encode(token.as_slice()));
        let url = format!("{}/simple/token_price/{}", self.api_url, self.platform);
        let body: Value = self
            .client
            .get(&url)
            .query(&[("contract_addresses", token_hex.as_str()), ("vs_currencies", "usd")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        parse_token_price(&body, &token_hex)
    }
}

/// Response shape: `{"0x<token>": {"usd": 1234.5}}`. Keys are compared case-insensitively.
fn parse_token_price(body: &Value, token_hex: &str) -> Result<Option<f64>, EnrichmentError> {
    let obj = body
        .as_object()
        .ok_or_else(|| EnrichmentError::Malformed("response is not an object".into()))?;
    let entry = obj
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(token_hex))
        .map(|(_, v)| v);
    let Some(entry) = entry else {
        return Ok(None);
    };
    match entry.get("usd") {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .filter(|p| p.is_finite() && *p >= 0.0)
            .map(Some)
            .ok_or_else(|| EnrichmentError::Malformed(format!("usd price {}", v))),
    }
}
