//! Batch token price lookup.

use crate::config::ApiConfig;
use crate::error::RebalanceError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, instrument};

/// USD price lookup by token mint.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Prices for every requested token; fails if any token has no data.
    async fn prices(&self, tokens: &[String]) -> Result<HashMap<String, Decimal>>;
}

#[derive(Debug, Deserialize)]
struct BatchPriceResponse {
    success: bool,
    #[serde(default)]
    data: HashMap<String, Option<TokenPriceData>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenPriceData {
    value: Option<Decimal>,
}

/// HTTP client for the batch price API.
#[derive(Debug, Clone)]
pub struct PriceApiClient {
    client: Client,
    base_url: String,
}

impl PriceApiClient {
    /// Create a client from configuration.
    pub fn new(config: &ApiConfig) -> Result<Self> {
        Self::build(&config.base_url, Duration::from_secs(config.timeout_secs))
    }

    /// Create a client against a custom base URL.
    pub fn with_base_url(base_url: &str) -> Result<Self> {
        Self::build(base_url, Duration::from_secs(30))
    }

    fn build(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl PriceSource for PriceApiClient {
    #[instrument(skip(self), name = "price_batch")]
    async fn prices(&self, tokens: &[String]) -> Result<HashMap<String, Decimal>> {
        let params = tokens
            .iter()
            .map(|t| format!("tokens={}", urlencoding::encode(t)))
            .collect::<Vec<_>>()
            .join("&");
        let url = format!("{}/batch-token-prices?{}", self.base_url, params);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to send batch price request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Price API error {}: {}", status, body);
        }

        let body: BatchPriceResponse = response
            .json()
            .await
            .context("Failed to parse batch price response")?;

        if !body.success {
            anyhow::bail!("Batch price API response indicates failure");
        }

        let mut prices = HashMap::with_capacity(tokens.len());
        let mut missing = Vec::new();
        for token in tokens {
            match body.data.get(token).and_then(|d| d.as_ref()).and_then(|d| d.value) {
                Some(price) => {
                    prices.insert(token.clone(), price);
                }
                None => missing.push(token.clone()),
            }
        }

        if !missing.is_empty() {
            return Err(RebalanceError::PriceUnavailable(missing).into());
        }

        debug!("Fetched {} token prices", prices.len());
        Ok(prices)
    }
}
