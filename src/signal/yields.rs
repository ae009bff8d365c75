//! External yield discovery and winner selection.
//!
//! Venue yields come from an HTTP API keyed by asset mint. Each venue is
//! matched to at most one registered strategy, venues too small to absorb
//! the vault without diluting their posted yield are dropped, and the best
//! remaining APY wins.

use crate::config::ApiConfig;
use crate::registry::{Strategy, StrategyRegistry};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Yield and size of one external venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VenueYield {
    /// Provider-scoped identifier of the venue
    pub key: String,
    /// Underlying venue address, used to match registered strategies
    pub address: String,
    /// Provider name (e.g. "kamino")
    pub provider: String,
    /// Deposit APY as a fraction (0.05 = 5%)
    pub deposit_apy: Decimal,
    /// Total deposited value in USD
    pub tvl_usd: Decimal,
}

/// A venue matched to a registered strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct YieldCandidate {
    pub strategy_id: String,
    pub venue_key: String,
    pub deposit_apy: Decimal,
    pub tvl_usd: Decimal,
}

/// The strategy nominated to receive all free capital.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct YieldWinner {
    pub strategy_id: String,
    pub venue_key: String,
    pub deposit_apy: Decimal,
    pub tvl_usd: Decimal,
}

/// Source of venue yields for an asset.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait YieldSource: Send + Sync {
    /// All venues currently quoting a deposit yield for `asset_mint`.
    async fn venue_yields(&self, asset_mint: &str) -> Result<Vec<VenueYield>>;
}

/// Map venues to registered strategies by venue address.
///
/// A venue whose provider does not belong to the strategy's venue family is
/// not a match. Unmatched venues are dropped.
pub fn match_venues(venues: &[VenueYield], registry: &StrategyRegistry) -> Vec<YieldCandidate> {
    let mut by_address: HashMap<&str, &Strategy> = HashMap::new();
    for strategy in registry.strategies() {
        by_address.entry(strategy.address.as_str()).or_insert(strategy);
    }

    venues
        .iter()
        .filter_map(|venue| {
            let Some(strategy) = by_address.get(venue.address.as_str()) else {
                debug!(venue = %venue.key, address = %venue.address, "Venue has no registered strategy");
                return None;
            };
            if !venue
                .provider
                .to_ascii_lowercase()
                .starts_with(strategy.kind.provider())
            {
                debug!(
                    venue = %venue.key,
                    provider = %venue.provider,
                    strategy_id = %strategy.id,
                    kind = %strategy.kind,
                    "Venue provider does not match strategy kind"
                );
                return None;
            }
            Some(YieldCandidate {
                strategy_id: strategy.id.clone(),
                venue_key: venue.key.clone(),
                deposit_apy: venue.deposit_apy,
                tvl_usd: venue.tvl_usd,
            })
        })
        .collect()
}

/// Whether a venue is large enough for the vault's deposit.
pub fn passes_dilution_filter(tvl_usd: Decimal, portfolio_usd: Decimal, max_tvl_share: Decimal) -> bool {
    tvl_usd > Decimal::ZERO
        && tvl_usd
            .checked_mul(max_tvl_share)
            .is_some_and(|allowance| portfolio_usd <= allowance)
}

/// Highest APY first, then deeper TVL, then strategy id for a stable order.
fn rank(a: &YieldCandidate, b: &YieldCandidate) -> Ordering {
    a.deposit_apy
        .cmp(&b.deposit_apy)
        .then(a.tvl_usd.cmp(&b.tvl_usd))
        .then_with(|| b.strategy_id.cmp(&a.strategy_id))
}

/// Pick the best eligible strategy, or `None` when nothing qualifies.
pub fn select_winner(
    venues: &[VenueYield],
    registry: &StrategyRegistry,
    portfolio_usd: Decimal,
    max_tvl_share: Decimal,
) -> Option<YieldWinner> {
    let candidates = match_venues(venues, registry);
    if candidates.is_empty() {
        warn!(venues = venues.len(), "No yield venues matched a registered strategy");
        return None;
    }

    let matched = candidates.len();
    let eligible: Vec<YieldCandidate> = candidates
        .into_iter()
        .filter(|c| {
            let keep = passes_dilution_filter(c.tvl_usd, portfolio_usd, max_tvl_share);
            if !keep {
                debug!(
                    strategy_id = %c.strategy_id,
                    tvl_usd = %c.tvl_usd,
                    %portfolio_usd,
                    "Venue excluded by dilution filter"
                );
            }
            keep
        })
        .collect();

    let Some(best) = eligible.iter().max_by(|a, b| rank(a, b)) else {
        warn!(
            matched,
            %portfolio_usd,
            %max_tvl_share,
            "All matched venues excluded by dilution filter"
        );
        return None;
    };

    info!(
        strategy_id = %best.strategy_id,
        venue = %best.venue_key,
        apy = %best.deposit_apy,
        tvl_usd = %best.tvl_usd,
        eligible = eligible.len(),
        "Yield winner selected"
    );

    Some(YieldWinner {
        strategy_id: best.strategy_id.clone(),
        venue_key: best.venue_key.clone(),
        deposit_apy: best.deposit_apy,
        tvl_usd: best.tvl_usd,
    })
}

/// HTTP client for the venue yield API.
#[derive(Debug, Clone)]
pub struct YieldApiClient {
    client: Client,
    base_url: String,
}

impl YieldApiClient {
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
impl YieldSource for YieldApiClient {
    #[instrument(skip(self), name = "yield_venue_yields")]
    async fn venue_yields(&self, asset_mint: &str) -> Result<Vec<VenueYield>> {
        let url = format!(
            "{}/yields?asset={}",
            self.base_url,
            urlencoding::encode(asset_mint)
        );

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to send yields request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Yield API error {}: {}", status, body);
        }

        let venues: Vec<VenueYield> = response
            .json()
            .await
            .context("Failed to parse yields response")?;

        debug!("Fetched {} venue yields for {}", venues.len(), asset_mint);
        Ok(venues)
    }
}
