//! Advisory yield signal.
//!
//! Nothing in here is load-bearing: any failure while discovering yields
//! results in no winner, and the cycle falls back to equal weight.

pub mod price;
pub mod yields;

pub use price::{PriceApiClient, PriceSource};
pub use yields::{
    match_venues, passes_dilution_filter, select_winner, VenueYield, YieldApiClient, YieldCandidate,
    YieldSource, YieldWinner,
};

#[cfg(test)]
pub use price::MockPriceSource;
#[cfg(test)]
pub use yields::MockYieldSource;

use crate::allocation::Amount;
use crate::registry::StrategyRegistry;
use crate::utils::to_ui_amount;
use rust_decimal::Decimal;
use tracing::warn;

/// Everything the yield signal needs to size and rank venues.
#[derive(Debug, Clone, Copy)]
pub struct SignalParams<'a> {
    pub asset_mint: &'a str,
    pub asset_decimals: u32,
    pub max_tvl_share: Decimal,
}

/// USD price of the vault asset, or 1 when no price can be obtained.
async fn asset_price_or_par(prices: &dyn PriceSource, asset_mint: &str) -> Decimal {
    let tokens = [asset_mint.to_string()];
    match prices.prices(&tokens).await {
        Ok(map) => match map.get(asset_mint) {
            Some(price) => *price,
            None => {
                warn!(mint = %asset_mint, "Price response missing asset; sizing at 1 USD");
                Decimal::ONE
            }
        },
        Err(e) => {
            warn!(mint = %asset_mint, error = %e, "Price lookup failed; sizing at 1 USD");
            Decimal::ONE
        }
    }
}

/// Nominate the strategy that should receive all free capital.
///
/// Returns `None` when the yield source fails, nothing matches, or the
/// dilution filter removes every candidate.
pub async fn nominate_winner(
    yields: &dyn YieldSource,
    prices: &dyn PriceSource,
    registry: &StrategyRegistry,
    params: SignalParams<'_>,
    total: Amount,
) -> Option<YieldWinner> {
    let venues = match yields.venue_yields(params.asset_mint).await {
        Ok(venues) => venues,
        Err(e) => {
            warn!(mint = %params.asset_mint, error = %e, "Yield source unavailable; no winner");
            return None;
        }
    };

    let price = asset_price_or_par(prices, params.asset_mint).await;
    let Some(portfolio_usd) = to_ui_amount(total, params.asset_decimals).checked_mul(price) else {
        warn!(total = %total, %price, "Portfolio value out of range; no winner");
        return None;
    };

    select_winner(&venues, registry, portfolio_usd, params.max_tvl_share)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RebalanceError;
    use crate::registry::{Strategy, StrategyKind};
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    const MINT: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";

    fn params() -> SignalParams<'static> {
        SignalParams {
            asset_mint: MINT,
            asset_decimals: 6,
            max_tvl_share: dec!(0.10),
        }
    }

    fn registry() -> StrategyRegistry {
        StrategyRegistry::new(vec![
            Strategy::new("kvault", StrategyKind::KaminoVault, "vault-addr"),
            Strategy::new("jlend", StrategyKind::JupiterLend, "jlend-addr"),
        ])
        .unwrap()
    }

    fn venue(key: &str, address: &str, provider: &str, apy: Decimal, tvl: Decimal) -> VenueYield {
        VenueYield {
            key: key.to_string(),
            address: address.to_string(),
            provider: provider.to_string(),
            deposit_apy: apy,
            tvl_usd: tvl,
        }
    }

    fn fixed_price(price: Decimal) -> MockPriceSource {
        let mut prices = MockPriceSource::new();
        prices.expect_prices().returning(move |tokens| {
            Ok(tokens.iter().map(|t| (t.clone(), price)).collect::<HashMap<_, _>>())
        });
        prices
    }

    // =========================================================================
    // Winner nomination
    // =========================================================================

    #[tokio::test]
    async fn test_yield_failure_means_no_winner() {
        let mut yields = MockYieldSource::new();
        yields
            .expect_venue_yields()
            .returning(|_| Err(anyhow::anyhow!("connection refused")));
        let prices = MockPriceSource::new();

        let winner = nominate_winner(&yields, &prices, &registry(), params(), 1_000_000).await;
        assert!(winner.is_none());
    }

    #[tokio::test]
    async fn test_best_apy_nominated() {
        let mut yields = MockYieldSource::new();
        yields.expect_venue_yields().returning(|_| {
            Ok(vec![
                venue("k1", "vault-addr", "kamino", dec!(0.05), dec!(10000000)),
                venue("j1", "jlend-addr", "jupiter", dec!(0.07), dec!(10000000)),
            ])
        });

        let winner = nominate_winner(&yields, &fixed_price(dec!(1)), &registry(), params(), 1_000_000)
            .await
            .unwrap();
        assert_eq!(winner.strategy_id, "jlend");
    }

    #[tokio::test]
    async fn test_price_failure_sizes_at_par() {
        let mut yields = MockYieldSource::new();
        // 100 USD of TVL at a 10% cap admits exactly 10 USD
        yields
            .expect_venue_yields()
            .returning(|_| Ok(vec![venue("j1", "jlend-addr", "jupiter", dec!(0.07), dec!(100))]));
        let mut prices = MockPriceSource::new();
        prices
            .expect_prices()
            .returning(|tokens| Err(RebalanceError::PriceUnavailable(tokens.to_vec()).into()));

        // 10 tokens at par passes, 11 does not
        let winner = nominate_winner(&yields, &prices, &registry(), params(), 10_000_000).await;
        assert_eq!(winner.map(|w| w.strategy_id), Some("jlend".to_string()));

        let mut prices = MockPriceSource::new();
        prices.expect_prices().returning(|_| Ok(HashMap::new()));
        let winner = nominate_winner(&yields, &prices, &registry(), params(), 11_000_000).await;
        assert!(winner.is_none());
    }

    #[tokio::test]
    async fn test_price_scales_portfolio_size() {
        let mut yields = MockYieldSource::new();
        yields
            .expect_venue_yields()
            .returning(|_| Ok(vec![venue("j1", "jlend-addr", "jupiter", dec!(0.07), dec!(100))]));

        // 10 tokens at 2 USD is 20 USD, over the 10 USD allowance
        let winner = nominate_winner(&yields, &fixed_price(dec!(2)), &registry(), params(), 10_000_000).await;
        assert!(winner.is_none());
    }

    #[tokio::test]
    async fn test_oversized_portfolio_means_no_winner() {
        let mut yields = MockYieldSource::new();
        yields.expect_venue_yields().returning(|_| {
            Ok(vec![venue("j1", "jlend-addr", "jupiter", dec!(0.07), Decimal::MAX)])
        });

        // u128::MAX base units saturate the UI amount; any real price overflows it
        let winner = nominate_winner(
            &yields,
            &fixed_price(dec!(10000000)),
            &registry(),
            params(),
            u128::MAX,
        )
        .await;
        assert!(winner.is_none());
    }
}
