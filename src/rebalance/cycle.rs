//! One rebalance decision: read state, estimate liquidity, pick a target.

use crate::allocation::{
    allocation_total, create_equal_weight_allocation, create_initial_allocation,
    create_winner_take_all_allocation,
    max_withdrawable, Allocation, Amount, RebalancePlan, ReserveHolding, StrategyInput,
};
use crate::config::AllocationPolicy;
use crate::error::RebalanceError;
use crate::registry::{Strategy, StrategyRegistry};
use crate::signal::{nominate_winner, PriceSource, SignalParams, YieldSource, YieldWinner};
use crate::sources::{PositionSource, ReserveSource};
use crate::utils::apply_ratio;
use anyhow::{Context, Result};
use futures_util::future::try_join_all;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Borrowed view of everything a cycle reads from.
#[derive(Clone, Copy)]
pub struct CycleContext<'a> {
    pub registry: &'a StrategyRegistry,
    pub positions: &'a dyn PositionSource,
    pub reserves: &'a dyn ReserveSource,
    /// Fraction of the oracle ceiling trusted as a hard constraint
    pub liquidity_safety_factor: Decimal,
}

/// Observed portfolio next to the proposed one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentAndTarget {
    pub current: Vec<Allocation>,
    pub target: Vec<Allocation>,
    /// Every strategy at its lock; the idle row is the most capital freeable now
    pub floor: Vec<Allocation>,
    pub total: Amount,
    pub winner: Option<YieldWinner>,
}

impl CurrentAndTarget {
    /// Capital that could be moved to idle this cycle.
    pub fn freeable(&self) -> Amount {
        self.floor
            .iter()
            .find(|a| a.is_idle())
            .map(|a| a.position_value)
            .unwrap_or(0)
    }

    pub fn plan(&self, min_move: Amount) -> RebalancePlan {
        RebalancePlan::from_allocations(&self.current, &self.target, min_move)
    }
}

struct CycleInputs {
    current: Vec<Allocation>,
    inputs: Vec<StrategyInput>,
    total: Amount,
}

async fn fetch_reserves(
    source: &dyn ReserveSource,
    strategy: &Strategy,
) -> Result<Option<Vec<ReserveHolding>>> {
    source
        .strategy_reserves(strategy)
        .await
        .with_context(|| format!("Failed to fetch reserves for {}", strategy.id))
}

async fn gather_inputs(ctx: &CycleContext<'_>) -> Result<CycleInputs> {
    let positions = ctx
        .positions
        .fetch_positions(ctx.registry)
        .await
        .context("Failed to fetch position values")?;
    let slot = ctx
        .reserves
        .current_slot()
        .await
        .context("Failed to fetch current slot")?;

    let mut values = Vec::with_capacity(ctx.registry.len());
    for strategy in ctx.registry.strategies() {
        let Some(position_value) = positions.value_of(&strategy.id) else {
            error!(strategy_id = %strategy.id, kind = %strategy.kind, "No position reported for strategy");
            return Err(RebalanceError::MissingPosition(strategy.id.clone()).into());
        };
        values.push(position_value);
    }

    let fetches: Vec<_> = ctx
        .registry
        .strategies()
        .iter()
        .map(|strategy| fetch_reserves(ctx.reserves, strategy))
        .collect();
    let reserve_sets = try_join_all(fetches).await?;

    let mut current = Vec::with_capacity(ctx.registry.len() + 1);
    let mut inputs = Vec::with_capacity(ctx.registry.len());

    for ((strategy, position_value), holdings) in
        ctx.registry.strategies().iter().zip(values).zip(reserve_sets)
    {
        let liquidity = match holdings {
            Some(holdings) => {
                let raw = max_withdrawable(&strategy.id, &holdings, slot)?;
                Some(apply_ratio(raw, ctx.liquidity_safety_factor))
            }
            None => None,
        };

        debug!(
            strategy_id = %strategy.id,
            position_value = %position_value,
            liquidity = ?liquidity,
            "Strategy input"
        );

        current.push(Allocation::for_strategy(strategy, position_value));
        inputs.push(StrategyInput::new(strategy, position_value, liquidity));
    }

    current.push(Allocation::idle(positions.idle));
    let total = allocation_total(&current);

    Ok(CycleInputs {
        current,
        inputs,
        total,
    })
}

fn check_conservation(target: &[Allocation], total: Amount) -> Result<(), RebalanceError> {
    let actual = allocation_total(target);
    if actual != total {
        error!(expected = %total, actual = %actual, "Target allocation does not conserve capital");
        return Err(RebalanceError::ConservationViolation {
            expected: total,
            actual,
        });
    }
    Ok(())
}

/// Current portfolio and its equal-weight target.
pub async fn current_and_equal_allocation(ctx: &CycleContext<'_>) -> Result<CurrentAndTarget> {
    let CycleInputs {
        current,
        inputs,
        total,
    } = gather_inputs(ctx).await?;

    let target = create_equal_weight_allocation(total, &inputs);
    check_conservation(&target, total)?;

    Ok(CurrentAndTarget {
        current,
        target,
        floor: create_initial_allocation(total, &inputs),
        total,
        winner: None,
    })
}

/// Current portfolio and its yield-driven target.
///
/// Falls back to the equal-weight target whenever the signal nominates
/// nobody, producing exactly what [`current_and_equal_allocation`] would.
pub async fn current_and_target_allocation(
    ctx: &CycleContext<'_>,
    yields: &dyn YieldSource,
    prices: &dyn PriceSource,
    params: SignalParams<'_>,
) -> Result<CurrentAndTarget> {
    let CycleInputs {
        current,
        inputs,
        total,
    } = gather_inputs(ctx).await?;

    let winner = nominate_winner(yields, prices, ctx.registry, params, total).await;
    let target = create_winner_take_all_allocation(
        total,
        &inputs,
        winner.as_ref().map(|w| w.strategy_id.as_str()),
    );
    check_conservation(&target, total)?;

    Ok(CurrentAndTarget {
        current,
        target,
        floor: create_initial_allocation(total, &inputs),
        total,
        winner,
    })
}

/// Yield signal collaborators and the asset they are queried for.
#[derive(Clone)]
pub struct YieldSignal {
    pub yields: Arc<dyn YieldSource>,
    pub prices: Arc<dyn PriceSource>,
    pub asset_mint: String,
    pub asset_decimals: u32,
    pub max_tvl_share: Decimal,
}

impl YieldSignal {
    pub fn params(&self) -> SignalParams<'_> {
        SignalParams {
            asset_mint: &self.asset_mint,
            asset_decimals: self.asset_decimals,
            max_tvl_share: self.max_tvl_share,
        }
    }
}

/// Owned cycle dependencies, shared by the worker and one-shot planning.
#[derive(Clone)]
pub struct CyclePlanner {
    registry: Arc<StrategyRegistry>,
    positions: Arc<dyn PositionSource>,
    reserves: Arc<dyn ReserveSource>,
    liquidity_safety_factor: Decimal,
    signal: Option<YieldSignal>,
}

impl CyclePlanner {
    pub fn new(
        registry: Arc<StrategyRegistry>,
        positions: Arc<dyn PositionSource>,
        reserves: Arc<dyn ReserveSource>,
        liquidity_safety_factor: Decimal,
    ) -> Self {
        Self {
            registry,
            positions,
            reserves,
            liquidity_safety_factor,
            signal: None,
        }
    }

    /// Use the yield-winner policy with the given signal.
    pub fn with_yield_signal(mut self, signal: YieldSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn policy(&self) -> AllocationPolicy {
        if self.signal.is_some() {
            AllocationPolicy::YieldWinner
        } else {
            AllocationPolicy::EqualWeight
        }
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    fn context(&self) -> CycleContext<'_> {
        CycleContext {
            registry: &self.registry,
            positions: self.positions.as_ref(),
            reserves: self.reserves.as_ref(),
            liquidity_safety_factor: self.liquidity_safety_factor,
        }
    }

    /// Compute current and target under the configured policy.
    pub async fn compute(&self) -> Result<CurrentAndTarget> {
        let ctx = self.context();
        let result = match &self.signal {
            Some(signal) => {
                current_and_target_allocation(&ctx, signal.yields.as_ref(), signal.prices.as_ref(), signal.params())
                    .await?
            }
            None => current_and_equal_allocation(&ctx).await?,
        };

        info!(
            policy = %self.policy(),
            total = %result.total,
            winner = result.winner.as_ref().map(|w| w.strategy_id.as_str()).unwrap_or("none"),
            "Target allocation computed"
        );
        Ok(result)
    }
}
