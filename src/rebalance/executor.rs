//! Plan execution seam.
//!
//! Venue adapters that build and submit deposit/withdraw transactions plug
//! in behind [`AllocationExecutor`]. The shipped executor only logs.

use crate::allocation::RebalancePlan;
use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

/// Carries out a rebalance plan against the venues.
#[async_trait]
pub trait AllocationExecutor: Send + Sync {
    /// Execute moves in plan order. Withdrawals precede deposits.
    async fn execute(&self, plan: &RebalancePlan) -> Result<()>;
}

/// Logs every move without touching any venue.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunExecutor;

#[async_trait]
impl AllocationExecutor for DryRunExecutor {
    async fn execute(&self, plan: &RebalancePlan) -> Result<()> {
        for (step, mv) in plan.moves.iter().enumerate() {
            info!(
                step = step + 1,
                strategy_id = %mv.strategy_id,
                kind = %mv.strategy_kind,
                address = %mv.strategy_address,
                direction = %mv.direction,
                amount = %mv.amount,
                "[DRY RUN] Would move capital"
            );
        }
        info!(
            moves = plan.moves.len(),
            withdrawn = %plan.total_withdrawn(),
            deposited = %plan.total_deposited(),
            "[DRY RUN] Plan complete"
        );
        Ok(())
    }
}
