//! Allocation data model.

use crate::registry::{Strategy, StrategyKind, IDLE_ID};
use serde::{Deserialize, Serialize};

/// Capital in the asset's smallest unit.
pub type Amount = u128;

/// Per-cycle snapshot of one strategy, as fed to the allocation engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyInput {
    pub strategy_id: String,
    pub strategy_kind: StrategyKind,
    pub strategy_address: String,
    /// Capital currently held by the strategy
    pub position_value: Amount,
    /// Upper bound on what can be withdrawn right now; `None` when no cap is known
    pub available_withdrawable_liquidity: Option<Amount>,
}

impl StrategyInput {
    pub fn new(
        strategy: &Strategy,
        position_value: Amount,
        available_withdrawable_liquidity: Option<Amount>,
    ) -> Self {
        Self {
            strategy_id: strategy.id.clone(),
            strategy_kind: strategy.kind,
            strategy_address: strategy.address.clone(),
            position_value,
            available_withdrawable_liquidity,
        }
    }

    /// Capital that cannot be withdrawn at current liquidity.
    pub fn locked(&self) -> Amount {
        match self.available_withdrawable_liquidity {
            Some(liquidity) => self.position_value.saturating_sub(liquidity),
            None => 0,
        }
    }
}

/// One row of a current or target portfolio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub strategy_id: String,
    /// `None` for the idle row
    pub strategy_kind: Option<StrategyKind>,
    /// `None` for the idle row
    pub strategy_address: Option<String>,
    pub position_value: Amount,
}

impl Allocation {
    pub fn for_strategy(strategy: &Strategy, position_value: Amount) -> Self {
        Self {
            strategy_id: strategy.id.clone(),
            strategy_kind: Some(strategy.kind),
            strategy_address: Some(strategy.address.clone()),
            position_value,
        }
    }

    pub(crate) fn for_input(input: &StrategyInput, position_value: Amount) -> Self {
        Self {
            strategy_id: input.strategy_id.clone(),
            strategy_kind: Some(input.strategy_kind),
            strategy_address: Some(input.strategy_address.clone()),
            position_value,
        }
    }

    pub fn idle(position_value: Amount) -> Self {
        Self {
            strategy_id: IDLE_ID.to_string(),
            strategy_kind: None,
            strategy_address: None,
            position_value,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.strategy_kind.is_none() && self.strategy_id == IDLE_ID
    }
}

/// Sum of all rows, saturating.
pub fn allocation_total(allocations: &[Allocation]) -> Amount {
    crate::utils::saturating_sum(allocations.iter().map(|a| a.position_value))
}
