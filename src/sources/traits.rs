//! Boundary traits for per-cycle portfolio state.
//!
//! Implementations read ledger state (or a stand-in for it); the cycle only
//! sees these traits, so tests can substitute mocks.

use crate::allocation::{Amount, ReserveHolding};
use crate::registry::{Strategy, StrategyRegistry};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Current capital per strategy plus the idle balance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    /// Position value keyed by strategy id
    pub values: HashMap<String, Amount>,
    /// Undeployed capital held by the vault
    pub idle: Amount,
}

impl PositionSnapshot {
    pub fn value_of(&self, strategy_id: &str) -> Option<Amount> {
        self.values.get(strategy_id).copied()
    }
}

/// Source of current position values.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PositionSource: Send + Sync {
    /// Position values for the registered strategies and the idle balance.
    ///
    /// Called first in every cycle, before any reserve lookups.
    async fn fetch_positions(&self, registry: &StrategyRegistry) -> Result<PositionSnapshot>;
}

/// Source of reserve state for liquidity estimation.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReserveSource: Send + Sync {
    /// Current ledger slot, used to evaluate withdrawal-cap windows.
    async fn current_slot(&self) -> Result<u64>;

    /// Reserves backing `strategy`.
    ///
    /// `Ok(None)` means the strategy has no reserve-level liquidity data and
    /// is treated as unbounded.
    async fn strategy_reserves(&self, strategy: &Strategy) -> Result<Option<Vec<ReserveHolding>>>;
}
