//! Withdrawal-capacity estimation for lending reserves.
//!
//! Turns raw reserve state into the amount this vault could pull out right
//! now, bounded by three things:
//! - liquidity sitting unborrowed in the reserve
//! - the remaining room in the reserve's rate-limited withdrawal cap
//! - the vault's own holding in the reserve

use super::Amount;
use crate::error::RebalanceError;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

/// Rolling withdrawal cap for a reserve, measured in slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalCapWindow {
    /// Maximum cumulative withdrawals permitted per window
    pub capacity: Amount,
    /// Cumulative withdrawals recorded in the window that started at `last_interval_start_slot`
    pub current: Amount,
    pub last_interval_start_slot: u64,
    /// Window length; zero disables the rolling reset bookkeeping
    pub interval_length_slots: u64,
}

impl WithdrawalCapWindow {
    /// Usage that still counts against the cap at `current_slot`.
    ///
    /// Once the window has elapsed the recorded usage no longer applies.
    pub fn usage_at(&self, current_slot: u64) -> Amount {
        if self.interval_length_slots == 0 {
            return 0;
        }
        let window_end = self
            .last_interval_start_slot
            .saturating_add(self.interval_length_slots);
        if current_slot >= window_end {
            0
        } else {
            self.current
        }
    }

    /// Remaining capacity at `current_slot`, never negative.
    pub fn remaining_at(&self, current_slot: u64) -> Amount {
        self.capacity.saturating_sub(self.usage_at(current_slot))
    }
}

/// Decoded state of one lending reserve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveState {
    /// Unborrowed liquidity in the reserve
    pub available_liquidity: Amount,
    /// `None` when the reserve has no withdrawal cap configured
    #[serde(default)]
    pub withdrawal_cap: Option<WithdrawalCapWindow>,
}

impl ReserveState {
    /// Venue-wide ceiling on withdrawals right now, ignoring who owns the funds.
    pub fn market_ceiling(&self, current_slot: u64) -> Amount {
        match &self.withdrawal_cap {
            Some(cap) => self.available_liquidity.min(cap.remaining_at(current_slot)),
            None => self.available_liquidity,
        }
    }
}

/// The vault's holding in one reserve, with the reserve's state if it could be read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveHolding {
    pub reserve: String,
    /// Amount this vault has invested in the reserve
    pub invested: Amount,
    /// `None` when the reserve account was missing or undecodable
    pub state: Option<ReserveState>,
}

/// Amount withdrawable from a single reserve by a holder of `invested`.
pub fn compute_withdrawable(state: &ReserveState, current_slot: u64, invested: Amount) -> Amount {
    invested.min(state.market_ceiling(current_slot))
}

/// Largest single-reserve withdrawable amount across a strategy's reserves.
///
/// A withdrawal is routed through one reserve, so the ceiling is the best
/// reserve rather than the sum. Fails if any reserve state is missing.
pub fn max_withdrawable(
    strategy_id: &str,
    holdings: &[ReserveHolding],
    current_slot: u64,
) -> Result<Amount, RebalanceError> {
    let mut best: Amount = 0;

    for holding in holdings {
        let Some(state) = &holding.state else {
            error!(
                strategy_id,
                reserve = %holding.reserve,
                invested = %holding.invested,
                "Reserve state unavailable"
            );
            return Err(RebalanceError::MissingReserve {
                strategy_id: strategy_id.to_string(),
                reserve: holding.reserve.clone(),
            });
        };

        let withdrawable = compute_withdrawable(state, current_slot, holding.invested);
        debug!(
            strategy_id,
            reserve = %holding.reserve,
            available_liquidity = %state.available_liquidity,
            invested = %holding.invested,
            withdrawable = %withdrawable,
            "Evaluated reserve"
        );
        best = best.max(withdrawable);
    }

    Ok(best)
}
