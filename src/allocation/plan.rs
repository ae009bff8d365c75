//! Current-vs-target diffing into venue moves.

use super::types::{Allocation, Amount};
use crate::registry::StrategyKind;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

/// Direction of a capital move relative to a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveDirection {
    /// Pull capital out of the strategy into idle
    Withdraw,
    /// Push idle capital into the strategy
    Deposit,
}

impl fmt::Display for MoveDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MoveDirection::Withdraw => write!(f, "withdraw"),
            MoveDirection::Deposit => write!(f, "deposit"),
        }
    }
}

/// A single deposit or withdrawal against one strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RebalanceMove {
    pub strategy_id: String,
    pub strategy_kind: StrategyKind,
    pub strategy_address: String,
    pub direction: MoveDirection,
    pub amount: Amount,
}

/// Ordered set of moves taking the current portfolio to the target.
///
/// Withdrawals come first so deposits are funded from freed capital.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RebalancePlan {
    pub moves: Vec<RebalanceMove>,
    /// Moves skipped for being below the minimum size
    pub skipped_dust: usize,
}

impl RebalancePlan {
    /// Diff two allocations over the same strategies.
    ///
    /// Rows are matched by strategy id. The idle row is the balancing bucket
    /// and never produces a move. A strategy present in only one side is
    /// treated as zero on the other.
    pub fn from_allocations(current: &[Allocation], target: &[Allocation], min_move: Amount) -> Self {
        let current_by_id: HashMap<&str, Amount> = current
            .iter()
            .filter(|a| !a.is_idle())
            .map(|a| (a.strategy_id.as_str(), a.position_value))
            .collect();

        let mut withdrawals = Vec::new();
        let mut deposits = Vec::new();
        let mut skipped_dust = 0;

        for row in target.iter().filter(|a| !a.is_idle()) {
            let (Some(kind), Some(address)) = (row.strategy_kind, row.strategy_address.as_ref()) else {
                continue;
            };
            let have = current_by_id.get(row.strategy_id.as_str()).copied().unwrap_or(0);
            let want = row.position_value;

            let (direction, amount) = if want < have {
                (MoveDirection::Withdraw, have - want)
            } else if want > have {
                (MoveDirection::Deposit, want - have)
            } else {
                continue;
            };

            if amount < min_move {
                debug!(
                    strategy_id = %row.strategy_id,
                    %direction,
                    %amount,
                    %min_move,
                    "Skipping dust move"
                );
                skipped_dust += 1;
                continue;
            }

            let mv = RebalanceMove {
                strategy_id: row.strategy_id.clone(),
                strategy_kind: kind,
                strategy_address: address.clone(),
                direction,
                amount,
            };
            match direction {
                MoveDirection::Withdraw => withdrawals.push(mv),
                MoveDirection::Deposit => deposits.push(mv),
            }
        }

        // Strategies dropped from the target are emptied
        for row in current.iter().filter(|a| !a.is_idle() && a.position_value > 0) {
            if target.iter().any(|t| t.strategy_id == row.strategy_id) {
                continue;
            }
            if let (Some(kind), Some(address)) = (row.strategy_kind, row.strategy_address.as_ref()) {
                withdrawals.push(RebalanceMove {
                    strategy_id: row.strategy_id.clone(),
                    strategy_kind: kind,
                    strategy_address: address.clone(),
                    direction: MoveDirection::Withdraw,
                    amount: row.position_value,
                });
            }
        }

        withdrawals.extend(deposits);
        Self {
            moves: withdrawals,
            skipped_dust,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    pub fn total_withdrawn(&self) -> Amount {
        self.total_for(MoveDirection::Withdraw)
    }

    pub fn total_deposited(&self) -> Amount {
        self.total_for(MoveDirection::Deposit)
    }

    fn total_for(&self, direction: MoveDirection) -> Amount {
        crate::utils::saturating_sum(
            self.moves
                .iter()
                .filter(|m| m.direction == direction)
                .map(|m| m.amount),
        )
    }
}
