//! Target allocation policies.
//!
//! Every function here is pure: same inputs, same output, no I/O. Each
//! result lists the strategies in input order followed by one idle row, and
//! sums to the supplied total.

use super::types::{Allocation, Amount, StrategyInput};
use crate::utils::saturating_sum;
use tracing::{debug, info, warn};

/// Every strategy held at its locked amount, the remainder idle.
///
/// This is the most capital that can be freed this cycle.
pub fn create_initial_allocation(total: Amount, inputs: &[StrategyInput]) -> Vec<Allocation> {
    let mut allocations: Vec<Allocation> = inputs
        .iter()
        .map(|input| Allocation::for_input(input, input.locked()))
        .collect();

    let sum_locked = saturating_sum(allocations.iter().map(|a| a.position_value));
    if sum_locked > total {
        warn!(%total, %sum_locked, "Locked capital exceeds total; idle clamped to zero");
    }
    allocations.push(Allocation::idle(total.saturating_sub(sum_locked)));
    allocations
}

/// Equal split of the total across all strategies, respecting locks.
///
/// Strategies locked above their fair share are pinned at the lock and the
/// rest is split evenly over the others. Pinning repeats until no unpinned
/// strategy is locked above the recomputed share, so the sum never exceeds
/// the total. Integer-division residue goes to idle.
pub fn create_equal_weight_allocation(total: Amount, inputs: &[StrategyInput]) -> Vec<Allocation> {
    let n = inputs.len();
    if n == 0 {
        return vec![Allocation::idle(total)];
    }

    let locked: Vec<Amount> = inputs.iter().map(StrategyInput::locked).collect();
    let target_per_strategy = total / n as Amount;

    let mut pinned: Vec<bool> = locked.iter().map(|&l| l > target_per_strategy).collect();
    let mut passes = 1usize;

    let share = loop {
        let pinned_total = saturating_sum(
            locked
                .iter()
                .zip(&pinned)
                .filter(|(_, p)| **p)
                .map(|(l, _)| *l),
        );
        let normal_count = pinned.iter().filter(|&&p| !p).count();
        let share = if normal_count > 0 {
            total.saturating_sub(pinned_total) / normal_count as Amount
        } else {
            0
        };

        let mut changed = false;
        for (is_pinned, &lock) in pinned.iter_mut().zip(&locked) {
            if !*is_pinned && lock > share {
                *is_pinned = true;
                changed = true;
            }
        }

        if !changed {
            break share;
        }
        passes += 1;
    };

    debug!(
        %total,
        strategies = n,
        %target_per_strategy,
        %share,
        pinned = pinned.iter().filter(|&&p| p).count(),
        passes,
        "Equal-weight split"
    );

    let mut allocations: Vec<Allocation> = inputs
        .iter()
        .zip(locked.iter().zip(&pinned))
        .map(|(input, (&lock, &is_pinned))| {
            let value = if is_pinned { lock } else { share.max(lock) };
            Allocation::for_input(input, value)
        })
        .collect();

    let allocated = saturating_sum(allocations.iter().map(|a| a.position_value));
    if allocated > total {
        warn!(
            %total,
            %allocated,
            "Locked capital exceeds total; idle clamped to zero"
        );
    }
    allocations.push(Allocation::idle(total.saturating_sub(allocated)));
    allocations
}

/// Concentrate all free capital in `winner`, leaving others at their locks.
///
/// With no winner, or a winner that is not among the inputs, this is
/// exactly [`create_equal_weight_allocation`].
pub fn create_winner_take_all_allocation(
    total: Amount,
    inputs: &[StrategyInput],
    winner: Option<&str>,
) -> Vec<Allocation> {
    let Some(winner_id) = winner else {
        info!(fallback = "equal_weight", reason = "no_winner", "Falling back to equal-weight allocation");
        return create_equal_weight_allocation(total, inputs);
    };

    let Some(winner_idx) = inputs.iter().position(|i| i.strategy_id == winner_id) else {
        warn!(
            fallback = "equal_weight",
            reason = "unknown_winner",
            winner = winner_id,
            "Winner is not a registered strategy; falling back to equal-weight allocation"
        );
        return create_equal_weight_allocation(total, inputs);
    };

    let locked: Vec<Amount> = inputs.iter().map(StrategyInput::locked).collect();
    let others_locked = saturating_sum(
        locked
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != winner_idx)
            .map(|(_, &l)| l),
    );

    if others_locked > total {
        warn!(
            %total,
            %others_locked,
            winner = winner_id,
            "Locks on other strategies exceed total; winner floored at its own lock"
        );
    }
    let winner_value = total.saturating_sub(others_locked).max(locked[winner_idx]);

    debug!(
        %total,
        winner = winner_id,
        %winner_value,
        %others_locked,
        "Winner-take-all split"
    );

    let mut allocations: Vec<Allocation> = inputs
        .iter()
        .enumerate()
        .map(|(i, input)| {
            let value = if i == winner_idx { winner_value } else { locked[i] };
            Allocation::for_input(input, value)
        })
        .collect();

    let allocated = saturating_sum(allocations.iter().map(|a| a.position_value));
    allocations.push(Allocation::idle(total.saturating_sub(allocated)));
    allocations
}
