//! Capital allocation core.
//!
//! Contains:
//! - Withdrawal-capacity estimation from reserve state
//! - Equal-weight and winner-take-all target policies
//! - Diffing of current vs target into deposit/withdraw moves

mod engine;
pub mod liquidity;
mod plan;
mod types;

pub use engine::{
    create_equal_weight_allocation, create_initial_allocation, create_winner_take_all_allocation,
};
pub use liquidity::{
    compute_withdrawable, max_withdrawable, ReserveHolding, ReserveState, WithdrawalCapWindow,
};
pub use plan::{MoveDirection, RebalanceMove, RebalancePlan};
pub use types::{allocation_total, Allocation, Amount, StrategyInput};
