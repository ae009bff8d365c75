//! Typed faults raised by the rebalancing core.
//!
//! Application code wraps these in `anyhow` with context; matching on the
//! variant is only needed where a fault changes control flow.

use crate::allocation::Amount;
use thiserror::Error;

/// Domain errors for the registry, liquidity oracle, and rebalance cycle.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RebalanceError {
    /// Two registry entries share an id.
    #[error("duplicate strategy id in registry: {0}")]
    DuplicateStrategyId(String),

    /// A registry entry used the id reserved for undeployed capital.
    #[error("strategy id '{0}' is reserved for idle capital")]
    ReservedStrategyId(String),

    /// A registry entry is structurally invalid.
    #[error("invalid strategy '{id}': {reason}")]
    InvalidStrategy { id: String, reason: String },

    /// A reserve backing a strategy could not be fetched or decoded.
    #[error("reserve {reserve} for strategy {strategy_id} was not found or could not be decoded")]
    MissingReserve { strategy_id: String, reserve: String },

    /// The position source did not report a value for a registered strategy.
    #[error("no position value reported for strategy {0}")]
    MissingPosition(String),

    /// The price source had no data for some requested tokens.
    #[error("no price data for tokens: {}", .0.join(", "))]
    PriceUnavailable(Vec<String>),

    /// A computed allocation does not sum to its input total.
    #[error("allocation total {actual} does not match input total {expected}")]
    ConservationViolation { expected: Amount, actual: Amount },
}
