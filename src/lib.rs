//! # Vault Rebalancer
//!
//! Periodically rebalances a vault's deposited capital across a fixed set of
//! yield strategies, respecting how much each strategy can actually return
//! on withdrawal right now.
//!
//! ## Architecture
//!
//! - `allocation`: Liquidity ceilings, target policies, and move planning
//! - `config`: Configuration management and validation
//! - `error`: Typed data-integrity faults
//! - `persistence`: SQLite-based cycle history
//! - `rebalance`: Cycle orchestration and the background worker
//! - `registry`: Load-once strategy catalogue
//! - `signal`: External yield and price lookups for winner selection
//! - `sources`: Position and reserve state sources
//! - `utils`: Shared amount arithmetic

pub mod allocation;
pub mod config;
pub mod error;
pub mod persistence;
pub mod rebalance;
pub mod registry;
pub mod signal;
pub mod sources;
pub mod utils;

pub use config::Config;
pub use error::RebalanceError;
