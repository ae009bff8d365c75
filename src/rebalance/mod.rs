//! Rebalance cycle orchestration.
//!
//! Contains:
//! - The per-cycle read, estimate and decide step
//! - The background worker with its control channel
//! - Retry backoff and the execution seam

mod backoff;
mod cycle;
mod executor;
mod worker;

pub use backoff::Backoff;
pub use cycle::{
    current_and_equal_allocation, current_and_target_allocation, CurrentAndTarget, CycleContext,
    CyclePlanner, YieldSignal,
};
pub use executor::{AllocationExecutor, DryRunExecutor};
pub use worker::{RebalanceWorker, WorkerCommand, WorkerEvent, WorkerHandle};
