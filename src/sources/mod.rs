//! Per-cycle portfolio state sources.

mod snapshot;
mod traits;

pub use snapshot::{PortfolioSnapshot, SnapshotFileSource};
pub use traits::{PositionSnapshot, PositionSource, ReserveSource};

#[cfg(test)]
pub use traits::{MockPositionSource, MockReserveSource};
