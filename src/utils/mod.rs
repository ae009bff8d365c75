//! Shared utilities.

pub mod amount;

pub use amount::{apply_ratio, saturating_sum, to_ui_amount};
