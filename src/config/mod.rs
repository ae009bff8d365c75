//! Configuration management for the vault rebalancer.
//!
//! Loads settings from environment variables and config files.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Vault asset being allocated
    #[serde(default)]
    pub vault: VaultConfig,
    /// Path to the strategy registry file, read once at startup
    #[serde(default = "default_registry_path")]
    pub registry_path: String,
    /// Path to the portfolio snapshot read each cycle
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: String,
    /// Allocation policy settings
    #[serde(default)]
    pub allocation: AllocationConfig,
    /// External yield API
    #[serde(default)]
    pub yield_api: ApiConfig,
    /// External price API
    #[serde(default = "default_price_api")]
    pub price_api: ApiConfig,
    /// Rebalance loop timing and retry behaviour
    #[serde(default)]
    pub worker: WorkerConfig,
    /// Cycle history storage
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Mint address of the deposited asset
    #[serde(default)]
    pub asset_mint: String,
    /// Decimal places of the deposited asset
    #[serde(default = "default_asset_decimals")]
    pub asset_decimals: u32,
}

/// Which target policy the rebalance cycle runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationPolicy {
    /// Split evenly across strategies
    EqualWeight,
    /// Concentrate in the best eligible yield, falling back to equal weight
    YieldWinner,
}

impl fmt::Display for AllocationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocationPolicy::EqualWeight => write!(f, "equal_weight"),
            AllocationPolicy::YieldWinner => write!(f, "yield_winner"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationConfig {
    #[serde(default = "default_policy")]
    pub policy: AllocationPolicy,
    /// Fraction of oracle liquidity trusted as a hard constraint (0.0-1.0)
    #[serde(default = "default_liquidity_safety_factor")]
    pub liquidity_safety_factor: Decimal,
    /// Maximum share of a venue's TVL the vault may represent (0.0-1.0)
    /// Venues where the vault would exceed this are excluded from winner selection
    #[serde(default = "default_max_tvl_share")]
    pub max_tvl_share: Decimal,
    /// Moves below this size in native units are skipped
    #[serde(default)]
    pub min_move_amount: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default)]
    pub base_url: String,
    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Seconds between successful rebalance cycles
    #[serde(default = "default_rebalance_interval")]
    pub rebalance_interval_secs: u64,
    /// First retry delay after a failed cycle
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
    /// Upper bound on the retry delay
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,
    /// Relative jitter applied to retry delays (0.0-1.0)
    #[serde(default = "default_retry_jitter")]
    pub retry_jitter: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

// Default value functions
fn default_registry_path() -> String {
    "strategies.json".to_string()
}

fn default_snapshot_path() -> String {
    "portfolio.json".to_string()
}

fn default_asset_decimals() -> u32 {
    6
}

fn default_policy() -> AllocationPolicy {
    AllocationPolicy::YieldWinner
}

fn default_liquidity_safety_factor() -> Decimal {
    Decimal::new(98, 2) // 0.98
}

fn default_max_tvl_share() -> Decimal {
    Decimal::new(10, 2) // 0.10
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_price_api() -> ApiConfig {
    ApiConfig {
        base_url: "https://api.kamino.finance/kswap".to_string(),
        timeout_secs: default_timeout_secs(),
    }
}

fn default_rebalance_interval() -> u64 {
    1800 // 30 minutes
}

fn default_retry_base_delay() -> u64 {
    1_000
}

fn default_retry_max_delay() -> u64 {
    60_000
}

fn default_retry_jitter() -> Decimal {
    Decimal::new(25, 2) // 0.25
}

fn default_db_path() -> String {
    "data/rebalancer.db".to_string()
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("REBAL"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.allocation.liquidity_safety_factor > Decimal::ZERO
                && self.allocation.liquidity_safety_factor <= Decimal::ONE,
            "liquidity_safety_factor must be in (0, 1]"
        );

        anyhow::ensure!(
            self.allocation.max_tvl_share > Decimal::ZERO
                && self.allocation.max_tvl_share <= Decimal::ONE,
            "max_tvl_share must be in (0, 1]"
        );

        anyhow::ensure!(
            self.worker.rebalance_interval_secs > 0,
            "rebalance_interval_secs must be positive"
        );

        anyhow::ensure!(
            self.worker.retry_base_delay_ms > 0
                && self.worker.retry_base_delay_ms <= self.worker.retry_max_delay_ms,
            "retry_base_delay_ms must be positive and <= retry_max_delay_ms"
        );

        anyhow::ensure!(
            self.worker.retry_jitter >= Decimal::ZERO && self.worker.retry_jitter <= Decimal::ONE,
            "retry_jitter must be between 0 and 1"
        );

        anyhow::ensure!(
            self.vault.asset_decimals <= 18,
            "asset_decimals must be <= 18"
        );

        if self.allocation.policy == AllocationPolicy::YieldWinner {
            anyhow::ensure!(
                !self.vault.asset_mint.is_empty(),
                "vault.asset_mint is required for the yield_winner policy"
            );
            anyhow::ensure!(
                !self.yield_api.base_url.is_empty(),
                "yield_api.base_url is required for the yield_winner policy"
            );
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vault: VaultConfig::default(),
            registry_path: default_registry_path(),
            snapshot_path: default_snapshot_path(),
            allocation: AllocationConfig::default(),
            yield_api: ApiConfig::default(),
            price_api: default_price_api(),
            worker: WorkerConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            asset_mint: String::new(),
            asset_decimals: default_asset_decimals(),
        }
    }
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            policy: default_policy(),
            liquidity_safety_factor: default_liquidity_safety_factor(),
            max_tvl_share: default_max_tvl_share(),
            min_move_amount: 0,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            rebalance_interval_secs: default_rebalance_interval(),
            retry_base_delay_ms: default_retry_base_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
            retry_jitter: default_retry_jitter(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn equal_weight_config() -> Config {
        let mut config = Config::default();
        config.allocation.policy = AllocationPolicy::EqualWeight;
        config
    }

    #[test]
    fn test_default_equal_weight_config_is_valid() {
        assert!(equal_weight_config().validate().is_ok());
    }

    #[test]
    fn test_yield_policy_requires_mint_and_api() {
        let mut config = Config::default();
        assert!(config.validate().is_err());

        config.vault.asset_mint = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v".to_string();
        config.yield_api.base_url = "http://localhost:9000".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_safety_factor_bounds() {
        let mut config = equal_weight_config();
        config.allocation.liquidity_safety_factor = dec!(1.01);
        assert!(config.validate().is_err());

        config.allocation.liquidity_safety_factor = Decimal::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_delays_ordered() {
        let mut config = equal_weight_config();
        config.worker.retry_base_delay_ms = 120_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_policy_wire_names() {
        let policy: AllocationPolicy = serde_json::from_str("\"equal_weight\"").unwrap();
        assert_eq!(policy, AllocationPolicy::EqualWeight);
        assert_eq!(AllocationPolicy::YieldWinner.to_string(), "yield_winner");
    }
}
