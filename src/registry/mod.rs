//! Strategy registry.
//!
//! A load-once, read-only catalogue of the yield venues the vault may
//! allocate to. Built at startup from `strategies.json` and shared by `Arc`;
//! nothing reloads it mid-run.

use crate::error::RebalanceError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use tracing::info;

/// Id of the pseudo-strategy holding undeployed capital.
pub const IDLE_ID: &str = "idle";

/// Venue kind of a registered strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StrategyKind {
    /// Vault wrapper allocating across several lending reserves
    KaminoVault,
    /// Direct lending-market position
    KaminoMarket,
    /// Earn (insurance-fund style) position
    DriftEarn,
    /// Lending position in a single-asset pool
    JupiterLend,
}

impl StrategyKind {
    /// Wire name, as written in the registry file.
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::KaminoVault => "kaminoVault",
            StrategyKind::KaminoMarket => "kaminoMarket",
            StrategyKind::DriftEarn => "driftEarn",
            StrategyKind::JupiterLend => "jupiterLend",
        }
    }

    /// Provider family reported by yield APIs for venues of this kind.
    pub fn provider(&self) -> &'static str {
        match self {
            StrategyKind::KaminoVault | StrategyKind::KaminoMarket => "kamino",
            StrategyKind::DriftEarn => "drift",
            StrategyKind::JupiterLend => "jupiter",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered yield venue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Strategy {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: StrategyKind,
    pub address: String,
}

impl Strategy {
    pub fn new(id: impl Into<String>, kind: StrategyKind, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            address: address.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    strategies: Vec<Strategy>,
}

/// Validated, indexed strategy catalogue.
#[derive(Debug, Clone)]
pub struct StrategyRegistry {
    strategies: Vec<Strategy>,
    by_id: HashMap<String, usize>,
}

impl StrategyRegistry {
    /// Build a registry, rejecting duplicate, reserved, or empty ids.
    pub fn new(strategies: Vec<Strategy>) -> Result<Self, RebalanceError> {
        let mut by_id = HashMap::with_capacity(strategies.len());

        for (idx, strategy) in strategies.iter().enumerate() {
            if strategy.id.trim().is_empty() {
                return Err(RebalanceError::InvalidStrategy {
                    id: strategy.id.clone(),
                    reason: "id must not be empty".to_string(),
                });
            }
            if strategy.id == IDLE_ID {
                return Err(RebalanceError::ReservedStrategyId(strategy.id.clone()));
            }
            if strategy.address.trim().is_empty() {
                return Err(RebalanceError::InvalidStrategy {
                    id: strategy.id.clone(),
                    reason: "address must not be empty".to_string(),
                });
            }
            if by_id.insert(strategy.id.clone(), idx).is_some() {
                return Err(RebalanceError::DuplicateStrategyId(strategy.id.clone()));
            }
        }

        Ok(Self { strategies, by_id })
    }

    /// Parse and validate a registry from its JSON representation.
    pub fn from_json(raw: &str) -> Result<Self> {
        let file: RegistryFile =
            serde_json::from_str(raw).context("Failed to parse strategy registry")?;
        Ok(Self::new(file.strategies)?)
    }

    /// Load the registry file once at startup.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).with_context(|| {
            format!("Failed to read strategy registry at {:?}", path.as_ref())
        })?;
        let registry = Self::from_json(&raw)?;

        info!(
            path = ?path.as_ref(),
            strategies = registry.len(),
            "Strategy registry loaded"
        );
        Ok(registry)
    }

    /// All strategies, in file order.
    pub fn strategies(&self) -> &[Strategy] {
        &self.strategies
    }

    pub fn get(&self, id: &str) -> Option<&Strategy> {
        self.by_id.get(id).map(|&idx| &self.strategies[idx])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Strategies of one kind, in file order.
    pub fn of_kind(&self, kind: StrategyKind) -> impl Iterator<Item = &Strategy> {
        self.strategies.iter().filter(move |s| s.kind == kind)
    }

    /// Strategies grouped by venue kind.
    pub fn by_kind(&self) -> HashMap<StrategyKind, Vec<&Strategy>> {
        let mut grouped: HashMap<StrategyKind, Vec<&Strategy>> = HashMap::new();
        for strategy in &self.strategies {
            grouped.entry(strategy.kind).or_default().push(strategy);
        }
        grouped
    }

    /// Vault-wrapper strategies, the ones that span several reserves.
    pub fn kamino_vaults(&self) -> Vec<&Strategy> {
        self.of_kind(StrategyKind::KaminoVault).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "strategies": [
            { "id": "kvault-usdc", "type": "kaminoVault", "address": "KVau1t111" },
            { "id": "kmarket-main", "type": "kaminoMarket", "address": "KMkt111" },
            { "id": "drift-earn", "type": "driftEarn", "address": "Drift111" },
            { "id": "jlend-usdc", "type": "jupiterLend", "address": "JLend111" }
        ]
    }"#;

    #[test]
    fn test_from_json_preserves_order_and_index() {
        let registry = StrategyRegistry::from_json(SAMPLE).unwrap();

        assert_eq!(registry.len(), 4);
        assert_eq!(registry.strategies()[0].id, "kvault-usdc");
        assert_eq!(registry.strategies()[3].kind, StrategyKind::JupiterLend);
        assert_eq!(registry.get("drift-earn").unwrap().address, "Drift111");
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_grouping_by_kind() {
        let registry = StrategyRegistry::from_json(SAMPLE).unwrap();

        let vaults = registry.kamino_vaults();
        assert_eq!(vaults.len(), 1);
        assert_eq!(vaults[0].id, "kvault-usdc");

        let grouped = registry.by_kind();
        assert_eq!(grouped.len(), 4);
        assert_eq!(grouped[&StrategyKind::DriftEarn][0].id, "drift-earn");
    }

    #[test]
    fn test_duplicate_id_is_fatal() {
        let result = StrategyRegistry::new(vec![
            Strategy::new("a", StrategyKind::KaminoMarket, "Addr1"),
            Strategy::new("a", StrategyKind::DriftEarn, "Addr2"),
        ]);
        assert_eq!(
            result.unwrap_err(),
            RebalanceError::DuplicateStrategyId("a".to_string())
        );
    }

    #[test]
    fn test_idle_id_is_reserved() {
        let result = StrategyRegistry::new(vec![Strategy::new(
            IDLE_ID,
            StrategyKind::KaminoMarket,
            "Addr1",
        )]);
        assert!(matches!(result, Err(RebalanceError::ReservedStrategyId(_))));
    }

    #[test]
    fn test_empty_address_rejected() {
        let result = StrategyRegistry::new(vec![Strategy::new("a", StrategyKind::JupiterLend, " ")]);
        assert!(matches!(result, Err(RebalanceError::InvalidStrategy { .. })));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let raw = r#"{ "strategies": [ { "id": "x", "type": "mystery", "address": "A" } ] }"#;
        assert!(StrategyRegistry::from_json(raw).is_err());
    }

    #[test]
    fn test_kind_wire_names_round_trip() {
        for kind in [
            StrategyKind::KaminoVault,
            StrategyKind::KaminoMarket,
            StrategyKind::DriftEarn,
            StrategyKind::JupiterLend,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
        assert_eq!(StrategyKind::KaminoMarket.provider(), "kamino");
    }

    #[test]
    fn test_bundled_strategies_file_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("strategies.json");
        let registry = StrategyRegistry::load(&path).unwrap();

        assert_eq!(registry.len(), 4);
        assert!(registry.contains("kvault-usdc-main"));
        assert_eq!(
            registry.get("jlend-usdc").unwrap().kind,
            StrategyKind::JupiterLend
        );
    }
}
