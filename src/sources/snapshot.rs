//! File-backed portfolio source.
//!
//! An external process may rewrite the JSON snapshot while the worker runs.
//! The file is read once per cycle, on `fetch_positions`; slot and reserve
//! lookups for the same cycle are served from that read.

use super::traits::{PositionSnapshot, PositionSource, ReserveSource};
use crate::allocation::{Amount, ReserveHolding};
use crate::registry::{Strategy, StrategyRegistry};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// On-disk portfolio state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    /// Ledger slot the snapshot was taken at
    pub slot: u64,
    /// Undeployed capital
    #[serde(default)]
    pub idle: Amount,
    /// Position value keyed by strategy id
    #[serde(default)]
    pub positions: HashMap<String, Amount>,
    /// Reserve holdings keyed by strategy id; absent strategies are unbounded
    #[serde(default)]
    pub reserves: HashMap<String, Vec<ReserveHolding>>,
}

impl PortfolioSnapshot {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("Failed to parse portfolio snapshot")
    }
}

/// Position and reserve source backed by a snapshot file.
#[derive(Debug, Clone)]
pub struct SnapshotFileSource {
    path: PathBuf,
    current: Arc<RwLock<Option<Arc<PortfolioSnapshot>>>>,
}

impl SnapshotFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            current: Arc::new(RwLock::new(None)),
        }
    }

    async fn read(&self) -> Result<PortfolioSnapshot> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read snapshot {}", self.path.display()))?;
        PortfolioSnapshot::from_json(&raw)
    }

    /// Read the file and make it the snapshot for the cycle in progress.
    async fn refresh(&self) -> Result<Arc<PortfolioSnapshot>> {
        let snapshot = Arc::new(self.read().await?);
        *self.current.write().await = Some(Arc::clone(&snapshot));
        debug!(slot = snapshot.slot, path = %self.path.display(), "Loaded portfolio snapshot");
        Ok(snapshot)
    }

    /// Snapshot for the cycle in progress, loading it if none has been read yet.
    async fn cycle_snapshot(&self) -> Result<Arc<PortfolioSnapshot>> {
        if let Some(snapshot) = self.current.read().await.as_ref() {
            return Ok(Arc::clone(snapshot));
        }
        self.refresh().await
    }
}

#[async_trait]
impl PositionSource for SnapshotFileSource {
    /// Starts a cycle: rereads the file.
    async fn fetch_positions(&self, registry: &StrategyRegistry) -> Result<PositionSnapshot> {
        let snapshot = self.refresh().await?;

        for id in snapshot.positions.keys() {
            if !registry.contains(id) {
                debug!(strategy_id = %id, "Ignoring position for unregistered strategy");
            }
        }

        let values = snapshot
            .positions
            .iter()
            .filter(|(id, _)| registry.contains(id))
            .map(|(id, value)| (id.clone(), *value))
            .collect();

        Ok(PositionSnapshot {
            values,
            idle: snapshot.idle,
        })
    }
}

#[async_trait]
impl ReserveSource for SnapshotFileSource {
    async fn current_slot(&self) -> Result<u64> {
        Ok(self.cycle_snapshot().await?.slot)
    }

    async fn strategy_reserves(&self, strategy: &Strategy) -> Result<Option<Vec<ReserveHolding>>> {
        Ok(self.cycle_snapshot().await?.reserves.get(&strategy.id).cloned())
    }
}
