//! SQLite persistence for rebalance cycle history.
//!
//! Records every cycle the worker runs:
//! - Outcome, policy and winner per cycle
//! - Current and target value per strategy for successful cycles
//!
//! Amounts are stored as TEXT since they can exceed SQLite's integer range.

use crate::allocation::Amount;
use crate::config::AllocationPolicy;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::fmt;
use std::path::Path;
use tracing::{debug, info};

/// How a cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Success,
    Failed,
}

impl CycleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleOutcome::Success => "success",
            CycleOutcome::Failed => "failed",
        }
    }

    fn parse(raw: &str) -> Self {
        if raw == "success" {
            CycleOutcome::Success
        } else {
            CycleOutcome::Failed
        }
    }
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current and target value of one strategy in a recorded cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRecord {
    pub strategy_id: String,
    pub current: Amount,
    pub target: Amount,
}

/// A cycle to be recorded.
#[derive(Debug, Clone)]
pub struct CycleEntry<'a> {
    pub session_id: &'a str,
    pub cycle: u64,
    pub policy: AllocationPolicy,
    pub outcome: CycleOutcome,
    pub winner: Option<&'a str>,
    pub total: Option<Amount>,
    pub moves: usize,
    pub error: Option<String>,
    pub allocations: Vec<AllocationRecord>,
}

/// A recorded cycle as read back from the database.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub cycle: u64,
    pub policy: String,
    pub outcome: CycleOutcome,
    pub winner: Option<String>,
    pub total: Option<Amount>,
    pub moves: usize,
    pub error: Option<String>,
}

/// SQLite-backed cycle history.
pub struct CycleStore {
    conn: Connection,
}

impl CycleStore {
    /// Open the store, initializing the database if needed.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        let store = Self { conn };
        store.init_schema()?;

        info!("Cycle store initialized at {:?}", db_path.as_ref());
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS rebalance_cycles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                session_id TEXT NOT NULL,
                cycle INTEGER NOT NULL,
                policy TEXT NOT NULL,
                outcome TEXT NOT NULL,
                winner TEXT,
                total TEXT,
                moves INTEGER NOT NULL,
                error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_cycles_timestamp ON rebalance_cycles(timestamp);

            CREATE TABLE IF NOT EXISTS cycle_allocations (
                cycle_id INTEGER NOT NULL REFERENCES rebalance_cycles(id),
                strategy_id TEXT NOT NULL,
                current_value TEXT NOT NULL,
                target_value TEXT NOT NULL,
                PRIMARY KEY (cycle_id, strategy_id)
            );
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Record a cycle and its allocation rows. Returns the cycle row id.
    pub fn record_cycle(&self, entry: &CycleEntry<'_>) -> Result<i64> {
        let tx = self.conn.unchecked_transaction()?;

        tx.execute(
            r#"
            INSERT INTO rebalance_cycles (timestamp, session_id, cycle, policy, outcome,
                                          winner, total, moves, error)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                Utc::now().to_rfc3339(),
                entry.session_id,
                entry.cycle,
                entry.policy.to_string(),
                entry.outcome.as_str(),
                entry.winner,
                entry.total.map(|t| t.to_string()),
                entry.moves,
                entry.error,
            ],
        )?;
        let cycle_id = tx.last_insert_rowid();

        for row in &entry.allocations {
            tx.execute(
                r#"
                INSERT INTO cycle_allocations (cycle_id, strategy_id, current_value, target_value)
                VALUES (?1, ?2, ?3, ?4)
                "#,
                params![
                    cycle_id,
                    row.strategy_id,
                    row.current.to_string(),
                    row.target.to_string(),
                ],
            )?;
        }

        tx.commit()?;

        debug!(
            cycle_id,
            cycle = entry.cycle,
            outcome = %entry.outcome,
            rows = entry.allocations.len(),
            "Cycle recorded"
        );
        Ok(cycle_id)
    }

    /// Most recent cycles, newest first.
    pub fn recent_cycles(&self, limit: usize) -> Result<Vec<CycleRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, timestamp, session_id, cycle, policy, outcome, winner, total, moves, error
            FROM rebalance_cycles
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )?;

        let cycles: Vec<CycleRecord> = stmt
            .query_map([limit], |row| {
                let ts: String = row.get(1)?;
                let outcome: String = row.get(5)?;
                let total: Option<String> = row.get(7)?;
                Ok(CycleRecord {
                    id: row.get(0)?,
                    timestamp: DateTime::parse_from_rfc3339(&ts)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                    session_id: row.get(2)?,
                    cycle: row.get(3)?,
                    policy: row.get(4)?,
                    outcome: CycleOutcome::parse(&outcome),
                    winner: row.get(6)?,
                    total: total.and_then(|t| t.parse().ok()),
                    moves: row.get(8)?,
                    error: row.get(9)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(cycles)
    }

    /// Allocation rows recorded for a cycle, in strategy id order.
    pub fn allocations_for(&self, cycle_id: i64) -> Result<Vec<AllocationRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT strategy_id, current_value, target_value
            FROM cycle_allocations
            WHERE cycle_id = ?1
            ORDER BY strategy_id
            "#,
        )?;

        let rows: Vec<AllocationRecord> = stmt
            .query_map([cycle_id], |row| {
                let current: String = row.get(1)?;
                let target: String = row.get(2)?;
                Ok(AllocationRecord {
                    strategy_id: row.get(0)?,
                    current: current.parse().unwrap_or_default(),
                    target: target.parse().unwrap_or_default(),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn success_entry(cycle: u64) -> CycleEntry<'static> {
        CycleEntry {
            session_id: "a1b2c3d4",
            cycle,
            policy: AllocationPolicy::YieldWinner,
            outcome: CycleOutcome::Success,
            winner: Some("kvault"),
            total: Some(1_000_000),
            moves: 2,
            error: None,
            allocations: vec![
                AllocationRecord {
                    strategy_id: "kvault".to_string(),
                    current: 500_000,
                    target: 700_000,
                },
                AllocationRecord {
                    strategy_id: "idle".to_string(),
                    current: 200_000,
                    target: 0,
                },
            ],
        }
    }

    #[test]
    fn test_record_and_read_back_cycle() {
        let store = CycleStore::new(":memory:").unwrap();

        let id = store.record_cycle(&success_entry(1)).unwrap();

        let cycles = store.recent_cycles(10).unwrap();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].id, id);
        assert_eq!(cycles[0].outcome, CycleOutcome::Success);
        assert_eq!(cycles[0].policy, "yield_winner");
        assert_eq!(cycles[0].winner.as_deref(), Some("kvault"));
        assert_eq!(cycles[0].total, Some(1_000_000));
        assert_eq!(cycles[0].moves, 2);

        let rows = store.allocations_for(id).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].strategy_id, "idle");
        assert_eq!(rows[1].target, 700_000);
    }

    #[test]
    fn test_failed_cycle_has_no_rows() {
        let store = CycleStore::new(":memory:").unwrap();

        let id = store
            .record_cycle(&CycleEntry {
                session_id: "a1b2c3d4",
                cycle: 1,
                policy: AllocationPolicy::EqualWeight,
                outcome: CycleOutcome::Failed,
                winner: None,
                total: None,
                moves: 0,
                error: Some("reserve state unavailable".to_string()),
                allocations: Vec::new(),
            })
            .unwrap();

        let cycles = store.recent_cycles(10).unwrap();
        assert_eq!(cycles[0].outcome, CycleOutcome::Failed);
        assert_eq!(cycles[0].error.as_deref(), Some("reserve state unavailable"));
        assert!(cycles[0].total.is_none());
        assert!(store.allocations_for(id).unwrap().is_empty());
    }

    #[test]
    fn test_recent_cycles_newest_first_and_limited() {
        let store = CycleStore::new(":memory:").unwrap();
        for cycle in 1..=5 {
            store.record_cycle(&success_entry(cycle)).unwrap();
        }

        let cycles = store.recent_cycles(3).unwrap();
        assert_eq!(
            cycles.iter().map(|c| c.cycle).collect::<Vec<_>>(),
            vec![5, 4, 3]
        );
    }

    #[test]
    fn test_amounts_beyond_i64_round_trip() {
        let store = CycleStore::new(":memory:").unwrap();
        let mut entry = success_entry(1);
        entry.total = Some(u128::MAX);

        store.record_cycle(&entry).unwrap();

        assert_eq!(store.recent_cycles(1).unwrap()[0].total, Some(u128::MAX));
    }
}
