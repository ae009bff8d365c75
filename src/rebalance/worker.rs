//! Background rebalance loop.
//!
//! The worker owns a single loop on its own tokio task, so cycles never
//! overlap. Timer ticks and manual triggers both feed that loop; triggers
//! that arrive while a cycle runs collapse into one follow-up cycle.

use super::backoff::Backoff;
use super::cycle::{CurrentAndTarget, CyclePlanner};
use super::executor::AllocationExecutor;
use crate::allocation::{Amount, RebalancePlan};
use crate::config::{AllocationPolicy, WorkerConfig};
use crate::persistence::{AllocationRecord, CycleEntry, CycleOutcome, CycleStore};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

const COMMAND_BUFFER: usize = 16;
const EVENT_BUFFER: usize = 64;

/// Inbound control messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCommand {
    /// Run a cycle as soon as the current one (if any) finishes
    TriggerRebalance,
    /// Stop after the current cycle; abandons any pending wait
    Shutdown,
}

/// Outbound notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Started,
    CycleFinished { cycle: u64, success: bool },
    Stopped,
}

/// Control side of a running worker.
pub struct WorkerHandle {
    commands: mpsc::Sender<WorkerCommand>,
    events: mpsc::Receiver<WorkerEvent>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// A sender for signal handlers and other control sources.
    pub fn commands(&self) -> mpsc::Sender<WorkerCommand> {
        self.commands.clone()
    }

    pub async fn trigger(&self) -> Result<()> {
        self.commands
            .send(WorkerCommand::TriggerRebalance)
            .await
            .context("Rebalance worker is not running")
    }

    /// Next worker notification, or `None` once the worker has exited.
    pub async fn next_event(&mut self) -> Option<WorkerEvent> {
        self.events.recv().await
    }

    /// Ask the worker to stop and wait for it to exit.
    pub async fn shutdown(self) -> Result<()> {
        // A closed channel means the worker already exited
        let _ = self.commands.send(WorkerCommand::Shutdown).await;
        self.join.await.context("Rebalance worker task failed")
    }

    /// Wait for the worker to exit on its own.
    pub async fn join(self) -> Result<()> {
        let Self { commands, join, .. } = self;
        drop(commands);
        join.await.context("Rebalance worker task failed")
    }
}

enum Wake {
    Elapsed,
    Triggered,
    Shutdown,
}

/// Periodic rebalancer driving a [`CyclePlanner`] and an executor.
pub struct RebalanceWorker {
    planner: CyclePlanner,
    executor: Arc<dyn AllocationExecutor>,
    store: Option<Mutex<CycleStore>>,
    settings: WorkerConfig,
    min_move: Amount,
    session_id: String,
}

impl RebalanceWorker {
    pub fn new(
        planner: CyclePlanner,
        executor: Arc<dyn AllocationExecutor>,
        settings: WorkerConfig,
        min_move: Amount,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            planner,
            executor,
            store: None,
            settings,
            min_move,
            session_id: session_id.into(),
        }
    }

    /// Record every cycle in `store`.
    pub fn with_store(mut self, store: CycleStore) -> Self {
        self.store = Some(Mutex::new(store));
        self
    }

    /// Start the loop on a dedicated task. The first cycle runs immediately.
    pub fn spawn(self) -> WorkerHandle {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);

        let join = tokio::spawn(self.run(command_rx, event_tx));

        WorkerHandle {
            commands: command_tx,
            events: event_rx,
            join,
        }
    }

    async fn run(self, mut commands: mpsc::Receiver<WorkerCommand>, events: mpsc::Sender<WorkerEvent>) {
        let interval = Duration::from_secs(self.settings.rebalance_interval_secs);
        let mut backoff = Backoff::from_config(&self.settings);
        let mut cycle: u64 = 0;

        info!(
            session_id = %self.session_id,
            policy = %self.planner.policy(),
            strategies = self.planner.registry().len(),
            interval_secs = interval.as_secs(),
            "Rebalance worker started"
        );
        emit(&events, WorkerEvent::Started);

        loop {
            cycle += 1;
            let span = info_span!("rebalance_cycle", cycle, session_id = %self.session_id);
            let retry_delay = match self.run_cycle(cycle).instrument(span).await {
                Ok(()) => {
                    backoff.reset();
                    None
                }
                Err(e) => {
                    let delay = backoff.record_failure();
                    error!(
                        cycle,
                        failures = backoff.failures(),
                        retry_in_ms = delay.as_millis() as u64,
                        error = %format!("{:#}", e),
                        "Rebalance cycle failed"
                    );
                    Some(delay)
                }
            };
            emit(
                &events,
                WorkerEvent::CycleFinished {
                    cycle,
                    success: retry_delay.is_none(),
                },
            );

            match drain_commands(&mut commands) {
                Wake::Shutdown => break,
                Wake::Triggered => {
                    info!("Manual trigger received during cycle; running follow-up cycle");
                    continue;
                }
                Wake::Elapsed => {}
            }

            let wait = retry_delay.unwrap_or(interval);
            debug!(wait_ms = wait.as_millis() as u64, "Waiting for next cycle");

            match wait_for_wake(&mut commands, wait).await {
                Wake::Shutdown => break,
                Wake::Triggered => info!("Manual rebalance triggered"),
                Wake::Elapsed => {}
            }
        }

        info!(session_id = %self.session_id, cycles = cycle, "Rebalance worker stopped");
        emit(&events, WorkerEvent::Stopped);
    }

    async fn run_cycle(&self, cycle: u64) -> Result<()> {
        let policy = self.planner.policy();
        let result = match self.planner.compute().await {
            Ok(result) => result,
            Err(e) => {
                self.record(failed_entry(&self.session_id, cycle, policy, &e));
                return Err(e);
            }
        };

        let plan = result.plan(self.min_move);
        info!(
            moves = plan.moves.len(),
            skipped_dust = plan.skipped_dust,
            withdraw = %plan.total_withdrawn(),
            deposit = %plan.total_deposited(),
            "Rebalance plan ready"
        );

        let executed = if plan.is_empty() {
            info!("Portfolio already at target");
            Ok(())
        } else {
            self.executor.execute(&plan).await
        };

        match &executed {
            Ok(()) => self.record(success_entry(&self.session_id, cycle, policy, &result, &plan)),
            Err(e) => {
                let mut entry = failed_entry(&self.session_id, cycle, policy, e);
                entry.total = Some(result.total);
                entry.winner = result.winner.as_ref().map(|w| w.strategy_id.as_str());
                self.record(entry);
            }
        }
        executed
    }

    fn record(&self, entry: CycleEntry<'_>) {
        let Some(store) = &self.store else {
            return;
        };
        let guard = match store.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = guard.record_cycle(&entry) {
            warn!(cycle = entry.cycle, error = %e, "Failed to record cycle");
        }
    }
}

fn success_entry<'a>(
    session_id: &'a str,
    cycle: u64,
    policy: AllocationPolicy,
    result: &'a CurrentAndTarget,
    plan: &RebalancePlan,
) -> CycleEntry<'a> {
    let current: HashMap<&str, Amount> = result
        .current
        .iter()
        .map(|a| (a.strategy_id.as_str(), a.position_value))
        .collect();

    CycleEntry {
        session_id,
        cycle,
        policy,
        outcome: CycleOutcome::Success,
        winner: result.winner.as_ref().map(|w| w.strategy_id.as_str()),
        total: Some(result.total),
        moves: plan.moves.len(),
        error: None,
        allocations: result
            .target
            .iter()
            .map(|t| AllocationRecord {
                strategy_id: t.strategy_id.clone(),
                current: current.get(t.strategy_id.as_str()).copied().unwrap_or(0),
                target: t.position_value,
            })
            .collect(),
    }
}

fn failed_entry<'a>(
    session_id: &'a str,
    cycle: u64,
    policy: AllocationPolicy,
    error: &anyhow::Error,
) -> CycleEntry<'a> {
    CycleEntry {
        session_id,
        cycle,
        policy,
        outcome: CycleOutcome::Failed,
        winner: None,
        total: None,
        moves: 0,
        error: Some(format!("{:#}", error)),
        allocations: Vec::new(),
    }
}

fn emit(events: &mpsc::Sender<WorkerEvent>, event: WorkerEvent) {
    // Nobody listening, or a slow listener, must not stall the loop
    if let Err(e) = events.try_send(event) {
        debug!(error = %e, "Dropped worker event");
    }
}

/// Consume commands queued during a cycle without blocking.
fn drain_commands(commands: &mut mpsc::Receiver<WorkerCommand>) -> Wake {
    let mut triggered = false;
    loop {
        match commands.try_recv() {
            Ok(WorkerCommand::Shutdown) | Err(TryRecvError::Disconnected) => return Wake::Shutdown,
            Ok(WorkerCommand::TriggerRebalance) => triggered = true,
            Err(TryRecvError::Empty) => break,
        }
    }
    if triggered {
        Wake::Triggered
    } else {
        Wake::Elapsed
    }
}

/// Sleep for `wait`, returning early on a command.
async fn wait_for_wake(commands: &mut mpsc::Receiver<WorkerCommand>, wait: Duration) -> Wake {
    tokio::select! {
        command = commands.recv() => match command {
            Some(WorkerCommand::TriggerRebalance) => Wake::Triggered,
            Some(WorkerCommand::Shutdown) | None => Wake::Shutdown,
        },
        _ = tokio::time::sleep(wait) => Wake::Elapsed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Strategy, StrategyKind, StrategyRegistry};
    use crate::sources::{MockPositionSource, MockReserveSource, PositionSnapshot};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;
    use tokio::time::timeout;
    use tokio_test::assert_ok;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// Counts concurrent executions and holds each one open for a while.
    #[derive(Default)]
    struct SlowExecutor {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        executions: AtomicUsize,
        entered: Notify,
    }

    #[async_trait]
    impl AllocationExecutor for SlowExecutor {
        async fn execute(&self, _plan: &RebalancePlan) -> Result<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.executions.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_one();
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn registry() -> Arc<StrategyRegistry> {
        Arc::new(
            StrategyRegistry::new(vec![
                Strategy::new("kvault", StrategyKind::KaminoVault, "vault-addr"),
                Strategy::new("jlend", StrategyKind::JupiterLend, "jlend-addr"),
            ])
            .unwrap(),
        )
    }

    /// All capital idle, so every cycle has deposits to make.
    fn idle_planner() -> CyclePlanner {
        let mut positions = MockPositionSource::new();
        positions.expect_fetch_positions().returning(|_| {
            Ok(PositionSnapshot {
                values: [("kvault".to_string(), 0), ("jlend".to_string(), 0)]
                    .into_iter()
                    .collect(),
                idle: 1_000_000,
            })
        });
        let mut reserves = MockReserveSource::new();
        reserves.expect_current_slot().returning(|| Ok(1));
        reserves.expect_strategy_reserves().returning(|_| Ok(None));

        CyclePlanner::new(registry(), Arc::new(positions), Arc::new(reserves), dec!(0.98))
    }

    fn failing_planner() -> CyclePlanner {
        let mut positions = MockPositionSource::new();
        positions
            .expect_fetch_positions()
            .returning(|_| Err(anyhow::anyhow!("rpc timeout")));
        let reserves = MockReserveSource::new();

        CyclePlanner::new(registry(), Arc::new(positions), Arc::new(reserves), dec!(0.98))
    }

    fn settings(interval_secs: u64) -> WorkerConfig {
        WorkerConfig {
            rebalance_interval_secs: interval_secs,
            retry_base_delay_ms: 10,
            retry_max_delay_ms: 20,
            retry_jitter: dec!(0),
        }
    }

    async fn expect_event(handle: &mut WorkerHandle) -> WorkerEvent {
        timeout(TEST_TIMEOUT, handle.next_event())
            .await
            .expect("timed out waiting for worker event")
            .expect("worker event channel closed")
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    #[tokio::test]
    async fn test_started_then_first_cycle() {
        let executor = Arc::new(SlowExecutor::default());
        let mut handle =
            RebalanceWorker::new(idle_planner(), executor.clone(), settings(3600), 0, "test").spawn();

        assert_eq!(expect_event(&mut handle).await, WorkerEvent::Started);
        assert_eq!(
            expect_event(&mut handle).await,
            WorkerEvent::CycleFinished {
                cycle: 1,
                success: true
            }
        );
        assert_eq!(executor.executions.load(Ordering::SeqCst), 1);

        assert_ok!(timeout(TEST_TIMEOUT, handle.shutdown()).await.unwrap());
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_interval_wait() {
        let executor = Arc::new(SlowExecutor::default());
        let mut handle =
            RebalanceWorker::new(idle_planner(), executor, settings(86_400), 0, "test").spawn();

        expect_event(&mut handle).await;
        expect_event(&mut handle).await;

        // A day-long interval must not delay shutdown
        let stopped = timeout(Duration::from_secs(1), handle.shutdown()).await;
        assert!(stopped.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_senders_stop_worker() {
        let executor = Arc::new(SlowExecutor::default());
        let mut handle =
            RebalanceWorker::new(idle_planner(), executor, settings(86_400), 0, "test").spawn();
        expect_event(&mut handle).await;
        expect_event(&mut handle).await;

        assert_ok!(timeout(Duration::from_secs(1), handle.join()).await.unwrap());
    }

    // =========================================================================
    // Triggers
    // =========================================================================

    #[tokio::test]
    async fn test_trigger_during_cycle_never_overlaps() {
        let executor = Arc::new(SlowExecutor::default());
        let mut handle =
            RebalanceWorker::new(idle_planner(), executor.clone(), settings(3600), 0, "test").spawn();

        assert_eq!(expect_event(&mut handle).await, WorkerEvent::Started);

        // Fire triggers while the first cycle is executing
        timeout(TEST_TIMEOUT, executor.entered.notified()).await.unwrap();
        for _ in 0..3 {
            assert_ok!(handle.trigger().await);
        }

        assert_eq!(
            expect_event(&mut handle).await,
            WorkerEvent::CycleFinished {
                cycle: 1,
                success: true
            }
        );
        // The three triggers collapse into one follow-up cycle
        assert_eq!(
            expect_event(&mut handle).await,
            WorkerEvent::CycleFinished {
                cycle: 2,
                success: true
            }
        );

        assert_ok!(timeout(TEST_TIMEOUT, handle.shutdown()).await.unwrap());
        assert_eq!(executor.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(executor.executions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_trigger_cuts_interval_short() {
        let executor = Arc::new(SlowExecutor::default());
        let mut handle =
            RebalanceWorker::new(idle_planner(), executor.clone(), settings(86_400), 0, "test").spawn();
        expect_event(&mut handle).await;
        expect_event(&mut handle).await;

        assert_ok!(handle.trigger().await);

        assert_eq!(
            expect_event(&mut handle).await,
            WorkerEvent::CycleFinished {
                cycle: 2,
                success: true
            }
        );
        assert_ok!(timeout(TEST_TIMEOUT, handle.shutdown()).await.unwrap());
    }

    // =========================================================================
    // Failures and history
    // =========================================================================

    #[tokio::test]
    async fn test_failed_cycles_retry_with_backoff() {
        let executor = Arc::new(SlowExecutor::default());
        let mut handle =
            RebalanceWorker::new(failing_planner(), executor.clone(), settings(86_400), 0, "test")
                .spawn();
        expect_event(&mut handle).await;

        for cycle in 1..=3 {
            assert_eq!(
                expect_event(&mut handle).await,
                WorkerEvent::CycleFinished {
                    cycle,
                    success: false
                }
            );
        }

        assert_ok!(timeout(TEST_TIMEOUT, handle.shutdown()).await.unwrap());
        assert_eq!(executor.executions.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cycles_recorded_in_store() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let executor = Arc::new(SlowExecutor::default());
        let store = CycleStore::new(":memory:").unwrap();
        let worker = RebalanceWorker::new(idle_planner(), executor, settings(3600), 0, "sess")
            .with_store(store);

        // Drive one cycle directly and inspect the store afterwards
        runtime.block_on(worker.run_cycle(1)).unwrap();

        let guard = worker.store.as_ref().unwrap().lock().unwrap();
        let cycles = guard.recent_cycles(10).unwrap();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].outcome, CycleOutcome::Success);
        assert_eq!(cycles[0].session_id, "sess");
        assert_eq!(cycles[0].policy, "equal_weight");
        assert_eq!(cycles[0].moves, 2);

        let rows = guard.allocations_for(cycles[0].id).unwrap();
        let idle = rows.iter().find(|r| r.strategy_id == "idle").unwrap();
        assert_eq!(idle.current, 1_000_000);
        assert_eq!(idle.target, 0);
    }
}
