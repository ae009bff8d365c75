//! Vault Rebalancer - Main Entry Point
//!
//! Runs the rebalance worker, or one-shot planning and inspection commands.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;
use vault_rebalancer::allocation::{Amount, MoveDirection, RebalancePlan};
use vault_rebalancer::config::{AllocationPolicy, Config};
use vault_rebalancer::persistence::{CycleOutcome, CycleStore};
use vault_rebalancer::rebalance::{
    CurrentAndTarget, CyclePlanner, DryRunExecutor, RebalanceWorker, WorkerCommand, WorkerEvent, YieldSignal,
};
use vault_rebalancer::registry::StrategyRegistry;
use vault_rebalancer::signal::{PriceApiClient, YieldApiClient};
use vault_rebalancer::sources::SnapshotFileSource;
use vault_rebalancer::utils::to_ui_amount;

/// Vault Rebalancer CLI
#[derive(Parser)]
#[command(name = "vault-rebalancer")]
#[command(version, about = "Liquidity-constrained capital rebalancing across yield strategies")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the rebalance worker (default)
    Run,

    /// Compute the current and target allocation once, without executing
    Plan {
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show recent rebalance cycles from the history database
    Status {
        /// Path to SQLite database (defaults to the configured history database)
        #[arg(short, long)]
        db: Option<String>,

        /// Number of cycles to show
        #[arg(short, long, default_value = "10")]
        limit: usize,

        /// Show per-strategy allocations for each cycle
        #[arg(short, long)]
        verbose: bool,
    },

    /// Load and validate configuration and the strategy registry
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    match cli.command {
        Some(Commands::Plan { json }) => run_plan(json).await,
        Some(Commands::Status { db, limit, verbose }) => {
            let db = status_db_path(db, Config::load)?;
            show_status(&db, limit, verbose)
        }
        Some(Commands::Validate) => run_validate(),
        Some(Commands::Run) | None => run_worker().await,
    }
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "vault-rebalancer.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep it alive for the program duration
    Box::leak(Box::new(_guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("vault_rebalancer=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Load and validate configuration.
fn load_config() -> Result<Config> {
    let config = Config::load()?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// History database for `status`. An explicit flag wins; otherwise the
/// configured path is used.
fn status_db_path(flag: Option<String>, load: impl FnOnce() -> Result<Config>) -> Result<String> {
    match flag {
        Some(db) => Ok(db),
        None => Ok(load()?.persistence.db_path),
    }
}

/// Log configuration on startup.
fn log_config(config: &Config, registry: &StrategyRegistry) {
    info!("📋 Configuration:");
    info!("   Policy: {}", config.allocation.policy);
    info!("   Strategies: {} ({})", registry.len(), config.registry_path);
    info!("   Snapshot: {}", config.snapshot_path);
    info!(
        "   Liquidity Safety Factor: {}",
        config.allocation.liquidity_safety_factor
    );
    if config.allocation.policy == AllocationPolicy::YieldWinner {
        info!("   Asset Mint: {}", config.vault.asset_mint);
        info!("   Max TVL Share: {}", config.allocation.max_tvl_share);
        info!("   Yield API: {}", config.yield_api.base_url);
    }
    info!(
        "   Interval: {}s, retry {}ms..{}ms",
        config.worker.rebalance_interval_secs,
        config.worker.retry_base_delay_ms,
        config.worker.retry_max_delay_ms
    );
}

/// Wire sources and the optional yield signal into a planner.
fn build_planner(config: &Config, registry: Arc<StrategyRegistry>) -> Result<CyclePlanner> {
    let snapshot = Arc::new(SnapshotFileSource::new(&config.snapshot_path));
    let planner = CyclePlanner::new(
        registry,
        snapshot.clone(),
        snapshot,
        config.allocation.liquidity_safety_factor,
    );

    match config.allocation.policy {
        AllocationPolicy::EqualWeight => Ok(planner),
        AllocationPolicy::YieldWinner => {
            let yields = YieldApiClient::new(&config.yield_api)?;
            let prices = PriceApiClient::new(&config.price_api)?;
            Ok(planner.with_yield_signal(YieldSignal {
                yields: Arc::new(yields),
                prices: Arc::new(prices),
                asset_mint: config.vault.asset_mint.clone(),
                asset_decimals: config.vault.asset_decimals,
                max_tvl_share: config.allocation.max_tvl_share,
            }))
        }
    }
}

fn session_id() -> String {
    hex::encode(rand::random::<[u8; 4]>())
}

/// Run the worker until Ctrl-C.
async fn run_worker() -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║           Vault Rebalancer v{}                          ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");

    let config = load_config()?;
    let registry = Arc::new(StrategyRegistry::load(&config.registry_path)?);
    log_config(&config, &registry);

    if let Some(parent) = Path::new(&config.persistence.db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    let store = CycleStore::new(&config.persistence.db_path)?;

    let session_id = session_id();
    let planner = build_planner(&config, registry)?;
    let worker = RebalanceWorker::new(
        planner,
        Arc::new(DryRunExecutor),
        config.worker.clone(),
        Amount::from(config.allocation.min_move_amount),
        session_id.clone(),
    )
    .with_store(store);

    let mut handle = worker.spawn();

    let shutdown = handle.commands();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Shutdown signal received");
        let _ = shutdown.send(WorkerCommand::Shutdown).await;
    });

    #[cfg(unix)]
    spawn_trigger_listener(handle.commands())?;

    while let Some(event) = handle.next_event().await {
        match event {
            WorkerEvent::Started => info!(session_id = %session_id, "🚀 Rebalance worker started"),
            WorkerEvent::CycleFinished { cycle, success } => {
                if success {
                    debug!(cycle, "Cycle finished");
                } else {
                    warn!(cycle, "⚠️  Cycle failed, retrying with backoff");
                }
            }
            WorkerEvent::Stopped => break,
        }
    }

    handle.join().await?;
    info!("👋 Vault Rebalancer shutdown complete");
    Ok(())
}

/// Trigger a rebalance on SIGUSR1.
#[cfg(unix)]
fn spawn_trigger_listener(commands: tokio::sync::mpsc::Sender<WorkerCommand>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut usr1 = signal(SignalKind::user_defined1()).context("Failed to install SIGUSR1 handler")?;
    tokio::spawn(async move {
        while usr1.recv().await.is_some() {
            info!("📨 SIGUSR1 received, triggering rebalance");
            if commands.send(WorkerCommand::TriggerRebalance).await.is_err() {
                break;
            }
        }
    });
    Ok(())
}

#[derive(Serialize)]
struct PlanOutput<'a> {
    allocation: &'a CurrentAndTarget,
    plan: &'a RebalancePlan,
}

/// Compute one target and print it next to the current portfolio.
async fn run_plan(json: bool) -> Result<()> {
    let config = load_config()?;
    let registry = Arc::new(StrategyRegistry::load(&config.registry_path)?);
    let planner = build_planner(&config, registry)?;

    let result = planner.compute().await?;
    let plan = result.plan(Amount::from(config.allocation.min_move_amount));

    if json {
        let output = PlanOutput {
            allocation: &result,
            plan: &plan,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let decimals = config.vault.asset_decimals;
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              REBALANCE PLAN ({})                ", planner.policy());
    println!("╚════════════════════════════════════════════════════════════╝");

    println!("\n📊 Allocation (total {})", to_ui_amount(result.total, decimals));
    println!("   Freeable this cycle: {}", to_ui_amount(result.freeable(), decimals));
    for (current, target) in result.current.iter().zip(&result.target) {
        println!(
            "   ├─ {:<24} {:>18} → {:>18}",
            current.strategy_id,
            to_ui_amount(current.position_value, decimals),
            to_ui_amount(target.position_value, decimals)
        );
    }

    match &result.winner {
        Some(winner) => println!(
            "\n🏆 Winner: {} ({}) APY {} TVL ${}",
            winner.strategy_id, winner.venue_key, winner.deposit_apy, winner.tvl_usd
        ),
        None if planner.policy() == AllocationPolicy::YieldWinner => {
            println!("\n⚖️  No eligible winner, equal-weight fallback")
        }
        None => {}
    }

    if plan.is_empty() {
        println!("\n✅ Portfolio already at target");
    } else {
        println!("\n🔁 Moves");
        for mv in &plan.moves {
            let arrow = match mv.direction {
                MoveDirection::Withdraw => "⬆️ ",
                MoveDirection::Deposit => "⬇️ ",
            };
            println!(
                "   ├─ {} {:<8} {:<24} {}",
                arrow,
                mv.direction,
                mv.strategy_id,
                to_ui_amount(mv.amount, decimals)
            );
        }
    }
    if plan.skipped_dust > 0 {
        println!("   └─ {} dust move(s) skipped", plan.skipped_dust);
    }

    println!();
    Ok(())
}

/// Check configuration and registry without running anything.
fn run_validate() -> Result<()> {
    let config = load_config()?;
    let registry = StrategyRegistry::load(&config.registry_path)?;

    println!("✅ Configuration valid (policy: {})", config.allocation.policy);
    println!("✅ Registry valid: {} strategies", registry.len());
    let mut by_kind: Vec<_> = registry.by_kind().into_iter().collect();
    by_kind.sort_by_key(|(kind, _)| kind.as_str());
    for (kind, strategies) in by_kind {
        println!("   ├─ {}: {}", kind, strategies.len());
        for strategy in strategies {
            println!("   │    {} ({})", strategy.id, strategy.address);
        }
    }
    Ok(())
}

/// Show recent cycles from the history database.
fn show_status(db_path: &str, limit: usize, verbose: bool) -> Result<()> {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              REBALANCER STATUS                             ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    if !Path::new(db_path).exists() {
        println!("\n❌ Database not found: {}", db_path);
        println!("   The worker has not run yet, or the database path is incorrect.");
        return Ok(());
    }

    let store = CycleStore::new(db_path)?;
    let cycles = store.recent_cycles(limit)?;

    if cycles.is_empty() {
        println!("\n❌ No cycles recorded yet.");
        return Ok(());
    }

    let failed = cycles
        .iter()
        .filter(|c| c.outcome == CycleOutcome::Failed)
        .count();
    println!("\n📈 Last {} cycles ({} failed)", cycles.len(), failed);

    for cycle in &cycles {
        let marker = match cycle.outcome {
            CycleOutcome::Success => "✅",
            CycleOutcome::Failed => "❌",
        };
        println!(
            "   {} {} session {} #{} [{}] winner={} moves={}",
            marker,
            cycle.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            cycle.session_id,
            cycle.cycle,
            cycle.policy,
            cycle.winner.as_deref().unwrap_or("-"),
            cycle.moves
        );
        if let Some(error) = &cycle.error {
            println!("      └─ {}", error);
        }

        if verbose {
            for row in store.allocations_for(cycle.id)? {
                println!(
                    "      ├─ {:<24} {:>20} → {:>20}",
                    row.strategy_id, row.current, row.target
                );
            }
        }
    }

    println!();
    Ok(())
}
