//! CLOB Trader - Main Entry Point
//!
//! Paper trading against the built-in simulated venue.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use clob_trader::audit::{SharedAudit, TracingAuditSink};
use clob_trader::config::Config;
use clob_trader::exchange::{InMemoryCredentials, SimulatedVenue};
use clob_trader::orchestrator::{ExternalDeps, Orchestrator};
use clob_trader::risk::BotState;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// CLOB Trader CLI
#[derive(Parser)]
#[command(name = "clob-trader")]
#[command(version, about = "Unattended front-running and market-making on CLOB markets")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Paper trade against the simulated venue until Ctrl-C
    Run {
        /// Stop after this many heartbeats
        #[arg(short, long)]
        ticks: Option<u64>,

        /// Number of simulated markets
        #[arg(short, long, default_value = "20")]
        markets: usize,

        /// Seed for the simulated venue
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Validate and print the configuration
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    match cli.command {
        Some(Commands::CheckConfig) => check_config(),
        Some(Commands::Run {
            ticks,
            markets,
            seed,
        }) => run(ticks, markets, seed).await,
        None => run(None, 20, None).await,
    }
}

fn check_config() -> Result<()> {
    let config = Config::load()?;
    log_config(&config);
    info!("✅ Configuration is valid");
    Ok(())
}

async fn run(ticks: Option<u64>, markets: usize, seed: Option<u64>) -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║          CLOB Trader v{} - Paper Trading             ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");

    let config = Config::load()?;
    if !config.execution.paper_trading {
        bail!("live trading needs a venue transport, which this binary does not ship; set execution.paper_trading = true");
    }
    log_config(&config);

    let heartbeat = Duration::from_secs(config.engine.heartbeat_interval_secs.max(1));
    let venue = Arc::new(SimulatedVenue::new(markets, seed));
    let audit: SharedAudit = Arc::new(TracingAuditSink);
    let deps = ExternalDeps {
        books: venue.clone(),
        discovery: venue.clone(),
        scorer: None,
        triggers: Some(venue.clone()),
        venue: None,
        credentials: Arc::new(InMemoryCredentials::locked()),
        audit,
    };

    let orchestrator = Orchestrator::new(deps);
    orchestrator.load_config(config).await?;
    orchestrator.launch().await?;
    info!(markets, "🚀 Bot launched against simulated venue");

    let simulation = {
        let venue = venue.clone();
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat);
            let mut beats: u64 = 0;
            loop {
                interval.tick().await;
                venue.step().await;
                beats += 1;
                if beats % 5 == 0 {
                    if let Some(trigger) = venue.emit_random_trigger() {
                        info!(token_id = %trigger.token_id, "📡 Simulated trigger");
                    }
                }
                if beats % 30 == 0 {
                    log_status(&orchestrator);
                }
            }
        })
    };

    let shutdown = async move {
        match ticks {
            Some(n) => {
                tokio::select! {
                    _ = tokio::time::sleep(heartbeat * n as u32) => info!(ticks = n, "Tick budget reached"),
                    _ = tokio::signal::ctrl_c() => info!("🛑 Shutdown signal received"),
                }
            }
            None => {
                tokio::signal::ctrl_c().await.ok();
                info!("🛑 Shutdown signal received");
            }
        }
    };

    orchestrator.run(shutdown).await;
    simulation.abort();

    log_status(&orchestrator);
    if orchestrator.state() == BotState::Killed {
        warn!(status = ?orchestrator.kill_switch_status(), "Stopped by kill switch");
    }
    info!("👋 Shutdown complete");
    Ok(())
}

/// Initialize logging to stdout and an hourly-rolled file under `logs/`.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "clob-trader.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer alive for the program duration
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("clob_trader=debug".parse()?)
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

/// Log configuration on startup.
fn log_config(config: &Config) {
    info!("📋 Configuration:");
    info!("   Total Capital: ${}", config.capital.total);
    info!(
        "   Max Allocation A/B: ${} / ${}",
        config.capital.max_allocation_a, config.capital.max_allocation_b
    );
    info!(
        "   Front-Running: {} | Trade Size: {}%",
        if config.front_running.enabled { "on" } else { "off" },
        config.front_running.trade_size_pct
    );
    info!(
        "   Market-Making: {} | Max Exposure: ${} | Base Spread: {:.2}%",
        if config.market_making.enabled { "on" } else { "off" },
        config.market_making.max_exposure,
        config.market_making.base_spread * dec!(100)
    );
    info!(
        "   Kill Switch Threshold: {}% loss",
        config.risk.kill_switch_threshold_pct
    );
    info!(
        "   Heartbeat: {}s | Tick Timeout: {}s",
        config.engine.heartbeat_interval_secs, config.engine.max_tick_timeout_secs
    );
}

fn log_status(orchestrator: &Orchestrator) {
    let capital = orchestrator.capital();
    info!(
        "💰 [STATUS] State: {} | Locked A: ${} | Locked B: ${} | Free: ${}",
        orchestrator.state(),
        capital.locked_a,
        capital.locked_b,
        capital.free
    );
    for status in orchestrator.strategy_statuses() {
        info!(
            "   {} [{}] positions={} last={}",
            status.name,
            status.state,
            status.position_count,
            status.last_action.as_deref().unwrap_or("-")
        );
    }
    for (kind, perf) in orchestrator.performance() {
        info!(
            "   {} trades={} win_rate={:.1}% pnl=${}",
            kind,
            perf.trade_count,
            perf.win_rate,
            perf.realized_pnl.round_dp(4)
        );
    }
    if let Some(stats) = orchestrator.execution_stats() {
        info!(
            "   Orders: submitted={} completed={} failed={} cancelled={}",
            stats.submitted, stats.completed, stats.failed, stats.cancelled
        );
    }
}
