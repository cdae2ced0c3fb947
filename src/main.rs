use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use sharedgate::config::SharedgateConfig;
use sharedgate::{Coordinator, Rate};

/// Admission checks against a shared counter store.
#[derive(Debug, Parser)]
#[command(name = "sharedgate", version, about)]
struct Cli {
    /// YAML configuration file; SHAREDGATE__* environment variables override it
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Record an event in a fixed window and report the decision
    Allow {
        /// Identifier being limited
        #[arg(long)]
        id: String,
        /// Events allowed per window
        #[arg(long)]
        limit: u64,
        /// Window length in seconds
        #[arg(long, default_value_t = 60)]
        window_secs: u64,
        /// Events to record
        #[arg(long, default_value_t = 1)]
        hits: u64,
    },
    /// Check one event against a continuous rate
    Rate {
        /// Identifier being limited
        #[arg(long)]
        id: String,
        /// Milliseconds between events at the sustained rate
        #[arg(long)]
        interval_ms: u64,
        /// Events admitted back to back from a rested bucket
        #[arg(long, default_value_t = 1)]
        burst: u32,
    },
    /// Zero the current fixed window for an identifier
    Reset {
        #[arg(long)]
        id: String,
        #[arg(long, default_value_t = 60)]
        window_secs: u64,
    },
    /// Refill the rate bucket for an identifier
    ResetRate {
        #[arg(long)]
        id: String,
        #[arg(long)]
        interval_ms: u64,
        #[arg(long, default_value_t = 1)]
        burst: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = SharedgateConfig::load(cli.config.as_deref())?;
    info!(backend = ?config.store.backend, "Configuration loaded");

    let coordinator = Coordinator::from_config(&config)?;

    match cli.command {
        Command::Allow {
            id,
            limit,
            window_secs,
            hits,
        } => {
            let window = Duration::from_secs(window_secs);
            let decision = coordinator.allow_n(&id, limit, hits, window).await?;
            println!(
                "allowed={} count={} delay_ms={}",
                decision.allowed,
                decision.count,
                decision.delay.as_millis()
            );
        }
        Command::Rate {
            id,
            interval_ms,
            burst,
        } => {
            let rate = Rate::every(Duration::from_millis(interval_ms)).with_burst(burst);
            let decision = coordinator.allow_rate(&id, &rate).await?;
            println!(
                "allowed={} delay_ms={}",
                decision.allowed,
                decision.delay.as_millis()
            );
        }
        Command::Reset { id, window_secs } => {
            coordinator.reset(&id, Duration::from_secs(window_secs)).await?;
            println!("reset {}", id);
        }
        Command::ResetRate {
            id,
            interval_ms,
            burst,
        } => {
            let rate = Rate::every(Duration::from_millis(interval_ms)).with_burst(burst);
            coordinator.reset_rate(&id, &rate).await?;
            println!("reset {}", id);
        }
    }

    Ok(())
}
