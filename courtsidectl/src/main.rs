use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use courtside_model::Priority;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

#[derive(Parser)]
#[command(
    name = "courtsidectl",
    version,
    about = "Keeps the NBA data inventory complete by reconciling storage and running scrape tasks"
)]
struct Cli {
    /// Collector configuration file (TOML or JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Inventory catalog file (TOML or JSON with [[data_types]])
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Clone, Debug)]
struct FilterArgs {
    /// Least urgent priority tier to include (IMMEDIATE, HIGH, MEDIUM, LOW, EXECUTE)
    #[arg(long)]
    tier: Option<Priority>,
    /// Only act on gaps of this source
    #[arg(long)]
    source: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Reconcile once and work the resulting queue until it drains
    Run {
        #[command(flatten)]
        filter: FilterArgs,
        /// Report gaps without fetching anything
        #[arg(long)]
        dry_run: bool,
        /// Stop workers after this long, e.g. "45m" or "2h"
        #[arg(long)]
        max_runtime: Option<humantime::Duration>,
    },
    /// List current gaps without scheduling them
    Gaps {
        #[command(flatten)]
        filter: FilterArgs,
        /// Print gaps as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration and where it came from
    Config,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,courtside::executor=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Run {
            filter,
            dry_run,
            max_runtime,
        } => {
            commands::run(
                cli.config.as_deref(),
                cli.catalog.as_deref(),
                filter.into_run_filter(dry_run),
                max_runtime.map(Into::into),
            )
            .await
        }
        Command::Gaps { filter, json } => {
            commands::gaps(
                cli.config.as_deref(),
                cli.catalog.as_deref(),
                filter.into_run_filter(true),
                json,
            )
            .await
        }
        Command::Config => commands::show_config(cli.config.as_deref()),
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(target: "courtside::alert", "{err:#}");
            eprintln!("error: {err:#}");
            ExitCode::from(commands::EXIT_FATAL)
        }
    }
}

impl FilterArgs {
    fn into_run_filter(self, dry_run: bool) -> courtside_core::RunFilter {
        courtside_core::RunFilter {
            tier: self.tier,
            source: self.source.map(Into::into),
            dry_run,
        }
    }
}
