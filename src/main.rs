use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use smokewatch::config::{SmokeConfig, WatchMode};
use smokewatch::memory::HealthStore;
use smokewatch::recovery;
use smokewatch::runner::Runner;

#[derive(Parser)]
#[command(
    name = "smokewatch",
    about = "Smoke tests with memory for a locally developed web app",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (defaults to ./smokewatch.toml when present)
    #[arg(long, global = true, env = "SMOKEWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Base URL of the server under test
    #[arg(long, global = true, env = "SMOKE_BASE_URL")]
    base_url: Option<String>,

    /// Health memory file
    #[arg(long, global = true, env = "SMOKE_MEMORY_PATH")]
    memory: Option<PathBuf>,

    /// Print details for passing probes too
    #[arg(long, short, global = true, env = "SMOKE_VERBOSE")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every probe once (exit 0 when all pass, 1 otherwise)
    Run {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Watch source files and re-run probes after changes
    Watch {
        /// Watcher variant
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
    },

    /// Show the health report from the memory file
    Report {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Suggest fixes for the probes that failed last run
    Recover {
        /// Attempt the bounded automatic remediation
        #[arg(long)]
        auto_fix: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Auto,
    Smart,
}

impl From<ModeArg> for WatchMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Auto => WatchMode::Auto,
            ModeArg::Smart => WatchMode::Smart,
        }
    }
}

fn init_tracing(config: &SmokeConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match SmokeConfig::load_or_default(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("smokewatch: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    config.apply_overrides(cli.base_url, cli.verbose, cli.memory);
    init_tracing(&config);

    match execute(cli.command, config).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "smokewatch failed");
            eprintln!("smokewatch: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn execute(command: Commands, mut config: SmokeConfig) -> Result<ExitCode> {
    match command {
        Commands::Run { json } => {
            let mut runner = Runner::from_config(config)?;
            if !json {
                runner.init();
            }
            // A panicking cycle is recorded and surfaces as an error (exit 1).
            let report = runner.run_isolated().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                runner.display_results(&report);
                if !report.passed {
                    runner.generate_recovery_plan(&report);
                }
            }
            Ok(ExitCode::from(report.exit_code()))
        }
        Commands::Watch { mode } => {
            if let Some(mode) = mode {
                config.watch.mode = mode.into();
            }
            tracing::info!(mode = ?config.watch.mode, "starting watcher");
            let stats = smokewatch::watch(config).await?;
            println!(
                "\nWatched {} change(s): {} cycle(s) run, {} skipped",
                stats.changes_seen, stats.cycles_run, stats.cycles_skipped
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::Report { json } => {
            let store = HealthStore::load(config.memory_path(), config.memory.history_cap);
            let report = store.health_report(config.memory.pass_rate_window);
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("\n=== smokewatch Health Report ===");
                println!("Memory:      {}", store.path().display());
                report.print();
                println!("================================\n");
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Recover { auto_fix } => {
            if auto_fix {
                config.recovery.auto_fix = true;
            }
            let mut runner = Runner::from_config(config)?;
            if runner.store().memory().total_runs == 0 {
                println!("No runs recorded yet. Run `smokewatch run` first.");
                return Ok(ExitCode::SUCCESS);
            }

            let steps = runner.recovery_for_last_run();
            if steps.is_empty() {
                println!("Last run passed; nothing to recover.");
                return Ok(ExitCode::SUCCESS);
            }
            recovery::print_plan(&steps);
            runner.try_auto_fix();
            Ok(ExitCode::SUCCESS)
        }
    }
}
