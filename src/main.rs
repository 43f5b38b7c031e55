mod logging;
mod sim;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use dispatch_engine::EngineConfig;

#[derive(Parser)]
#[command(name = "dispatch_engine", version, about = "Priority task dispatch engine")]
struct Cli {
    /// Engine configuration file (TOML); defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless DISPATCH_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the demo: scoring, matching, retries, escalation, offline detection
    Demo,

    /// Run one benchmark and print a CSV row
    Bench {
        #[arg(default_value_t = 4)]
        workers: usize,
        #[arg(default_value_t = 25)]
        tasks_per_worker: usize,
        #[arg(default_value_t = 5)]
        work_ms: u64,
        /// Report duplicate assignments and dependency-order violations
        #[arg(long)]
        validate: bool,
    },

    /// Print the effective configuration as TOML
    Config,

    /// Load and validate a configuration file
    CheckConfig { path: PathBuf },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load_from(path),
        None => Ok(EngineConfig::default()),
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match cli.cmd.unwrap_or(Command::Demo) {
        Command::Demo => sim::run_demo(load_config(cli.config.as_ref())?)?,
        Command::Bench {
            workers,
            tasks_per_worker,
            work_ms,
            validate,
        } => {
            let config = load_config(cli.config.as_ref())?;
            sim::run_benchmark(&config, workers, tasks_per_worker, work_ms, validate)?;
        }
        Command::Config => {
            let config = load_config(cli.config.as_ref())?;
            print!("{}", config.to_toml_string()?);
        }
        Command::CheckConfig { path } => {
            let config = EngineConfig::load_from(&path)
                .with_context(|| format!("check {}", path.display()))?;
            println!(
                "config ok: {} (max_retries={}, heartbeat_timeout_ms={})",
                path.display(),
                config.recovery.max_retries,
                config.monitor.heartbeat_timeout_ms
            );
        }
    }
    Ok(())
}
