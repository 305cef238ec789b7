use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use scribble::daemon::{repair_stores, reset_memories};
use scribble::store::RepairReport;
use scribble::{Config, Daemon};

/// Scribble - a chat agent that remembers the people it talks to
#[derive(Parser)]
#[command(name = "scribble", version, about)]
struct Cli {
    /// Settings file (TOML or JSON)
    #[arg(short, long, env = "SCRIBBLE_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Connect and start answering (default)
    Run,
    /// Check and repair the memory and dossier files
    Repair,
    /// Delete every stored memory
    ResetMemory {
        /// Skip the confirmation check
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref());

    let filter = if let Ok(env) = std::env::var("RUST_LOG") {
        env
    } else {
        match cli.verbose {
            0 => config
                .as_ref()
                .ok()
                .and_then(|c| c.log_level.clone())
                .unwrap_or_else(|| "info".to_string()),
            1 => "info,scribble=debug".to_string(),
            2 => "debug".to_string(),
            _ => "trace".to_string(),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let result = match config {
        Ok(config) => run(cli.command.unwrap_or(Command::Run), config).await,
        Err(e) => Err(e.into()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, config: Config) -> anyhow::Result<()> {
    match command {
        Command::Run => {
            tracing::info!(data_dir = %config.data_dir.display(), "starting scribble");
            Daemon::new(config).run().await?;
        }
        Command::Repair => {
            let (memories, dossiers) = repair_stores(&config).await?;
            print_report("memories", &memories);
            print_report("dossiers", &dossiers);
        }
        Command::ResetMemory { yes } => {
            if !yes {
                anyhow::bail!("refusing to reset memories without --yes");
            }
            reset_memories(&config).await?;
            println!("memories cleared ({})", config.memories_path().display());
        }
    }
    Ok(())
}

fn print_report(kind: &str, report: &RepairReport) {
    if report.repaired {
        println!("{kind}: fixed {} issue(s)", report.issues.len());
        for issue in &report.issues {
            println!("  - {issue}");
        }
    } else {
        println!("{kind}: no problems found");
    }
}
