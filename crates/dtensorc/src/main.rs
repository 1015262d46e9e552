//! The DTensor lowering CLI.
//!
//! Provides the `dtensorc` command with the following subcommands:
//!
//! - `dtensorc lower <module.json>` - Lower every abstract send/receive pair
//! - `dtensorc print <module.json>` - Print a module as text
//!
//! Options:
//! - `--config` - TOML file with a `[lowering]` table
//! - `--emit` - Output format for the lowered module (`text` or `json`)
//! - `--output` - Write the lowered module to a file instead of stdout
//! - `--report` - Print the lowering report as JSON to stderr
//! - `--log` - Log filter, overriding `DTENSOR_LOG`

use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use dtensor_ir::Module;
use dtensor_lower::LowerConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dtensorc", version, about = "DTensor send/receive lowering")]
struct Cli {
    /// Log filter directives (e.g. `dtensor_lower=debug`)
    #[arg(long, global = true)]
    log: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lower the abstract send/receive ops of a JSON module
    Lower {
        /// Path to the module, as JSON
        input: PathBuf,

        /// Lowering config (TOML with a `[lowering]` table)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Output format for the lowered module
        #[arg(long, value_enum, default_value = "text")]
        emit: Emit,

        /// Output path for the lowered module
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print the lowering report as JSON to stderr
        #[arg(long)]
        report: bool,
    },
    /// Print a JSON module as text
    Print {
        /// Path to the module, as JSON
        input: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Emit {
    Text,
    Json,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log.as_deref());

    let result = match cli.command {
        Commands::Lower {
            input,
            config,
            emit,
            output,
            report,
        } => lower(&input, config.as_deref(), emit, output.as_deref(), report),
        Commands::Print { input } => read_module(&input).map(|module| print!("{module}")),
    };
    if let Err(e) = result {
        eprintln!("error: {}", e);
        process::exit(1);
    }
}

fn init_logging(filter: Option<&str>) {
    let filter = match filter {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_env("DTENSOR_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn read_module(path: &Path) -> Result<Module, String> {
    let source = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read '{}': {}", path.display(), e))?;
    serde_json::from_str(&source)
        .map_err(|e| format!("Failed to parse module '{}': {}", path.display(), e))
}

/// Read, lower and write one module.
fn lower(
    input: &Path,
    config: Option<&Path>,
    emit: Emit,
    output: Option<&Path>,
    report: bool,
) -> Result<(), String> {
    let config = match config {
        Some(path) => LowerConfig::from_file(path)?,
        None => LowerConfig::default(),
    };
    let mut module = read_module(input)?;

    let summary = dtensor_lower::lower_send_recv(&mut module, &config)
        .map_err(|e| format!("Lowering failed: {}", e))?;
    info!(
        transfers = summary.transfers.len(),
        branches = summary.branches.len(),
        "lowered module '{}'",
        module.name
    );

    let rendered = match emit {
        Emit::Text => module.to_string(),
        Emit::Json => serde_json::to_string_pretty(&module)
            .map_err(|e| format!("Failed to serialize module: {}", e))?,
    };
    match output {
        Some(path) => std::fs::write(path, rendered)
            .map_err(|e| format!("Failed to write '{}': {}", path.display(), e))?,
        None => print!("{rendered}"),
    }

    if report {
        let json = serde_json::to_string(&summary)
            .map_err(|e| format!("Failed to serialize report: {}", e))?;
        eprintln!("{}", json);
    }
    Ok(())
}
