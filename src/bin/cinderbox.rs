//! cinderbox CLI.
//!
//! Usage:
//!   cinderbox full ./sample.bin
//!   cinderbox static ./sample.bin
//!   cinderbox dynamic ./sample.bin -c ./config.yaml -v

use std::path::PathBuf;
use std::process;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cinderbox::config::Config;
use cinderbox::error::{Error, Result};
use cinderbox::orchestrator::{AnalysisMode, Orchestrator};

#[derive(Parser)]
#[command(
    name = "cinderbox",
    version,
    about = "Detonate IoT malware samples in an emulated sandbox"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to the configuration file
    #[arg(short, long, global = true, env = "CINDERBOX_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run static analysis, then detonate the sample
    Full { file: PathBuf },
    /// Run static analysis only
    Static { file: PathBuf },
    /// Detonate the sample without static analysis
    Dynamic { file: PathBuf },
}

impl Command {
    fn mode(&self) -> AnalysisMode {
        match self {
            Command::Full { .. } => AnalysisMode::Full,
            Command::Static { .. } => AnalysisMode::Static,
            Command::Dynamic { .. } => AnalysisMode::Dynamic,
        }
    }

    fn file(&self) -> &PathBuf {
        match self {
            Command::Full { file } | Command::Static { file } | Command::Dynamic { file } => file,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        "cinderbox=debug"
    } else if cli.quiet {
        "cinderbox=warn"
    } else {
        "cinderbox=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    if let Err(e) = run(cli).await {
        error!("{e}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => default_config_path()?,
    };
    let config = Config::from_file(&config_path)?;

    let orchestrator = Orchestrator::new(config)?;

    let started = Instant::now();
    let report = orchestrator
        .run(cli.command.file(), cli.command.mode())
        .await?;
    let report_path = orchestrator.write_report(&report)?;

    info!(
        "analysis finished in {}, report written to {}",
        humantime::format_duration(round_to_secs(started.elapsed())),
        report_path.display()
    );
    Ok(())
}

fn round_to_secs(d: std::time::Duration) -> std::time::Duration {
    std::time::Duration::from_secs(d.as_secs())
}

fn default_config_path() -> Result<PathBuf> {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return Ok(PathBuf::from(xdg).join("cinderbox/config.yaml"));
    }
    let home = std::env::var("HOME")
        .map_err(|_| Error::Config("no configuration file given and HOME not set".into()))?;
    Ok(PathBuf::from(home).join(".config/cinderbox/config.yaml"))
}
