//! Command-line front-end of the DEP-11 metadata harvester.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use appstream_harvester::generator::GeneratorError;
use appstream_harvester::{Generator, Scheduler};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Generate DEP-11 metadata from Debian packages."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Process packages and extract metadata for a suite.
    Process {
        /// Directory holding dep11-config.yml.
        confdir: PathBuf,
        /// Suite to scan.
        suite: String,
        /// Number of extraction workers (defaults to the core count).
        #[arg(long)]
        workers: Option<usize>,
        /// Per-package processing deadline in seconds.
        #[arg(long, default_value_t = 300)]
        deadline_secs: u64,
    },
    /// Remove unused data from the cache and expire media.
    Cleanup { confdir: PathBuf },
    /// Remove information about processed packages for a suite.
    RemoveProcessed { confdir: PathBuf, suite: String },
    /// Forget a single package and the data associated with it.
    Forget { confdir: PathBuf, pkid: String },
    /// Re-generate HTML reports and statistics (external tool).
    UpdateReports { confdir: PathBuf, suite: String },
}

fn init_logging() {
    let default_level = if std::env::var("DEBUG").is_ok_and(|v| v == "1") {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}

fn open_generator(confdir: &PathBuf) -> Result<Generator, ExitCode> {
    match Generator::new(confdir) {
        Ok(generator) => Ok(generator),
        Err(e) => {
            eprintln!("Initialization failed, can not continue: {e}");
            Err(ExitCode::from(2))
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(1);
        }
    };

    match cli.command {
        Commands::Process {
            confdir,
            suite,
            workers,
            deadline_secs,
        } => {
            let generator = match open_generator(&confdir) {
                Ok(generator) => generator,
                Err(code) => return code,
            };
            let scheduler = match workers {
                Some(workers) => Scheduler::new(workers, Duration::from_secs(deadline_secs)),
                None => Scheduler::with_defaults(),
            };
            match generator.process_suite(&suite, &scheduler).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(GeneratorError::WorkerPool(message)) => {
                    eprintln!("Unrecoverable worker error: {message}");
                    ExitCode::from(5)
                }
                Err(e) => {
                    eprintln!("Processing failed: {e}");
                    ExitCode::from(2)
                }
            }
        }
        Commands::Cleanup { confdir } => {
            let generator = match open_generator(&confdir) {
                Ok(generator) => generator,
                Err(code) => return code,
            };
            match generator.expire_cache() {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("Cleanup failed: {e}");
                    ExitCode::from(2)
                }
            }
        }
        Commands::RemoveProcessed { confdir, suite } => {
            let generator = match open_generator(&confdir) {
                Ok(generator) => generator,
                Err(code) => return code,
            };
            match generator.remove_processed(&suite) {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("Could not remove processed packages: {e}");
                    ExitCode::from(2)
                }
            }
        }
        Commands::Forget { confdir, pkid } => {
            let generator = match open_generator(&confdir) {
                Ok(generator) => generator,
                Err(code) => return code,
            };
            match generator.forget_package(&pkid) {
                Ok(true) => ExitCode::SUCCESS,
                Ok(false) => {
                    eprintln!("Package with ID '{pkid}' does not exist.");
                    ExitCode::from(1)
                }
                Err(e) => {
                    eprintln!("Could not forget package: {e}");
                    ExitCode::from(2)
                }
            }
        }
        Commands::UpdateReports { .. } => {
            eprintln!(
                "Report generation is handled by the separate reporting tool, not this binary."
            );
            ExitCode::from(1)
        }
    }
}
