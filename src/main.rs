mod announce;
mod config;
mod controller;
mod liveness;
mod marker;
mod signals;
mod supervisor;
mod unit;

use clap::{Parser, Subcommand};
use config::{RespawnConfig, CONFIG_FILE_NAME};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use supervisor::Session;
use tracing_subscriber::EnvFilter;

/// Keep a command running in the foreground and restart or stop it from
/// another terminal.
#[derive(Parser, Debug)]
#[command(name = "respawn", version, about)]
pub struct Cli {
    /// Extra logging (state transitions, signals, marker writes)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a command under supervision
    Run {
        /// Directory to supervise (defaults to the current directory)
        #[arg(short = 'C', long)]
        dir: Option<PathBuf>,

        /// Don't clear the screen before each run
        #[arg(short, long)]
        preserve_output: bool,

        /// Config file path (default: <dir>/respawn.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Command to run, passed to the shell as one string
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Restart the command supervised in a directory
    Restart {
        #[arg(short = 'C', long)]
        dir: Option<PathBuf>,
    },
    /// Stop the supervisor of a directory and its command
    Stop {
        #[arg(short = 'C', long)]
        dir: Option<PathBuf>,
    },
    /// Print the marker of a directory and whether its processes are alive
    Status {
        #[arg(short = 'C', long)]
        dir: Option<PathBuf>,
    },
}

/// Resolve `-C` to an absolute path, defaulting to the current directory.
fn resolve_dir(dir: Option<PathBuf>) -> std::io::Result<PathBuf> {
    let cwd = std::env::current_dir()?;
    Ok(match dir {
        Some(d) if d.is_absolute() => d,
        Some(d) => cwd.join(d),
        None => cwd,
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    match cli.command {
        Command::Run {
            dir,
            preserve_output,
            config,
            command,
        } => run(dir, preserve_output, config, command.join(" ")).await,
        Command::Restart { dir } => with_dir(dir, |dir| match controller::request_restart(dir) {
            Ok(_) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("respawn: {e}");
                ExitCode::from(e.exit_code() as u8)
            }
        }),
        Command::Stop { dir } => with_dir(dir, |dir| match controller::request_stop(dir) {
            Ok(report) => {
                tracing::info!(
                    supervisor = report.pair.supervisor,
                    signalled = ?report.signalled,
                    "supervisor stopped"
                );
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("respawn: {e}");
                ExitCode::from(e.exit_code() as u8)
            }
        }),
        Command::Status { dir } => with_dir(dir, |dir| match controller::status(dir) {
            Ok(Some(status)) => match serde_json::to_string_pretty(&status) {
                Ok(json) => {
                    println!("{json}");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("respawn: {e}");
                    ExitCode::FAILURE
                }
            },
            Ok(None) => {
                eprintln!("respawn: no supervisor is running in {}", dir.display());
                ExitCode::from(1)
            }
            Err(e) => {
                eprintln!("respawn: {e}");
                ExitCode::from(4)
            }
        }),
    }
}

fn with_dir(dir: Option<PathBuf>, op: impl FnOnce(&Path) -> ExitCode) -> ExitCode {
    match resolve_dir(dir) {
        Ok(dir) => op(&dir),
        Err(e) => {
            eprintln!("respawn: cannot determine directory: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(
    dir: Option<PathBuf>,
    preserve_output: bool,
    config_path: Option<PathBuf>,
    command: String,
) -> ExitCode {
    let dir = match resolve_dir(dir) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("respawn: cannot determine directory: {e}");
            return ExitCode::FAILURE;
        }
    };
    let config_path = config_path.unwrap_or_else(|| dir.join(CONFIG_FILE_NAME));
    let config = match RespawnConfig::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("respawn: {e}");
            return ExitCode::FAILURE;
        }
    };
    tracing::debug!(?config, "resolved config");

    let session = Session {
        command,
        dir,
        preserve_output,
    };
    match supervisor::run_supervised(session, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("respawn: {e}");
            ExitCode::FAILURE
        }
    }
}
