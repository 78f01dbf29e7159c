use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;
mod config;
mod manager;
mod sandbox;
mod session;
mod templates;
mod terminal;

use commands::preview::PreviewOptions;
use commands::ProjectArgs;
use config::{Config, CONFIG_FILE};

#[derive(Parser)]
#[command(name = "sandman")]
#[command(
    author,
    version,
    about = "Per-project sandboxes with shared terminals and live preview forwards"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file
    #[arg(long, global = true, default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Also write JSON logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Docker endpoint for remote sandboxes (local, unix://…, tcp://…)
    #[arg(long, global = true, env = "SANDMAN_REMOTE_ENDPOINT")]
    remote_endpoint: Option<String>,

    /// Container image remote sandboxes start from
    #[arg(long, global = true, env = "SANDMAN_REMOTE_TEMPLATE")]
    remote_template: Option<String>,

    /// Shell command line for sandbox terminals
    #[arg(long, global = true, env = "SANDMAN_SHELL")]
    shell: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default sandman.toml in the current directory
    Init {
        /// Force overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Run a command in the project's sandbox
    Exec {
        /// Project directory to sync
        #[arg(long, default_value = ".")]
        dir: PathBuf,

        /// Project id (defaults to the directory name)
        #[arg(long)]
        project_id: Option<String>,

        /// Command and arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },

    /// Open an interactive shell in the project's sandbox
    Shell {
        /// Project directory to sync
        #[arg(default_value = ".")]
        dir: PathBuf,

        /// Project id (defaults to the directory name)
        #[arg(long)]
        project_id: Option<String>,
    },

    /// Serve the project's preview through a port forward
    Preview {
        /// Project directory to sync
        #[arg(default_value = ".")]
        dir: PathBuf,

        /// Project id (defaults to the directory name)
        #[arg(long)]
        project_id: Option<String>,

        /// Port the dev server listens on inside the sandbox
        #[arg(short, long)]
        port: Option<u16>,

        /// Command that starts the dev server
        #[arg(short, long)]
        run: Option<String>,

        /// Seconds to wait for the preview to answer
        #[arg(short, long)]
        wait: Option<u64>,

        /// Print a JSON report
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_guard = init_logging(cli.verbose, cli.log_file.as_deref())?;

    let load_config = || -> Result<Config> {
        Ok(Config::load(&cli.config)?.with_overrides(
            cli.remote_endpoint.clone(),
            cli.remote_template.clone(),
            cli.shell.clone(),
        ))
    };

    let code = match cli.command {
        Commands::Init { force } => {
            commands::init::run(force)?;
            0
        }
        Commands::Exec {
            ref dir,
            ref project_id,
            ref command,
        } => {
            let project = ProjectArgs {
                dir: dir.clone(),
                project_id: project_id.clone(),
            };
            commands::exec::run(&load_config()?, project, command.clone()).await?
        }
        Commands::Shell {
            ref dir,
            ref project_id,
        } => {
            let project = ProjectArgs {
                dir: dir.clone(),
                project_id: project_id.clone(),
            };
            commands::shell::run(&load_config()?, project).await?
        }
        Commands::Preview {
            ref dir,
            ref project_id,
            port,
            ref run,
            wait,
            json,
        } => {
            let project = ProjectArgs {
                dir: dir.clone(),
                project_id: project_id.clone(),
            };
            let options = PreviewOptions {
                port,
                run: run.clone(),
                wait_secs: wait,
                json,
            };
            commands::preview::run(&load_config()?, project, options).await?;
            0
        }
    };

    // Flush buffered file logs before a non-zero exit skips destructors
    drop(log_guard);
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

/// Console logs go to stderr so command output on stdout stays clean.
fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = if verbose {
        EnvFilter::new("sandman=debug")
    } else {
        EnvFilter::new("sandman=info")
    };

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .with_context(|| format!("Invalid log file path: {}", path.display()))?;
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;

            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            let layer = fmt::layer().json().with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    Ok(guard)
}
