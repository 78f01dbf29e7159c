//! Serve a project's preview from its sandbox.

use anyhow::{Context, Result};
use colored::Colorize;
use serde::Serialize;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use super::{open_project, start_manager, ProjectArgs};
use crate::config::Config;
use crate::manager::SessionManager;
use crate::session::SessionSnapshot;

/// Delay between readiness probes.
const PROBE_INTERVAL: Duration = Duration::from_millis(250);

/// Per-request timeout for a readiness probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Options for the preview command.
#[derive(Debug, Clone, Default)]
pub(crate) struct PreviewOptions {
    /// Port inside the sandbox (defaults to the configured preview port)
    pub port: Option<u16>,
    /// Command to start the dev server with
    pub run: Option<String>,
    /// Seconds to wait for the URL to answer
    pub wait_secs: Option<u64>,
    /// Print a JSON report instead of text
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct PreviewReport {
    url: String,
    ready: Option<bool>,
    session: SessionSnapshot,
}

/// Syncs the project, optionally starts its dev server, and holds a
/// forward to the preview port until Ctrl-C.
pub(crate) async fn run(config: &Config, project: ProjectArgs, options: PreviewOptions) -> Result<()> {
    let manager = start_manager(config);
    let result = serve(&manager, &project, &options).await;
    manager.shutdown().await;
    result
}

async fn serve(manager: &SessionManager, project: &ProjectArgs, options: &PreviewOptions) -> Result<()> {
    let open = open_project(manager, project).await?;
    let session = &open.session;

    if let Some(command) = &options.run {
        let terminal = session.create_terminal().await?;
        let mut output = terminal.subscribe_output();
        tokio::spawn(async move {
            let mut stderr = tokio::io::stderr();
            loop {
                match output.recv().await {
                    Ok(chunk) => {
                        if stderr.write_all(&chunk).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        });
        terminal.write(format!("{command}\n").as_bytes()).await?;
        info!(command = %command, "Started dev server");
    }

    let port = options
        .port
        .unwrap_or_else(|| manager.config().default_preview_port);
    let lease = session.acquire_port(port).await?;

    let ready = match options.wait_secs {
        Some(secs) => {
            let ready = wait_until_ready(lease.url(), Duration::from_secs(secs)).await?;
            if !ready {
                warn!(url = %lease.url(), secs, "Preview did not answer in time");
            }
            Some(ready)
        }
        None => None,
    };

    if options.json {
        let report = PreviewReport {
            url: lease.url().to_string(),
            ready,
            session: session.snapshot(),
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize preview report")?
        );
    } else {
        println!(
            "\n{} Preview for {} at {}",
            "▶".green().bold(),
            session.project_id().to_string().cyan(),
            lease.url().green().underline()
        );
        println!("  Press {} to stop.", "Ctrl-C".yellow());
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Stopping preview");

    lease.release().await?;
    open.connection.release();
    Ok(())
}

/// Polls `url` until it answers any HTTP response or `timeout` elapses.
pub(crate) async fn wait_until_ready(url: &str, timeout: Duration) -> Result<bool> {
    let client = reqwest::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .build()
        .context("Failed to build HTTP client")?;
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        match client.get(url).send().await {
            Ok(response) => {
                debug!(url, status = %response.status(), "Preview answered");
                return Ok(true);
            }
            Err(e) => debug!(url, error = %e, "Preview not ready yet"),
        }

        if tokio::time::Instant::now() >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(PROBE_INTERVAL).await;
    }
}
