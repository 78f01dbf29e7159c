//! Attach this process's stdin/stdout to a sandbox terminal.

use anyhow::Result;
use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info};

use super::{open_project, start_manager, ProjectArgs};
use crate::config::Config;
use crate::manager::SessionManager;
use crate::terminal::Terminal;

const OUTPUT_DRAIN: Duration = Duration::from_secs(1);

/// Opens an interactive shell in the project's sandbox until it exits,
/// stdin closes, or Ctrl-C is pressed. Returns the shell's exit code.
pub(crate) async fn run(config: &Config, project: ProjectArgs) -> Result<i32> {
    let manager = start_manager(config);
    let result = attach(&manager, &project).await;
    manager.shutdown().await;
    result
}

async fn attach(manager: &SessionManager, project: &ProjectArgs) -> Result<i32> {
    let open = open_project(manager, project).await?;
    let terminal = open.session.create_terminal().await?;
    info!(
        root = %open.session.adapter().root(),
        "Shell attached (exit the shell or press Ctrl-C to leave)"
    );

    let output = tokio::spawn(copy_output(terminal.subscribe_output()));
    let input = tokio::spawn(copy_input(terminal.clone()));

    tokio::select! {
        _ = terminal.wait() => {}
        _ = tokio::signal::ctrl_c() => {
            debug!("Interrupted, closing shell");
            terminal.dispose().await;
        }
    }

    input.abort();
    // Background jobs can keep the output pipe open past the shell's exit
    let _ = tokio::time::timeout(OUTPUT_DRAIN, output).await;

    let code = terminal.wait().await.code().unwrap_or(1);
    open.connection.release();
    Ok(code)
}

async fn copy_output(mut output: broadcast::Receiver<Bytes>) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    loop {
        match output.recv().await {
            Ok(chunk) => {
                stdout.write_all(&chunk).await?;
                stdout.flush().await?;
            }
            Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => return Ok(()),
        }
    }
}

async fn copy_input(terminal: Terminal) -> Result<()> {
    let mut stdin = tokio::io::stdin();
    let mut buf = vec![0u8; 4096];
    loop {
        let n = stdin.read(&mut buf).await?;
        if n == 0 {
            debug!("stdin closed, hanging up shell");
            terminal.dispose().await;
            return Ok(());
        }
        terminal.write(&buf[..n]).await?;
    }
}
