//! Run one command in a project's sandbox.

use anyhow::Result;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use super::{open_project, start_manager, ProjectArgs};
use crate::config::Config;
use crate::manager::SessionManager;
use crate::terminal::TerminalExit;

/// Syncs the project, runs `command` without an interactive shell and
/// streams its output to stdout. Returns the command's exit code.
pub(crate) async fn run(config: &Config, project: ProjectArgs, command: Vec<String>) -> Result<i32> {
    let manager = start_manager(config);
    let result = run_command(&manager, &project, &command).await;
    manager.shutdown().await;
    result
}

async fn run_command(
    manager: &SessionManager,
    project: &ProjectArgs,
    command: &[String],
) -> Result<i32> {
    let open = open_project(manager, project).await?;
    let (terminal, mut output) = open.session.run_command(&shell_words::join(command)).await?;

    let mut stdout = tokio::io::stdout();
    loop {
        match output.recv().await {
            Ok(chunk) => {
                stdout.write_all(&chunk).await?;
                stdout.flush().await?;
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Output fell behind, some chunks were dropped");
            }
            Err(RecvError::Closed) => break,
        }
    }

    let exit = terminal.wait().await;
    open.connection.release();
    Ok(exit_code(&exit))
}

fn exit_code(exit: &TerminalExit) -> i32 {
    match exit {
        TerminalExit::Exited {
            code: Some(code), ..
        } => *code,
        TerminalExit::Exited {
            signal: Some(signal),
            ..
        } => 128 + signal,
        _ => 1,
    }
}
