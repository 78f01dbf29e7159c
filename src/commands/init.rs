//! Write a default `sandman.toml` into a project directory.
//!
//! The write logic takes closures for filesystem access so it can be tested
//! without touching disk.

use anyhow::{Context, Result};
use colored::Colorize;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::CONFIG_FILE;
use crate::templates;

/// Runs the init command in the current directory.
pub(crate) fn run(force: bool) -> Result<()> {
    let cwd = std::env::current_dir().context("Failed to get current directory")?;

    info!("Initializing sandman in {}", cwd.display());

    let file = config_file();
    let result = write_config(
        &file,
        force,
        |path| cwd.join(path).exists(),
        |path, content| {
            fs::write(cwd.join(path), content)
                .with_context(|| format!("Failed to write {}", path.display()))
        },
    )?;

    print!("{}", format_result(&file.path, &result));
    Ok(())
}

/// File written by init.
#[derive(Debug, Clone, PartialEq, Eq)]
struct InitFile {
    path: PathBuf,
    content: &'static str,
}

/// Outcome of the write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteResult {
    Created,
    Overwritten,
    Skipped,
}

fn config_file() -> InitFile {
    InitFile {
        path: PathBuf::from(CONFIG_FILE),
        content: templates::SANDMAN_TOML,
    }
}

/// Writes `file` unless it exists and `force` is off.
fn write_config<E, W>(file: &InitFile, force: bool, exists: E, mut write_file: W) -> Result<WriteResult>
where
    E: Fn(&Path) -> bool,
    W: FnMut(&Path, &str) -> Result<()>,
{
    let existed = exists(&file.path);
    if existed && !force {
        return Ok(WriteResult::Skipped);
    }

    write_file(&file.path, file.content)?;
    Ok(if existed {
        WriteResult::Overwritten
    } else {
        WriteResult::Created
    })
}

fn format_result(path: &Path, result: &WriteResult) -> String {
    let mut out = String::new();

    match result {
        WriteResult::Created => {
            let _ = writeln!(out, "\n{} Created {}", "✓".green().bold(), path.display().to_string().cyan());
        }
        WriteResult::Overwritten => {
            let _ = writeln!(out, "\n{} {} (overwritten)", "↻".blue(), path.display());
        }
        WriteResult::Skipped => {
            let _ = writeln!(
                out,
                "\n{} {} (already exists, use --force to overwrite)",
                "⊘".yellow(),
                path.display()
            );
            return out;
        }
    }

    let _ = writeln!(out, "\n{}", "Next steps:".yellow().bold());
    let _ = writeln!(
        out,
        "  1. Set {} in {} to use a Docker sandbox",
        "[remote].endpoint".cyan(),
        CONFIG_FILE.cyan()
    );
    let _ = writeln!(
        out,
        "  2. Run {} to check the sandbox",
        "sandman exec -- ls".green()
    );
    let _ = writeln!(
        out,
        "  3. Run {} to serve your project",
        "sandman preview --run \"npm run dev\"".green()
    );
    out
}
