//! Collect a project directory into sandbox files.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Component, Path};
use tracing::debug;

use crate::sandbox::ProjectFile;

/// Directories never shipped to a sandbox.
const SKIPPED_DIRS: &[&str] = &[".git", "node_modules", "target"];

/// Reads every UTF-8 file under `dir` with a `/`-separated relative path.
/// Files that are not valid UTF-8 are skipped.
pub(crate) fn read_project_files(dir: &Path) -> Result<Vec<ProjectFile>> {
    let mut files = Vec::new();
    collect(dir, dir, &mut files)?;
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

fn collect(root: &Path, dir: &Path, files: &mut Vec<ProjectFile>) -> Result<()> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("Failed to read directory: {}", dir.display()))?;

    for entry in entries {
        let entry = entry.with_context(|| format!("Failed to read directory: {}", dir.display()))?;
        let path = entry.path();
        let file_type = entry
            .file_type()
            .with_context(|| format!("Failed to stat {}", path.display()))?;

        if file_type.is_dir() {
            let name = entry.file_name();
            if SKIPPED_DIRS.iter().any(|skipped| name == *skipped) {
                continue;
            }
            collect(root, &path, files)?;
        } else if file_type.is_file() {
            let bytes =
                fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
            let Ok(content) = String::from_utf8(bytes) else {
                debug!("Skipping non-UTF-8 file: {}", path.display());
                continue;
            };
            files.push(ProjectFile::new(relative_path(root, &path), content));
        }
    }
    Ok(())
}

fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Project id to use when none is given: the directory's name.
pub(crate) fn default_project_id(dir: &Path) -> String {
    dir.canonicalize()
        .ok()
        .and_then(|dir| dir.file_name().map(|name| name.to_string_lossy().into_owned()))
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "project".to_string())
}
