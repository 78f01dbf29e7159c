//! Project identity and file-path validation.
//!
//! Project ids and file paths arrive from untrusted callers. Everything that
//! ends up in a filesystem path or a container name goes through here first.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};

use super::SandboxError;

/// Maximum length of the sanitized project slug.
const MAX_SLUG_LEN: usize = 48;

/// One file of a project, relative to the project root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectFile {
    /// Relative, `/`-separated path
    pub path: String,
    /// UTF-8 file content
    pub content: String,
}

impl ProjectFile {
    /// Builds a file entry.
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// Validated project identifier.
///
/// The raw id is kept as the registry key; [`ProjectId::slug`] is the only
/// form used to build paths or provider resource names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProjectId {
    raw: String,
    slug: String,
}

impl ProjectId {
    /// Validates a raw id. Empty or whitespace-only ids are rejected.
    pub fn parse(raw: &str) -> Result<Self, SandboxError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(SandboxError::invalid_project_id(raw));
        }

        let slug: String = trimmed
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .take(MAX_SLUG_LEN)
            .collect();

        Ok(Self {
            raw: trimmed.to_string(),
            slug,
        })
    }

    /// The trimmed id, used as the registry key.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Path-safe form: `[A-Za-z0-9_-]`, at most 48 characters.
    pub fn slug(&self) -> &str {
        &self.slug
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Normalizes a project file path to a relative path inside the workspace.
///
/// A leading `/` means "project root". `..` may only climb back out of
/// directories the path itself entered.
pub fn normalize_project_path(path: &str) -> Result<PathBuf, SandboxError> {
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();

    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(SandboxError::invalid_path(
                        path,
                        "escapes the workspace root",
                    ));
                }
            }
            Component::Prefix(_) => {
                return Err(SandboxError::invalid_path(path, "has a drive prefix"));
            }
        }
    }

    if parts.is_empty() {
        return Err(SandboxError::invalid_path(path, "does not name a file"));
    }

    Ok(parts.iter().collect())
}

/// Validates every file up front so a bad path aborts the sync before any
/// deletion or write happens.
pub fn validate_files(files: &[ProjectFile]) -> Result<Vec<(PathBuf, &str)>, SandboxError> {
    files
        .iter()
        .map(|file| Ok((normalize_project_path(&file.path)?, file.content.as_str())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_id_slug_replaces_unsafe_chars() {
        let id = ProjectId::parse("../../etc/passwd").unwrap();
        assert_eq!(id.as_str(), "../../etc/passwd");
        assert_eq!(id.slug(), "______etc_passwd");
    }

    #[test]
    fn test_project_id_slug_is_truncated() {
        let long = "a".repeat(200);
        let id = ProjectId::parse(&long).unwrap();
        assert_eq!(id.slug().len(), MAX_SLUG_LEN);
    }

    #[test]
    fn test_project_id_rejects_blank() {
        assert!(ProjectId::parse("").is_err());
        let err = ProjectId::parse("   ").unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_project_id_trims_whitespace() {
        let id = ProjectId::parse("  my-app_1 ").unwrap();
        assert_eq!(id.as_str(), "my-app_1");
        assert_eq!(id.slug(), "my-app_1");
        assert_eq!(id.to_string(), "my-app_1");
    }

    #[test]
    fn test_normalize_plain_paths() {
        assert_eq!(
            normalize_project_path("src/main.ts").unwrap(),
            PathBuf::from("src/main.ts")
        );
        assert_eq!(
            normalize_project_path("/index.html").unwrap(),
            PathBuf::from("index.html")
        );
        assert_eq!(
            normalize_project_path("./a/./b.txt").unwrap(),
            PathBuf::from("a/b.txt")
        );
    }

    #[test]
    fn test_normalize_allows_parent_inside_root() {
        assert_eq!(
            normalize_project_path("src/../README.md").unwrap(),
            PathBuf::from("README.md")
        );
    }

    #[test]
    fn test_normalize_rejects_escape() {
        let err = normalize_project_path("../escape.txt").unwrap_err();
        assert!(matches!(err, SandboxError::InvalidPath { .. }));
        assert!(normalize_project_path("a/../../b").is_err());
        assert!(normalize_project_path("/../etc/passwd").is_err());
    }

    #[test]
    fn test_normalize_rejects_empty() {
        assert!(normalize_project_path("").is_err());
        assert!(normalize_project_path("/").is_err());
        assert!(normalize_project_path("a/..").is_err());
    }

    #[test]
    fn test_validate_files_stops_at_first_bad_path() {
        let files = vec![
            ProjectFile::new("ok.txt", "fine"),
            ProjectFile::new("../escape.txt", "nope"),
        ];
        assert!(validate_files(&files).is_err());

        let good = vec![ProjectFile::new("a/b.txt", "x")];
        let validated = validate_files(&good).unwrap();
        assert_eq!(validated, vec![(PathBuf::from("a/b.txt"), "x")]);
    }
}
