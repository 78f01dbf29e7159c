//! Embedded templates for sandman files.

/// Default `sandman.toml` configuration.
pub(crate) const SANDMAN_TOML: &str = include_str!("sandman.toml");
