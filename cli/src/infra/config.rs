//! Loading build templates from YAML files.

use std::path::Path;

use anyhow::{Context, Result};

use crate::domain::{BuildConfig, Template};

/// Environment variable that overrides `remote_password`.
pub const PASSWORD_ENV: &str = "XENPACK_PASSWORD";

/// Read and parse a template file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is not a valid template.
pub fn load_template(path: &Path) -> Result<Template> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    serde_yaml::from_str(&content).with_context(|| format!("cannot parse {}", path.display()))
}

/// Read, parse and validate a template file, applying [`PASSWORD_ENV`].
///
/// # Errors
///
/// Returns an error if the template cannot be loaded or fails validation.
pub fn load_build_config(path: &Path) -> Result<BuildConfig> {
    let template = load_template(path)?;
    let password = std::env::var(PASSWORD_ENV).ok().filter(|p| !p.is_empty());
    template
        .prepare(password)
        .with_context(|| format!("invalid template {}", path.display()))
}
