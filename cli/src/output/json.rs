//! JSON output helpers for `--json`.

use anyhow::{Context, Result};
use xenpack_common::ArtifactMetadata;

/// Format a JSON error object.
///
/// Output (pretty-printed):
/// ```json
/// {
///   "error": true,
///   "message": "...",
///   "code": "..."
/// }
/// ```
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn format_error(message: &str, code: &str) -> Result<String> {
    let obj = serde_json::json!({
        "error": true,
        "message": message,
        "code": code,
    });
    serde_json::to_string_pretty(&obj).context("JSON serialization failed")
}

/// Format the result of a successful build.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn format_artifact(output_dir: &str, artifact: &ArtifactMetadata) -> Result<String> {
    let obj = serde_json::json!({
        "output_directory": output_dir,
        "artifact": artifact,
    });
    serde_json::to_string_pretty(&obj).context("JSON serialization failed")
}
