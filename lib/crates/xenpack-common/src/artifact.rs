//! Output artifact contract consumed by downstream packagers.
//!
//! A build leaves a directory of exported files plus `artifact.json`
//! describing them. Packagers read the metadata instead of guessing from
//! file names.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ExportFormat, VirtualizationMode};

/// Identifies artifacts produced by this builder.
pub const BUILDER_ID: &str = "xenpack.xenserver";

/// Metadata file name inside the output directory.
pub const METADATA_FILENAME: &str = "artifact.json";

/// Size of one disk of the built VM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiskSize {
    pub name: String,
    pub size_mib: u64,
}

/// One exported file, relative to the output directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportedFile {
    pub name: String,
    pub bytes: u64,
    /// Hex SHA-256 of the file contents.
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactMetadata {
    pub builder_id: String,
    pub vm_name: String,
    pub virtualization_mode: VirtualizationMode,
    pub format: ExportFormat,
    #[serde(default)]
    pub disks: Vec<DiskSize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mib: Option<u64>,
    #[serde(default)]
    pub files: Vec<ExportedFile>,
    pub created_at: DateTime<Utc>,
}

impl ArtifactMetadata {
    /// Human summary, e.g. `VM files in directory: output-web`.
    #[must_use]
    pub fn describe(&self, dir: &str) -> String {
        format!("VM files in directory: {dir}")
    }

    /// Total size of all exported files.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.bytes).sum()
    }
}
