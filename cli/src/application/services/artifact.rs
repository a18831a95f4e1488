//! Application service: the output artifact.
//!
//! Imports only from `crate::domain`, `crate::application` and
//! `xenpack_common`. All I/O is routed through injected port traits.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use xenpack_common::{
    ArtifactMetadata, BUILDER_ID, DiskSize, ExportFormat, ExportedFile, METADATA_FILENAME,
    VirtualizationMode,
};

use crate::application::ports::{FileHasher, LocalFs};
use crate::application::state::BuildState;
use crate::domain::{BuildConfig, BuilderConfig, ExportError};

/// Assemble the artifact metadata for a finished build.
///
/// # Errors
///
/// Returns an error if the export format is unknown or an exported file
/// cannot be measured or hashed.
pub fn describe(
    config: &BuildConfig,
    state: &BuildState,
    fs: &impl LocalFs,
    hasher: &impl FileHasher,
) -> Result<ArtifactMetadata> {
    let format: ExportFormat = config
        .common
        .format
        .parse()
        .map_err(|_| ExportError::UnknownFormat(config.common.format.clone()))?;

    let virtualization_mode = state
        .boot_policy
        .as_deref()
        .map_or(VirtualizationMode::Pv, VirtualizationMode::from_boot_policy);

    let (disks, memory_mib) = match &config.builder {
        BuilderConfig::Vm(_) => {
            let disks = state
                .configured_disk_gb
                .map(|gb| DiskSize {
                    name: config.common.vm_name.clone(),
                    size_mib: gb * 1024,
                })
                .into_iter()
                .collect();
            (disks, None)
        }
        BuilderConfig::Iso(iso) => {
            let disks = iso
                .disks
                .iter()
                .map(|d| DiskSize {
                    name: d.name.clone(),
                    size_mib: d.size_mib,
                })
                .collect();
            (disks, Some(iso.memory_mib))
        }
    };

    let files = state
        .export_files
        .iter()
        .map(|path| exported_file(path, fs, hasher))
        .collect::<Result<Vec<_>>>()?;

    Ok(ArtifactMetadata {
        builder_id: BUILDER_ID.to_string(),
        vm_name: config.common.vm_name.clone(),
        virtualization_mode,
        format,
        disks,
        memory_mib,
        files,
        created_at: Utc::now(),
    })
}

fn exported_file(path: &Path, fs: &impl LocalFs, hasher: &impl FileHasher) -> Result<ExportedFile> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .with_context(|| format!("export path {} has no file name", path.display()))?;
    Ok(ExportedFile {
        name,
        bytes: fs.file_size(path)?,
        sha256: hasher
            .sha256_file(path)
            .with_context(|| format!("hashing {}", path.display()))?,
    })
}

/// Write `artifact.json` into `dir` and return its path.
///
/// # Errors
///
/// Returns an error if the metadata cannot be serialized or written.
pub fn write_metadata(dir: &Path, meta: &ArtifactMetadata, fs: &impl LocalFs) -> Result<PathBuf> {
    let path = dir.join(METADATA_FILENAME);
    let json = serde_json::to_string_pretty(meta).context("serializing artifact metadata")?;
    fs.write(&path, json)?;
    Ok(path)
}

/// Remove an output directory and everything in it.
///
/// # Errors
///
/// Returns an error if the directory does not exist or cannot be removed.
pub fn destroy(dir: &Path, fs: &impl LocalFs) -> Result<()> {
    if !fs.exists(dir) {
        anyhow::bail!("output directory {} does not exist", dir.display());
    }
    fs.remove_dir_all(dir)
}
