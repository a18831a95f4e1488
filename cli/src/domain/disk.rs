//! Disk sizing and export file naming.

use std::path::{Path, PathBuf};

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

/// Whole gibibytes in a byte-granular virtual size, rounded down.
#[must_use]
pub fn whole_gigabytes(bytes: u64) -> u64 {
    bytes / GIB
}

/// Bytes in `mib` mebibytes.
#[must_use]
pub fn mib_to_bytes(mib: u64) -> u64 {
    mib.saturating_mul(MIB)
}

/// Name of the exported file for disk `index` of `vm_name`.
///
/// The first disk keeps the bare VM name so single-disk exports read
/// naturally; later disks get a numeric suffix.
#[must_use]
pub fn export_file_name(vm_name: &str, index: usize, extension: &str) -> String {
    if index == 0 {
        format!("{vm_name}.{extension}")
    } else {
        format!("{vm_name}-{index}.{extension}")
    }
}

/// Where the storage repository export exposes a disk's VHD once mounted.
#[must_use]
pub fn mounted_vhd_path(mount_point: &Path, sr_uuid: &str, vdi_uuid: &str) -> PathBuf {
    mount_point.join(sr_uuid).join(format!("{vdi_uuid}.vhd"))
}
