use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A string that does not name any variant of a closed set.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown {kind} '{value}' (expected one of: {expected})")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
    pub expected: &'static str,
}

/// Hypervisor-reported VM lifecycle state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PowerState {
    Halted,
    Paused,
    Suspended,
    Running,
}

impl FromStr for PowerState {
    type Err = UnknownVariant;

    /// Case-insensitive; the API reports `Halted`, older hosts `halted`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "halted" => Ok(Self::Halted),
            "paused" => Ok(Self::Paused),
            "suspended" => Ok(Self::Suspended),
            "running" => Ok(Self::Running),
            _ => Err(UnknownVariant {
                kind: "power state",
                value: s.to_string(),
                expected: "Halted, Paused, Suspended, Running",
            }),
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Halted => "Halted",
            Self::Paused => "Paused",
            Self::Suspended => "Suspended",
            Self::Running => "Running",
        };
        f.write_str(s)
    }
}

/// Output format of the export step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum ExportFormat {
    /// Skip the export entirely.
    None,
    /// Copy each disk's VHD from the mounted storage export.
    Vhd,
    /// One XVA archive of the whole VM.
    #[default]
    Xva,
    /// One raw image per disk.
    VdiRaw,
    /// One VHD image per disk, downloaded from the hypervisor.
    VdiVhd,
}

impl ExportFormat {
    pub const ALL: &'static str = "none, vhd, xva, vdi_raw, vdi_vhd";

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Vhd => "vhd",
            Self::Xva => "xva",
            Self::VdiRaw => "vdi_raw",
            Self::VdiVhd => "vdi_vhd",
        }
    }

    /// File extension of the files this format produces.
    #[must_use]
    pub fn extension(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Vhd | Self::VdiVhd => Some("vhd"),
            Self::Xva => Some("xva"),
            Self::VdiRaw => Some("raw"),
        }
    }
}

impl FromStr for ExportFormat {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "vhd" => Ok(Self::Vhd),
            "xva" => Ok(Self::Xva),
            "vdi_raw" => Ok(Self::VdiRaw),
            "vdi_vhd" => Ok(Self::VdiVhd),
            _ => Err(UnknownVariant {
                kind: "export format",
                value: s.to_string(),
                expected: Self::ALL,
            }),
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Virtualization mode recorded in the artifact.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum VirtualizationMode {
    Hvm,
    Pv,
}

impl VirtualizationMode {
    /// An empty HVM boot policy means the guest is paravirtualized.
    #[must_use]
    pub fn from_boot_policy(policy: &str) -> Self {
        if policy.is_empty() { Self::Pv } else { Self::Hvm }
    }
}

impl fmt::Display for VirtualizationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hvm => f.write_str("HVM"),
            Self::Pv => f.write_str("PV"),
        }
    }
}
