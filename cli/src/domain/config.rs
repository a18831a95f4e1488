//! Build template schema and validation.
//!
//! No I/O happens here. The loader in `infra::config` reads YAML into
//! [`Template`]; [`Template::prepare`] turns it into a fully-typed
//! [`BuildConfig`] or reports every problem at once.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use xenpack_common::ExportFormat;

use crate::domain::duration::parse_duration;
use crate::domain::error::ConfigError;
use crate::domain::ssh::SshAuth;

// ── Constants ────────────────────────────────────────────────────────────────

pub const DEFAULT_DISK_NAME: &str = "Packer-disk";
pub const DEFAULT_DISK_MIB: u64 = 40_000;
pub const DEFAULT_CLONE_TEMPLATE: &str = "Other install media";

// ── Keep-VM policy ───────────────────────────────────────────────────────────

/// Whether cleanup may destroy the VM the build created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeepVm {
    #[default]
    Never,
    OnSuccess,
    Always,
}

impl KeepVm {
    pub const VALID: &'static str = "never, on_success, always";

    /// `interrupted` is true when the build halted or was cancelled.
    #[must_use]
    pub fn keeps(self, interrupted: bool) -> bool {
        match self {
            Self::Never => false,
            Self::OnSuccess => !interrupted,
            Self::Always => true,
        }
    }
}

impl FromStr for KeepVm {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "never" => Ok(Self::Never),
            "on_success" => Ok(Self::OnSuccess),
            "always" => Ok(Self::Always),
            _ => Err(ConfigError::InvalidValue {
                field: "keep_vm",
                value: s.to_string(),
                valid: Self::VALID.to_string(),
            }),
        }
    }
}

impl fmt::Display for KeepVm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Never => "never",
            Self::OnSuccess => "on_success",
            Self::Always => "always",
        })
    }
}

// ── Template schema ──────────────────────────────────────────────────────────

/// A build template as written by the user, tagged by builder type.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum Template {
    /// Rebuild an image from an existing VM.
    #[serde(rename = "xenserver-vm")]
    Vm(VmTemplate),
    /// Install a fresh VM from an ISO.
    #[serde(rename = "xenserver-iso")]
    Iso(IsoTemplate),
}

/// Keys shared by both builders.
#[derive(Debug, Clone, Deserialize)]
pub struct CommonTemplate {
    #[serde(default)]
    pub remote_host: String,
    #[serde(default = "default_remote_username")]
    pub remote_username: String,
    #[serde(default)]
    pub remote_password: String,
    #[serde(default)]
    pub vm_name: String,
    #[serde(default)]
    pub vm_description: String,
    #[serde(default)]
    pub sr_name: Option<String>,
    #[serde(default)]
    pub output_directory: Option<String>,
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default = "default_keep_vm")]
    pub keep_vm: String,
    #[serde(default = "default_boot_wait")]
    pub boot_wait: String,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: String,
    #[serde(default = "default_host_port_min")]
    pub host_port_min: u16,
    #[serde(default = "default_host_port_max")]
    pub host_port_max: u16,
    #[serde(default = "default_remote_username")]
    pub ssh_username: String,
    #[serde(default)]
    pub ssh_password: Option<String>,
    #[serde(default)]
    pub ssh_key_path: Option<String>,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default)]
    pub nfs_mount: Option<String>,
    #[serde(default)]
    pub script_url: Option<String>,
    #[serde(default)]
    pub provision_commands: Vec<String>,
    #[serde(default)]
    pub convert_to_template: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VmTemplate {
    #[serde(flatten)]
    pub common: CommonTemplate,
    #[serde(default)]
    pub source_vm: String,
    #[serde(default = "default_long_timeout")]
    pub boot_timeout: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IsoTemplate {
    #[serde(flatten)]
    pub common: CommonTemplate,
    #[serde(default)]
    pub iso_name: String,
    #[serde(default)]
    pub iso_sr: Option<String>,
    #[serde(default)]
    pub iso_url: Option<String>,
    #[serde(default = "default_clone_template")]
    pub clone_template: String,
    /// MiB.
    #[serde(default = "default_vm_memory")]
    pub vm_memory: u64,
    #[serde(default = "default_vm_vcpus")]
    pub vm_vcpus: u32,
    /// Ordered `[name, size_mib]` pairs; creation order follows the list.
    #[serde(default)]
    pub vm_disks: Vec<(String, u64)>,
    /// Legacy single-disk size in MiB.
    #[serde(default)]
    pub disk_size: Option<u64>,
    #[serde(default)]
    pub network_name: Option<String>,
    #[serde(default = "default_long_timeout")]
    pub install_timeout: String,
}

fn default_remote_username() -> String {
    "root".to_string()
}

fn default_format() -> String {
    ExportFormat::default().as_str().to_string()
}

fn default_keep_vm() -> String {
    KeepVm::Never.to_string()
}

fn default_boot_wait() -> String {
    "0s".to_string()
}

fn default_shutdown_timeout() -> String {
    "50m".to_string()
}

fn default_long_timeout() -> String {
    "200m".to_string()
}

fn default_host_port_min() -> u16 {
    5900
}

fn default_host_port_max() -> u16 {
    6000
}

fn default_ssh_port() -> u16 {
    22
}

fn default_clone_template() -> String {
    DEFAULT_CLONE_TEMPLATE.to_string()
}

fn default_vm_memory() -> u64 {
    1024
}

fn default_vm_vcpus() -> u32 {
    1
}

// ── Prepared configuration ───────────────────────────────────────────────────

/// A validated build configuration.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub common: CommonConfig,
    pub builder: BuilderConfig,
}

#[derive(Debug, Clone)]
pub enum BuilderConfig {
    Vm(VmConfig),
    Iso(IsoConfig),
}

#[derive(Debug, Clone)]
pub struct CommonConfig {
    pub remote_host: String,
    pub remote_username: String,
    pub remote_password: String,
    pub vm_name: String,
    pub vm_description: String,
    pub sr_name: Option<String>,
    pub output_directory: PathBuf,
    /// Validated export format, kept as written for the export step.
    pub format: String,
    pub keep_vm: KeepVm,
    pub boot_wait: Duration,
    pub shutdown_timeout: Duration,
    pub host_port_min: u16,
    pub host_port_max: u16,
    pub ssh_username: String,
    pub ssh_auth: SshAuth,
    pub ssh_port: u16,
    pub nfs_mount: Option<String>,
    pub script_url: Option<String>,
    pub provision_commands: Vec<String>,
    pub convert_to_template: bool,
}

impl CommonConfig {
    /// Mount point of the storage repository export inside the output directory.
    #[must_use]
    pub fn nfs_mount_point(&self) -> PathBuf {
        self.output_directory.join("nfs")
    }
}

#[derive(Debug, Clone)]
pub struct VmConfig {
    pub source_vm: String,
    pub boot_timeout: Duration,
    /// Name of the intermediate snapshot of the source VM.
    pub snapshot_name: String,
    /// Name of the intermediate template cloned from the snapshot.
    pub clone_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSpec {
    pub name: String,
    pub size_mib: u64,
}

#[derive(Debug, Clone)]
pub struct IsoConfig {
    pub iso_name: String,
    pub iso_sr: Option<String>,
    pub iso_url: Option<String>,
    pub clone_template: String,
    pub memory_mib: u64,
    pub vcpus: u32,
    pub disks: Vec<DiskSpec>,
    pub network_name: Option<String>,
    pub install_timeout: Duration,
}

impl BuildConfig {
    #[must_use]
    pub fn vm(&self) -> Option<&VmConfig> {
        match &self.builder {
            BuilderConfig::Vm(vm) => Some(vm),
            BuilderConfig::Iso(_) => None,
        }
    }

    #[must_use]
    pub fn iso(&self) -> Option<&IsoConfig> {
        match &self.builder {
            BuilderConfig::Iso(iso) => Some(iso),
            BuilderConfig::Vm(_) => None,
        }
    }
}

// ── Validation ───────────────────────────────────────────────────────────────

impl Template {
    #[must_use]
    pub fn builder_type(&self) -> &'static str {
        match self {
            Self::Vm(_) => "xenserver-vm",
            Self::Iso(_) => "xenserver-iso",
        }
    }

    /// Apply defaults, parse durations and validate every key.
    ///
    /// `password_override` replaces `remote_password` when set (the caller
    /// reads it from the environment).
    ///
    /// # Errors
    ///
    /// Returns the single problem found, or [`ConfigError::Multiple`] listing
    /// all of them.
    pub fn prepare(self, password_override: Option<String>) -> Result<BuildConfig, ConfigError> {
        let mut problems = Vec::new();
        let (common, builder) = match self {
            Self::Vm(t) => {
                let common = prepare_common(t.common, password_override, &mut problems);
                let vm = prepare_vm(&common, t.source_vm, &t.boot_timeout, &mut problems);
                (common, BuilderConfig::Vm(vm))
            }
            Self::Iso(t) => {
                let common = prepare_common(t.common.clone(), password_override, &mut problems);
                let iso = prepare_iso(&common, t, &mut problems);
                (common, BuilderConfig::Iso(iso))
            }
        };

        match problems.len() {
            0 => Ok(BuildConfig { common, builder }),
            1 => Err(problems.remove(0)),
            _ => Err(ConfigError::Multiple(problems)),
        }
    }
}

fn duration_field(
    field: &'static str,
    value: &str,
    problems: &mut Vec<ConfigError>,
) -> Duration {
    parse_duration(value).unwrap_or_else(|reason| {
        problems.push(ConfigError::InvalidDuration {
            field,
            value: value.to_string(),
            reason,
        });
        Duration::ZERO
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn prepare_common(
    t: CommonTemplate,
    password_override: Option<String>,
    problems: &mut Vec<ConfigError>,
) -> CommonConfig {
    let remote_password = non_empty(password_override).unwrap_or(t.remote_password);

    if t.remote_host.trim().is_empty() {
        problems.push(ConfigError::Missing { field: "remote_host" });
    }
    if remote_password.is_empty() {
        problems.push(ConfigError::Missing {
            field: "remote_password",
        });
    }
    if t.vm_name.trim().is_empty() {
        problems.push(ConfigError::Missing { field: "vm_name" });
    }
    if t.format.parse::<ExportFormat>().is_err() {
        problems.push(ConfigError::InvalidValue {
            field: "format",
            value: t.format.clone(),
            valid: ExportFormat::ALL.to_string(),
        });
    }
    let keep_vm = t.keep_vm.parse::<KeepVm>().unwrap_or_else(|e| {
        problems.push(e);
        KeepVm::Never
    });
    if t.host_port_min > t.host_port_max {
        problems.push(ConfigError::Invalid(format!(
            "host_port_min ({}) must not exceed host_port_max ({})",
            t.host_port_min, t.host_port_max
        )));
    }

    let boot_wait = duration_field("boot_wait", &t.boot_wait, problems);
    let shutdown_timeout = duration_field("shutdown_timeout", &t.shutdown_timeout, problems);

    let ssh_auth = match non_empty(t.ssh_key_path) {
        Some(path) => SshAuth::Key(PathBuf::from(path)),
        None => SshAuth::Password(t.ssh_password.unwrap_or_default()),
    };

    let output_directory = non_empty(t.output_directory)
        .map_or_else(|| PathBuf::from(format!("output-{}", t.vm_name)), PathBuf::from);

    CommonConfig {
        remote_host: t.remote_host,
        remote_username: t.remote_username,
        remote_password,
        vm_name: t.vm_name,
        vm_description: t.vm_description,
        sr_name: non_empty(t.sr_name),
        output_directory,
        format: t.format,
        keep_vm,
        boot_wait,
        shutdown_timeout,
        host_port_min: t.host_port_min,
        host_port_max: t.host_port_max,
        ssh_username: t.ssh_username,
        ssh_auth,
        ssh_port: t.ssh_port,
        nfs_mount: non_empty(t.nfs_mount),
        script_url: non_empty(t.script_url),
        provision_commands: t.provision_commands,
        convert_to_template: t.convert_to_template,
    }
}

fn prepare_vm(
    common: &CommonConfig,
    source_vm: String,
    boot_timeout: &str,
    problems: &mut Vec<ConfigError>,
) -> VmConfig {
    if source_vm.trim().is_empty() {
        problems.push(ConfigError::Missing { field: "source_vm" });
    }
    let boot_timeout = duration_field("boot_timeout", boot_timeout, problems);
    VmConfig {
        snapshot_name: format!("{}_snapshot", common.vm_name),
        clone_name: format!("{source_vm}-clone"),
        source_vm,
        boot_timeout,
    }
}

fn prepare_iso(common: &CommonConfig, t: IsoTemplate, problems: &mut Vec<ConfigError>) -> IsoConfig {
    if t.iso_name.trim().is_empty() {
        problems.push(ConfigError::Missing { field: "iso_name" });
    }

    let iso_url = non_empty(t.iso_url);
    let iso_sr = non_empty(t.iso_sr);
    if iso_url.is_some() {
        if common.script_url.is_none() {
            problems.push(ConfigError::Invalid(
                "script_url must be specified when iso_url is set".to_string(),
            ));
        }
        if iso_sr.is_none() {
            problems.push(ConfigError::Invalid(
                "iso_sr must be specified when iso_url is set".to_string(),
            ));
        }
    }

    if t.vm_memory == 0 {
        problems.push(ConfigError::Invalid("vm_memory must be greater than 0".to_string()));
    }
    if t.vm_vcpus == 0 {
        problems.push(ConfigError::Invalid("vm_vcpus must be greater than 0".to_string()));
    }

    let mut disks: Vec<DiskSpec> = t
        .vm_disks
        .into_iter()
        .map(|(name, size_mib)| DiskSpec { name, size_mib })
        .collect();
    if let Some(size_mib) = t.disk_size {
        disks.push(DiskSpec {
            name: DEFAULT_DISK_NAME.to_string(),
            size_mib,
        });
    }
    if disks.is_empty() {
        disks.push(DiskSpec {
            name: DEFAULT_DISK_NAME.to_string(),
            size_mib: DEFAULT_DISK_MIB,
        });
    }
    for (i, disk) in disks.iter().enumerate() {
        if disk.name.trim().is_empty() {
            problems.push(ConfigError::Invalid(format!("vm_disks[{i}] has an empty name")));
        }
        if disk.size_mib == 0 {
            problems.push(ConfigError::Invalid(format!(
                "vm_disks[{i}] ('{}') must have a size greater than 0",
                disk.name
            )));
        }
    }

    let install_timeout = duration_field("install_timeout", &t.install_timeout, problems);

    IsoConfig {
        iso_name: t.iso_name,
        iso_sr,
        iso_url,
        clone_template: t.clone_template,
        memory_mib: t.vm_memory,
        vcpus: t.vm_vcpus,
        disks,
        network_name: non_empty(t.network_name),
        install_timeout,
    }
}
