//! Port trait definitions for the Application layer.
//!
//! Ports are the interfaces (contracts) that infrastructure must fulfill.
//! This file imports only from `crate::domain` and `xenpack_common`, never
//! from `crate::infra`, `crate::commands`, or `crate::output`.
//!
//! Ports that the build steps hold as `Arc<dyn ..>` are declared with
//! `async_trait` so they stay object-safe; the process runner is only ever
//! used generically and returns `impl Future + Send` instead.

use std::path::Path;
use std::process::Output;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use xenpack_common::{PowerState, ProductVersion};

use crate::domain::{NetworkRef, SrRef, SshTarget, VbdKind, VdiRef, Vif, VifRef, VmRef};

// ── Hypervisor Port Traits ────────────────────────────────────────────────────

/// Finding VMs and reading their properties.
#[async_trait]
pub trait VmInventory: Send + Sync {
    async fn vms_by_name(&self, name: &str) -> Result<Vec<VmRef>>;
    async fn vm_uuid(&self, vm: &VmRef) -> Result<String>;
    /// Disks attached as `Disk` (not CD), ordered by device number.
    async fn vm_disks(&self, vm: &VmRef) -> Result<Vec<VdiRef>>;
    /// Empty for paravirtualized guests.
    async fn hvm_boot_policy(&self, vm: &VmRef) -> Result<String>;
    /// Address the guest tools report for interface `device`, if any yet.
    async fn guest_ip(&self, vm: &VmRef, device: u32) -> Result<Option<String>>;
    /// Management address of the host the VM is currently running on.
    async fn resident_host_address(&self, vm: &VmRef) -> Result<String>;
    async fn domid(&self, vm: &VmRef) -> Result<i64>;
}

/// Power-state queries and transitions.
#[async_trait]
pub trait VmPower: Send + Sync {
    async fn power_state(&self, vm: &VmRef) -> Result<PowerState>;
    async fn start(&self, vm: &VmRef, paused: bool) -> Result<()>;
    async fn unpause(&self, vm: &VmRef) -> Result<()>;
    async fn resume(&self, vm: &VmRef) -> Result<()>;
    async fn clean_shutdown(&self, vm: &VmRef) -> Result<()>;
    async fn hard_shutdown(&self, vm: &VmRef) -> Result<()>;
}

/// Creating, copying and destroying VMs.
#[async_trait]
pub trait VmProvisioning: Send + Sync {
    async fn snapshot(&self, vm: &VmRef, name: &str) -> Result<VmRef>;
    async fn clone_vm(&self, vm: &VmRef, name: &str) -> Result<VmRef>;
    async fn copy_vm(&self, vm: &VmRef, name: &str, sr: &SrRef) -> Result<VmRef>;
    async fn set_is_a_template(&self, vm: &VmRef, value: bool) -> Result<()>;
    async fn set_description(&self, vm: &VmRef, description: &str) -> Result<()>;
    async fn set_memory(&self, vm: &VmRef, bytes: u64) -> Result<()>;
    async fn set_vcpus(&self, vm: &VmRef, count: u32) -> Result<()>;
    async fn destroy_vm(&self, vm: &VmRef) -> Result<()>;
}

/// Network interfaces and networks.
#[async_trait]
pub trait NetworkOps: Send + Sync {
    async fn vm_vifs(&self, vm: &VmRef) -> Result<Vec<Vif>>;
    async fn destroy_vif(&self, vif: &VifRef) -> Result<()>;
    async fn connect_network(&self, vm: &VmRef, network: &NetworkRef, device: u32)
    -> Result<VifRef>;
    async fn create_network(&self, name: &str, description: &str) -> Result<NetworkRef>;
    async fn destroy_network(&self, network: &NetworkRef) -> Result<()>;
    async fn networks_by_name(&self, name: &str) -> Result<Vec<NetworkRef>>;
    /// The host-internal network used for host-to-guest control traffic.
    async fn management_network(&self) -> Result<NetworkRef>;
}

/// Storage repositories, disks and their attachment to VMs.
#[async_trait]
pub trait StorageOps: Send + Sync {
    async fn srs_by_name(&self, name: &str) -> Result<Vec<SrRef>>;
    async fn default_sr(&self) -> Result<SrRef>;
    async fn sr_uuid(&self, sr: &SrRef) -> Result<String>;
    async fn vdis_by_name(&self, name: &str) -> Result<Vec<VdiRef>>;
    async fn vdi_uuid(&self, vdi: &VdiRef) -> Result<String>;
    async fn vdi_sr(&self, vdi: &VdiRef) -> Result<SrRef>;
    async fn vdi_virtual_size(&self, vdi: &VdiRef) -> Result<u64>;
    async fn create_vdi(&self, sr: &SrRef, name: &str, size_bytes: u64) -> Result<VdiRef>;
    async fn destroy_vdi(&self, vdi: &VdiRef) -> Result<()>;
    async fn attach_vdi(&self, vm: &VmRef, vdi: &VdiRef, kind: VbdKind) -> Result<()>;
    /// Eject or unplug `vdi` from `vm` and remove the attachment.
    async fn detach_vdi(&self, vm: &VmRef, vdi: &VdiRef) -> Result<()>;
}

/// Where and how disks can be downloaded from the pool.
#[derive(Debug, Clone)]
pub struct ExportEndpoint {
    /// `https://<host>`.
    pub base_url: String,
    pub session_id: String,
    pub username: String,
    pub password: String,
}

/// A disk made downloadable by the transfer helper service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExposedDisk {
    pub handle: String,
    pub url: String,
}

/// Disk and VM export support.
#[async_trait]
pub trait DiskExport: Send + Sync {
    async fn product_version(&self) -> Result<ProductVersion>;
    async fn export_endpoint(&self) -> Result<ExportEndpoint>;
    /// Expose `vdi` through the transfer helper; `format` is `raw` or `vhd`.
    async fn expose_vdi(&self, vdi: &VdiRef, format: &str) -> Result<ExposedDisk>;
    async fn unexpose_vdi(&self, handle: &str) -> Result<()>;
}

/// The whole hypervisor control API as consumed by the build.
pub trait Hypervisor:
    VmInventory + VmPower + VmProvisioning + NetworkOps + StorageOps + DiskExport
{
}

impl<T> Hypervisor for T where
    T: VmInventory + VmPower + VmProvisioning + NetworkOps + StorageOps + DiskExport
{
}

// ── Transport Port Traits ─────────────────────────────────────────────────────

/// Command execution and file upload on one SSH-reachable host.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run one command and return its trimmed stdout.
    ///
    /// # Errors
    ///
    /// Fails on transport errors and on a non-zero exit status.
    async fn run_command(&self, command: &str) -> Result<String>;

    /// Run commands one after another, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// The error carries everything captured up to the failing command.
    async fn run_commands(&self, commands: &[String]) -> Result<String>;

    /// Copy a local file to `remote`, optionally marking it executable.
    async fn upload_file(&self, local: &Path, remote: &str, executable: bool) -> Result<()>;
}

/// Builds shells for a given target (the hypervisor host, or a guest behind
/// a forwarded port).
pub trait ShellConnector: Send + Sync {
    fn connect(&self, target: &SshTarget) -> Box<dyn RemoteShell>;
}

/// A bidirectional byte stream.
pub trait DuplexStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> DuplexStream for T {}

pub type BoxedStream = Box<dyn DuplexStream>;

/// Opens a stream to a destination that is only reachable from `entry`.
#[async_trait]
pub trait TunnelDialer: Send + Sync {
    /// Connect to `entry`, then from there to `dest_host:dest_port`.
    async fn dial(&self, entry: &SshTarget, dest_host: &str, dest_port: u16)
    -> Result<BoxedStream>;
}

// ── Download Port ─────────────────────────────────────────────────────────────

/// An authenticated HTTPS GET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub url: String,
    pub basic_auth: Option<(String, String)>,
}

impl DownloadRequest {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            basic_auth: None,
        }
    }

    #[must_use]
    pub fn with_basic_auth(mut self, user: &str, password: &str) -> Self {
        self.basic_auth = Some((user.to_string(), password.to_string()));
        self
    }
}

/// Streams a URL to a local file.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Returns the number of bytes written. `progress` receives each crossed
    /// 5% boundary.
    async fn download(
        &self,
        request: &DownloadRequest,
        dest: &Path,
        progress: &(dyn Fn(u8) + Send + Sync),
    ) -> Result<u64>;
}

// ── Local Host Ports ──────────────────────────────────────────────────────────

/// Mounting the storage repository export on the build host.
#[async_trait]
pub trait MountManager: Send + Sync {
    async fn mount(&self, source: &str, target: &Path) -> Result<()>;
    async fn unmount(&self, target: &Path) -> Result<()>;
}

/// Abstracts file hashing for the artifact manifest.
pub trait FileHasher {
    /// Compute the hex SHA-256 hash of a file.
    fn sha256_file(&self, path: &Path) -> Result<String>;
}

/// Abstracts raw filesystem operations on the output directory.
pub trait LocalFs {
    fn exists(&self, path: &Path) -> bool;
    fn file_size(&self, path: &Path) -> Result<u64>;
    fn write(&self, path: &Path, content: String) -> Result<()>;
    fn remove_dir_all(&self, path: &Path) -> Result<()>;
}

/// Abstracts subprocess execution so process-backed adapters can be tested
/// without spawning real processes.
///
/// The futures are `Send` so adapters built on a runner can themselves be
/// shared across tasks.
pub trait CommandRunner: Send + Sync {
    /// Run a program and capture its output.
    ///
    /// Implementations should delegate to `run_with_timeout` using the
    /// instance's configured default timeout.
    fn run(&self, program: &str, args: &[&str]) -> impl Future<Output = Result<Output>> + Send;
    /// Run a program with a custom timeout override.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be spawned or exceeds `timeout`.
    /// On timeout, the child process must be killed (not left orphaned).
    fn run_with_timeout(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> impl Future<Output = Result<Output>> + Send;
    /// Spawn a program with piped stdin/stdout without waiting for it.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be spawned.
    fn spawn(&self, program: &str, args: &[&str]) -> Result<tokio::process::Child>;
}

// ── Reporting Port ────────────────────────────────────────────────────────────

/// Abstracts progress reporting so application services do not depend on
/// any presentation type.
pub trait ProgressReporter: Send + Sync {
    /// Announce a step starting.
    fn say(&self, message: &str);
    /// Emit a detail line within the current step.
    fn message(&self, message: &str);
    /// Emit a success message.
    fn success(&self, message: &str);
    /// Emit a warning message.
    fn warn(&self, message: &str);
    /// Emit an error message. Never suppressed.
    fn error(&self, message: &str);
}
