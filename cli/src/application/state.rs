//! Typed build state shared by the steps of one build.
//!
//! Each field is written by exactly one step and read by later ones. Reading
//! a field that was never written is a programming error surfaced as
//! [`StateError::Missing`].

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::application::ports::{
    Downloader, Hypervisor, MountManager, ProgressReporter, RemoteShell, ShellConnector,
    TunnelDialer,
};
use crate::application::runner::{Interruption, StepContext};
use crate::domain::{BuildConfig, NetworkRef, SshAuth, SshTarget, StateError, VdiRef, VmRef};

fn required<'a, T>(value: Option<&'a T>, key: &'static str) -> Result<&'a T, StateError> {
    value.ok_or(StateError::Missing { key })
}

#[derive(Debug, Default)]
pub struct BuildState {
    /// Failure recorded by the step that halted.
    pub error: Option<anyhow::Error>,
    pub interruption: Option<Interruption>,

    pub instance: Option<VmRef>,
    pub instance_uuid: Option<String>,
    pub instance_sr_uuid: Option<String>,
    /// Virtual size of the single disk of a snapshot-built VM, in whole GiB.
    pub configured_disk_gb: Option<u64>,
    /// HVM boot policy; empty for paravirtualized guests.
    pub boot_policy: Option<String>,
    /// Networks that were on each interface index before isolation.
    pub original_networks: Option<Vec<Option<NetworkRef>>>,
    pub iso_vdi: Option<VdiRef>,

    pub domid: Option<i64>,
    /// Host the VM runs on; host commands after boot go there.
    pub resident_host: Option<String>,
    pub guest_ip: Option<String>,
    pub local_ssh_port: Option<u16>,

    pub export_files: Vec<PathBuf>,
}

impl BuildState {
    /// # Errors
    ///
    /// Returns `StateError::Missing` when no step created the instance yet.
    pub fn require_instance(&self) -> Result<&VmRef, StateError> {
        required(self.instance.as_ref(), "instance")
    }

    /// # Errors
    ///
    /// Returns `StateError::Missing` when no step recorded the instance UUID.
    pub fn require_instance_uuid(&self) -> Result<&str, StateError> {
        required(self.instance_uuid.as_ref(), "instance_uuid").map(String::as_str)
    }

    /// # Errors
    ///
    /// Returns `StateError::Missing` when the snapshot step has not run.
    pub fn require_original_networks(&self) -> Result<&[Option<NetworkRef>], StateError> {
        required(self.original_networks.as_ref(), "original_networks").map(Vec::as_slice)
    }

    /// # Errors
    ///
    /// Returns `StateError::Missing` when the ISO has not been located.
    pub fn require_iso_vdi(&self) -> Result<&VdiRef, StateError> {
        required(self.iso_vdi.as_ref(), "iso_vdi")
    }

    /// # Errors
    ///
    /// Returns `StateError::Missing` before the guest reported an address.
    pub fn require_guest_ip(&self) -> Result<&str, StateError> {
        required(self.guest_ip.as_ref(), "guest_ip").map(String::as_str)
    }

    /// # Errors
    ///
    /// Returns `StateError::Missing` before the guest port was forwarded.
    pub fn require_local_ssh_port(&self) -> Result<u16, StateError> {
        required(self.local_ssh_port.as_ref(), "local_ssh_port").copied()
    }
}

/// Collaborators the steps talk to.
#[derive(Clone)]
pub struct BuildServices {
    pub hypervisor: Arc<dyn Hypervisor>,
    pub shells: Arc<dyn ShellConnector>,
    pub dialer: Arc<dyn TunnelDialer>,
    pub downloader: Arc<dyn Downloader>,
    pub mounts: Arc<dyn MountManager>,
    pub reporter: Arc<dyn ProgressReporter>,
}

/// Everything a step can see: configuration, collaborators, cancellation and
/// the mutable state.
pub struct BuildContext {
    pub config: BuildConfig,
    pub services: BuildServices,
    pub cancel: CancellationToken,
    pub state: BuildState,
}

impl BuildContext {
    #[must_use]
    pub fn new(config: BuildConfig, services: BuildServices, cancel: CancellationToken) -> Self {
        Self {
            config,
            services,
            cancel,
            state: BuildState::default(),
        }
    }

    #[must_use]
    pub fn hypervisor(&self) -> &dyn Hypervisor {
        self.services.hypervisor.as_ref()
    }

    #[must_use]
    pub fn reporter(&self) -> &dyn ProgressReporter {
        self.services.reporter.as_ref()
    }

    /// Record `error` as the reason the build stops and report it.
    pub fn fail(&mut self, error: anyhow::Error) {
        self.services.reporter.error(&format!("{error:#}"));
        self.state.error = Some(error);
    }

    /// Whether cleanups must leave the VM in place.
    #[must_use]
    pub fn should_keep_vm(&self) -> bool {
        self.config
            .common
            .keep_vm
            .keeps(self.state.interruption.is_some())
    }

    /// SSH target of the hypervisor host. Follows the VM to the host it is
    /// resident on once it has started.
    #[must_use]
    pub fn host_target(&self) -> SshTarget {
        let common = &self.config.common;
        let host = self
            .state
            .resident_host
            .clone()
            .unwrap_or_else(|| common.remote_host.clone());
        SshTarget::new(
            host,
            22,
            common.remote_username.clone(),
            SshAuth::Password(common.remote_password.clone()),
        )
    }

    #[must_use]
    pub fn host_shell(&self) -> Box<dyn RemoteShell> {
        self.services.shells.connect(&self.host_target())
    }
}

impl StepContext for BuildContext {
    fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    fn has_error(&self) -> bool {
        self.state.error.is_some()
    }

    fn set_interruption(&mut self, interruption: Interruption) {
        self.state.interruption = Some(interruption);
    }
}
