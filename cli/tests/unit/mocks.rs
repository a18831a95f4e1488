//! Shared mock infrastructure for unit tests.
//!
//! [`FakeHypervisor`] keeps a small in-memory pool (VMs, disks, storage
//! repositories, networks) and logs every call, so step tests can assert both
//! on the resulting pool and on the order of operations.

#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Output};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use xenpack_cli::application::ports::{
    BoxedStream, CommandRunner, DiskExport, DownloadRequest, Downloader, ExportEndpoint,
    ExposedDisk, FileHasher, LocalFs, MountManager, NetworkOps, ProgressReporter, RemoteShell,
    ShellConnector, StorageOps, TunnelDialer, VmInventory, VmPower, VmProvisioning,
};
use xenpack_cli::application::{BuildContext, BuildServices};
use xenpack_cli::domain::{
    BuildConfig, NetworkRef, SrRef, SshTarget, Template, VbdKind, VdiRef, Vif, VifRef, VmRef,
};
use xenpack_common::{PowerState, ProductVersion};

// ── Output helpers ────────────────────────────────────────────────────────────

#[cfg(unix)]
pub fn exit_status(code: i32) -> ExitStatus {
    use std::os::unix::process::ExitStatusExt;
    ExitStatus::from_raw(code << 8)
}

#[cfg(windows)]
pub fn exit_status(code: i32) -> ExitStatus {
    use std::os::windows::process::ExitStatusExt;
    #[allow(clippy::cast_sign_loss)]
    ExitStatus::from_raw(code as u32)
}

pub fn ok_output(stdout: &[u8]) -> Output {
    Output {
        status: exit_status(0),
        stdout: stdout.to_vec(),
        stderr: Vec::new(),
    }
}

pub fn err_output(code: i32, stdout: &[u8], stderr: &[u8]) -> Output {
    Output {
        status: exit_status(code),
        stdout: stdout.to_vec(),
        stderr: stderr.to_vec(),
    }
}

// ── Fake pool ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FakeVm {
    pub name: String,
    pub uuid: String,
    pub power: PowerState,
    pub is_template: bool,
    pub description: String,
    pub memory_bytes: u64,
    pub vcpus: u32,
    pub boot_policy: String,
    pub guest_ip: Option<String>,
    pub disks: Vec<VdiRef>,
    pub cds: Vec<VdiRef>,
    pub vifs: Vec<Vif>,
}

#[derive(Debug, Clone)]
pub struct FakeVdi {
    pub name: String,
    pub uuid: String,
    pub sr: SrRef,
    pub size: u64,
}

#[derive(Default)]
struct Pool {
    next_id: u32,
    calls: Vec<String>,
    fail: HashSet<String>,
    vms: BTreeMap<String, FakeVm>,
    vdis: BTreeMap<String, FakeVdi>,
    srs: Vec<(SrRef, String, String)>,
    networks: Vec<(NetworkRef, String)>,
    exposed: Vec<String>,
    version: Option<ProductVersion>,
    halt_on_clean_shutdown: bool,
    guest_ip_after_polls: Option<(u32, String)>,
    iso_after_lookups: Option<(String, u32)>,
}

impl Pool {
    fn id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn vm(&self, vm: &VmRef) -> Result<&FakeVm> {
        self.vms
            .get(vm.as_str())
            .ok_or_else(|| anyhow::anyhow!("no such VM {vm}"))
    }

    fn vm_mut(&mut self, vm: &VmRef) -> Result<&mut FakeVm> {
        self.vms
            .get_mut(vm.as_str())
            .ok_or_else(|| anyhow::anyhow!("no such VM {vm}"))
    }

    fn vdi(&self, vdi: &VdiRef) -> Result<&FakeVdi> {
        self.vdis
            .get(vdi.as_str())
            .ok_or_else(|| anyhow::anyhow!("no such VDI {vdi}"))
    }

    fn copy_disks(&mut self, disks: &[VdiRef], sr: Option<&SrRef>) -> Vec<VdiRef> {
        let mut copies = Vec::new();
        for disk in disks {
            let Some(original) = self.vdis.get(disk.as_str()).cloned() else {
                continue;
            };
            let reference = self.id("OpaqueRef:vdi");
            let uuid = self.id("vdi-uuid");
            self.vdis.insert(
                reference.clone(),
                FakeVdi {
                    uuid,
                    sr: sr.cloned().unwrap_or(original.sr.clone()),
                    ..original
                },
            );
            copies.push(VdiRef::new(reference));
        }
        copies
    }

    fn copy_vm(&mut self, vm: &VmRef, name: &str, sr: Option<&SrRef>, template: bool) -> Result<VmRef> {
        let source = self.vm(vm)?.clone();
        let disks = self.copy_disks(&source.disks, sr);
        let mut vifs = Vec::new();
        for vif in &source.vifs {
            vifs.push(Vif {
                reference: VifRef::new(self.id("OpaqueRef:vif")),
                ..vif.clone()
            });
        }
        let reference = self.id("OpaqueRef:vm");
        let uuid = self.id("vm-uuid");
        self.vms.insert(
            reference.clone(),
            FakeVm {
                name: name.to_string(),
                uuid,
                power: PowerState::Halted,
                is_template: template,
                disks,
                cds: Vec::new(),
                vifs,
                ..source
            },
        );
        Ok(VmRef::new(reference))
    }
}

/// In-memory hypervisor implementing every hypervisor port.
#[derive(Clone, Default)]
pub struct FakeHypervisor {
    pool: Arc<Mutex<Pool>>,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        let hv = Self::default();
        {
            let mut pool = hv.pool.lock().unwrap();
            pool.srs.push((
                SrRef::new("OpaqueRef:sr-default"),
                "Local storage".to_string(),
                "sr-uuid-default".to_string(),
            ));
            pool.networks
                .push((NetworkRef::new("OpaqueRef:net-mgmt"), "Host internal management network".to_string()));
            pool.version = Some(ProductVersion::new(&[8, 2, 1]));
            pool.halt_on_clean_shutdown = true;
        }
        hv
    }

    /// Add a VM with one disk of `disk_bytes` on the default SR and interfaces
    /// on `networks` (device index = position, `None` leaves a gap).
    pub fn add_vm(&self, name: &str, power: PowerState, disk_bytes: u64, networks: &[Option<&str>]) -> VmRef {
        let mut pool = self.pool.lock().unwrap();
        let disk = pool.id("OpaqueRef:vdi");
        let disk_uuid = pool.id("vdi-uuid");
        pool.vdis.insert(
            disk.clone(),
            FakeVdi {
                name: format!("{name} disk"),
                uuid: disk_uuid,
                sr: SrRef::new("OpaqueRef:sr-default"),
                size: disk_bytes,
            },
        );
        let mut vifs = Vec::new();
        for (device, network) in networks.iter().enumerate() {
            let Some(network) = network else { continue };
            let net = NetworkRef::new(format!("OpaqueRef:net-{network}"));
            if !pool.networks.iter().any(|(r, _)| *r == net) {
                pool.networks.push((net.clone(), (*network).to_string()));
            }
            vifs.push(Vif {
                reference: VifRef::new(pool.id("OpaqueRef:vif")),
                device: u32::try_from(device).unwrap(),
                network: net,
            });
        }
        let reference = pool.id("OpaqueRef:vm");
        let uuid = pool.id("vm-uuid");
        pool.vms.insert(
            reference.clone(),
            FakeVm {
                name: name.to_string(),
                uuid,
                power,
                is_template: false,
                description: String::new(),
                memory_bytes: 0,
                vcpus: 1,
                boot_policy: String::new(),
                guest_ip: None,
                disks: vec![VdiRef::new(disk)],
                cds: Vec::new(),
                vifs,
            },
        );
        VmRef::new(reference)
    }

    pub fn add_template(&self, name: &str) -> VmRef {
        let vm = self.add_vm(name, PowerState::Halted, 0, &[]);
        let mut pool = self.pool.lock().unwrap();
        let entry = pool.vms.get_mut(vm.as_str()).unwrap();
        entry.is_template = true;
        entry.disks.clear();
        entry.boot_policy = "BIOS order".to_string();
        vm
    }

    pub fn add_disk(&self, vm: &VmRef, bytes: u64) -> VdiRef {
        let mut pool = self.pool.lock().unwrap();
        let reference = pool.id("OpaqueRef:vdi");
        let uuid = pool.id("vdi-uuid");
        pool.vdis.insert(
            reference.clone(),
            FakeVdi {
                name: "extra".to_string(),
                uuid,
                sr: SrRef::new("OpaqueRef:sr-default"),
                size: bytes,
            },
        );
        let vdi = VdiRef::new(reference);
        pool.vms.get_mut(vm.as_str()).unwrap().disks.push(vdi.clone());
        vdi
    }

    pub fn add_iso(&self, name: &str) -> VdiRef {
        let mut pool = self.pool.lock().unwrap();
        let reference = pool.id("OpaqueRef:vdi");
        let uuid = pool.id("vdi-uuid");
        pool.vdis.insert(
            reference.clone(),
            FakeVdi {
                name: name.to_string(),
                uuid,
                sr: SrRef::new("OpaqueRef:sr-iso"),
                size: 1,
            },
        );
        VdiRef::new(reference)
    }

    pub fn add_sr(&self, name: &str) -> SrRef {
        let mut pool = self.pool.lock().unwrap();
        let reference = SrRef::new(format!("OpaqueRef:sr-{name}"));
        let uuid = pool.id("sr-uuid");
        pool.srs.push((reference.clone(), name.to_string(), uuid));
        reference
    }

    pub fn set_guest_ip(&self, vm: &VmRef, ip: &str) {
        let mut pool = self.pool.lock().unwrap();
        pool.vms.get_mut(vm.as_str()).unwrap().guest_ip = Some(ip.to_string());
    }

    /// The guest reports `ip` only after `polls` unsuccessful queries.
    pub fn guest_ip_after(&self, polls: u32, ip: &str) {
        self.pool.lock().unwrap().guest_ip_after_polls = Some((polls, ip.to_string()));
    }

    /// An ISO named `name` shows up once it has been looked up `lookups` times.
    pub fn iso_appears_after(&self, name: &str, lookups: u32) {
        self.pool.lock().unwrap().iso_after_lookups = Some((name.to_string(), lookups));
    }

    pub fn vdi_uuid_of(&self, vdi: &VdiRef) -> String {
        self.pool.lock().unwrap().vdis[vdi.as_str()].uuid.clone()
    }

    pub fn set_version(&self, version: &[u32]) {
        self.pool.lock().unwrap().version = Some(ProductVersion::new(version));
    }

    /// Make clean shutdowns leave the VM running.
    pub fn ignore_clean_shutdown(&self) {
        self.pool.lock().unwrap().halt_on_clean_shutdown = false;
    }

    /// Fail every call to `method`.
    pub fn fail_on(&self, method: &str) {
        self.pool.lock().unwrap().fail.insert(method.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.pool.lock().unwrap().calls.clone()
    }

    pub fn calls_to(&self, method: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.split(' ').next() == Some(method))
            .count()
    }

    pub fn vm(&self, vm: &VmRef) -> Option<FakeVm> {
        self.pool.lock().unwrap().vms.get(vm.as_str()).cloned()
    }

    pub fn vms_named(&self, name: &str) -> Vec<FakeVm> {
        self.pool
            .lock()
            .unwrap()
            .vms
            .values()
            .filter(|vm| vm.name == name)
            .cloned()
            .collect()
    }

    pub fn vm_count(&self) -> usize {
        self.pool.lock().unwrap().vms.len()
    }

    pub fn vdi_count(&self) -> usize {
        self.pool.lock().unwrap().vdis.len()
    }

    pub fn network_count(&self) -> usize {
        self.pool.lock().unwrap().networks.len()
    }

    pub fn exposed(&self) -> Vec<String> {
        self.pool.lock().unwrap().exposed.clone()
    }

    fn enter(&self, method: &str, args: &str) -> Result<std::sync::MutexGuard<'_, Pool>> {
        let mut pool = self.pool.lock().unwrap();
        pool.calls.push(if args.is_empty() {
            method.to_string()
        } else {
            format!("{method} {args}")
        });
        if pool.fail.contains(method) {
            anyhow::bail!("injected failure in {method}");
        }
        Ok(pool)
    }
}

#[async_trait]
impl VmInventory for FakeHypervisor {
    async fn vms_by_name(&self, name: &str) -> Result<Vec<VmRef>> {
        let pool = self.enter("vms_by_name", name)?;
        Ok(pool
            .vms
            .iter()
            .filter(|(_, vm)| vm.name == name)
            .map(|(r, _)| VmRef::new(r.clone()))
            .collect())
    }

    async fn vm_uuid(&self, vm: &VmRef) -> Result<String> {
        let pool = self.enter("vm_uuid", vm.as_str())?;
        Ok(pool.vm(vm)?.uuid.clone())
    }

    async fn vm_disks(&self, vm: &VmRef) -> Result<Vec<VdiRef>> {
        let pool = self.enter("vm_disks", vm.as_str())?;
        Ok(pool.vm(vm)?.disks.clone())
    }

    async fn hvm_boot_policy(&self, vm: &VmRef) -> Result<String> {
        let pool = self.enter("hvm_boot_policy", vm.as_str())?;
        Ok(pool.vm(vm)?.boot_policy.clone())
    }

    async fn guest_ip(&self, vm: &VmRef, device: u32) -> Result<Option<String>> {
        let mut pool = self.enter("guest_ip", vm.as_str())?;
        if let Some((remaining, ip)) = pool.guest_ip_after_polls.take() {
            if remaining == 0 {
                pool.vm_mut(vm)?.guest_ip = Some(ip);
            } else {
                pool.guest_ip_after_polls = Some((remaining - 1, ip));
            }
        }
        if device != 0 {
            return Ok(None);
        }
        Ok(pool.vm(vm)?.guest_ip.clone())
    }

    async fn resident_host_address(&self, vm: &VmRef) -> Result<String> {
        let pool = self.enter("resident_host_address", vm.as_str())?;
        pool.vm(vm)?;
        Ok("10.0.0.2".to_string())
    }

    async fn domid(&self, vm: &VmRef) -> Result<i64> {
        let pool = self.enter("domid", vm.as_str())?;
        pool.vm(vm)?;
        Ok(7)
    }
}

#[async_trait]
impl VmPower for FakeHypervisor {
    async fn power_state(&self, vm: &VmRef) -> Result<PowerState> {
        let pool = self.enter("power_state", vm.as_str())?;
        Ok(pool.vm(vm)?.power)
    }

    async fn start(&self, vm: &VmRef, paused: bool) -> Result<()> {
        let mut pool = self.enter("start", vm.as_str())?;
        pool.vm_mut(vm)?.power = if paused {
            PowerState::Paused
        } else {
            PowerState::Running
        };
        Ok(())
    }

    async fn unpause(&self, vm: &VmRef) -> Result<()> {
        let mut pool = self.enter("unpause", vm.as_str())?;
        pool.vm_mut(vm)?.power = PowerState::Running;
        Ok(())
    }

    async fn resume(&self, vm: &VmRef) -> Result<()> {
        let mut pool = self.enter("resume", vm.as_str())?;
        pool.vm_mut(vm)?.power = PowerState::Running;
        Ok(())
    }

    async fn clean_shutdown(&self, vm: &VmRef) -> Result<()> {
        let mut pool = self.enter("clean_shutdown", vm.as_str())?;
        if pool.halt_on_clean_shutdown {
            pool.vm_mut(vm)?.power = PowerState::Halted;
        }
        Ok(())
    }

    async fn hard_shutdown(&self, vm: &VmRef) -> Result<()> {
        let mut pool = self.enter("hard_shutdown", vm.as_str())?;
        pool.vm_mut(vm)?.power = PowerState::Halted;
        Ok(())
    }
}

#[async_trait]
impl VmProvisioning for FakeHypervisor {
    async fn snapshot(&self, vm: &VmRef, name: &str) -> Result<VmRef> {
        let mut pool = self.enter("snapshot", name)?;
        pool.copy_vm(vm, name, None, true)
    }

    async fn clone_vm(&self, vm: &VmRef, name: &str) -> Result<VmRef> {
        let mut pool = self.enter("clone_vm", name)?;
        let template = pool.vm(vm)?.is_template;
        pool.copy_vm(vm, name, None, template)
    }

    async fn copy_vm(&self, vm: &VmRef, name: &str, sr: &SrRef) -> Result<VmRef> {
        let mut pool = self.enter("copy_vm", name)?;
        let template = pool.vm(vm)?.is_template;
        pool.copy_vm(vm, name, Some(sr), template)
    }

    async fn set_is_a_template(&self, vm: &VmRef, value: bool) -> Result<()> {
        let mut pool = self.enter("set_is_a_template", &value.to_string())?;
        pool.vm_mut(vm)?.is_template = value;
        Ok(())
    }

    async fn set_description(&self, vm: &VmRef, description: &str) -> Result<()> {
        let mut pool = self.enter("set_description", description)?;
        pool.vm_mut(vm)?.description = description.to_string();
        Ok(())
    }

    async fn set_memory(&self, vm: &VmRef, bytes: u64) -> Result<()> {
        let mut pool = self.enter("set_memory", &bytes.to_string())?;
        pool.vm_mut(vm)?.memory_bytes = bytes;
        Ok(())
    }

    async fn set_vcpus(&self, vm: &VmRef, count: u32) -> Result<()> {
        let mut pool = self.enter("set_vcpus", &count.to_string())?;
        pool.vm_mut(vm)?.vcpus = count;
        Ok(())
    }

    async fn destroy_vm(&self, vm: &VmRef) -> Result<()> {
        let mut pool = self.enter("destroy_vm", vm.as_str())?;
        pool.vms
            .remove(vm.as_str())
            .map(|_| ())
            .ok_or_else(|| anyhow::anyhow!("no such VM {vm}"))
    }
}

#[async_trait]
impl NetworkOps for FakeHypervisor {
    async fn vm_vifs(&self, vm: &VmRef) -> Result<Vec<Vif>> {
        let pool = self.enter("vm_vifs", vm.as_str())?;
        Ok(pool.vm(vm)?.vifs.clone())
    }

    async fn destroy_vif(&self, vif: &VifRef) -> Result<()> {
        let mut pool = self.enter("destroy_vif", vif.as_str())?;
        for vm in pool.vms.values_mut() {
            vm.vifs.retain(|v| v.reference != *vif);
        }
        Ok(())
    }

    async fn connect_network(&self, vm: &VmRef, network: &NetworkRef, device: u32) -> Result<VifRef> {
        let mut pool = self.enter("connect_network", &format!("{device} {network}"))?;
        let reference = VifRef::new(pool.id("OpaqueRef:vif"));
        let entry = pool.vm_mut(vm)?;
        anyhow::ensure!(
            !entry.vifs.iter().any(|v| v.device == device),
            "device {device} already in use"
        );
        entry.vifs.push(Vif {
            reference: reference.clone(),
            device,
            network: network.clone(),
        });
        Ok(reference)
    }

    async fn create_network(&self, name: &str, _description: &str) -> Result<NetworkRef> {
        let mut pool = self.enter("create_network", name)?;
        let reference = NetworkRef::new(pool.id("OpaqueRef:net"));
        pool.networks.push((reference.clone(), name.to_string()));
        Ok(reference)
    }

    async fn destroy_network(&self, network: &NetworkRef) -> Result<()> {
        let mut pool = self.enter("destroy_network", network.as_str())?;
        pool.networks.retain(|(r, _)| r != network);
        Ok(())
    }

    async fn networks_by_name(&self, name: &str) -> Result<Vec<NetworkRef>> {
        let pool = self.enter("networks_by_name", name)?;
        Ok(pool
            .networks
            .iter()
            .filter(|(_, n)| n == name)
            .map(|(r, _)| r.clone())
            .collect())
    }

    async fn management_network(&self) -> Result<NetworkRef> {
        let _pool = self.enter("management_network", "")?;
        Ok(NetworkRef::new("OpaqueRef:net-mgmt"))
    }
}

#[async_trait]
impl StorageOps for FakeHypervisor {
    async fn srs_by_name(&self, name: &str) -> Result<Vec<SrRef>> {
        let pool = self.enter("srs_by_name", name)?;
        Ok(pool
            .srs
            .iter()
            .filter(|(_, n, _)| n == name)
            .map(|(r, _, _)| r.clone())
            .collect())
    }

    async fn default_sr(&self) -> Result<SrRef> {
        let _pool = self.enter("default_sr", "")?;
        Ok(SrRef::new("OpaqueRef:sr-default"))
    }

    async fn sr_uuid(&self, sr: &SrRef) -> Result<String> {
        let pool = self.enter("sr_uuid", sr.as_str())?;
        pool.srs
            .iter()
            .find(|(r, _, _)| r == sr)
            .map(|(_, _, uuid)| uuid.clone())
            .ok_or_else(|| anyhow::anyhow!("no such SR {sr}"))
    }

    async fn vdis_by_name(&self, name: &str) -> Result<Vec<VdiRef>> {
        let mut pool = self.enter("vdis_by_name", name)?;
        if let Some((pending, remaining)) = pool.iso_after_lookups.take() {
            if pending != name {
                pool.iso_after_lookups = Some((pending, remaining));
            } else if remaining == 0 {
                let reference = pool.id("OpaqueRef:vdi");
                let uuid = pool.id("vdi-uuid");
                pool.vdis.insert(
                    reference,
                    FakeVdi {
                        name: pending,
                        uuid,
                        sr: SrRef::new("OpaqueRef:sr-iso"),
                        size: 1,
                    },
                );
            } else {
                pool.iso_after_lookups = Some((pending, remaining - 1));
            }
        }
        Ok(pool
            .vdis
            .iter()
            .filter(|(_, vdi)| vdi.name == name)
            .map(|(r, _)| VdiRef::new(r.clone()))
            .collect())
    }

    async fn vdi_uuid(&self, vdi: &VdiRef) -> Result<String> {
        let pool = self.enter("vdi_uuid", vdi.as_str())?;
        Ok(pool.vdi(vdi)?.uuid.clone())
    }

    async fn vdi_sr(&self, vdi: &VdiRef) -> Result<SrRef> {
        let pool = self.enter("vdi_sr", vdi.as_str())?;
        Ok(pool.vdi(vdi)?.sr.clone())
    }

    async fn vdi_virtual_size(&self, vdi: &VdiRef) -> Result<u64> {
        let pool = self.enter("vdi_virtual_size", vdi.as_str())?;
        Ok(pool.vdi(vdi)?.size)
    }

    async fn create_vdi(&self, sr: &SrRef, name: &str, size_bytes: u64) -> Result<VdiRef> {
        let mut pool = self.enter("create_vdi", name)?;
        let reference = pool.id("OpaqueRef:vdi");
        let uuid = pool.id("vdi-uuid");
        pool.vdis.insert(
            reference.clone(),
            FakeVdi {
                name: name.to_string(),
                uuid,
                sr: sr.clone(),
                size: size_bytes,
            },
        );
        Ok(VdiRef::new(reference))
    }

    async fn destroy_vdi(&self, vdi: &VdiRef) -> Result<()> {
        let mut pool = self.enter("destroy_vdi", vdi.as_str())?;
        pool.vdis
            .remove(vdi.as_str())
            .map(|_| ())
            .ok_or_else(|| anyhow::anyhow!("no such VDI {vdi}"))
    }

    async fn attach_vdi(&self, vm: &VmRef, vdi: &VdiRef, kind: VbdKind) -> Result<()> {
        let mut pool = self.enter("attach_vdi", &format!("{vdi} {kind:?}"))?;
        let entry = pool.vm_mut(vm)?;
        match kind {
            VbdKind::Disk => entry.disks.push(vdi.clone()),
            VbdKind::Cd => entry.cds.push(vdi.clone()),
        }
        Ok(())
    }

    async fn detach_vdi(&self, vm: &VmRef, vdi: &VdiRef) -> Result<()> {
        let mut pool = self.enter("detach_vdi", vdi.as_str())?;
        let entry = pool.vm_mut(vm)?;
        entry.disks.retain(|d| d != vdi);
        entry.cds.retain(|d| d != vdi);
        Ok(())
    }
}

#[async_trait]
impl DiskExport for FakeHypervisor {
    async fn product_version(&self) -> Result<ProductVersion> {
        let pool = self.enter("product_version", "")?;
        pool.version
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no version"))
    }

    async fn export_endpoint(&self) -> Result<ExportEndpoint> {
        let _pool = self.enter("export_endpoint", "")?;
        Ok(ExportEndpoint {
            base_url: "https://xs1".to_string(),
            session_id: "OpaqueRef:session".to_string(),
            username: "root".to_string(),
            password: "secret".to_string(),
        })
    }

    async fn expose_vdi(&self, vdi: &VdiRef, format: &str) -> Result<ExposedDisk> {
        let mut pool = self.enter("expose_vdi", &format!("{vdi} {format}"))?;
        let handle = pool.id("record");
        pool.exposed.push(handle.clone());
        Ok(ExposedDisk {
            url: format!("http://10.0.0.2/{handle}.{format}"),
            handle,
        })
    }

    async fn unexpose_vdi(&self, handle: &str) -> Result<()> {
        let mut pool = self.enter("unexpose_vdi", handle)?;
        pool.exposed.retain(|h| h != handle);
        Ok(())
    }
}

// ── Remote shell ──────────────────────────────────────────────────────────────

/// Records `(target host, command)` for every command run through any shell
/// it hands out.
#[derive(Clone, Default)]
pub struct RecordingShells {
    log: Arc<Mutex<Vec<(String, String)>>>,
    fail_containing: Arc<Mutex<Option<String>>>,
}

impl RecordingShells {
    pub fn commands(&self) -> Vec<String> {
        self.log.lock().unwrap().iter().map(|(_, c)| c.clone()).collect()
    }

    pub fn hosts(&self) -> Vec<String> {
        self.log.lock().unwrap().iter().map(|(h, _)| h.clone()).collect()
    }

    /// Fail any command containing `pattern`.
    pub fn fail_on(&self, pattern: &str) {
        *self.fail_containing.lock().unwrap() = Some(pattern.to_string());
    }
}

struct RecordingShell {
    target: SshTarget,
    shells: RecordingShells,
}

#[async_trait]
impl RemoteShell for RecordingShell {
    async fn run_command(&self, command: &str) -> Result<String> {
        self.shells
            .log
            .lock()
            .unwrap()
            .push((format!("{}:{}", self.target.host, self.target.port), command.to_string()));
        if let Some(pattern) = self.shells.fail_containing.lock().unwrap().as_deref() {
            if command.contains(pattern) {
                anyhow::bail!("command failed: {command}");
            }
        }
        Ok(format!("ran {command}"))
    }

    async fn run_commands(&self, commands: &[String]) -> Result<String> {
        let mut out = Vec::new();
        for command in commands {
            out.push(self.run_command(command).await?);
        }
        Ok(out.join("\n"))
    }

    async fn upload_file(&self, local: &Path, remote: &str, _executable: bool) -> Result<()> {
        self.run_command(&format!("upload {} {remote}", local.display()))
            .await
            .map(|_| ())
    }
}

impl ShellConnector for RecordingShells {
    fn connect(&self, target: &SshTarget) -> Box<dyn RemoteShell> {
        Box::new(RecordingShell {
            target: target.clone(),
            shells: self.clone(),
        })
    }
}

// ── Tunnel dialer ─────────────────────────────────────────────────────────────

/// Refuses every dial; unit tests never open real connections.
pub struct RefusingDialer;

#[async_trait]
impl TunnelDialer for RefusingDialer {
    async fn dial(&self, _: &SshTarget, _: &str, _: u16) -> Result<BoxedStream> {
        anyhow::bail!("dialing not expected in this test")
    }
}

// ── Downloader ────────────────────────────────────────────────────────────────

/// Writes a fixed body to every destination and records the requests.
#[derive(Default)]
pub struct RecordingDownloader {
    requests: Mutex<Vec<(DownloadRequest, PathBuf)>>,
    fail: Mutex<bool>,
}

impl RecordingDownloader {
    pub const BODY: &'static [u8] = b"disk image bytes";

    pub fn requests(&self) -> Vec<(DownloadRequest, PathBuf)> {
        self.requests.lock().unwrap().clone()
    }

    pub fn fail(&self) {
        *self.fail.lock().unwrap() = true;
    }
}

#[async_trait]
impl Downloader for RecordingDownloader {
    async fn download(
        &self,
        request: &DownloadRequest,
        dest: &Path,
        progress: &(dyn Fn(u8) + Send + Sync),
    ) -> Result<u64> {
        self.requests
            .lock()
            .unwrap()
            .push((request.clone(), dest.to_path_buf()));
        if *self.fail.lock().unwrap() {
            anyhow::bail!("connection reset");
        }
        tokio::fs::write(dest, Self::BODY).await?;
        progress(100);
        Ok(Self::BODY.len() as u64)
    }
}

// ── Mounts ────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingMounts {
    log: Mutex<Vec<String>>,
}

impl RecordingMounts {
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl MountManager for RecordingMounts {
    async fn mount(&self, source: &str, target: &Path) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("mount {source} {}", target.display()));
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("umount {}", target.display()));
        Ok(())
    }
}

// ── Reporter ──────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingReporter {
    lines: Mutex<Vec<String>>,
}

impl RecordingReporter {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|l| l.contains(needle))
    }

    fn push(&self, kind: &str, message: &str) {
        self.lines.lock().unwrap().push(format!("{kind}: {message}"));
    }
}

impl ProgressReporter for RecordingReporter {
    fn say(&self, message: &str) {
        self.push("say", message);
    }
    fn message(&self, message: &str) {
        self.push("message", message);
    }
    fn success(&self, message: &str) {
        self.push("success", message);
    }
    fn warn(&self, message: &str) {
        self.push("warn", message);
    }
    fn error(&self, message: &str) {
        self.push("error", message);
    }
}

// ── Command runner ────────────────────────────────────────────────────────────

/// Returns canned outputs in order and records every invocation.
#[derive(Default)]
pub struct RecordingRunner {
    outputs: Mutex<Vec<Output>>,
    calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl RecordingRunner {
    pub fn new(outputs: Vec<Output>) -> Self {
        Self {
            outputs: Mutex::new(outputs),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }
}

impl CommandRunner for RecordingRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<Output> {
        self.run_with_timeout(program, args, Duration::from_secs(1)).await
    }

    async fn run_with_timeout(&self, program: &str, args: &[&str], _timeout: Duration) -> Result<Output> {
        self.calls.lock().unwrap().push((
            program.to_string(),
            args.iter().map(ToString::to_string).collect(),
        ));
        let mut outputs = self.outputs.lock().unwrap();
        if outputs.is_empty() {
            anyhow::bail!("no canned output left for {program}");
        }
        Ok(outputs.remove(0))
    }

    fn spawn(&self, program: &str, _args: &[&str]) -> Result<tokio::process::Child> {
        anyhow::bail!("spawn of {program} not expected in this test")
    }
}

// ── Local filesystem ──────────────────────────────────────────────────────────

/// Answers from an in-memory file table.
#[derive(Default)]
pub struct MemFs {
    pub files: Mutex<BTreeMap<PathBuf, String>>,
    pub dirs: Mutex<HashSet<PathBuf>>,
}

impl LocalFs for MemFs {
    fn exists(&self, path: &Path) -> bool {
        self.dirs.lock().unwrap().contains(path) || self.files.lock().unwrap().contains_key(path)
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .map(|c| c.len() as u64)
            .ok_or_else(|| anyhow::anyhow!("{} not found", path.display()))
    }

    fn write(&self, path: &Path, content: String) -> Result<()> {
        self.files.lock().unwrap().insert(path.to_path_buf(), content);
        Ok(())
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        self.dirs.lock().unwrap().remove(path);
        self.files.lock().unwrap().retain(|p, _| !p.starts_with(path));
        Ok(())
    }
}

impl FileHasher for MemFs {
    fn sha256_file(&self, path: &Path) -> Result<String> {
        let files = self.files.lock().unwrap();
        let content = files
            .get(path)
            .ok_or_else(|| anyhow::anyhow!("{} not found", path.display()))?;
        Ok(format!("hash-of-{}", content.len()))
    }
}

// ── Build context harness ─────────────────────────────────────────────────────

/// Every fake a build talks to, plus a scratch output directory.
pub struct Harness {
    pub hv: FakeHypervisor,
    pub shells: RecordingShells,
    pub downloader: Arc<RecordingDownloader>,
    pub mounts: Arc<RecordingMounts>,
    pub reporter: Arc<RecordingReporter>,
    pub cancel: CancellationToken,
    pub dir: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            hv: FakeHypervisor::new(),
            shells: RecordingShells::default(),
            downloader: Arc::new(RecordingDownloader::default()),
            mounts: Arc::new(RecordingMounts::default()),
            reporter: Arc::new(RecordingReporter::default()),
            cancel: CancellationToken::new(),
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    pub fn output_dir(&self) -> PathBuf {
        self.dir.path().join("out")
    }

    pub fn services(&self) -> BuildServices {
        BuildServices {
            hypervisor: Arc::new(self.hv.clone()),
            shells: Arc::new(self.shells.clone()),
            dialer: Arc::new(RefusingDialer),
            downloader: self.downloader.clone(),
            mounts: self.mounts.clone(),
            reporter: self.reporter.clone(),
        }
    }

    /// Parse and validate a template, pointing its output at the scratch dir.
    pub fn config(&self, yaml: &str) -> BuildConfig {
        let yaml = format!(
            "{yaml}\noutput_directory: {}\n",
            self.output_dir().display()
        );
        let template: Template = serde_yaml::from_str(&yaml).expect("template parses");
        template.prepare(None).expect("template is valid")
    }

    pub fn context(&self, yaml: &str) -> BuildContext {
        BuildContext::new(self.config(yaml), self.services(), self.cancel.clone())
    }
}

pub const VM_TEMPLATE: &str = "type: xenserver-vm
remote_host: xs1
remote_password: secret
vm_name: web
source_vm: base
boot_timeout: 10m
shutdown_timeout: 10m";

pub const ISO_TEMPLATE: &str = "type: xenserver-iso
remote_host: xs1
remote_password: secret
vm_name: fresh
iso_name: debian.iso
vm_memory: 2048
vm_vcpus: 2";
