//! XenAPI client over JSON-RPC 2.0.
//!
//! One session per client: [`XenApiClient::login`] opens it with
//! `session.login_with_password`, [`XenApiClient::logout`] releases it. Every
//! hypervisor port is implemented on top of [`XenApiClient::call`], which
//! prepends the session reference to the parameters.

use std::collections::HashMap;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value, json};
use thiserror::Error;
use xenpack_common::{PowerState, ProductVersion};

use crate::application::ports::{
    DiskExport, ExportEndpoint, ExposedDisk, NetworkOps, StorageOps, VmInventory, VmPower,
    VmProvisioning,
};
use crate::domain::{NetworkRef, SrRef, VbdKind, VdiRef, Vif, VifRef, VmRef};

const NULL_REF: &str = "OpaqueRef:NULL";
const TRANSFER_PLUGIN: &str = "transfer";
const INTERNAL_MANAGEMENT_KEY: &str = "is_host_internal_management_network";

static URL_FULL: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r#"url_full="([^"]*)""#));

/// Errors reported by the XenAPI endpoint itself.
#[derive(Debug, Error)]
pub enum XapiError {
    #[error("{method} failed: {code} {message} {data}")]
    Rpc {
        method: String,
        code: i64,
        message: String,
        data: Value,
    },

    #[error("{method} returned no result")]
    EmptyResponse { method: String },

    #[error("unexpected value for {what}: {value}")]
    UnexpectedValue { what: String, value: Value },
}

fn unexpected(what: &str, value: &Value) -> XapiError {
    XapiError::UnexpectedValue {
        what: what.to_string(),
        value: value.clone(),
    }
}

// ── Value helpers ────────────────────────────────────────────────────────────

fn as_string(value: &Value, what: &str) -> Result<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| unexpected(what, value).into())
}

fn as_strings(value: &Value, what: &str) -> Result<Vec<String>> {
    value
        .as_array()
        .ok_or_else(|| unexpected(what, value))?
        .iter()
        .map(|v| as_string(v, what))
        .collect()
}

/// XenAPI integers arrive as JSON numbers or, from some hosts, as strings.
fn as_i64(value: &Value, what: &str) -> Result<i64> {
    match value {
        Value::Number(n) => n.as_i64().ok_or_else(|| unexpected(what, value).into()),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| unexpected(what, value).into()),
        _ => Err(unexpected(what, value).into()),
    }
}

fn as_u64(value: &Value, what: &str) -> Result<u64> {
    let n = as_i64(value, what)?;
    u64::try_from(n).map_err(|_| unexpected(what, value).into())
}

fn as_string_map(value: &Value, what: &str) -> Result<HashMap<String, String>> {
    value
        .as_object()
        .ok_or_else(|| unexpected(what, value))?
        .iter()
        .map(|(k, v)| Ok((k.clone(), as_string(v, what)?)))
        .collect()
}

fn field<'a>(record: &'a Value, key: &str) -> Result<&'a Value> {
    record
        .get(key)
        .ok_or_else(|| anyhow::anyhow!("record has no field '{key}'"))
}

/// Extract the download URL from a transfer plugin record.
fn parse_url_full(record: &str) -> Result<String> {
    let re = URL_FULL
        .as_ref()
        .map_err(|e| anyhow::anyhow!("url_full pattern: {e}"))?;
    re.captures(record)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .with_context(|| format!("no url_full in transfer record: {record}"))
}

// ── Client ───────────────────────────────────────────────────────────────────

/// An authenticated XenAPI session.
pub struct XenApiClient {
    http: reqwest::Client,
    host: String,
    endpoint: String,
    username: String,
    password: String,
    session: String,
    next_id: AtomicU64,
}

impl XenApiClient {
    /// Log in to `host` (a hostname or address, optionally with `:port`).
    ///
    /// Pool certificates are usually self-signed, so they are not verified.
    ///
    /// # Errors
    ///
    /// Returns an error if the host is unreachable or rejects the credentials.
    pub async fn login(host: &str, username: &str, password: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .context("building HTTP client")?;
        let mut client = Self {
            http,
            host: host.to_string(),
            endpoint: format!("https://{host}/jsonrpc"),
            username: username.to_string(),
            password: password.to_string(),
            session: String::new(),
            next_id: AtomicU64::new(1),
        };
        let session = client
            .rpc(
                "session.login_with_password",
                vec![json!(username), json!(password), json!("1.0"), json!("xenpack")],
            )
            .await
            .with_context(|| format!("logging in to {host} as {username}"))?;
        client.session = as_string(&session, "session reference")?;
        tracing::debug!(host, "XenAPI session opened");
        Ok(client)
    }

    /// Release the session.
    ///
    /// # Errors
    ///
    /// Returns an error if the host rejects the logout.
    pub async fn logout(&self) -> Result<()> {
        self.rpc("session.logout", vec![json!(self.session)]).await?;
        tracing::debug!(host = %self.host, "XenAPI session closed");
        Ok(())
    }

    async fn rpc(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });
        tracing::trace!(method, id, "XenAPI call");
        let response: Value = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("sending {method}"))?
            .error_for_status()
            .with_context(|| format!("{method} HTTP status"))?
            .json()
            .await
            .with_context(|| format!("decoding {method} response"))?;

        if let Some(error) = response.get("error").filter(|e| !e.is_null()) {
            return Err(XapiError::Rpc {
                method: method.to_string(),
                code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                data: error.get("data").cloned().unwrap_or(Value::Null),
            }
            .into());
        }
        response.get("result").cloned().ok_or_else(|| {
            XapiError::EmptyResponse {
                method: method.to_string(),
            }
            .into()
        })
    }

    /// Call `method` with the session reference prepended to `params`.
    ///
    /// # Errors
    ///
    /// Returns the API error for a failed call.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        let mut all = Vec::with_capacity(params.len() + 1);
        all.push(json!(self.session));
        all.extend(params);
        self.rpc(method, all).await
    }

    async fn call_str(&self, method: &str, params: Vec<Value>) -> Result<String> {
        as_string(&self.call(method, params).await?, method)
    }

    async fn call_strs(&self, method: &str, params: Vec<Value>) -> Result<Vec<String>> {
        as_strings(&self.call(method, params).await?, method)
    }

    async fn call_unit(&self, method: &str, params: Vec<Value>) -> Result<()> {
        self.call(method, params).await.map(drop)
    }

    async fn master_host(&self) -> Result<String> {
        let pools = self.call_strs("pool.get_all", vec![]).await?;
        let pool = pools.first().context("no pool on this host")?;
        self.call_str("pool.get_master", vec![json!(pool)]).await
    }

    async fn call_transfer(&self, function: &str, args: Value) -> Result<String> {
        let host = self.master_host().await?;
        self.call_str(
            "host.call_plugin",
            vec![json!(host), json!(TRANSFER_PLUGIN), json!(function), args],
        )
        .await
    }

    async fn vbd_records(&self, vm: &VmRef) -> Result<Vec<(String, Value)>> {
        let mut records = Vec::new();
        for vbd in self.call_strs("VM.get_VBDs", vec![json!(vm.as_str())]).await? {
            let record = self.call("VBD.get_record", vec![json!(vbd)]).await?;
            records.push((vbd, record));
        }
        Ok(records)
    }
}

// ── Port implementations ────────────────────────────────────────────────────

#[async_trait]
impl VmInventory for XenApiClient {
    async fn vms_by_name(&self, name: &str) -> Result<Vec<VmRef>> {
        let refs = self.call_strs("VM.get_by_name_label", vec![json!(name)]).await?;
        Ok(refs.into_iter().map(VmRef::new).collect())
    }

    async fn vm_uuid(&self, vm: &VmRef) -> Result<String> {
        self.call_str("VM.get_uuid", vec![json!(vm.as_str())]).await
    }

    async fn vm_disks(&self, vm: &VmRef) -> Result<Vec<VdiRef>> {
        let mut disks = Vec::new();
        for (_, record) in self.vbd_records(vm).await? {
            if as_string(field(&record, "type")?, "VBD type")? != "Disk" {
                continue;
            }
            let device = as_string(field(&record, "userdevice")?, "VBD userdevice")?;
            let vdi = as_string(field(&record, "VDI")?, "VBD VDI")?;
            disks.push((device.parse::<u32>().unwrap_or(u32::MAX), VdiRef::new(vdi)));
        }
        disks.sort_by_key(|(device, _)| *device);
        Ok(disks.into_iter().map(|(_, vdi)| vdi).collect())
    }

    async fn hvm_boot_policy(&self, vm: &VmRef) -> Result<String> {
        self.call_str("VM.get_HVM_boot_policy", vec![json!(vm.as_str())])
            .await
    }

    async fn guest_ip(&self, vm: &VmRef, device: u32) -> Result<Option<String>> {
        let metrics = self
            .call_str("VM.get_guest_metrics", vec![json!(vm.as_str())])
            .await?;
        if metrics == NULL_REF {
            return Ok(None);
        }
        let networks = self
            .call("VM_guest_metrics.get_networks", vec![json!(metrics)])
            .await?;
        let networks = as_string_map(&networks, "guest networks")?;
        Ok(networks
            .get(&format!("{device}/ip"))
            .filter(|ip| !ip.is_empty())
            .cloned())
    }

    async fn resident_host_address(&self, vm: &VmRef) -> Result<String> {
        let host = self
            .call_str("VM.get_resident_on", vec![json!(vm.as_str())])
            .await?;
        anyhow::ensure!(host != NULL_REF, "VM is not resident on any host");
        self.call_str("host.get_address", vec![json!(host)]).await
    }

    async fn domid(&self, vm: &VmRef) -> Result<i64> {
        let value = self.call("VM.get_domid", vec![json!(vm.as_str())]).await?;
        as_i64(&value, "domid")
    }
}

#[async_trait]
impl VmPower for XenApiClient {
    async fn power_state(&self, vm: &VmRef) -> Result<PowerState> {
        let state = self
            .call_str("VM.get_power_state", vec![json!(vm.as_str())])
            .await?;
        Ok(state.parse()?)
    }

    async fn start(&self, vm: &VmRef, paused: bool) -> Result<()> {
        self.call_unit("VM.start", vec![json!(vm.as_str()), json!(paused), json!(false)])
            .await
    }

    async fn unpause(&self, vm: &VmRef) -> Result<()> {
        self.call_unit("VM.unpause", vec![json!(vm.as_str())]).await
    }

    async fn resume(&self, vm: &VmRef) -> Result<()> {
        self.call_unit("VM.resume", vec![json!(vm.as_str()), json!(false), json!(false)])
            .await
    }

    async fn clean_shutdown(&self, vm: &VmRef) -> Result<()> {
        self.call_unit("VM.clean_shutdown", vec![json!(vm.as_str())])
            .await
    }

    async fn hard_shutdown(&self, vm: &VmRef) -> Result<()> {
        self.call_unit("VM.hard_shutdown", vec![json!(vm.as_str())])
            .await
    }
}

#[async_trait]
impl VmProvisioning for XenApiClient {
    async fn snapshot(&self, vm: &VmRef, name: &str) -> Result<VmRef> {
        self.call_str("VM.snapshot", vec![json!(vm.as_str()), json!(name)])
            .await
            .map(VmRef::new)
    }

    async fn clone_vm(&self, vm: &VmRef, name: &str) -> Result<VmRef> {
        self.call_str("VM.clone", vec![json!(vm.as_str()), json!(name)])
            .await
            .map(VmRef::new)
    }

    async fn copy_vm(&self, vm: &VmRef, name: &str, sr: &SrRef) -> Result<VmRef> {
        self.call_str(
            "VM.copy",
            vec![json!(vm.as_str()), json!(name), json!(sr.as_str())],
        )
        .await
        .map(VmRef::new)
    }

    async fn set_is_a_template(&self, vm: &VmRef, value: bool) -> Result<()> {
        self.call_unit("VM.set_is_a_template", vec![json!(vm.as_str()), json!(value)])
            .await
    }

    async fn set_description(&self, vm: &VmRef, description: &str) -> Result<()> {
        self.call_unit(
            "VM.set_name_description",
            vec![json!(vm.as_str()), json!(description)],
        )
        .await
    }

    async fn set_memory(&self, vm: &VmRef, bytes: u64) -> Result<()> {
        let b = json!(bytes.to_string());
        self.call_unit(
            "VM.set_memory_limits",
            vec![json!(vm.as_str()), b.clone(), b.clone(), b.clone(), b],
        )
        .await
    }

    async fn set_vcpus(&self, vm: &VmRef, count: u32) -> Result<()> {
        let n = json!(count.to_string());
        self.call_unit("VM.set_VCPUs_max", vec![json!(vm.as_str()), n.clone()])
            .await?;
        self.call_unit("VM.set_VCPUs_at_startup", vec![json!(vm.as_str()), n])
            .await
    }

    async fn destroy_vm(&self, vm: &VmRef) -> Result<()> {
        self.call_unit("VM.destroy", vec![json!(vm.as_str())]).await
    }
}

#[async_trait]
impl NetworkOps for XenApiClient {
    async fn vm_vifs(&self, vm: &VmRef) -> Result<Vec<Vif>> {
        let mut vifs = Vec::new();
        for vif in self.call_strs("VM.get_VIFs", vec![json!(vm.as_str())]).await? {
            let record = self.call("VIF.get_record", vec![json!(vif)]).await?;
            let device = as_string(field(&record, "device")?, "VIF device")?;
            let device = device
                .parse()
                .map_err(|_| unexpected("VIF device", &record["device"]))?;
            let network = as_string(field(&record, "network")?, "VIF network")?;
            vifs.push(Vif {
                reference: VifRef::new(vif),
                device,
                network: NetworkRef::new(network),
            });
        }
        Ok(vifs)
    }

    async fn destroy_vif(&self, vif: &VifRef) -> Result<()> {
        if let Err(e) = self.call_unit("VIF.unplug", vec![json!(vif.as_str())]).await {
            tracing::debug!(vif = %vif, error = %format!("{e:#}"), "VIF unplug failed");
        }
        self.call_unit("VIF.destroy", vec![json!(vif.as_str())]).await
    }

    async fn connect_network(&self, vm: &VmRef, network: &NetworkRef, device: u32) -> Result<VifRef> {
        let record = json!({
            "device": device.to_string(),
            "network": network.as_str(),
            "VM": vm.as_str(),
            "MAC": "",
            "MTU": "1500",
            "other_config": {},
            "qos_algorithm_type": "",
            "qos_algorithm_params": {},
        });
        self.call_str("VIF.create", vec![record])
            .await
            .map(VifRef::new)
    }

    async fn create_network(&self, name: &str, description: &str) -> Result<NetworkRef> {
        let record = json!({
            "name_label": name,
            "name_description": description,
            "MTU": "1500",
            "other_config": {},
            "tags": [],
        });
        self.call_str("network.create", vec![record])
            .await
            .map(NetworkRef::new)
    }

    async fn destroy_network(&self, network: &NetworkRef) -> Result<()> {
        self.call_unit("network.destroy", vec![json!(network.as_str())])
            .await
    }

    async fn networks_by_name(&self, name: &str) -> Result<Vec<NetworkRef>> {
        let refs = self
            .call_strs("network.get_by_name_label", vec![json!(name)])
            .await?;
        Ok(refs.into_iter().map(NetworkRef::new).collect())
    }

    async fn management_network(&self) -> Result<NetworkRef> {
        let records = self.call("network.get_all_records", vec![]).await?;
        let records: &Map<String, Value> = records
            .as_object()
            .ok_or_else(|| unexpected("network records", &records))?;
        records
            .iter()
            .find(|(_, record)| {
                record
                    .get("other_config")
                    .and_then(|c| c.get(INTERNAL_MANAGEMENT_KEY))
                    .and_then(Value::as_str)
                    == Some("true")
            })
            .map(|(reference, _)| NetworkRef::new(reference.clone()))
            .context("no host internal management network")
    }
}

#[async_trait]
impl StorageOps for XenApiClient {
    async fn srs_by_name(&self, name: &str) -> Result<Vec<SrRef>> {
        let refs = self.call_strs("SR.get_by_name_label", vec![json!(name)]).await?;
        Ok(refs.into_iter().map(SrRef::new).collect())
    }

    async fn default_sr(&self) -> Result<SrRef> {
        let pools = self.call_strs("pool.get_all", vec![]).await?;
        let pool = pools.first().context("no pool on this host")?;
        let sr = self
            .call_str("pool.get_default_SR", vec![json!(pool)])
            .await?;
        anyhow::ensure!(sr != NULL_REF, "the pool has no default SR");
        Ok(SrRef::new(sr))
    }

    async fn sr_uuid(&self, sr: &SrRef) -> Result<String> {
        self.call_str("SR.get_uuid", vec![json!(sr.as_str())]).await
    }

    async fn vdis_by_name(&self, name: &str) -> Result<Vec<VdiRef>> {
        let refs = self
            .call_strs("VDI.get_by_name_label", vec![json!(name)])
            .await?;
        Ok(refs.into_iter().map(VdiRef::new).collect())
    }

    async fn vdi_uuid(&self, vdi: &VdiRef) -> Result<String> {
        self.call_str("VDI.get_uuid", vec![json!(vdi.as_str())]).await
    }

    async fn vdi_sr(&self, vdi: &VdiRef) -> Result<SrRef> {
        self.call_str("VDI.get_SR", vec![json!(vdi.as_str())])
            .await
            .map(SrRef::new)
    }

    async fn vdi_virtual_size(&self, vdi: &VdiRef) -> Result<u64> {
        let value = self
            .call("VDI.get_virtual_size", vec![json!(vdi.as_str())])
            .await?;
        as_u64(&value, "VDI virtual size")
    }

    async fn create_vdi(&self, sr: &SrRef, name: &str, size_bytes: u64) -> Result<VdiRef> {
        let record = json!({
            "name_label": name,
            "name_description": "",
            "SR": sr.as_str(),
            "virtual_size": size_bytes.to_string(),
            "type": "user",
            "sharable": false,
            "read_only": false,
            "other_config": {},
            "xenstore_data": {},
            "sm_config": {},
            "tags": [],
        });
        self.call_str("VDI.create", vec![record])
            .await
            .map(VdiRef::new)
    }

    async fn destroy_vdi(&self, vdi: &VdiRef) -> Result<()> {
        self.call_unit("VDI.destroy", vec![json!(vdi.as_str())]).await
    }

    async fn attach_vdi(&self, vm: &VmRef, vdi: &VdiRef, kind: VbdKind) -> Result<()> {
        let (vbd_type, mode, bootable) = match kind {
            VbdKind::Disk => ("Disk", "RW", false),
            VbdKind::Cd => ("CD", "RO", true),
        };
        let record = json!({
            "VM": vm.as_str(),
            "VDI": vdi.as_str(),
            "userdevice": "autodetect",
            "bootable": bootable,
            "mode": mode,
            "type": vbd_type,
            "unpluggable": false,
            "empty": false,
            "other_config": {},
            "qos_algorithm_type": "",
            "qos_algorithm_params": {},
        });
        self.call_unit("VBD.create", vec![record]).await
    }

    async fn detach_vdi(&self, vm: &VmRef, vdi: &VdiRef) -> Result<()> {
        let mut found = false;
        for (vbd, record) in self.vbd_records(vm).await? {
            if record.get("VDI").and_then(Value::as_str) != Some(vdi.as_str()) {
                continue;
            }
            found = true;
            if let Err(e) = self.call_unit("VBD.unplug", vec![json!(vbd)]).await {
                tracing::debug!(vbd = %vbd, error = %format!("{e:#}"), "VBD unplug failed");
            }
            self.call_unit("VBD.destroy", vec![json!(vbd)]).await?;
        }
        anyhow::ensure!(found, "disk {vdi} is not attached to the VM");
        Ok(())
    }
}

#[async_trait]
impl DiskExport for XenApiClient {
    async fn product_version(&self) -> Result<ProductVersion> {
        let host = self.master_host().await?;
        let software = self
            .call("host.get_software_version", vec![json!(host)])
            .await?;
        let software = as_string_map(&software, "software version")?;
        let version = software
            .get("product_version")
            .or_else(|| software.get("platform_version"))
            .context("host reports no product version")?;
        Ok(version.parse()?)
    }

    async fn export_endpoint(&self) -> Result<ExportEndpoint> {
        Ok(ExportEndpoint {
            base_url: format!("https://{}", self.host),
            session_id: self.session.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
        })
    }

    async fn expose_vdi(&self, vdi: &VdiRef, format: &str) -> Result<ExposedDisk> {
        let uuid = self.vdi_uuid(vdi).await?;
        let handle = self
            .call_transfer(
                "expose",
                json!({
                    "vdi_uuid": uuid,
                    "network_uuid": "management",
                    "read_only": "true",
                    "timeout_minutes": "5",
                    "transfer_mode": "http",
                    "vhd_blocks": "",
                    "vhd_uuid": "",
                    "use_ssl": "false",
                    "format": format,
                }),
            )
            .await
            .context("exposing disk through the transfer plugin")?;
        let record = self
            .call_transfer("get_record", json!({ "record_handle": handle }))
            .await?;
        let url = parse_url_full(&record)?;
        tracing::debug!(handle = %handle, url = %url, "disk exposed");
        Ok(ExposedDisk { handle, url })
    }

    async fn unexpose_vdi(&self, handle: &str) -> Result<()> {
        self.call_transfer("unexpose", json!({ "record_handle": handle }))
            .await
            .map(drop)
    }
}
