//! `virsh` command adapter.

use std::io::Write as _;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::xml;
use crate::hypervisor::traits::{
    DomainInfo, DomainSpec, Hypervisor, HypervisorError, NetworkSpec, PoolInfo, PoolSpec,
    ResourceKind, VmState, VolumeInfo, VolumeSource, VolumeSpec,
};
use crate::retry::{with_retry_async, RetryConfig};

/// Default connection URI when neither an argument nor `LIBVIRT_DEFAULT_URI` is set.
pub const DEFAULT_URI: &str = "qemu:///system";

const BACKING_PATH_XPATH: &str = "/volume/backingStore/path/text()";
const POOL_PATH_XPATH: &str = "/pool/target/path/text()";

/// Hypervisor adapter driving libvirt through the `virsh` CLI.
pub struct Virsh {
    uri: String,
    retry: RetryConfig,
    connected: Mutex<bool>,
}

impl Virsh {
    /// Create an adapter for `uri`, falling back to `LIBVIRT_DEFAULT_URI`
    /// and then [`DEFAULT_URI`].
    #[must_use]
    pub fn new(uri: Option<&str>) -> Self {
        let uri = uri.map_or_else(
            || std::env::var("LIBVIRT_DEFAULT_URI").unwrap_or_else(|_| DEFAULT_URI.to_string()),
            ToString::to_string,
        );
        Self {
            uri,
            retry: RetryConfig::default(),
            connected: Mutex::new(false),
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    async fn ensure_connected(&self) -> Result<(), HypervisorError> {
        let mut connected = self.connected.lock().await;
        if *connected {
            return Ok(());
        }
        with_retry_async(&self.retry, "hypervisor connect", || self.probe()).await?;
        *connected = true;
        info!(uri = %self.uri, "Connected to hypervisor");
        Ok(())
    }

    async fn probe(&self) -> Result<(), HypervisorError> {
        let output = tokio::process::Command::new("virsh")
            .args(["-c", self.uri.as_str(), "uri"])
            .output()
            .await
            .map_err(|e| HypervisorError::Connection {
                uri: self.uri.clone(),
                message: format!("failed to execute virsh: {e}"),
            })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(HypervisorError::Connection {
                uri: self.uri.clone(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    /// Run one virsh command and return its stdout.
    async fn run(&self, operation: &str, target: &str, args: &[&str]) -> Result<String, HypervisorError> {
        self.ensure_connected().await?;

        debug!(uri = %self.uri, command = %args.join(" "), "Executing virsh command");

        let output = tokio::process::Command::new("virsh")
            .args(["-c", self.uri.as_str()])
            .args(args)
            .output()
            .await
            .map_err(|e| {
                HypervisorError::operation(operation, target, format!("failed to execute virsh: {e}"))
            })?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).to_string());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.contains("failed to connect to the hypervisor") {
            *self.connected.lock().await = false;
            return Err(HypervisorError::Connection {
                uri: self.uri.clone(),
                message: stderr,
            });
        }
        Err(HypervisorError::operation(operation, target, stderr))
    }

    /// Like [`Self::run`], mapping "no such object" failures to `NotFound`.
    async fn run_on(
        &self,
        kind: ResourceKind,
        operation: &str,
        target: &str,
        args: &[&str],
    ) -> Result<String, HypervisorError> {
        self.run(operation, target, args).await.map_err(|e| match e {
            HypervisorError::Operation { ref message, .. } if looks_missing(message) => {
                HypervisorError::not_found(kind, target)
            }
            other => other,
        })
    }

    /// Run a virsh subcommand that takes an XML file argument.
    async fn run_with_xml(
        &self,
        operation: &str,
        target: &str,
        args: &[&str],
        document: &str,
    ) -> Result<String, HypervisorError> {
        let mut file = tempfile::Builder::new()
            .prefix("provisioner-")
            .suffix(".xml")
            .tempfile()?;
        file.write_all(document.as_bytes())?;
        file.flush()?;
        let path = file.path().to_string_lossy().to_string();

        let mut full: Vec<&str> = args.to_vec();
        full.push(&path);
        self.run(operation, target, &full).await
    }

    async fn list_names(&self, operation: &str, args: &[&str]) -> Result<Vec<String>, HypervisorError> {
        let out = self.run(operation, "*", args).await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(ToString::to_string)
            .collect())
    }

    async fn volume_info(&self, pool: &str, name: &str) -> Result<Option<VolumeInfo>, HypervisorError> {
        let path = match self
            .run_on(ResourceKind::Volume, "vol-path", name, &["vol-path", "--pool", pool, name])
            .await
        {
            Ok(out) => PathBuf::from(out.trim()),
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        let info = self
            .run_on(
                ResourceKind::Volume,
                "vol-info",
                name,
                &["vol-info", "--pool", pool, name, "--bytes"],
            )
            .await?;
        let backing = self
            .run_on(
                ResourceKind::Volume,
                "vol-dumpxml",
                name,
                &["vol-dumpxml", "--pool", pool, name, "--xpath", BACKING_PATH_XPATH],
            )
            .await
            .map(|out| xpath_text(&out).map(PathBuf::from))?;
        Ok(Some(VolumeInfo {
            name: name.to_string(),
            path,
            capacity_bytes: parse_bytes_field(&info, "Capacity:"),
            allocation_bytes: parse_bytes_field(&info, "Allocation:"),
            backing,
        }))
    }
}

fn looks_missing(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("not found")
        || lower.contains("failed to get")
        || lower.contains("no domain with matching")
        || lower.contains("no network with matching")
        || lower.contains("no storage pool with matching")
        || lower.contains("no storage vol with matching")
}

/// First line of a `--xpath` text query. `None` when nothing matched.
fn xpath_text(output: &str) -> Option<&str> {
    output.lines().map(str::trim).find(|l| !l.is_empty())
}

/// Map `virsh domstate` output to a [`VmState`].
pub(crate) fn state_from_label(label: &str) -> VmState {
    match label.trim() {
        "no state" => VmState::Undefined,
        "running" => VmState::Running,
        "idle" | "blocked" => VmState::Blocked,
        "paused" => VmState::Paused,
        "in shutdown" => VmState::Shutdown,
        "shut off" => VmState::Shutoff,
        "crashed" => VmState::Crashed,
        "pmsuspended" => VmState::PmSuspended,
        _ => VmState::Error,
    }
}

/// Parse `"Capacity:       1073741824 bytes"` style lines from `vol-info --bytes`.
fn parse_bytes_field(output: &str, field: &str) -> u64 {
    output
        .lines()
        .find_map(|l| l.trim().strip_prefix(field))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

/// Rows of a virsh table, skipping the header and separator line.
fn table_rows(output: &str) -> impl Iterator<Item = Vec<&str>> {
    output
        .lines()
        .skip_while(|l| !l.trim_start().starts_with("---"))
        .skip(1)
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.split_whitespace().collect())
}

#[async_trait]
impl Hypervisor for Virsh {
    async fn connect(&self) -> Result<(), HypervisorError> {
        self.ensure_connected().await
    }

    async fn define_domain(&self, spec: &DomainSpec) -> Result<String, HypervisorError> {
        if self.lookup_domain(&spec.name).await?.is_some() {
            return Err(HypervisorError::AlreadyExists {
                kind: ResourceKind::Domain,
                name: spec.name.clone(),
            });
        }
        self.run_with_xml("define", &spec.name, &["define"], &xml::domain(spec)?)
            .await?;
        let uuid = self
            .run_on(ResourceKind::Domain, "domuuid", &spec.name, &["domuuid", spec.name.as_str()])
            .await?;
        Ok(uuid.trim().to_string())
    }

    async fn lookup_domain(&self, name: &str) -> Result<Option<DomainInfo>, HypervisorError> {
        let handle = match self
            .run_on(ResourceKind::Domain, "domuuid", name, &["domuuid", name])
            .await
        {
            Ok(out) => out.trim().to_string(),
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        let state = self.domain_state(name).await?;
        Ok(Some(DomainInfo {
            name: name.to_string(),
            handle,
            state,
        }))
    }

    async fn domain_state(&self, name: &str) -> Result<VmState, HypervisorError> {
        let out = self
            .run_on(ResourceKind::Domain, "domstate", name, &["domstate", name])
            .await?;
        Ok(state_from_label(&out))
    }

    async fn start_domain(&self, name: &str) -> Result<(), HypervisorError> {
        self.run_on(ResourceKind::Domain, "start", name, &["start", name])
            .await
            .map(|_| ())
    }

    async fn stop_domain(&self, name: &str, force: bool) -> Result<(), HypervisorError> {
        let verb = if force { "destroy" } else { "shutdown" };
        self.run_on(ResourceKind::Domain, verb, name, &[verb, name])
            .await
            .map(|_| ())
    }

    async fn destroy_domain_definition(&self, name: &str) -> Result<(), HypervisorError> {
        self.run_on(
            ResourceKind::Domain,
            "undefine",
            name,
            &["undefine", name, "--managed-save", "--snapshots-metadata", "--nvram"],
        )
        .await
        .map(|_| ())
    }

    async fn domain_disks(&self, name: &str) -> Result<Vec<PathBuf>, HypervisorError> {
        let out = self
            .run_on(
                ResourceKind::Domain,
                "domblklist",
                name,
                &["domblklist", name, "--details"],
            )
            .await?;
        Ok(table_rows(&out)
            .filter(|cols| cols.len() >= 4 && cols[0] == "file" && cols[1] == "disk")
            .map(|cols| PathBuf::from(cols[3]))
            .collect())
    }

    async fn list_domains(&self) -> Result<Vec<String>, HypervisorError> {
        self.list_names("list", &["list", "--all", "--name"]).await
    }

    async fn define_network(&self, spec: &NetworkSpec) -> Result<String, HypervisorError> {
        self.run_with_xml("net-define", &spec.name, &["net-define"], &xml::network(spec)?)
            .await?;
        let uuid = self
            .run_on(ResourceKind::Network, "net-uuid", &spec.name, &["net-uuid", spec.name.as_str()])
            .await?;
        Ok(uuid.trim().to_string())
    }

    async fn start_network(&self, name: &str) -> Result<(), HypervisorError> {
        self.run_on(ResourceKind::Network, "net-start", name, &["net-start", name])
            .await?;
        self.run_on(ResourceKind::Network, "net-autostart", name, &["net-autostart", name])
            .await
            .map(|_| ())
    }

    async fn stop_network(&self, name: &str) -> Result<(), HypervisorError> {
        match self
            .run_on(ResourceKind::Network, "net-destroy", name, &["net-destroy", name])
            .await
        {
            Ok(_) => Ok(()),
            Err(HypervisorError::Operation { message, .. }) if message.contains("not active") => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn undefine_network(&self, name: &str) -> Result<(), HypervisorError> {
        self.run_on(ResourceKind::Network, "net-undefine", name, &["net-undefine", name])
            .await
            .map(|_| ())
    }

    async fn list_networks(&self) -> Result<Vec<String>, HypervisorError> {
        self.list_names("net-list", &["net-list", "--all", "--name"])
            .await
    }

    async fn define_storage_pool(&self, spec: &PoolSpec) -> Result<String, HypervisorError> {
        let name = spec.name.as_str();
        self.run_with_xml("pool-define", name, &["pool-define"], &xml::pool(spec)?)
            .await?;
        self.run_on(ResourceKind::StoragePool, "pool-build", name, &["pool-build", name])
            .await?;
        self.run_on(ResourceKind::StoragePool, "pool-start", name, &["pool-start", name])
            .await?;
        self.run_on(
            ResourceKind::StoragePool,
            "pool-autostart",
            name,
            &["pool-autostart", name],
        )
        .await?;
        let uuid = self
            .run_on(ResourceKind::StoragePool, "pool-uuid", name, &["pool-uuid", name])
            .await?;
        Ok(uuid.trim().to_string())
    }

    async fn storage_pool(&self, name: &str) -> Result<Option<PoolInfo>, HypervisorError> {
        let path = match self
            .run_on(
                ResourceKind::StoragePool,
                "pool-dumpxml",
                name,
                &["pool-dumpxml", name, "--xpath", POOL_PATH_XPATH],
            )
            .await
        {
            Ok(out) => xpath_text(&out).map(PathBuf::from).unwrap_or_default(),
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(Some(PoolInfo {
            name: name.to_string(),
            path,
        }))
    }

    async fn list_storage_pools(&self) -> Result<Vec<String>, HypervisorError> {
        self.list_names("pool-list", &["pool-list", "--all", "--name"])
            .await
    }

    async fn destroy_storage_pool(&self, name: &str) -> Result<(), HypervisorError> {
        match self
            .run_on(ResourceKind::StoragePool, "pool-destroy", name, &["pool-destroy", name])
            .await
        {
            Ok(_) => {}
            Err(HypervisorError::Operation { message, .. }) if message.contains("not active") => {}
            Err(e) => return Err(e),
        }
        self.run_on(ResourceKind::StoragePool, "pool-undefine", name, &["pool-undefine", name])
            .await
            .map(|_| ())
    }

    async fn create_volume(
        &self,
        pool: &str,
        spec: &VolumeSpec,
    ) -> Result<VolumeInfo, HypervisorError> {
        let name = spec.name.as_str();
        match &spec.source {
            VolumeSource::CopyOf(source) => {
                let capacity = if spec.capacity_bytes == 0 {
                    tokio::fs::metadata(source).await?.len()
                } else {
                    spec.capacity_bytes
                };
                let capacity = capacity.to_string();
                let source = source.to_string_lossy();
                self.run_on(
                    ResourceKind::StoragePool,
                    "vol-create-as",
                    name,
                    &["vol-create-as", pool, name, capacity.as_str(), "--format", spec.format.as_str()],
                )
                .await?;
                self.run_on(
                    ResourceKind::Volume,
                    "vol-upload",
                    name,
                    &["vol-upload", "--pool", pool, name, source.as_ref()],
                )
                .await?;
            }
            VolumeSource::BackedBy(_) => {
                self.run_with_xml("vol-create", name, &["vol-create", pool], &xml::volume(spec)?)
                    .await?;
            }
        }
        self.volume_info(pool, name)
            .await?
            .ok_or_else(|| HypervisorError::not_found(ResourceKind::Volume, name))
    }

    async fn find_volume(
        &self,
        pool: &str,
        name: &str,
    ) -> Result<Option<VolumeInfo>, HypervisorError> {
        self.volume_info(pool, name).await
    }

    async fn list_volumes(&self, pool: &str) -> Result<Vec<VolumeInfo>, HypervisorError> {
        let out = self
            .run_on(ResourceKind::StoragePool, "vol-list", pool, &["vol-list", pool])
            .await?;
        let mut volumes = Vec::new();
        for cols in table_rows(&out) {
            if let Some(name) = cols.first() {
                if let Some(info) = self.volume_info(pool, name).await? {
                    volumes.push(info);
                }
            }
        }
        Ok(volumes)
    }

    async fn delete_volume(&self, pool: &str, name: &str) -> Result<(), HypervisorError> {
        self.run_on(
            ResourceKind::Volume,
            "vol-delete",
            name,
            &["vol-delete", "--pool", pool, name],
        )
        .await
        .map(|_| ())
    }
}
