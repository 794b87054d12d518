//! Cluster-level start, stop, destroy and status.
//!
//! One [`ClusterOrchestrator`] serves both cluster kinds; the differences
//! live in the [`Topology`](crate::topology::Topology) chosen for the
//! config. Only `start` rolls back: every forward step that created
//! something pushes its compensating action, and a failure unwinds the
//! stack before the error is returned. `stop` and `destroy` are best effort
//! and report what they could not do in a [`TeardownReport`].

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ClusterConfig, Settings};
use crate::error::ClusterError;
use crate::gpu::GpuAllocator;
use crate::hypervisor::{DomainSpec, Hypervisor, VmState};
use crate::lifecycle::VmLifecycleManager;
use crate::network::{mac_address, network_name, HostDns, NetworkAllocator, NetworkRef};
use crate::pcie::{HostSystem, PciAddress, PcieValidator, SysfsHost};
use crate::rollback::{Compensator, RollbackAction, RollbackManager};
use crate::state::{
    ClusterKind, ClusterState, ClusterStateStore, NetworkConfig, StaticLease, VmRecord, VmRole,
    VolumeRecord,
};
use crate::topology::{self, ClusterTopology, NodePlan, PlannedDevice};
use crate::volume::VolumeAllocator;

/// Overall condition of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterPhase {
    /// No state recorded.
    NotConfigured,
    Running,
    Stopped,
    /// Some VMs running, some stopped or missing.
    Partial,
}

impl fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotConfigured => "not_configured",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Partial => "partial",
        };
        f.write_str(s)
    }
}

/// Live view of one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmStatus {
    pub name: String,
    pub role: VmRole,
    pub state: VmState,
    pub cpu_cores: u32,
    pub memory_gb: u32,
    pub ip_address: Option<Ipv4Addr>,
    pub gpus: Vec<PciAddress>,
}

/// Result of [`ClusterOrchestrator::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterStatus {
    pub cluster_name: String,
    pub status: ClusterPhase,
    pub cluster_type: Option<ClusterKind>,
    pub network: Option<String>,
    pub subnet: Option<String>,
    pub storage_pool: Option<String>,
    pub vms: Vec<VmStatus>,
    pub created_at: Option<DateTime<Utc>>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Outcome of a best-effort teardown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    /// VMs that were stopped or destroyed.
    pub vms: Vec<String>,
    pub released_gpus: Vec<PciAddress>,
    /// Steps that failed; the teardown carried on past each of them.
    pub warnings: Vec<String>,
}

impl TeardownReport {
    fn warn(&mut self, step: impl fmt::Display, error: &ClusterError) {
        warn!(step = %step, error = %error, "Teardown step failed, continuing");
        self.warnings.push(format!("{step}: {error}"));
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Sequences the allocators and the lifecycle manager into cluster
/// operations.
pub struct ClusterOrchestrator {
    hypervisor: Arc<dyn Hypervisor>,
    settings: Settings,
    gpus: GpuAllocator,
    network: NetworkAllocator,
    volumes: VolumeAllocator,
    vms: VmLifecycleManager,
    validator: PcieValidator,
}

impl ClusterOrchestrator {
    #[must_use]
    pub fn new(hypervisor: Arc<dyn Hypervisor>, settings: Settings) -> Self {
        let gpus = GpuAllocator::in_state_dir(&settings.state_dir)
            .with_max_backups(settings.max_state_backups);
        let network =
            NetworkAllocator::new(hypervisor.clone(), HostDns::new(&settings.dns_config_dir));
        let vms = VmLifecycleManager::new(hypervisor.clone())
            .with_gpu_allocator(gpus.clone())
            .with_poll_interval(settings.poll_interval);
        Self {
            volumes: VolumeAllocator::new(hypervisor.clone()),
            validator: PcieValidator::new(Arc::new(SysfsHost::default())),
            hypervisor,
            settings,
            gpus,
            network,
            vms,
        }
    }

    /// Use `host` for PCIe validation instead of the live `/sys` tree.
    #[must_use]
    pub fn with_host_system(mut self, host: Arc<dyn HostSystem>) -> Self {
        self.validator = PcieValidator::new(host);
        self
    }

    /// Replace the host DNS integration used by `shared-dns` clusters.
    #[must_use]
    pub fn with_dns(mut self, dns: HostDns) -> Self {
        self.network = NetworkAllocator::new(self.hypervisor.clone(), dns);
        self
    }

    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    #[must_use]
    pub fn gpu_allocator(&self) -> &GpuAllocator {
        &self.gpus
    }

    #[must_use]
    pub fn validator(&self) -> &PcieValidator {
        &self.validator
    }

    #[must_use]
    pub fn lifecycle(&self) -> &VmLifecycleManager {
        &self.vms
    }

    fn store(&self, cluster: &str) -> ClusterStateStore {
        ClusterStateStore::for_cluster(&self.settings.state_dir, cluster)
            .with_max_backups(self.settings.max_state_backups)
    }

    /// Bring a cluster up: network, storage pool, then each VM in order.
    ///
    /// Re-running `start` on a cluster that is already (partly) up adopts
    /// what exists and only creates what is missing.
    ///
    /// # Errors
    /// Returns [`ClusterError::Orchestration`] wrapping the first failure.
    /// Everything this call created has been removed by then; actions that
    /// could not be undone are listed in `rollback_warnings`.
    pub async fn start(
        &self,
        config: &ClusterConfig,
        kind: ClusterKind,
        config_path: Option<&Path>,
    ) -> Result<ClusterState, ClusterError> {
        let cluster = config.name.clone();
        info!(cluster = %cluster, kind = %kind, "Starting cluster");

        let plan = match self.prepare(config, kind).await {
            Ok(plan) => plan,
            Err(e) => return Err(ClusterError::orchestration("start", cluster, e, Vec::new())),
        };

        let mut store = self.store(&cluster);
        let mut rollback = RollbackManager::new();
        match self.provision(&plan, &mut store, &mut rollback, config_path).await {
            Ok(state) => {
                rollback.commit();
                info!(cluster = %cluster, vms = state.all_vms().len(), "Cluster started");
                Ok(state)
            }
            Err(e) => {
                warn!(cluster = %cluster, error = %e, "Cluster start failed");
                let (e, mut warnings) = e.take_cleanup_failures();
                warnings.extend(rollback.unwind_all(self).await);
                store.discard();
                Err(ClusterError::orchestration("start", cluster, e, warnings))
            }
        }
    }

    /// Checks that create nothing: config shape, hypervisor reachability,
    /// free space, passthrough readiness and GPU ownership.
    async fn prepare(
        &self,
        config: &ClusterConfig,
        kind: ClusterKind,
    ) -> Result<ClusterTopology, ClusterError> {
        config.validate(kind)?;
        let topology = topology::for_kind(kind);
        let plan = ClusterTopology::plan(config, topology.as_ref())?;

        self.hypervisor.connect().await?;
        let existing = self.vms.list(Some(plan.name_prefix().as_str())).await?;
        if !existing.is_empty() {
            info!(cluster = %plan.name, domains = ?existing, "Found existing VMs for cluster");
        }

        if self.settings.check_free_space {
            VolumeAllocator::validate_pool_space(&self.settings.pool_root, plan.total_disk_gb())?;
        }

        let addresses: Vec<String> = plan
            .passthrough_addresses()
            .iter()
            .map(ToString::to_string)
            .collect();
        if !addresses.is_empty() {
            info!(cluster = %plan.name, devices = addresses.len(), "Validating PCIe passthrough");
            self.validator.validate_devices(addresses.as_slice())?;
        }

        for node in &plan.nodes {
            let gpus = node.gpu_addresses();
            if gpus.is_empty() {
                continue;
            }
            let (ok, conflict) = self.gpus.validate_all(&gpus, &node.name)?;
            if !ok {
                return Err(ClusterError::ResourceConflict(conflict.unwrap_or_else(|| {
                    format!("GPUs requested by {} are not available", node.name)
                })));
            }
        }
        Ok(plan)
    }

    /// Network config for this run: the recorded one if the subnet is
    /// unchanged (keeping its leases), otherwise freshly resolved.
    fn network_config(
        plan: &ClusterTopology,
        recorded: Option<&NetworkConfig>,
    ) -> Result<NetworkConfig, ClusterError> {
        let resolved = NetworkAllocator::resolve_config(&plan.name, &plan.network)?;
        Ok(match recorded {
            Some(recorded) if recorded.subnet == resolved.subnet => NetworkConfig {
                static_leases: recorded.static_leases.clone(),
                ..resolved
            },
            _ => resolved,
        })
    }

    async fn provision(
        &self,
        plan: &ClusterTopology,
        store: &mut ClusterStateStore,
        rollback: &mut RollbackManager,
        config_path: Option<&Path>,
    ) -> Result<ClusterState, ClusterError> {
        let cluster = plan.name.as_str();
        let recorded_network = store.ensure(cluster, plan.kind)?.network_config.clone();

        let mut net_config = Self::network_config(plan, recorded_network.as_ref())?;
        self.network
            .register(cluster, &net_config, plan.static_ips())?;
        for node in &plan.nodes {
            let ip = self.network.allocate_ip(cluster, &node.name)?;
            rollback.push_action(RollbackAction::ReleaseIp {
                cluster: cluster.to_string(),
                vm: node.name.clone(),
            });
            net_config.static_leases.insert(
                node.name.clone(),
                StaticLease {
                    ip,
                    mac: mac_address(&node.name),
                },
            );
        }

        let network = self.network.create_network(cluster, &net_config).await?;
        if network.created {
            rollback.push_action(RollbackAction::DestroyNetwork {
                cluster: cluster.to_string(),
            });
        }

        let pool = self
            .volumes
            .create_pool(cluster, &self.settings.pool_root, &plan.base_image)
            .await?;
        if pool.created {
            rollback.push_action(RollbackAction::DestroyPool {
                cluster: cluster.to_string(),
            });
        }

        let mut pool_record = pool.record(&plan.base_image);
        for node in &plan.nodes {
            let ip = net_config.static_leases.get(&node.name).map(|l| l.ip);
            let (vm, volume) = self
                .provision_vm(cluster, node, &network, ip, rollback)
                .await?;
            pool_record.volumes.push(volume);
            let state = store.ensure(cluster, plan.kind)?;
            let previous = state.remove_vm(&vm.name);
            let vm = VmRecord {
                created_at: previous.map_or(vm.created_at, |p| p.created_at),
                ..vm
            };
            state.add_vm(vm)?;
        }

        store.set_network_config(net_config)?;
        store.set_storage_pool(pool_record)?;
        if let Some(path) = config_path {
            store.set_config_file_path(path)?;
        }
        store.save()?;
        store
            .state()
            .cloned()
            .ok_or_else(|| ClusterError::Configuration("cluster state vanished after save".into()))
    }

    async fn provision_vm(
        &self,
        cluster: &str,
        node: &NodePlan,
        network: &NetworkRef,
        ip: Option<Ipv4Addr>,
        rollback: &mut RollbackManager,
    ) -> Result<(VmRecord, VolumeRecord), ClusterError> {
        let (volume, created) = self
            .volumes
            .create_vm_volume(cluster, &node.name, u64::from(node.disk_gb), node.role)
            .await?;
        if created {
            rollback.push_action(RollbackAction::DestroyVolume {
                cluster: cluster.to_string(),
                vm: node.name.clone(),
            });
        }

        let gpus = node.gpu_addresses();
        for device in &node.devices {
            self.validator.validate_device(device.pci_address.as_str())?;
        }
        for pci in &gpus {
            let newly = self.gpus.owner(pci)?.is_none();
            if !self.gpus.allocate(pci, &node.name)? {
                let owner = self.gpus.owner(pci)?.unwrap_or_default();
                return Err(ClusterError::ResourceConflict(format!(
                    "GPU {pci} is currently allocated to '{owner}'"
                )));
            }
            if newly {
                rollback.push_action(RollbackAction::ReleaseGpu { pci: pci.clone() });
            }
        }

        let handle = if let Some(existing) = self.hypervisor.lookup_domain(&node.name).await? {
            info!(vm = %node.name, "Adopting existing VM");
            existing.handle
        } else {
            let spec = DomainSpec {
                name: node.name.clone(),
                uuid: Uuid::new_v4(),
                template: node.template,
                vcpus: node.cpu_cores,
                memory_gb: node.memory_gb,
                disk_path: volume.path.clone(),
                network: network.name.clone(),
                mac_address: mac_address(&node.name),
                hostdevs: node.devices.iter().map(|d| d.pci_address.clone()).collect(),
            };
            let handle = self.vms.create(&spec).await?;
            rollback.push_action(RollbackAction::DestroyVm {
                name: node.name.clone(),
            });
            handle
        };

        if node.auto_start {
            self.vms
                .start(&node.name, self.settings.wait_for_boot, self.settings.boot_timeout)
                .await?;
        } else {
            debug!(vm = %node.name, "auto_start disabled, leaving VM defined");
        }

        let now = Utc::now();
        let record = VmRecord {
            name: node.name.clone(),
            domain_handle: handle,
            state: self.vms.state(&node.name).await?,
            cpu_cores: node.cpu_cores,
            memory_gb: node.memory_gb,
            volume_path: volume.path.clone(),
            role: node.role,
            ip_address: ip,
            assigned_gpus: node
                .devices
                .iter()
                .filter(|d| d.is_gpu())
                .map(PlannedDevice::assignment)
                .collect(),
            created_at: now,
            last_modified: now,
        };
        info!(
            cluster = %cluster,
            vm = %record.name,
            role = %record.role,
            ip = ?record.ip_address,
            gpus = record.assigned_gpus.len(),
            state = %record.state,
            "VM provisioned"
        );
        Ok((record, volume))
    }

    /// Stop every VM of the cluster (graceful, then forced after the
    /// shutdown timeout) and release their GPUs. A cluster with no state is
    /// not an error.
    ///
    /// # Errors
    /// Returns an error only if the state document cannot be read.
    pub async fn stop(&self, cluster: &str) -> Result<TeardownReport, ClusterError> {
        let mut report = TeardownReport::default();
        let mut store = self.store(cluster);
        let Some(state) = store.load()? else {
            info!(cluster = %cluster, "No state recorded, nothing to stop");
            return Ok(report);
        };
        info!(cluster = %cluster, vms = state.all_vms().len(), "Stopping cluster");

        for vm in state.all_vms().iter().rev() {
            let name = vm.name.as_str();
            let new_state = match self
                .vms
                .stop_with_gpu_release(name, false, self.settings.shutdown_timeout)
                .await
            {
                Ok((_, released)) => {
                    report.released_gpus.extend(released);
                    report.vms.push(name.to_string());
                    VmState::Shutoff
                }
                Err(ClusterError::Hypervisor(e)) if e.is_not_found() => {
                    warn!(vm = %name, "VM is not defined, releasing its GPUs");
                    match self.gpus.release_owned_by(name) {
                        Ok(released) => report.released_gpus.extend(released),
                        Err(e) => report.warn(format!("release GPUs of {name}"), &ClusterError::from(e)),
                    }
                    VmState::Undefined
                }
                Err(e) => {
                    report.warn(format!("stop {name}"), &e);
                    continue;
                }
            };
            if let Err(e) = store.update_vm_state(name, new_state) {
                report.warn(format!("record state of {name}"), &e);
            }
        }

        if let Err(e) = store.save() {
            report.warn("save cluster state", &ClusterError::from(e));
        }
        info!(
            cluster = %cluster,
            stopped = report.vms.len(),
            released_gpus = report.released_gpus.len(),
            warnings = report.warnings.len(),
            "Cluster stopped"
        );
        Ok(report)
    }

    /// Remove every resource of the cluster. Without recorded state, VMs are
    /// found by the `<cluster>-` name prefix.
    ///
    /// With `retain_volumes` the disk images stay on the host; the pool
    /// definition is still removed.
    ///
    /// # Errors
    /// Returns an error only if the state document exists but cannot be
    /// read. Every other failure is a warning in the report.
    pub async fn destroy(
        &self,
        cluster: &str,
        retain_volumes: bool,
    ) -> Result<TeardownReport, ClusterError> {
        let mut report = TeardownReport::default();
        let mut store = self.store(cluster);

        let names: Vec<String> = if let Some(state) = store.load()? {
            state.all_vms().iter().map(|vm| vm.name.clone()).collect()
        } else {
            let prefix = format!("{cluster}-");
            warn!(cluster = %cluster, prefix = %prefix, "No state recorded, discovering VMs by name");
            match self.vms.list(Some(prefix.as_str())).await {
                Ok(names) => names,
                Err(e) => {
                    report.warn("list VMs", &e);
                    Vec::new()
                }
            }
        };
        info!(cluster = %cluster, vms = names.len(), retain_volumes, "Destroying cluster");

        for name in names.iter().rev() {
            match self.vms.stop(name, false, self.settings.shutdown_timeout).await {
                Ok(_) => {}
                Err(ClusterError::Hypervisor(e)) if e.is_not_found() => {}
                Err(e) => report.warn(format!("stop {name}"), &e),
            }
            match self.vms.destroy(name, false).await {
                Ok(_) => report.vms.push(name.clone()),
                Err(e) => report.warn(format!("destroy {name}"), &e),
            }
            match self.gpus.release_owned_by(name) {
                Ok(released) => report.released_gpus.extend(released),
                Err(e) => report.warn(format!("release GPUs of {name}"), &ClusterError::from(e)),
            }
            if !retain_volumes {
                if let Err(e) = self.volumes.destroy_vm_volume(cluster, name).await {
                    report.warn(format!("delete volume of {name}"), &e);
                }
            }
        }

        if let Err(e) = self.volumes.destroy_pool(cluster, !retain_volumes).await {
            report.warn("destroy storage pool", &e);
        }
        if let Err(e) = self.network.destroy_network(cluster).await {
            report.warn(format!("destroy network {}", network_name(cluster)), &e);
        }
        if let Err(e) = store.clear() {
            report.warn("clear cluster state", &ClusterError::from(e));
        }

        info!(
            cluster = %cluster,
            destroyed = report.vms.len(),
            warnings = report.warnings.len(),
            "Cluster destroyed"
        );
        Ok(report)
    }

    /// Recorded topology merged with live VM states.
    ///
    /// # Errors
    /// Returns an error if the state cannot be read or the hypervisor
    /// cannot be queried.
    pub async fn status(&self, cluster: &str) -> Result<ClusterStatus, ClusterError> {
        let mut store = self.store(cluster);
        let Some(state) = store.load()? else {
            return Ok(ClusterStatus {
                cluster_name: cluster.to_string(),
                status: ClusterPhase::NotConfigured,
                cluster_type: None,
                network: None,
                subnet: None,
                storage_pool: None,
                vms: Vec::new(),
                created_at: None,
                last_modified: None,
            });
        };

        let mut vms = Vec::new();
        for vm in state.all_vms() {
            vms.push(VmStatus {
                name: vm.name.clone(),
                role: vm.role,
                state: self.vms.state(&vm.name).await?,
                cpu_cores: vm.cpu_cores,
                memory_gb: vm.memory_gb,
                ip_address: vm.ip_address,
                gpus: vm
                    .assigned_gpus
                    .iter()
                    .map(|g| g.pci_address.clone())
                    .collect(),
            });
        }

        let running = vms.iter().filter(|v| v.state == VmState::Running).count();
        let status = if running == 0 {
            ClusterPhase::Stopped
        } else if running == vms.len() {
            ClusterPhase::Running
        } else {
            ClusterPhase::Partial
        };

        Ok(ClusterStatus {
            cluster_name: state.cluster_name.clone(),
            status,
            cluster_type: Some(state.cluster_type),
            network: state
                .network_config
                .as_ref()
                .map(|_| network_name(&state.cluster_name)),
            subnet: state.network_config.as_ref().map(|n| n.subnet.clone()),
            storage_pool: state.storage_pool.as_ref().map(|p| p.name.clone()),
            vms,
            created_at: Some(state.created_at),
            last_modified: Some(state.last_modified),
        })
    }

    /// Current GPU ownership across every cluster on the host.
    ///
    /// # Errors
    /// Returns an error if the shared record cannot be read.
    pub fn gpu_allocations(&self) -> Result<BTreeMap<PciAddress, String>, ClusterError> {
        Ok(self.gpus.allocations()?)
    }
}

#[async_trait]
impl Compensator for ClusterOrchestrator {
    async fn compensate(&self, action: &RollbackAction) -> Result<(), ClusterError> {
        match action {
            RollbackAction::DestroyNetwork { cluster } => {
                self.network.destroy_network(cluster).await?;
            }
            RollbackAction::DestroyPool { cluster } => {
                self.volumes.destroy_pool(cluster, true).await?;
            }
            RollbackAction::DestroyVolume { cluster, vm } => {
                self.volumes.destroy_vm_volume(cluster, vm).await?;
            }
            RollbackAction::ReleaseIp { cluster, vm } => {
                self.network.release_ip(cluster, vm);
            }
            RollbackAction::ReleaseGpu { pci } => {
                self.gpus.release(pci)?;
            }
            RollbackAction::DestroyVm { name } => {
                self.vms.destroy(name, false).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::config::{NetworkSettings, NodeConfig, PciePassthrough};
    use crate::hypervisor::MemoryHypervisor;
    use crate::state::DnsMode;

    fn node(cpu: u32, mem: u32) -> NodeConfig {
        NodeConfig {
            cpu_cores: cpu,
            memory_gb: mem,
            disk_gb: 20,
            ip_address: None,
            auto_start: true,
            pcie_passthrough: PciePassthrough::default(),
        }
    }

    fn setup(dir: &TempDir) -> (Arc<MemoryHypervisor>, ClusterOrchestrator, ClusterConfig) {
        let base = dir.path().join("base.qcow2");
        std::fs::write(&base, b"qcow").unwrap();
        let hv = Arc::new(MemoryHypervisor::new());
        let settings = Settings {
            state_dir: dir.path().join("state"),
            pool_root: dir.path().join("pools"),
            check_free_space: false,
            poll_interval: std::time::Duration::from_millis(5),
            shutdown_timeout: std::time::Duration::from_millis(50),
            ..Settings::default()
        };
        let orchestrator = ClusterOrchestrator::new(hv.clone(), settings).with_dns(
            HostDns::new(dir.path().join("dns"))
                .with_privilege_check(|| true)
                .with_restart_commands(vec![]),
        );
        let mut worker = node(2, 4);
        worker.auto_start = false;
        let config = ClusterConfig {
            name: "k8s".into(),
            base_image_path: base,
            network: NetworkSettings {
                subnet: "10.20.0.0/24".into(),
                bridge: None,
                gateway_ip: None,
                dhcp_start: None,
                dhcp_end: None,
                dns_mode: DnsMode::Isolated,
                dns_servers: vec![],
            },
            controller: node(4, 8),
            compute_nodes: vec![],
            worker_nodes: vec![node(4, 8), worker],
        };
        (hv, orchestrator, config)
    }

    #[tokio::test]
    async fn test_cloud_start_respects_auto_start() {
        let dir = TempDir::new().unwrap();
        let (hv, orchestrator, config) = setup(&dir);
        let state = orchestrator
            .start(&config, ClusterKind::Cloud, None)
            .await
            .unwrap();

        let names: Vec<_> = state.all_vms().iter().map(|v| v.name.clone()).collect();
        assert_eq!(
            names,
            ["k8s-control-plane", "k8s-cpu-worker-01", "k8s-cpu-worker-02"]
        );
        assert_eq!(
            hv.domain_state("k8s-cpu-worker-02").await.unwrap(),
            VmState::Shutoff
        );
        let status = orchestrator.status("k8s").await.unwrap();
        assert_eq!(status.status, ClusterPhase::Partial);
        assert_eq!(status.network.as_deref(), Some("k8s-network"));
    }

    #[tokio::test]
    async fn test_status_without_state() {
        let dir = TempDir::new().unwrap();
        let (_, orchestrator, _) = setup(&dir);
        let status = orchestrator.status("ghost").await.unwrap();
        assert_eq!(status.status, ClusterPhase::NotConfigured);
        assert_eq!(
            serde_json::to_value(&status).unwrap()["status"],
            "not_configured"
        );
    }

    #[tokio::test]
    async fn test_invalid_config_creates_nothing() {
        let dir = TempDir::new().unwrap();
        let (hv, orchestrator, mut config) = setup(&dir);
        config.network.subnet = "10.20.0.0".into();
        let err = orchestrator
            .start(&config, ClusterKind::Cloud, None)
            .await
            .unwrap_err();
        assert!(matches!(err.root_cause(), ClusterError::Configuration(_)));
        assert!(hv.list_networks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_without_state_is_noop() {
        let dir = TempDir::new().unwrap();
        let (_, orchestrator, _) = setup(&dir);
        let report = orchestrator.stop("ghost").await.unwrap();
        assert!(report.vms.is_empty());
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_stop_escalates_and_records_state() {
        let dir = TempDir::new().unwrap();
        let (hv, orchestrator, config) = setup(&dir);
        hv.ignore_graceful_shutdown("k8s-control-plane");
        orchestrator
            .start(&config, ClusterKind::Cloud, None)
            .await
            .unwrap();

        let report = orchestrator.stop("k8s").await.unwrap();
        assert!(report.is_clean());
        assert_eq!(report.vms.len(), 3);
        assert_eq!(
            hv.domain_state("k8s-control-plane").await.unwrap(),
            VmState::Shutoff
        );
        let status = orchestrator.status("k8s").await.unwrap();
        assert_eq!(status.status, ClusterPhase::Stopped);
    }
}
