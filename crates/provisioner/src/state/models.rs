//! Persisted cluster topology.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ClusterError;
use crate::hypervisor::VmState;
use crate::pcie::PciAddress;

/// Version written into every state document.
pub const STATE_FILE_VERSION: &str = "2.0";

/// Cluster flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterKind {
    /// SLURM-style controller plus compute nodes.
    Hpc,
    /// Kubernetes-style control plane plus workers.
    Cloud,
}

impl std::fmt::Display for ClusterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hpc => write!(f, "hpc"),
            Self::Cloud => write!(f, "cloud"),
        }
    }
}

impl std::str::FromStr for ClusterKind {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hpc" => Ok(Self::Hpc),
            "cloud" => Ok(Self::Cloud),
            _ => Err(ClusterError::Configuration(format!(
                "unknown cluster kind: {s}. Supported: hpc, cloud"
            ))),
        }
    }
}

/// Role a VM plays in its cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VmRole {
    Controller,
    Compute,
    WorkerCpu,
    WorkerGpu,
}

impl std::fmt::Display for VmRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Controller => write!(f, "controller"),
            Self::Compute => write!(f, "compute"),
            Self::WorkerCpu => write!(f, "worker-cpu"),
            Self::WorkerGpu => write!(f, "worker-gpu"),
        }
    }
}

/// A GPU passed through to a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuAssignment {
    pub pci_address: PciAddress,
    #[serde(default)]
    pub vendor_id: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
}

/// One VM of a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRecord {
    pub name: String,
    /// Hypervisor identity; empty until the domain is defined.
    #[serde(default)]
    pub domain_handle: String,
    pub state: VmState,
    pub cpu_cores: u32,
    pub memory_gb: u32,
    pub volume_path: PathBuf,
    pub role: VmRole,
    #[serde(default)]
    pub ip_address: Option<Ipv4Addr>,
    #[serde(default)]
    pub assigned_gpus: Vec<GpuAssignment>,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl VmRecord {
    /// First passed-through GPU, if any.
    #[must_use]
    pub fn assigned_gpu(&self) -> Option<&GpuAssignment> {
        self.assigned_gpus.first()
    }
}

/// DNS integration of a cluster network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DnsMode {
    /// Network-local dnsmasq forwarding to public resolvers.
    #[default]
    Isolated,
    /// Host dnsmasq forwards the cluster domain to the network.
    #[serde(alias = "shared_dns")]
    SharedDns,
    /// Routed network, host resolver used directly.
    Routed,
    /// Cluster DNS delegated to a local service-discovery resolver.
    #[serde(alias = "service_discovery")]
    ServiceDiscovery,
}

impl std::fmt::Display for DnsMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Isolated => write!(f, "isolated"),
            Self::SharedDns => write!(f, "shared-dns"),
            Self::Routed => write!(f, "routed"),
            Self::ServiceDiscovery => write!(f, "service-discovery"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpRange {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

/// Fixed address reservation for one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticLease {
    pub ip: Ipv4Addr,
    pub mac: String,
}

/// Resolved network configuration of a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// CIDR, e.g. `192.168.100.0/24`.
    pub subnet: String,
    pub bridge_name: String,
    pub gateway_ip: Ipv4Addr,
    pub dhcp_range: DhcpRange,
    #[serde(default)]
    pub dns_mode: DnsMode,
    #[serde(default)]
    pub dns_servers: Vec<String>,
    /// VM name to reservation.
    #[serde(default)]
    pub static_leases: BTreeMap<String, StaticLease>,
}

/// Copy-on-write disk of one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub name: String,
    pub path: PathBuf,
    pub capacity_gb: u64,
    pub allocated_gb: u64,
    pub format: String,
    #[serde(default)]
    pub backing_image: Option<PathBuf>,
}

/// Per-cluster storage pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePoolRecord {
    pub name: String,
    pub path: PathBuf,
    /// Immutable base image volume inside the pool.
    pub base_image: PathBuf,
    #[serde(default)]
    pub volumes: Vec<VolumeRecord>,
}

/// Durable record of one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    pub cluster_name: String,
    pub cluster_type: ClusterKind,
    #[serde(default)]
    pub controller: Option<VmRecord>,
    #[serde(default)]
    pub compute_nodes: Vec<VmRecord>,
    #[serde(default)]
    pub worker_nodes: Vec<VmRecord>,
    #[serde(default)]
    pub network_config: Option<NetworkConfig>,
    #[serde(default)]
    pub storage_pool: Option<StoragePoolRecord>,
    #[serde(default)]
    pub config_file_path: Option<PathBuf>,
    pub state_file_version: String,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl ClusterState {
    /// Empty state for a new cluster.
    #[must_use]
    pub fn new(cluster_name: &str, cluster_type: ClusterKind) -> Self {
        let now = Utc::now();
        Self {
            cluster_name: cluster_name.to_string(),
            cluster_type,
            controller: None,
            compute_nodes: Vec::new(),
            worker_nodes: Vec::new(),
            network_config: None,
            storage_pool: None,
            config_file_path: None,
            state_file_version: STATE_FILE_VERSION.to_string(),
            created_at: now,
            last_modified: now,
        }
    }

    /// Every VM, controller first.
    #[must_use]
    pub fn all_vms(&self) -> Vec<&VmRecord> {
        self.controller
            .iter()
            .chain(&self.compute_nodes)
            .chain(&self.worker_nodes)
            .collect()
    }

    #[must_use]
    pub fn vm(&self, name: &str) -> Option<&VmRecord> {
        self.all_vms().into_iter().find(|vm| vm.name == name)
    }

    pub fn vm_mut(&mut self, name: &str) -> Option<&mut VmRecord> {
        self.controller
            .iter_mut()
            .chain(self.compute_nodes.iter_mut())
            .chain(self.worker_nodes.iter_mut())
            .find(|vm| vm.name == name)
    }

    /// Insert `vm` in the slot matching its role.
    ///
    /// # Errors
    /// Returns a resource conflict if a VM with that name already exists.
    pub fn add_vm(&mut self, vm: VmRecord) -> Result<(), ClusterError> {
        if self.vm(&vm.name).is_some() {
            return Err(ClusterError::ResourceConflict(format!(
                "VM '{}' already exists in cluster '{}'",
                vm.name, self.cluster_name
            )));
        }
        match vm.role {
            VmRole::Controller => self.controller = Some(vm),
            VmRole::Compute => self.compute_nodes.push(vm),
            VmRole::WorkerCpu | VmRole::WorkerGpu => self.worker_nodes.push(vm),
        }
        self.touch();
        Ok(())
    }

    /// Remove a VM by name.
    pub fn remove_vm(&mut self, name: &str) -> Option<VmRecord> {
        let removed = if self.controller.as_ref().is_some_and(|c| c.name == name) {
            self.controller.take()
        } else if let Some(pos) = self.compute_nodes.iter().position(|vm| vm.name == name) {
            Some(self.compute_nodes.remove(pos))
        } else if let Some(pos) = self.worker_nodes.iter().position(|vm| vm.name == name) {
            Some(self.worker_nodes.remove(pos))
        } else {
            None
        };
        if removed.is_some() {
            self.touch();
        }
        removed
    }

    pub(crate) fn touch(&mut self) {
        self.last_modified = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm(name: &str, role: VmRole) -> VmRecord {
        let now = Utc::now();
        VmRecord {
            name: name.to_string(),
            domain_handle: String::new(),
            state: VmState::Shutoff,
            cpu_cores: 4,
            memory_gb: 8,
            volume_path: PathBuf::from(format!("/pool/{name}.qcow2")),
            role,
            ip_address: None,
            assigned_gpus: vec![],
            created_at: now,
            last_modified: now,
        }
    }

    #[test]
    fn test_add_vm_places_by_role() {
        let mut state = ClusterState::new("k8s", ClusterKind::Cloud);
        state.add_vm(vm("k8s-control-plane", VmRole::Controller)).unwrap();
        state.add_vm(vm("k8s-cpu-worker-01", VmRole::WorkerCpu)).unwrap();
        state.add_vm(vm("k8s-gpu-worker-01", VmRole::WorkerGpu)).unwrap();
        assert!(state.controller.is_some());
        assert_eq!(state.worker_nodes.len(), 2);
        assert_eq!(state.all_vms().len(), 3);
        assert_eq!(state.all_vms()[0].name, "k8s-control-plane");
    }

    #[test]
    fn test_duplicate_vm_name_conflicts() {
        let mut state = ClusterState::new("hpc", ClusterKind::Hpc);
        state.add_vm(vm("hpc-compute-01", VmRole::Compute)).unwrap();
        let err = state.add_vm(vm("hpc-compute-01", VmRole::Compute)).unwrap_err();
        assert!(matches!(err, ClusterError::ResourceConflict(_)));
    }

    #[test]
    fn test_remove_vm() {
        let mut state = ClusterState::new("hpc", ClusterKind::Hpc);
        state.add_vm(vm("hpc-controller", VmRole::Controller)).unwrap();
        state.add_vm(vm("hpc-compute-01", VmRole::Compute)).unwrap();
        assert!(state.remove_vm("hpc-controller").is_some());
        assert!(state.controller.is_none());
        assert!(state.remove_vm("hpc-controller").is_none());
        assert_eq!(state.all_vms().len(), 1);
    }

    #[test]
    fn test_round_trip_preserves_everything() {
        let mut state = ClusterState::new("hpc", ClusterKind::Hpc);
        let mut gpu_node = vm("hpc-compute-02", VmRole::Compute);
        gpu_node.ip_address = Some(Ipv4Addr::new(192, 168, 100, 12));
        gpu_node.domain_handle = "6f1c0d9e-0000-4000-8000-000000000000".into();
        gpu_node.state = VmState::Running;
        gpu_node.assigned_gpus.push(GpuAssignment {
            pci_address: PciAddress::parse("0000:01:00.0").unwrap(),
            vendor_id: Some("10de".into()),
            device_id: Some("2684".into()),
        });
        state.add_vm(vm("hpc-controller", VmRole::Controller)).unwrap();
        state.add_vm(gpu_node).unwrap();
        state.network_config = Some(NetworkConfig {
            subnet: "192.168.100.0/24".into(),
            bridge_name: "br-hpc".into(),
            gateway_ip: Ipv4Addr::new(192, 168, 100, 1),
            dhcp_range: DhcpRange {
                start: Ipv4Addr::new(192, 168, 100, 10),
                end: Ipv4Addr::new(192, 168, 100, 254),
            },
            dns_mode: DnsMode::SharedDns,
            dns_servers: vec!["192.168.122.1".into()],
            static_leases: BTreeMap::from([(
                "hpc-controller".to_string(),
                StaticLease {
                    ip: Ipv4Addr::new(192, 168, 100, 10),
                    mac: "52:54:00:12:34:56".into(),
                },
            )]),
        });
        state.storage_pool = Some(StoragePoolRecord {
            name: "hpc-pool".into(),
            path: PathBuf::from("/var/lib/libvirt/images/hpc"),
            base_image: PathBuf::from("/var/lib/libvirt/images/hpc/hpc-base.qcow2"),
            volumes: vec![],
        });

        let json = serde_json::to_string_pretty(&state).unwrap();
        let back: ClusterState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
        assert!(json.contains("\"dns_mode\": \"shared-dns\""));
        assert!(json.contains("\"role\": \"compute\""));
    }

    #[test]
    fn test_dns_mode_accepts_snake_case() {
        let mode: DnsMode = serde_json::from_str("\"shared_dns\"").unwrap();
        assert_eq!(mode, DnsMode::SharedDns);
    }
}
