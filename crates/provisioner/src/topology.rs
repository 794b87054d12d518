//! Role naming and template selection for HPC and Cloud clusters.
//!
//! A [`ClusterTopology`] is the ordered list of VMs a cluster config asks
//! for. The [`Topology`] implementation decides what each VM is called and
//! which domain template it gets.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::path::PathBuf;

use crate::config::{ClusterConfig, DeviceType, NetworkSettings, NodeConfig};
use crate::error::ClusterError;
use crate::hypervisor::DomainTemplate;
use crate::pcie::PciAddress;
use crate::state::{ClusterKind, GpuAssignment, VmRole};

/// Role-specific naming and template choice.
pub trait Topology: Send + Sync {
    fn kind(&self) -> ClusterKind;

    /// Role of a non-controller node.
    fn node_role(&self, node: &NodeConfig) -> VmRole;

    /// VM name for the `ordinal`-th (1-based) VM of `role`.
    fn vm_name(&self, cluster: &str, role: VmRole, ordinal: usize) -> String;

    fn template(&self, role: VmRole) -> DomainTemplate;
}

/// SLURM-style cluster: one controller and numbered compute nodes.
#[derive(Debug, Clone, Copy, Default)]
pub struct HpcTopology;

impl Topology for HpcTopology {
    fn kind(&self) -> ClusterKind {
        ClusterKind::Hpc
    }

    fn node_role(&self, _node: &NodeConfig) -> VmRole {
        VmRole::Compute
    }

    fn vm_name(&self, cluster: &str, role: VmRole, ordinal: usize) -> String {
        match role {
            VmRole::Controller => format!("{cluster}-controller"),
            _ => format!("{cluster}-compute-{ordinal:02}"),
        }
    }

    fn template(&self, role: VmRole) -> DomainTemplate {
        match role {
            VmRole::Controller => DomainTemplate::Controller,
            _ => DomainTemplate::Compute,
        }
    }
}

/// Kubernetes-style cluster: a control plane plus CPU and GPU workers,
/// numbered separately.
#[derive(Debug, Clone, Copy, Default)]
pub struct CloudTopology;

impl Topology for CloudTopology {
    fn kind(&self) -> ClusterKind {
        ClusterKind::Cloud
    }

    fn node_role(&self, node: &NodeConfig) -> VmRole {
        if node.has_gpu() {
            VmRole::WorkerGpu
        } else {
            VmRole::WorkerCpu
        }
    }

    fn vm_name(&self, cluster: &str, role: VmRole, ordinal: usize) -> String {
        match role {
            VmRole::Controller => format!("{cluster}-control-plane"),
            VmRole::WorkerGpu => format!("{cluster}-gpu-worker-{ordinal:02}"),
            VmRole::WorkerCpu | VmRole::Compute => format!("{cluster}-cpu-worker-{ordinal:02}"),
        }
    }

    fn template(&self, role: VmRole) -> DomainTemplate {
        match role {
            VmRole::Controller => DomainTemplate::Controller,
            _ => DomainTemplate::Worker,
        }
    }
}

/// Topology for `kind`.
#[must_use]
pub fn for_kind(kind: ClusterKind) -> Box<dyn Topology> {
    match kind {
        ClusterKind::Hpc => Box::new(HpcTopology),
        ClusterKind::Cloud => Box::new(CloudTopology),
    }
}

/// A passthrough device of one planned VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedDevice {
    pub pci_address: PciAddress,
    pub device_type: DeviceType,
    pub vendor_id: Option<String>,
    pub device_id: Option<String>,
}

impl PlannedDevice {
    #[must_use]
    pub fn is_gpu(&self) -> bool {
        self.device_type == DeviceType::Gpu
    }

    #[must_use]
    pub fn assignment(&self) -> GpuAssignment {
        GpuAssignment {
            pci_address: self.pci_address.clone(),
            vendor_id: self.vendor_id.clone(),
            device_id: self.device_id.clone(),
        }
    }
}

/// One VM the cluster should have.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePlan {
    pub name: String,
    pub role: VmRole,
    pub template: DomainTemplate,
    pub cpu_cores: u32,
    pub memory_gb: u32,
    pub disk_gb: u32,
    pub static_ip: Option<Ipv4Addr>,
    pub auto_start: bool,
    pub devices: Vec<PlannedDevice>,
}

impl NodePlan {
    /// Addresses of the GPUs this VM claims in the shared record.
    #[must_use]
    pub fn gpu_addresses(&self) -> Vec<PciAddress> {
        self.devices
            .iter()
            .filter(|d| d.is_gpu())
            .map(|d| d.pci_address.clone())
            .collect()
    }
}

/// Ordered VM plan of one cluster, controller first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterTopology {
    pub name: String,
    pub kind: ClusterKind,
    pub base_image: PathBuf,
    pub network: NetworkSettings,
    pub nodes: Vec<NodePlan>,
}

impl ClusterTopology {
    /// Expand `config` into named VMs.
    ///
    /// # Errors
    /// Returns a configuration error for an invalid PCI address.
    pub fn plan(config: &ClusterConfig, topology: &dyn Topology) -> Result<Self, ClusterError> {
        let cluster = config.name.as_str();
        let mut ordinals: HashMap<VmRole, usize> = HashMap::new();
        let mut nodes = Vec::new();

        let roles = std::iter::once((VmRole::Controller, &config.controller)).chain(
            config
                .nodes(topology.kind())
                .iter()
                .map(|n| (topology.node_role(n), n)),
        );
        for (role, node) in roles {
            let ordinal = ordinals.entry(role).or_default();
            *ordinal += 1;
            let devices = node
                .passthrough_devices()
                .iter()
                .map(|d| {
                    Ok(PlannedDevice {
                        pci_address: PciAddress::parse(&d.pci_address)?,
                        device_type: d.device_type,
                        vendor_id: d.vendor_id.clone(),
                        device_id: d.device_id.clone(),
                    })
                })
                .collect::<Result<Vec<_>, ClusterError>>()?;
            nodes.push(NodePlan {
                name: topology.vm_name(cluster, role, *ordinal),
                role,
                template: topology.template(role),
                cpu_cores: node.cpu_cores,
                memory_gb: node.memory_gb,
                disk_gb: node.disk_gb,
                static_ip: node.ip_address,
                auto_start: node.auto_start,
                devices,
            });
        }

        Ok(Self {
            name: cluster.to_string(),
            kind: topology.kind(),
            base_image: config.base_image_path.clone(),
            network: config.network.clone(),
            nodes,
        })
    }

    /// Prefix shared by every VM name of the cluster.
    #[must_use]
    pub fn name_prefix(&self) -> String {
        format!("{}-", self.name)
    }

    #[must_use]
    pub fn total_disk_gb(&self) -> u64 {
        self.nodes.iter().map(|n| u64::from(n.disk_gb)).sum()
    }

    /// Every passthrough address requested by the cluster.
    #[must_use]
    pub fn passthrough_addresses(&self) -> Vec<PciAddress> {
        self.nodes
            .iter()
            .flat_map(|n| n.devices.iter().map(|d| d.pci_address.clone()))
            .collect()
    }

    /// Configured static IPs by VM name.
    #[must_use]
    pub fn static_ips(&self) -> BTreeMap<String, Ipv4Addr> {
        self.nodes
            .iter()
            .filter_map(|n| n.static_ip.map(|ip| (n.name.clone(), ip)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PcieDeviceRequest, PciePassthrough};
    use crate::state::DnsMode;

    fn node(gpu: Option<&str>) -> NodeConfig {
        NodeConfig {
            cpu_cores: 8,
            memory_gb: 16,
            disk_gb: 100,
            ip_address: None,
            auto_start: true,
            pcie_passthrough: PciePassthrough {
                enabled: gpu.is_some(),
                devices: gpu
                    .map(|pci| PcieDeviceRequest {
                        pci_address: pci.into(),
                        device_type: DeviceType::Gpu,
                        vendor_id: Some("10de".into()),
                        device_id: Some("2684".into()),
                    })
                    .into_iter()
                    .collect(),
            },
        }
    }

    fn config(nodes: Vec<NodeConfig>, kind: ClusterKind) -> ClusterConfig {
        let (compute_nodes, worker_nodes) = match kind {
            ClusterKind::Hpc => (nodes, vec![]),
            ClusterKind::Cloud => (vec![], nodes),
        };
        ClusterConfig {
            name: "c1".into(),
            base_image_path: PathBuf::from("/images/base.qcow2"),
            network: NetworkSettings {
                subnet: "10.0.0.0/24".into(),
                bridge: None,
                gateway_ip: None,
                dhcp_start: None,
                dhcp_end: None,
                dns_mode: DnsMode::Isolated,
                dns_servers: vec![],
            },
            controller: node(None),
            compute_nodes,
            worker_nodes,
        }
    }

    #[test]
    fn test_hpc_names() {
        let cfg = config(vec![node(None), node(Some("0000:01:00.0"))], ClusterKind::Hpc);
        let plan = ClusterTopology::plan(&cfg, &HpcTopology).unwrap();
        let names: Vec<_> = plan.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, ["c1-controller", "c1-compute-01", "c1-compute-02"]);
        assert_eq!(plan.nodes[0].template, DomainTemplate::Controller);
        assert_eq!(plan.nodes[2].role, VmRole::Compute);
        assert_eq!(plan.nodes[2].gpu_addresses().len(), 1);
        assert_eq!(plan.total_disk_gb(), 300);
        assert_eq!(plan.name_prefix(), "c1-");
    }

    #[test]
    fn test_cloud_workers_are_numbered_per_role() {
        let cfg = config(
            vec![node(None), node(Some("0000:01:00.0")), node(None)],
            ClusterKind::Cloud,
        );
        let plan = ClusterTopology::plan(&cfg, &CloudTopology).unwrap();
        let names: Vec<_> = plan.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "c1-control-plane",
                "c1-cpu-worker-01",
                "c1-gpu-worker-01",
                "c1-cpu-worker-02"
            ]
        );
        assert_eq!(plan.nodes[2].role, VmRole::WorkerGpu);
        assert_eq!(plan.nodes[2].template, DomainTemplate::Worker);
        assert_eq!(plan.passthrough_addresses().len(), 1);
    }

    #[test]
    fn test_invalid_pci_address_is_rejected() {
        let cfg = config(vec![node(Some("01:00.0"))], ClusterKind::Hpc);
        assert!(matches!(
            ClusterTopology::plan(&cfg, &HpcTopology),
            Err(ClusterError::Configuration(_))
        ));
    }
}
