//! Cluster and runtime configuration.
//!
//! [`ClusterConfig`] is the fully-resolved description of one cluster that
//! the command line hands to the orchestrator. [`Settings`] holds host-level
//! paths and timeouts that are the same for every cluster.

use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ClusterError;
use crate::network::Subnet;
use crate::pcie::is_valid_pci_address;
use crate::state::{ClusterKind, DnsMode};

static BRIDGE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9._-]+$").expect("bridge name pattern is valid"));

static CLUSTER_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_-]*$").expect("cluster name pattern is valid")
});

/// Kind of a passthrough device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Gpu,
    Network,
    Storage,
    Audio,
    Other,
}

/// One device requested for passthrough.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcieDeviceRequest {
    pub pci_address: String,
    pub device_type: DeviceType,
    #[serde(default)]
    pub vendor_id: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciePassthrough {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub devices: Vec<PcieDeviceRequest>,
}

fn default_true() -> bool {
    true
}

/// Resources and placement of one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub cpu_cores: u32,
    pub memory_gb: u32,
    pub disk_gb: u32,
    /// Static address; allocated from the subnet when absent.
    #[serde(default, alias = "ip")]
    pub ip_address: Option<Ipv4Addr>,
    /// Start the VM after defining it.
    #[serde(default = "default_true")]
    pub auto_start: bool,
    #[serde(default)]
    pub pcie_passthrough: PciePassthrough,
}

impl NodeConfig {
    /// Devices to pass through (empty unless passthrough is enabled).
    #[must_use]
    pub fn passthrough_devices(&self) -> &[PcieDeviceRequest] {
        if self.pcie_passthrough.enabled {
            &self.pcie_passthrough.devices
        } else {
            &[]
        }
    }

    /// Whether any passthrough device is a GPU.
    #[must_use]
    pub fn has_gpu(&self) -> bool {
        self.passthrough_devices()
            .iter()
            .any(|d| d.device_type == DeviceType::Gpu)
    }
}

/// Network section of a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSettings {
    pub subnet: String,
    /// Bridge name; defaults to `br-<cluster>`.
    #[serde(default)]
    pub bridge: Option<String>,
    #[serde(default)]
    pub gateway_ip: Option<Ipv4Addr>,
    #[serde(default)]
    pub dhcp_start: Option<Ipv4Addr>,
    #[serde(default)]
    pub dhcp_end: Option<Ipv4Addr>,
    #[serde(default)]
    pub dns_mode: DnsMode,
    #[serde(default)]
    pub dns_servers: Vec<String>,
}

/// Fully-resolved configuration of one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    pub base_image_path: PathBuf,
    pub network: NetworkSettings,
    /// Controller (HPC) or control plane (Cloud).
    #[serde(alias = "control_plane")]
    pub controller: NodeConfig,
    #[serde(default)]
    pub compute_nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub worker_nodes: Vec<NodeConfig>,
}

impl ClusterConfig {
    /// Non-controller nodes for `kind`.
    #[must_use]
    pub fn nodes(&self, kind: ClusterKind) -> &[NodeConfig] {
        match kind {
            ClusterKind::Hpc => &self.compute_nodes,
            ClusterKind::Cloud => &self.worker_nodes,
        }
    }

    /// Controller first, then the nodes for `kind`.
    pub fn all_nodes(&self, kind: ClusterKind) -> impl Iterator<Item = &NodeConfig> {
        std::iter::once(&self.controller).chain(self.nodes(kind))
    }

    /// Check the shape of the configuration.
    ///
    /// # Errors
    /// Returns a configuration error naming the first offending field.
    pub fn validate(&self, kind: ClusterKind) -> Result<(), ClusterError> {
        let err = |msg: String| Err(ClusterError::Configuration(msg));

        if !CLUSTER_NAME.is_match(&self.name) {
            return err(format!("invalid cluster name '{}'", self.name));
        }

        if self.base_image_path.as_os_str().is_empty() {
            return err("base_image_path is required".into());
        }
        if !self.base_image_path.is_file() {
            return err(format!(
                "base image {} does not exist",
                self.base_image_path.display()
            ));
        }
        if self.base_image_path.extension().and_then(|e| e.to_str()) != Some("qcow2") {
            return err(format!(
                "base image {} must be a qcow2 image",
                self.base_image_path.display()
            ));
        }

        let wrong_list = match kind {
            ClusterKind::Hpc => (!self.worker_nodes.is_empty()).then_some("worker_nodes"),
            ClusterKind::Cloud => (!self.compute_nodes.is_empty()).then_some("compute_nodes"),
        };
        if let Some(field) = wrong_list {
            return err(format!("{field} is not valid for {kind} clusters"));
        }

        let subnet = Subnet::parse(&self.network.subnet)?;
        if let Some(bridge) = &self.network.bridge {
            if !BRIDGE_NAME.is_match(bridge) || bridge.len() > 15 {
                return err(format!("invalid bridge name '{bridge}'"));
            }
        }
        for (field, ip) in [
            ("gateway_ip", self.network.gateway_ip),
            ("dhcp_start", self.network.dhcp_start),
            ("dhcp_end", self.network.dhcp_end),
        ] {
            if let Some(ip) = ip {
                if !subnet.is_host(ip) {
                    return err(format!("network.{field} {ip} is outside {subnet}"));
                }
            }
        }
        let gateway = self.network.gateway_ip.unwrap_or_else(|| subnet.gateway());

        let mut static_ips = HashSet::new();
        let mut pci_addresses = HashSet::new();
        for (index, node) in self.all_nodes(kind).enumerate() {
            let label = if index == 0 {
                "controller".to_string()
            } else {
                format!("node {index}")
            };
            if node.cpu_cores == 0 || node.memory_gb == 0 || node.disk_gb == 0 {
                return err(format!(
                    "{label}: cpu_cores, memory_gb and disk_gb must be positive"
                ));
            }
            if let Some(ip) = node.ip_address {
                if !subnet.is_host(ip) || ip == gateway {
                    return err(format!("{label}: ip {ip} is not a usable host in {subnet}"));
                }
                if !static_ips.insert(ip) {
                    return err(format!("{label}: ip {ip} is assigned twice"));
                }
            }
            for device in node.passthrough_devices() {
                if !is_valid_pci_address(&device.pci_address) {
                    return err(format!(
                        "{label}: invalid PCI address '{}'",
                        device.pci_address
                    ));
                }
                if !pci_addresses.insert(device.pci_address.to_lowercase()) {
                    return err(format!(
                        "{label}: PCI device {} is requested by more than one node",
                        device.pci_address
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Both clusters of a config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clusters {
    #[serde(default)]
    pub hpc: Option<ClusterConfig>,
    #[serde(default)]
    pub cloud: Option<ClusterConfig>,
}

/// Top-level YAML document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClustersFile {
    pub clusters: Clusters,
}

impl ClustersFile {
    /// Parse a YAML document.
    ///
    /// # Errors
    /// Returns a configuration error if the YAML does not match the schema.
    pub fn from_yaml(content: &str) -> Result<Self, ClusterError> {
        serde_yaml::from_str(content)
            .map_err(|e| ClusterError::Configuration(format!("invalid cluster config: {e}")))
    }

    /// Read and parse a YAML file.
    ///
    /// # Errors
    /// Returns a configuration error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ClusterError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ClusterError::Configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_yaml(&content)
    }

    /// The cluster of `kind`.
    ///
    /// # Errors
    /// Returns a configuration error if the file has no such cluster.
    pub fn cluster(&self, kind: ClusterKind) -> Result<&ClusterConfig, ClusterError> {
        match kind {
            ClusterKind::Hpc => self.clusters.hpc.as_ref(),
            ClusterKind::Cloud => self.clusters.cloud.as_ref(),
        }
        .ok_or_else(|| ClusterError::Configuration(format!("no {kind} cluster configured")))
    }

    /// PCI addresses requested by more than one cluster, with the cluster names.
    #[must_use]
    pub fn shared_gpus(&self) -> BTreeMap<String, Vec<String>> {
        let mut seen: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (kind, cluster) in [
            (ClusterKind::Hpc, &self.clusters.hpc),
            (ClusterKind::Cloud, &self.clusters.cloud),
        ] {
            let Some(cluster) = cluster else { continue };
            for node in cluster.all_nodes(kind) {
                for device in node.passthrough_devices() {
                    let owners = seen.entry(device.pci_address.to_lowercase()).or_default();
                    if !owners.contains(&cluster.name) {
                        owners.push(cluster.name.clone());
                    }
                }
            }
        }
        seen.retain(|_, owners| owners.len() > 1);
        seen
    }
}

/// Host-level runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root of per-cluster state documents and the shared GPU record.
    pub state_dir: PathBuf,
    /// Parent directory of per-cluster storage pools.
    pub pool_root: PathBuf,
    /// Host dnsmasq drop-in directory for shared DNS.
    pub dns_config_dir: PathBuf,
    /// Wait for each VM to report running after start.
    pub wait_for_boot: bool,
    pub boot_timeout: Duration,
    /// Graceful shutdown window before a forced stop.
    pub shutdown_timeout: Duration,
    pub poll_interval: Duration,
    /// Check free space under `pool_root` before creating volumes.
    pub check_free_space: bool,
    pub max_state_backups: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("output"),
            pool_root: PathBuf::from("/var/lib/libvirt/images"),
            dns_config_dir: PathBuf::from("/etc/dnsmasq.d"),
            wait_for_boot: false,
            boot_timeout: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(2),
            check_free_space: true,
            max_state_backups: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    const YAML: &str = r#"
clusters:
  hpc:
    name: hpc
    base_image_path: BASE
    network:
      subnet: 192.168.100.0/24
      bridge: br-hpc
    controller:
      cpu_cores: 4
      memory_gb: 8
      disk_gb: 100
      ip_address: 192.168.100.10
    compute_nodes:
      - cpu_cores: 8
        memory_gb: 16
        disk_gb: 200
        ip: 192.168.100.11
      - cpu_cores: 8
        memory_gb: 16
        disk_gb: 200
        pcie_passthrough:
          enabled: true
          devices:
            - pci_address: "0000:01:00.0"
              device_type: gpu
              vendor_id: "10de"
              device_id: "2684"
  cloud:
    name: k8s
    base_image_path: BASE
    network:
      subnet: 10.10.0.0/24
      dns_mode: shared-dns
    control_plane:
      cpu_cores: 4
      memory_gb: 8
      disk_gb: 50
    worker_nodes:
      - cpu_cores: 8
        memory_gb: 16
        disk_gb: 100
        auto_start: false
        pcie_passthrough:
          enabled: true
          devices:
            - pci_address: "0000:01:00.0"
              device_type: gpu
"#;

    fn load(dir: &TempDir) -> ClustersFile {
        let base = dir.path().join("base.qcow2");
        std::fs::write(&base, b"qcow").unwrap();
        ClustersFile::from_yaml(&YAML.replace("BASE", &base.to_string_lossy())).unwrap()
    }

    #[test]
    fn test_parse_and_validate() {
        let dir = TempDir::new().unwrap();
        let file = load(&dir);
        let hpc = file.cluster(ClusterKind::Hpc).unwrap();
        hpc.validate(ClusterKind::Hpc).unwrap();
        assert_eq!(hpc.compute_nodes[0].ip_address, Some(Ipv4Addr::new(192, 168, 100, 11)));
        assert!(hpc.compute_nodes[1].has_gpu());
        assert!(hpc.compute_nodes[1].auto_start);

        let cloud = file.cluster(ClusterKind::Cloud).unwrap();
        cloud.validate(ClusterKind::Cloud).unwrap();
        assert_eq!(cloud.network.dns_mode, DnsMode::SharedDns);
        assert!(!cloud.worker_nodes[0].auto_start);
    }

    #[test]
    fn test_shared_gpus_across_clusters() {
        let dir = TempDir::new().unwrap();
        let shared = load(&dir).shared_gpus();
        assert_eq!(
            shared.get("0000:01:00.0"),
            Some(&vec!["hpc".to_string(), "k8s".to_string()])
        );
    }

    #[test]
    fn test_validation_failures() {
        let dir = TempDir::new().unwrap();
        let file = load(&dir);
        let good = file.cluster(ClusterKind::Hpc).unwrap().clone();

        let mut bad = good.clone();
        bad.network.subnet = "192.168.100.0/33".into();
        assert!(matches!(bad.validate(ClusterKind::Hpc), Err(ClusterError::Configuration(_))));

        let mut bad = good.clone();
        bad.compute_nodes[1].pcie_passthrough.devices[0].pci_address = "0000:01:00.9".into();
        assert!(bad.validate(ClusterKind::Hpc).is_err());

        let mut bad = good.clone();
        bad.compute_nodes[0].cpu_cores = 0;
        assert!(bad.validate(ClusterKind::Hpc).is_err());

        let mut bad = good.clone();
        bad.compute_nodes[0].ip_address = Some(Ipv4Addr::new(192, 168, 100, 10));
        let msg = bad.validate(ClusterKind::Hpc).unwrap_err().to_string();
        assert!(msg.contains("assigned twice"));

        let mut bad = good.clone();
        bad.compute_nodes[0].ip_address = Some(Ipv4Addr::new(192, 168, 100, 1));
        assert!(bad.validate(ClusterKind::Hpc).is_err());

        let mut bad = good.clone();
        bad.network.bridge = Some("br hpc".into());
        assert!(bad.validate(ClusterKind::Hpc).is_err());

        let mut bad = good.clone();
        bad.base_image_path = dir.path().join("missing.qcow2");
        assert!(bad.validate(ClusterKind::Hpc).is_err());

        let mut bad = good.clone();
        bad.compute_nodes[0].pcie_passthrough = bad.compute_nodes[1].pcie_passthrough.clone();
        let msg = bad.validate(ClusterKind::Hpc).unwrap_err().to_string();
        assert!(msg.contains("more than one node"));

        assert!(good.validate(ClusterKind::Cloud).is_err());
    }

    #[test]
    fn test_disabled_passthrough_ignores_devices() {
        let node = NodeConfig {
            cpu_cores: 1,
            memory_gb: 1,
            disk_gb: 1,
            ip_address: None,
            auto_start: true,
            pcie_passthrough: PciePassthrough {
                enabled: false,
                devices: vec![PcieDeviceRequest {
                    pci_address: "0000:01:00.0".into(),
                    device_type: DeviceType::Gpu,
                    vendor_id: None,
                    device_id: None,
                }],
            },
        };
        assert!(node.passthrough_devices().is_empty());
        assert!(!node.has_gpu());
    }
}
