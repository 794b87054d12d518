//! Hypervisor control-plane boundary.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::pcie::PciAddress;

/// Kind of hypervisor object an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Domain,
    Network,
    StoragePool,
    Volume,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Domain => write!(f, "domain"),
            Self::Network => write!(f, "network"),
            Self::StoragePool => write!(f, "storage pool"),
            Self::Volume => write!(f, "volume"),
        }
    }
}

/// Errors from hypervisor adapters.
#[derive(Error, Debug)]
pub enum HypervisorError {
    /// Could not reach the control plane.
    #[error("failed to connect to hypervisor at {uri}: {message}")]
    Connection { uri: String, message: String },

    /// The named object does not exist.
    #[error("{kind} '{name}' not found")]
    NotFound { kind: ResourceKind, name: String },

    /// An object with that name already exists.
    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: ResourceKind, name: String },

    /// A control-plane call failed.
    #[error("{operation} failed for '{target}': {message}")]
    Operation {
        operation: String,
        target: String,
        message: String,
    },

    /// A state transition did not complete in time.
    #[error("timed out after {seconds}s waiting for '{target}' to become {expected}")]
    Timeout {
        target: String,
        expected: VmState,
        seconds: u64,
    },

    /// A native definition document could not be rendered.
    #[error("failed to render {document} definition: {message}")]
    Render { document: String, message: String },

    /// Local I/O needed by the adapter failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HypervisorError {
    pub(crate) fn operation(
        operation: impl Into<String>,
        target: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Operation {
            operation: operation.into(),
            target: target.into(),
            message: message.into(),
        }
    }

    pub(crate) fn not_found(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// True if this error reports a missing object.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Lifecycle state of a VM as reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    #[default]
    Undefined,
    Running,
    Blocked,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
    PmSuspended,
    Error,
}

impl VmState {
    /// Map a libvirt `virDomainState` code. Unknown codes become [`VmState::Error`].
    #[must_use]
    pub fn from_libvirt_code(code: i64) -> Self {
        match code {
            0 => Self::Undefined,
            1 => Self::Running,
            2 => Self::Blocked,
            3 => Self::Paused,
            4 => Self::Shutdown,
            5 => Self::Shutoff,
            6 => Self::Crashed,
            7 => Self::PmSuspended,
            _ => Self::Error,
        }
    }

    /// True for states where the guest is not executing and can be started.
    #[must_use]
    pub fn is_stopped(self) -> bool {
        matches!(self, Self::Shutdown | Self::Shutoff)
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Undefined => write!(f, "undefined"),
            Self::Running => write!(f, "running"),
            Self::Blocked => write!(f, "blocked"),
            Self::Paused => write!(f, "paused"),
            Self::Shutdown => write!(f, "shutdown"),
            Self::Shutoff => write!(f, "shutoff"),
            Self::Crashed => write!(f, "crashed"),
            Self::PmSuspended => write!(f, "pmsuspended"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Role-specific domain template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainTemplate {
    Controller,
    Compute,
    Worker,
}

/// Structured domain definition handed to the adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainSpec {
    pub name: String,
    pub uuid: Uuid,
    pub template: DomainTemplate,
    pub vcpus: u32,
    pub memory_gb: u32,
    pub disk_path: PathBuf,
    pub network: String,
    pub mac_address: String,
    /// PCI devices passed through to the guest.
    pub hostdevs: Vec<PciAddress>,
}

/// A defined domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainInfo {
    pub name: String,
    /// Hypervisor-assigned identity.
    pub handle: String,
    pub state: VmState,
}

/// How a cluster network reaches the outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardMode {
    Nat,
    Route,
}

/// A fixed DHCP reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticHost {
    pub name: String,
    pub mac: String,
    pub ip: Ipv4Addr,
}

/// Structured virtual network definition.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkSpec {
    pub name: String,
    pub bridge: String,
    pub gateway: Ipv4Addr,
    pub prefix_len: u8,
    pub dhcp_start: Ipv4Addr,
    pub dhcp_end: Ipv4Addr,
    pub forward: ForwardMode,
    /// Local DNS domain served by the network, e.g. `hpc.local`.
    pub domain: String,
    pub dns_forwarders: Vec<String>,
    pub hosts: Vec<StaticHost>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSpec {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolInfo {
    pub name: String,
    pub path: PathBuf,
}

/// Where the content of a new volume comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeSource {
    /// Import a full copy of a host file.
    CopyOf(PathBuf),
    /// Copy-on-write overlay on top of an existing image.
    BackedBy(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    pub name: String,
    pub capacity_bytes: u64,
    pub format: String,
    pub source: VolumeSource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub name: String,
    pub path: PathBuf,
    pub capacity_bytes: u64,
    pub allocation_bytes: u64,
    pub backing: Option<PathBuf>,
}

/// Virtualization control plane.
///
/// Implementations must be safe for concurrent use and reconnect on demand.
/// Lookups of missing objects return `Ok(None)`; mutations of missing
/// objects return [`HypervisorError::NotFound`].
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Establish (or re-establish) the connection. Idempotent.
    async fn connect(&self) -> Result<(), HypervisorError>;

    // Domains
    async fn define_domain(&self, spec: &DomainSpec) -> Result<String, HypervisorError>;
    async fn lookup_domain(&self, name: &str) -> Result<Option<DomainInfo>, HypervisorError>;
    async fn domain_state(&self, name: &str) -> Result<VmState, HypervisorError>;
    async fn start_domain(&self, name: &str) -> Result<(), HypervisorError>;
    async fn stop_domain(&self, name: &str, force: bool) -> Result<(), HypervisorError>;
    async fn destroy_domain_definition(&self, name: &str) -> Result<(), HypervisorError>;
    /// Backing file paths of the domain's disks.
    async fn domain_disks(&self, name: &str) -> Result<Vec<PathBuf>, HypervisorError>;
    async fn list_domains(&self) -> Result<Vec<String>, HypervisorError>;

    // Networks
    async fn define_network(&self, spec: &NetworkSpec) -> Result<String, HypervisorError>;
    async fn start_network(&self, name: &str) -> Result<(), HypervisorError>;
    async fn stop_network(&self, name: &str) -> Result<(), HypervisorError>;
    async fn undefine_network(&self, name: &str) -> Result<(), HypervisorError>;
    async fn list_networks(&self) -> Result<Vec<String>, HypervisorError>;

    // Storage
    async fn define_storage_pool(&self, spec: &PoolSpec) -> Result<String, HypervisorError>;
    async fn storage_pool(&self, name: &str) -> Result<Option<PoolInfo>, HypervisorError>;
    async fn list_storage_pools(&self) -> Result<Vec<String>, HypervisorError>;
    async fn destroy_storage_pool(&self, name: &str) -> Result<(), HypervisorError>;
    async fn create_volume(
        &self,
        pool: &str,
        spec: &VolumeSpec,
    ) -> Result<VolumeInfo, HypervisorError>;
    async fn find_volume(
        &self,
        pool: &str,
        name: &str,
    ) -> Result<Option<VolumeInfo>, HypervisorError>;
    async fn list_volumes(&self, pool: &str) -> Result<Vec<VolumeInfo>, HypervisorError>;
    async fn delete_volume(&self, pool: &str, name: &str) -> Result<(), HypervisorError>;
}
