//! VM cluster provisioning on a single hypervisor host.
//!
//! Two cluster shapes share one host: an HPC cluster (a SLURM controller
//! plus compute nodes) and a Cloud cluster (a Kubernetes control plane plus
//! CPU and GPU workers). Each cluster gets its own virtual network, storage
//! pool and copy-on-write VM disks. GPUs are passed through via VFIO and
//! tracked in a host-wide record so two clusters never claim the same card.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use provisioner::{ClusterOrchestrator, ClustersFile, Settings, Virsh};
//! use provisioner::state::ClusterKind;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let file = ClustersFile::load(Path::new("clusters.yaml"))?;
//!     let config = file.cluster(ClusterKind::Hpc)?;
//!     let orchestrator =
//!         ClusterOrchestrator::new(Arc::new(Virsh::new(None)), Settings::default());
//!
//!     let state = orchestrator.start(config, ClusterKind::Hpc, None).await?;
//!     println!("{} VMs up", state.all_vms().len());
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod gpu;
pub mod hypervisor;
pub mod lifecycle;
pub mod network;
pub mod orchestrator;
pub mod pcie;
pub mod retry;
pub mod rollback;
pub mod state;
pub mod topology;
pub mod volume;

pub use config::{ClusterConfig, ClustersFile, Settings};
pub use error::{ClusterError, PersistenceError};
pub use gpu::GpuAllocator;
pub use hypervisor::{Hypervisor, MemoryHypervisor, Virsh};
pub use lifecycle::VmLifecycleManager;
pub use network::NetworkAllocator;
pub use orchestrator::{ClusterOrchestrator, ClusterPhase, ClusterStatus, TeardownReport};
pub use pcie::{PciAddress, PcieValidator};
pub use rollback::RollbackManager;
pub use state::{ClusterKind, ClusterState, ClusterStateStore};
pub use volume::VolumeAllocator;
