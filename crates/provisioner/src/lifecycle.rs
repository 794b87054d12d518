//! Single-VM state machine: define, start, stop, destroy.
//!
//! GPU-aware variants wrap the base transitions with allocation in the
//! shared [`GpuAllocator`] record and hand allocations back if the
//! transition fails.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::ClusterError;
use crate::gpu::GpuAllocator;
use crate::hypervisor::{DomainSpec, Hypervisor, HypervisorError, VmState};
use crate::pcie::PciAddress;

/// How a `stop` request was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    AlreadyStopped,
    Graceful,
    /// Graceful shutdown was skipped or did not finish in time.
    Forced,
}

/// Drives individual domains through their lifecycle.
pub struct VmLifecycleManager {
    hypervisor: Arc<dyn Hypervisor>,
    gpus: Option<GpuAllocator>,
    poll_interval: Duration,
}

impl VmLifecycleManager {
    #[must_use]
    pub fn new(hypervisor: Arc<dyn Hypervisor>) -> Self {
        Self {
            hypervisor,
            gpus: None,
            poll_interval: Duration::from_secs(2),
        }
    }

    /// Enable the GPU-aware transitions.
    #[must_use]
    pub fn with_gpu_allocator(mut self, gpus: GpuAllocator) -> Self {
        self.gpus = Some(gpus);
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Define a new domain. Returns its handle.
    ///
    /// # Errors
    /// `ResourceConflict` if a domain with that name exists.
    pub async fn create(&self, spec: &DomainSpec) -> Result<String, ClusterError> {
        match self.hypervisor.define_domain(spec).await {
            Ok(handle) => {
                info!(vm = %spec.name, vcpus = spec.vcpus, memory_gb = spec.memory_gb, gpus = spec.hostdevs.len(), "Defined VM");
                Ok(handle)
            }
            Err(HypervisorError::AlreadyExists { name, .. }) => Err(ClusterError::ResourceConflict(
                format!("VM {name} already exists"),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Current state; `Undefined` when the domain does not exist.
    ///
    /// # Errors
    /// Returns the hypervisor failure.
    pub async fn state(&self, name: &str) -> Result<VmState, ClusterError> {
        Ok(self
            .hypervisor
            .lookup_domain(name)
            .await?
            .map_or(VmState::Undefined, |d| d.state))
    }

    /// # Errors
    /// Returns the hypervisor failure.
    pub async fn exists(&self, name: &str) -> Result<bool, ClusterError> {
        Ok(self.hypervisor.lookup_domain(name).await?.is_some())
    }

    /// Names of defined domains, optionally filtered by prefix.
    ///
    /// # Errors
    /// Returns the hypervisor failure.
    pub async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>, ClusterError> {
        let mut names = self.hypervisor.list_domains().await?;
        if let Some(prefix) = prefix {
            names.retain(|n| n.starts_with(prefix));
        }
        names.sort();
        Ok(names)
    }

    async fn wait_for<F>(
        &self,
        name: &str,
        expected: VmState,
        timeout: Duration,
        reached: F,
    ) -> Result<bool, ClusterError>
    where
        F: Fn(VmState) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let state = self.hypervisor.domain_state(name).await?;
            if reached(state) {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                debug!(vm = %name, state = %state, expected = %expected, "Timed out waiting for state");
                return Ok(false);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Start a defined domain. A running domain is left alone.
    ///
    /// # Errors
    /// Returns the hypervisor failure, or a timeout if `wait_for_boot` is
    /// set and the domain does not report running within `timeout`.
    pub async fn start(
        &self,
        name: &str,
        wait_for_boot: bool,
        timeout: Duration,
    ) -> Result<(), ClusterError> {
        if self.hypervisor.domain_state(name).await? == VmState::Running {
            debug!(vm = %name, "VM already running");
            return Ok(());
        }
        self.hypervisor.start_domain(name).await?;
        if wait_for_boot
            && !self
                .wait_for(name, VmState::Running, timeout, |s| s == VmState::Running)
                .await?
        {
            return Err(HypervisorError::Timeout {
                target: name.to_string(),
                expected: VmState::Running,
                seconds: timeout.as_secs(),
            }
            .into());
        }
        info!(vm = %name, "Started VM");
        Ok(())
    }

    /// Stop a domain, gracefully unless `force`. A graceful request that
    /// has not taken effect within `timeout` is escalated to a forced stop.
    ///
    /// # Errors
    /// Returns the hypervisor failure, including not-found for an
    /// undefined domain.
    pub async fn stop(
        &self,
        name: &str,
        force: bool,
        timeout: Duration,
    ) -> Result<StopOutcome, ClusterError> {
        if self.hypervisor.domain_state(name).await?.is_stopped() {
            debug!(vm = %name, "VM already stopped");
            return Ok(StopOutcome::AlreadyStopped);
        }

        if !force {
            self.hypervisor.stop_domain(name, false).await?;
            if self
                .wait_for(name, VmState::Shutoff, timeout, VmState::is_stopped)
                .await?
            {
                info!(vm = %name, "Stopped VM");
                return Ok(StopOutcome::Graceful);
            }
            warn!(vm = %name, timeout_secs = timeout.as_secs(), "Graceful shutdown timed out, forcing stop");
        }

        self.hypervisor.stop_domain(name, true).await?;
        info!(vm = %name, "Force-stopped VM");
        Ok(StopOutcome::Forced)
    }

    /// Remove a domain, stopping it first if needed. With `remove_storage`
    /// the disk files the domain referenced are deleted as well. Returns
    /// `false` if the domain did not exist.
    ///
    /// # Errors
    /// Returns the hypervisor failure.
    pub async fn destroy(&self, name: &str, remove_storage: bool) -> Result<bool, ClusterError> {
        let Some(domain) = self.hypervisor.lookup_domain(name).await? else {
            debug!(vm = %name, "VM not found, nothing to destroy");
            return Ok(false);
        };

        if !domain.state.is_stopped() && domain.state != VmState::Undefined {
            self.hypervisor.stop_domain(name, true).await?;
        }

        let disks: Vec<PathBuf> = if remove_storage {
            self.hypervisor.domain_disks(name).await?
        } else {
            Vec::new()
        };

        self.hypervisor.destroy_domain_definition(name).await?;

        for disk in disks {
            match tokio::fs::remove_file(&disk).await {
                Ok(()) => debug!(vm = %name, disk = %disk.display(), "Removed disk"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(vm = %name, disk = %disk.display(), error = %e, "Failed to remove disk");
                }
            }
        }
        info!(vm = %name, remove_storage, "Destroyed VM");
        Ok(true)
    }

    fn gpu_allocator(&self) -> Result<&GpuAllocator, ClusterError> {
        self.gpus.as_ref().ok_or_else(|| {
            ClusterError::Configuration("GPU allocation is not enabled for this manager".to_string())
        })
    }

    /// Claim `gpus` for `name` and start it. GPUs claimed by this call are
    /// released again if the start fails.
    ///
    /// # Errors
    /// `ResourceConflict` naming the first GPU owned by someone else, or
    /// the start failure.
    pub async fn start_with_gpu(
        &self,
        name: &str,
        gpus: &[PciAddress],
        wait_for_boot: bool,
        timeout: Duration,
    ) -> Result<(), ClusterError> {
        if gpus.is_empty() {
            return self.start(name, wait_for_boot, timeout).await;
        }
        let allocator = self.gpu_allocator()?;

        let (ok, conflict) = allocator.validate_all(gpus, name)?;
        if !ok {
            return Err(ClusterError::ResourceConflict(conflict.unwrap_or_else(|| {
                format!("GPUs requested by {name} are not available")
            })));
        }

        let mut claimed = Vec::new();
        for pci in gpus {
            let newly = allocator.owner(pci)?.is_none();
            if !allocator.allocate(pci, name)? {
                release_all(allocator, &claimed);
                return Err(ClusterError::ResourceConflict(format!(
                    "GPU {pci} was claimed by another VM while starting {name}"
                )));
            }
            if newly {
                claimed.push(pci.clone());
            }
        }

        if let Err(e) = self.start(name, wait_for_boot, timeout).await {
            warn!(vm = %name, error = %e, "Start failed, releasing GPUs");
            release_all(allocator, &claimed);
            return Err(e);
        }
        Ok(())
    }

    /// Stop `name` and release every GPU it owns.
    ///
    /// # Errors
    /// Returns the stop failure (GPUs are then kept), or a persistence error
    /// from the allocator.
    pub async fn stop_with_gpu_release(
        &self,
        name: &str,
        force: bool,
        timeout: Duration,
    ) -> Result<(StopOutcome, Vec<PciAddress>), ClusterError> {
        let outcome = self.stop(name, force, timeout).await?;
        let released = match &self.gpus {
            Some(allocator) => allocator.release_owned_by(name)?,
            None => Vec::new(),
        };
        if !released.is_empty() {
            info!(vm = %name, count = released.len(), "Released GPUs");
        }
        Ok((outcome, released))
    }

    /// Stop (releasing GPUs) then start again, re-claiming `gpus`.
    ///
    /// # Errors
    /// Returns the first failing step.
    pub async fn restart(
        &self,
        name: &str,
        gpus: &[PciAddress],
        timeout: Duration,
    ) -> Result<(), ClusterError> {
        self.stop_with_gpu_release(name, false, timeout).await?;
        self.start_with_gpu(name, gpus, false, timeout).await
    }
}

fn release_all(allocator: &GpuAllocator, gpus: &[PciAddress]) {
    for pci in gpus {
        if let Err(e) = allocator.release(pci) {
            warn!(pci = %pci, error = %e, "Failed to release GPU");
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use uuid::Uuid;

    use super::*;
    use crate::hypervisor::memory::Operation;
    use crate::hypervisor::{DomainTemplate, MemoryHypervisor};

    fn spec(name: &str) -> DomainSpec {
        DomainSpec {
            name: name.to_string(),
            uuid: Uuid::new_v4(),
            template: DomainTemplate::Compute,
            vcpus: 2,
            memory_gb: 4,
            disk_path: PathBuf::from(format!("/nonexistent/{name}.qcow2")),
            network: "c-network".into(),
            mac_address: "02:00:00:00:00:01".into(),
            hostdevs: vec![],
        }
    }

    fn manager(hv: &Arc<MemoryHypervisor>) -> VmLifecycleManager {
        VmLifecycleManager::new(hv.clone()).with_poll_interval(Duration::from_millis(5))
    }

    fn pci(s: &str) -> PciAddress {
        PciAddress::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let hv = Arc::new(MemoryHypervisor::new());
        let vms = manager(&hv);
        assert_eq!(vms.state("vm1").await.unwrap(), VmState::Undefined);

        vms.create(&spec("vm1")).await.unwrap();
        assert_eq!(vms.state("vm1").await.unwrap(), VmState::Shutoff);

        vms.start("vm1", true, Duration::from_secs(1)).await.unwrap();
        vms.start("vm1", false, Duration::from_secs(1)).await.unwrap();
        assert_eq!(vms.state("vm1").await.unwrap(), VmState::Running);

        let outcome = vms.stop("vm1", false, Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome, StopOutcome::Graceful);
        let outcome = vms.stop("vm1", false, Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome, StopOutcome::AlreadyStopped);

        assert!(vms.destroy("vm1", true).await.unwrap());
        assert!(!vms.destroy("vm1", true).await.unwrap());
        assert!(!vms.exists("vm1").await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_create_conflicts() {
        let hv = Arc::new(MemoryHypervisor::new());
        let vms = manager(&hv);
        vms.create(&spec("vm1")).await.unwrap();
        assert!(matches!(
            vms.create(&spec("vm1")).await,
            Err(ClusterError::ResourceConflict(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_escalates_to_force() {
        let hv = Arc::new(MemoryHypervisor::new());
        let vms = manager(&hv);
        vms.create(&spec("vm1")).await.unwrap();
        vms.start("vm1", false, Duration::ZERO).await.unwrap();
        hv.ignore_graceful_shutdown("vm1");

        let outcome = vms.stop("vm1", false, Duration::from_millis(20)).await.unwrap();
        assert_eq!(outcome, StopOutcome::Forced);
        assert_eq!(vms.state("vm1").await.unwrap(), VmState::Shutoff);
    }

    #[tokio::test]
    async fn test_destroy_stops_running_vm() {
        let hv = Arc::new(MemoryHypervisor::new());
        let vms = manager(&hv);
        vms.create(&spec("vm1")).await.unwrap();
        vms.start("vm1", false, Duration::ZERO).await.unwrap();
        assert!(vms.destroy("vm1", false).await.unwrap());
        assert!(hv.journal().contains(&"StopDomain vm1".to_string()));
    }

    #[tokio::test]
    async fn test_list_filters_by_prefix() {
        let hv = Arc::new(MemoryHypervisor::new());
        let vms = manager(&hv);
        for name in ["hpc-controller", "hpc-compute-01", "k8s-control-plane"] {
            vms.create(&spec(name)).await.unwrap();
        }
        assert_eq!(
            vms.list(Some("hpc-")).await.unwrap(),
            vec!["hpc-compute-01", "hpc-controller"]
        );
        assert_eq!(vms.list(None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_start_with_gpu_conflict() {
        let dir = TempDir::new().unwrap();
        let hv = Arc::new(MemoryHypervisor::new());
        let gpus = GpuAllocator::in_state_dir(dir.path());
        gpus.allocate(&pci("0000:01:00.0"), "other-vm").unwrap();
        let vms = manager(&hv).with_gpu_allocator(gpus);
        vms.create(&spec("vm1")).await.unwrap();

        let err = vms
            .start_with_gpu("vm1", &[pci("0000:01:00.0")], false, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::ResourceConflict(_)));
        assert!(err.to_string().contains("currently allocated to 'other-vm'"));
        assert_eq!(vms.state("vm1").await.unwrap(), VmState::Shutoff);
    }

    #[tokio::test]
    async fn test_failed_start_releases_claimed_gpus() {
        let dir = TempDir::new().unwrap();
        let hv = Arc::new(MemoryHypervisor::new());
        let gpus = GpuAllocator::in_state_dir(dir.path());
        let vms = manager(&hv).with_gpu_allocator(gpus.clone());
        vms.create(&spec("vm1")).await.unwrap();
        hv.fail_on(Operation::StartDomain, "vm1", "no vfio");

        assert!(vms
            .start_with_gpu("vm1", &[pci("0000:01:00.0")], false, Duration::ZERO)
            .await
            .is_err());
        assert!(gpus.allocations().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_gpu_round_trip_through_stop_and_restart() {
        let dir = TempDir::new().unwrap();
        let hv = Arc::new(MemoryHypervisor::new());
        let gpus = GpuAllocator::in_state_dir(dir.path());
        let vms = manager(&hv).with_gpu_allocator(gpus.clone());
        let gpu = pci("0000:01:00.0");
        vms.create(&spec("vm1")).await.unwrap();

        vms.start_with_gpu("vm1", &[gpu.clone()], false, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(gpus.owner(&gpu).unwrap().as_deref(), Some("vm1"));

        vms.restart("vm1", &[gpu.clone()], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(gpus.owner(&gpu).unwrap().as_deref(), Some("vm1"));
        assert_eq!(vms.state("vm1").await.unwrap(), VmState::Running);

        let (outcome, released) = vms
            .stop_with_gpu_release("vm1", false, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(outcome, StopOutcome::Graceful);
        assert_eq!(released, vec![gpu.clone()]);
        assert!(gpus.is_available(&gpu, "anyone").unwrap());
    }

    #[tokio::test]
    async fn test_gpu_start_without_allocator_fails() {
        let hv = Arc::new(MemoryHypervisor::new());
        let vms = manager(&hv);
        vms.create(&spec("vm1")).await.unwrap();
        assert!(matches!(
            vms.start_with_gpu("vm1", &[pci("0000:01:00.0")], false, Duration::ZERO)
                .await,
            Err(ClusterError::Configuration(_))
        ));
    }
}
