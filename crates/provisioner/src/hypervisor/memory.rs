//! In-memory hypervisor.
//!
//! Keeps domains, networks, pools and volumes in process memory. Used for
//! dry runs and as the backend of the test suite. Failures can be injected
//! per operation and target name.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use super::traits::{
    DomainInfo, DomainSpec, Hypervisor, HypervisorError, NetworkSpec, PoolInfo, PoolSpec,
    ResourceKind, VmState, VolumeInfo, VolumeSource, VolumeSpec,
};

/// Operations that accept injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Connect,
    DefineDomain,
    StartDomain,
    StopDomain,
    UndefineDomain,
    DefineNetwork,
    StartNetwork,
    UndefineNetwork,
    DefinePool,
    DestroyPool,
    CreateVolume,
    DeleteVolume,
}

#[derive(Debug)]
struct InjectedFailure {
    operation: Operation,
    target: String,
    message: String,
}

#[derive(Debug)]
struct Domain {
    handle: String,
    spec: DomainSpec,
    state: VmState,
    ignore_shutdown: bool,
}

#[derive(Debug)]
struct Network {
    spec: NetworkSpec,
    active: bool,
}

#[derive(Debug)]
struct Pool {
    path: PathBuf,
    volumes: BTreeMap<String, VolumeInfo>,
}

#[derive(Debug, Default)]
struct Inner {
    domains: BTreeMap<String, Domain>,
    networks: BTreeMap<String, Network>,
    pools: BTreeMap<String, Pool>,
    failures: Vec<InjectedFailure>,
    stubborn: Vec<String>,
    journal: Vec<String>,
}

impl Inner {
    fn check(&mut self, operation: Operation, target: &str) -> Result<(), HypervisorError> {
        self.journal.push(format!("{operation:?} {target}"));
        if let Some(pos) = self
            .failures
            .iter()
            .position(|f| f.operation == operation && f.target == target)
        {
            let failure = self.failures.remove(pos);
            return Err(HypervisorError::operation(
                format!("{operation:?}"),
                target,
                failure.message,
            ));
        }
        Ok(())
    }
}

/// Hypervisor backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryHypervisor {
    inner: Mutex<Inner>,
}

impl MemoryHypervisor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means another test thread panicked mid-call.
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Make the next `operation` on `target` fail once with `message`.
    pub fn fail_on(&self, operation: Operation, target: &str, message: &str) {
        self.lock().failures.push(InjectedFailure {
            operation,
            target: target.to_string(),
            message: message.to_string(),
        });
    }

    /// Make graceful shutdown requests for `domain` have no effect.
    pub fn ignore_graceful_shutdown(&self, domain: &str) {
        let mut inner = self.lock();
        if let Some(d) = inner.domains.get_mut(domain) {
            d.ignore_shutdown = true;
        }
        inner.stubborn.push(domain.to_string());
    }

    /// Calls made so far, as `"<Operation> <target>"` lines.
    #[must_use]
    pub fn journal(&self) -> Vec<String> {
        self.lock().journal.clone()
    }

    /// Definition a domain was created with.
    #[must_use]
    pub fn domain_spec(&self, name: &str) -> Option<DomainSpec> {
        self.lock().domains.get(name).map(|d| d.spec.clone())
    }

    /// Definition a network was created with, and whether it is active.
    #[must_use]
    pub fn network_spec(&self, name: &str) -> Option<(NetworkSpec, bool)> {
        self.lock()
            .networks
            .get(name)
            .map(|n| (n.spec.clone(), n.active))
    }

    /// Names of volumes currently in `pool`.
    #[must_use]
    pub fn volume_names(&self, pool: &str) -> Vec<String> {
        self.lock()
            .pools
            .get(pool)
            .map(|p| p.volumes.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Hypervisor for MemoryHypervisor {
    async fn connect(&self) -> Result<(), HypervisorError> {
        self.lock().check(Operation::Connect, "memory:///")
    }

    async fn define_domain(&self, spec: &DomainSpec) -> Result<String, HypervisorError> {
        let mut inner = self.lock();
        inner.check(Operation::DefineDomain, &spec.name)?;
        if inner.domains.contains_key(&spec.name) {
            return Err(HypervisorError::AlreadyExists {
                kind: ResourceKind::Domain,
                name: spec.name.clone(),
            });
        }
        let handle = spec.uuid.to_string();
        let ignore_shutdown = inner.stubborn.contains(&spec.name);
        inner.domains.insert(
            spec.name.clone(),
            Domain {
                handle: handle.clone(),
                spec: spec.clone(),
                state: VmState::Shutoff,
                ignore_shutdown,
            },
        );
        debug!(domain = %spec.name, "Defined in-memory domain");
        Ok(handle)
    }

    async fn lookup_domain(&self, name: &str) -> Result<Option<DomainInfo>, HypervisorError> {
        Ok(self.lock().domains.get(name).map(|d| DomainInfo {
            name: name.to_string(),
            handle: d.handle.clone(),
            state: d.state,
        }))
    }

    async fn domain_state(&self, name: &str) -> Result<VmState, HypervisorError> {
        self.lock()
            .domains
            .get(name)
            .map(|d| d.state)
            .ok_or_else(|| HypervisorError::not_found(ResourceKind::Domain, name))
    }

    async fn start_domain(&self, name: &str) -> Result<(), HypervisorError> {
        let mut inner = self.lock();
        inner.check(Operation::StartDomain, name)?;
        let domain = inner
            .domains
            .get_mut(name)
            .ok_or_else(|| HypervisorError::not_found(ResourceKind::Domain, name))?;
        domain.state = VmState::Running;
        Ok(())
    }

    async fn stop_domain(&self, name: &str, force: bool) -> Result<(), HypervisorError> {
        let mut inner = self.lock();
        inner.check(Operation::StopDomain, name)?;
        let domain = inner
            .domains
            .get_mut(name)
            .ok_or_else(|| HypervisorError::not_found(ResourceKind::Domain, name))?;
        if force || !domain.ignore_shutdown {
            domain.state = VmState::Shutoff;
        }
        Ok(())
    }

    async fn destroy_domain_definition(&self, name: &str) -> Result<(), HypervisorError> {
        let mut inner = self.lock();
        inner.check(Operation::UndefineDomain, name)?;
        inner
            .domains
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| HypervisorError::not_found(ResourceKind::Domain, name))
    }

    async fn domain_disks(&self, name: &str) -> Result<Vec<PathBuf>, HypervisorError> {
        self.lock()
            .domains
            .get(name)
            .map(|d| vec![d.spec.disk_path.clone()])
            .ok_or_else(|| HypervisorError::not_found(ResourceKind::Domain, name))
    }

    async fn list_domains(&self) -> Result<Vec<String>, HypervisorError> {
        Ok(self.lock().domains.keys().cloned().collect())
    }

    async fn define_network(&self, spec: &NetworkSpec) -> Result<String, HypervisorError> {
        let mut inner = self.lock();
        inner.check(Operation::DefineNetwork, &spec.name)?;
        if inner.networks.contains_key(&spec.name) {
            return Err(HypervisorError::AlreadyExists {
                kind: ResourceKind::Network,
                name: spec.name.clone(),
            });
        }
        inner.networks.insert(
            spec.name.clone(),
            Network {
                spec: spec.clone(),
                active: false,
            },
        );
        Ok(Uuid::new_v4().to_string())
    }

    async fn start_network(&self, name: &str) -> Result<(), HypervisorError> {
        let mut inner = self.lock();
        inner.check(Operation::StartNetwork, name)?;
        let network = inner
            .networks
            .get_mut(name)
            .ok_or_else(|| HypervisorError::not_found(ResourceKind::Network, name))?;
        network.active = true;
        Ok(())
    }

    async fn stop_network(&self, name: &str) -> Result<(), HypervisorError> {
        let mut inner = self.lock();
        let network = inner
            .networks
            .get_mut(name)
            .ok_or_else(|| HypervisorError::not_found(ResourceKind::Network, name))?;
        network.active = false;
        Ok(())
    }

    async fn undefine_network(&self, name: &str) -> Result<(), HypervisorError> {
        let mut inner = self.lock();
        inner.check(Operation::UndefineNetwork, name)?;
        inner
            .networks
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| HypervisorError::not_found(ResourceKind::Network, name))
    }

    async fn list_networks(&self) -> Result<Vec<String>, HypervisorError> {
        Ok(self.lock().networks.keys().cloned().collect())
    }

    async fn define_storage_pool(&self, spec: &PoolSpec) -> Result<String, HypervisorError> {
        let mut inner = self.lock();
        inner.check(Operation::DefinePool, &spec.name)?;
        if inner.pools.contains_key(&spec.name) {
            return Err(HypervisorError::AlreadyExists {
                kind: ResourceKind::StoragePool,
                name: spec.name.clone(),
            });
        }
        inner.pools.insert(
            spec.name.clone(),
            Pool {
                path: spec.path.clone(),
                volumes: BTreeMap::new(),
            },
        );
        Ok(Uuid::new_v4().to_string())
    }

    async fn storage_pool(&self, name: &str) -> Result<Option<PoolInfo>, HypervisorError> {
        Ok(self.lock().pools.get(name).map(|p| PoolInfo {
            name: name.to_string(),
            path: p.path.clone(),
        }))
    }

    async fn list_storage_pools(&self) -> Result<Vec<String>, HypervisorError> {
        Ok(self.lock().pools.keys().cloned().collect())
    }

    async fn destroy_storage_pool(&self, name: &str) -> Result<(), HypervisorError> {
        let mut inner = self.lock();
        inner.check(Operation::DestroyPool, name)?;
        inner
            .pools
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| HypervisorError::not_found(ResourceKind::StoragePool, name))
    }

    async fn create_volume(
        &self,
        pool: &str,
        spec: &VolumeSpec,
    ) -> Result<VolumeInfo, HypervisorError> {
        let mut inner = self.lock();
        inner.check(Operation::CreateVolume, &spec.name)?;
        let pool_entry = inner
            .pools
            .get_mut(pool)
            .ok_or_else(|| HypervisorError::not_found(ResourceKind::StoragePool, pool))?;
        if pool_entry.volumes.contains_key(&spec.name) {
            return Err(HypervisorError::AlreadyExists {
                kind: ResourceKind::Volume,
                name: spec.name.clone(),
            });
        }
        let (allocation_bytes, backing) = match &spec.source {
            VolumeSource::CopyOf(_) => (spec.capacity_bytes, None),
            VolumeSource::BackedBy(base) => (0, Some(base.clone())),
        };
        let info = VolumeInfo {
            name: spec.name.clone(),
            path: pool_entry.path.join(&spec.name),
            capacity_bytes: spec.capacity_bytes,
            allocation_bytes,
            backing,
        };
        pool_entry.volumes.insert(spec.name.clone(), info.clone());
        Ok(info)
    }

    async fn find_volume(
        &self,
        pool: &str,
        name: &str,
    ) -> Result<Option<VolumeInfo>, HypervisorError> {
        Ok(self
            .lock()
            .pools
            .get(pool)
            .and_then(|p| p.volumes.get(name).cloned()))
    }

    async fn list_volumes(&self, pool: &str) -> Result<Vec<VolumeInfo>, HypervisorError> {
        self.lock()
            .pools
            .get(pool)
            .map(|p| p.volumes.values().cloned().collect())
            .ok_or_else(|| HypervisorError::not_found(ResourceKind::StoragePool, pool))
    }

    async fn delete_volume(&self, pool: &str, name: &str) -> Result<(), HypervisorError> {
        let mut inner = self.lock();
        inner.check(Operation::DeleteVolume, name)?;
        let pool_entry = inner
            .pools
            .get_mut(pool)
            .ok_or_else(|| HypervisorError::not_found(ResourceKind::StoragePool, pool))?;
        pool_entry
            .volumes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| HypervisorError::not_found(ResourceKind::Volume, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::DomainTemplate;

    fn spec(name: &str) -> DomainSpec {
        DomainSpec {
            name: name.to_string(),
            uuid: Uuid::new_v4(),
            template: DomainTemplate::Compute,
            vcpus: 2,
            memory_gb: 4,
            disk_path: PathBuf::from(format!("/pool/{name}.qcow2")),
            network: "net".into(),
            mac_address: "52:54:00:00:00:01".into(),
            hostdevs: vec![],
        }
    }

    #[tokio::test]
    async fn test_domain_lifecycle() {
        let hv = MemoryHypervisor::new();
        let handle = hv.define_domain(&spec("vm1")).await.unwrap();
        assert_eq!(hv.domain_state("vm1").await.unwrap(), VmState::Shutoff);
        hv.start_domain("vm1").await.unwrap();
        assert_eq!(hv.domain_state("vm1").await.unwrap(), VmState::Running);
        let info = hv.lookup_domain("vm1").await.unwrap().unwrap();
        assert_eq!(info.handle, handle);
        hv.destroy_domain_definition("vm1").await.unwrap();
        assert!(hv.lookup_domain("vm1").await.unwrap().is_none());
        assert!(hv.domain_state("vm1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_injected_failure_fires_once() {
        let hv = MemoryHypervisor::new();
        hv.fail_on(Operation::DefineDomain, "vm1", "boom");
        let err = hv.define_domain(&spec("vm1")).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
        hv.define_domain(&spec("vm1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_stubborn_domain_ignores_graceful_stop() {
        let hv = MemoryHypervisor::new();
        hv.define_domain(&spec("vm1")).await.unwrap();
        hv.ignore_graceful_shutdown("vm1");
        hv.start_domain("vm1").await.unwrap();
        hv.stop_domain("vm1", false).await.unwrap();
        assert_eq!(hv.domain_state("vm1").await.unwrap(), VmState::Running);
        hv.stop_domain("vm1", true).await.unwrap();
        assert_eq!(hv.domain_state("vm1").await.unwrap(), VmState::Shutoff);
    }
}
