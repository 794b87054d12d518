//! Durable per-cluster state.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::atomic::{read_json, write_json_atomic};
use super::models::{ClusterKind, ClusterState, NetworkConfig, StoragePoolRecord, VmRecord};
use crate::error::{ClusterError, PersistenceError};
use crate::hypervisor::VmState;

/// File name of a cluster's state document.
pub const STATE_FILE: &str = "state.json";

/// Default number of rotated backups kept next to a state file.
pub const DEFAULT_MAX_BACKUPS: usize = 5;

/// Cached, explicitly-committed cluster state.
///
/// Mutations only touch the in-memory copy and mark it dirty; nothing reaches
/// disk until [`ClusterStateStore::save`] is called.
#[derive(Debug)]
pub struct ClusterStateStore {
    path: PathBuf,
    max_backups: usize,
    cache: Option<ClusterState>,
    dirty: bool,
}

impl ClusterStateStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_backups: DEFAULT_MAX_BACKUPS,
            cache: None,
            dirty: false,
        }
    }

    /// Store at `<state_dir>/<cluster>/state.json`.
    #[must_use]
    pub fn for_cluster(state_dir: &Path, cluster_name: &str) -> Self {
        Self::new(state_dir.join(cluster_name).join(STATE_FILE))
    }

    #[must_use]
    pub fn with_max_backups(mut self, max_backups: usize) -> Self {
        self.max_backups = max_backups;
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// The cached state, if loaded or created.
    #[must_use]
    pub fn state(&self) -> Option<&ClusterState> {
        self.cache.as_ref()
    }

    /// Read the state document from disk, replacing the cache.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(&mut self) -> Result<Option<ClusterState>, PersistenceError> {
        let state: Option<ClusterState> = read_json(&self.path)?;
        if state.is_some() {
            debug!(path = %self.path.display(), "Loaded cluster state");
        }
        self.cache.clone_from(&state);
        self.dirty = false;
        Ok(state)
    }

    /// Load existing state or start an empty one (not yet written).
    ///
    /// # Errors
    /// Returns a persistence error for unreadable state, or a configuration
    /// error if the stored cluster is of a different kind.
    pub fn ensure(
        &mut self,
        cluster_name: &str,
        kind: ClusterKind,
    ) -> Result<&mut ClusterState, ClusterError> {
        if self.cache.is_none() && self.load()?.is_none() {
            info!(cluster = %cluster_name, kind = %kind, "Creating new cluster state");
            self.cache = Some(ClusterState::new(cluster_name, kind));
            self.dirty = true;
        }
        let state = self.cached_mut()?;
        if state.cluster_type != kind {
            return Err(ClusterError::Configuration(format!(
                "cluster '{}' is recorded as {}, not {kind}",
                state.cluster_name, state.cluster_type
            )));
        }
        Ok(state)
    }

    /// Write the cached state. A store with nothing cached writes nothing.
    ///
    /// # Errors
    /// Returns an error if the document cannot be written.
    pub fn save(&mut self) -> Result<(), PersistenceError> {
        let Some(state) = self.cache.as_mut() else {
            return Ok(());
        };
        state.touch();
        write_json_atomic(&self.path, state, self.max_backups)?;
        self.dirty = false;
        info!(
            cluster = %state.cluster_name,
            path = %self.path.display(),
            vms = state.all_vms().len(),
            "Saved cluster state"
        );
        Ok(())
    }

    /// Replace the cache with `state` and write it.
    ///
    /// # Errors
    /// Returns an error if the document cannot be written.
    pub fn save_state(&mut self, state: ClusterState) -> Result<(), PersistenceError> {
        self.cache = Some(state);
        self.save()
    }

    /// Drop uncommitted changes.
    pub fn discard(&mut self) {
        self.cache = None;
        self.dirty = false;
    }

    /// Delete the state document. Returns `false` if there was none.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be removed.
    pub fn clear(&mut self) -> Result<bool, PersistenceError> {
        self.discard();
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "Cleared cluster state");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(PersistenceError::io(&self.path, e)),
        }
    }

    fn cached_mut(&mut self) -> Result<&mut ClusterState, ClusterError> {
        self.cache.as_mut().ok_or_else(|| {
            ClusterError::Configuration("cluster state has not been loaded".to_string())
        })
    }

    /// Record a new VM.
    ///
    /// # Errors
    /// Fails if no state is cached or the name is taken.
    pub fn add_vm(&mut self, vm: VmRecord) -> Result<(), ClusterError> {
        self.cached_mut()?.add_vm(vm)?;
        self.dirty = true;
        Ok(())
    }

    /// Forget a VM. Returns the removed record.
    ///
    /// # Errors
    /// Fails if no state is cached.
    pub fn remove_vm(&mut self, name: &str) -> Result<Option<VmRecord>, ClusterError> {
        let removed = self.cached_mut()?.remove_vm(name);
        if removed.is_some() {
            self.dirty = true;
        }
        Ok(removed)
    }

    /// Update the recorded lifecycle state of a VM. Returns `false` if the VM
    /// is unknown.
    ///
    /// # Errors
    /// Fails if no state is cached.
    pub fn update_vm_state(&mut self, name: &str, state: VmState) -> Result<bool, ClusterError> {
        let cluster = self.cached_mut()?;
        let Some(vm) = cluster.vm_mut(name) else {
            return Ok(false);
        };
        vm.state = state;
        vm.last_modified = chrono::Utc::now();
        cluster.touch();
        self.dirty = true;
        Ok(true)
    }

    /// # Errors
    /// Fails if no state is cached.
    pub fn set_network_config(&mut self, config: NetworkConfig) -> Result<(), ClusterError> {
        let cluster = self.cached_mut()?;
        cluster.network_config = Some(config);
        cluster.touch();
        self.dirty = true;
        Ok(())
    }

    /// # Errors
    /// Fails if no state is cached.
    pub fn set_storage_pool(&mut self, pool: StoragePoolRecord) -> Result<(), ClusterError> {
        let cluster = self.cached_mut()?;
        cluster.storage_pool = Some(pool);
        cluster.touch();
        self.dirty = true;
        Ok(())
    }

    /// # Errors
    /// Fails if no state is cached.
    pub fn set_config_file_path(&mut self, path: &Path) -> Result<(), ClusterError> {
        self.cached_mut()?.config_file_path = Some(path.to_path_buf());
        self.dirty = true;
        Ok(())
    }
}
