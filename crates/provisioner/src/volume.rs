//! Per-cluster storage pools and copy-on-write VM disks.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::ClusterError;
use crate::hypervisor::{Hypervisor, PoolSpec, VolumeInfo, VolumeSource, VolumeSpec};
use crate::state::{StoragePoolRecord, VmRole, VolumeRecord};

const GIB: u64 = 1024 * 1024 * 1024;

#[must_use]
pub fn pool_name(cluster: &str) -> String {
    format!("{cluster}-pool")
}

#[must_use]
pub fn base_volume_name(cluster: &str) -> String {
    format!("{cluster}-base.qcow2")
}

#[must_use]
pub fn vm_volume_name(vm: &str) -> String {
    format!("{vm}.qcow2")
}

/// A cluster storage pool known to the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolRef {
    pub name: String,
    pub path: PathBuf,
    /// Path of the imported base image inside the pool.
    pub base_volume: PathBuf,
    /// `false` when the pool already existed.
    pub created: bool,
}

impl PoolRef {
    #[must_use]
    pub fn record(&self, base_image: &Path) -> StoragePoolRecord {
        StoragePoolRecord {
            name: self.name.clone(),
            path: self.path.clone(),
            base_image: base_image.to_path_buf(),
            volumes: Vec::new(),
        }
    }
}

fn volume_record(info: &VolumeInfo, capacity_gb: u64) -> VolumeRecord {
    VolumeRecord {
        name: info.name.clone(),
        path: info.path.clone(),
        capacity_gb,
        allocated_gb: info.allocation_bytes.div_ceil(GIB),
        format: "qcow2".to_string(),
        backing_image: info.backing.clone(),
    }
}

/// Creates and removes pools and volumes through the hypervisor.
pub struct VolumeAllocator {
    hypervisor: Arc<dyn Hypervisor>,
}

impl VolumeAllocator {
    #[must_use]
    pub fn new(hypervisor: Arc<dyn Hypervisor>) -> Self {
        Self { hypervisor }
    }

    /// Create the pool of `cluster` under `host_root` and import
    /// `base_image` into it. Idempotent: an existing pool is returned with
    /// `created == false`, importing the base image if it is missing.
    ///
    /// # Errors
    /// Returns a configuration error if the base image is not a file, or
    /// the hypervisor failure. A pool defined by this call is removed again
    /// if the import fails; a failed removal comes back as
    /// [`ClusterError::Incomplete`].
    pub async fn create_pool(
        &self,
        cluster: &str,
        host_root: &Path,
        base_image: &Path,
    ) -> Result<PoolRef, ClusterError> {
        let name = pool_name(cluster);

        if let Some(existing) = self.hypervisor.storage_pool(&name).await? {
            info!(cluster = %cluster, pool = %name, "Storage pool already exists");
            let base = self.ensure_base_volume(cluster, base_image).await?;
            return Ok(PoolRef {
                name,
                path: existing.path,
                base_volume: base.path,
                created: false,
            });
        }

        if !base_image.is_file() {
            return Err(ClusterError::Configuration(format!(
                "base image {} does not exist",
                base_image.display()
            )));
        }

        let path = host_root.join(cluster);
        self.hypervisor
            .define_storage_pool(&PoolSpec {
                name: name.clone(),
                path: path.clone(),
            })
            .await?;

        let base = match self.ensure_base_volume(cluster, base_image).await {
            Ok(base) => base,
            Err(e) => {
                warn!(cluster = %cluster, error = %e, "Base image import failed, removing pool");
                if let Err(undo) = self.hypervisor.destroy_storage_pool(&name).await {
                    warn!(cluster = %cluster, pool = %name, error = %undo, "Failed to remove storage pool");
                    return Err(e.with_cleanup_failures(vec![format!(
                        "destroy storage pool {name}: {undo}"
                    )]));
                }
                return Err(e);
            }
        };

        info!(cluster = %cluster, pool = %name, path = %path.display(), "Created storage pool");
        Ok(PoolRef {
            name,
            path,
            base_volume: base.path,
            created: true,
        })
    }

    async fn ensure_base_volume(
        &self,
        cluster: &str,
        base_image: &Path,
    ) -> Result<VolumeInfo, ClusterError> {
        let pool = pool_name(cluster);
        let name = base_volume_name(cluster);
        if let Some(info) = self.hypervisor.find_volume(&pool, &name).await? {
            return Ok(info);
        }
        let capacity_bytes = std::fs::metadata(base_image)
            .map(|m| m.len())
            .map_err(|e| {
                ClusterError::Configuration(format!(
                    "cannot read base image {}: {e}",
                    base_image.display()
                ))
            })?;
        debug!(cluster = %cluster, image = %base_image.display(), "Importing base image");
        let info = self
            .hypervisor
            .create_volume(
                &pool,
                &VolumeSpec {
                    name,
                    capacity_bytes,
                    format: "qcow2".to_string(),
                    source: VolumeSource::CopyOf(base_image.to_path_buf()),
                },
            )
            .await?;
        Ok(info)
    }

    /// Copy-on-write disk for `vm` on top of the pool's base image.
    /// Idempotent by name: an existing volume is returned with `false`.
    ///
    /// # Errors
    /// Returns a configuration error if the pool has no base image, or the
    /// hypervisor failure.
    pub async fn create_vm_volume(
        &self,
        cluster: &str,
        vm: &str,
        size_gb: u64,
        role: VmRole,
    ) -> Result<(VolumeRecord, bool), ClusterError> {
        let pool = pool_name(cluster);
        let name = vm_volume_name(vm);

        if let Some(existing) = self.hypervisor.find_volume(&pool, &name).await? {
            debug!(cluster = %cluster, vm = %vm, "Volume already exists");
            let capacity_gb = existing.capacity_bytes.div_ceil(GIB).max(size_gb);
            return Ok((volume_record(&existing, capacity_gb), false));
        }

        let base = self
            .hypervisor
            .find_volume(&pool, &base_volume_name(cluster))
            .await?
            .ok_or_else(|| {
                ClusterError::Configuration(format!(
                    "storage pool {pool} has no base image volume"
                ))
            })?;

        let info = self
            .hypervisor
            .create_volume(
                &pool,
                &VolumeSpec {
                    name,
                    capacity_bytes: size_gb * GIB,
                    format: "qcow2".to_string(),
                    source: VolumeSource::BackedBy(base.path),
                },
            )
            .await?;
        info!(
            cluster = %cluster,
            vm = %vm,
            role = ?role,
            size_gb,
            path = %info.path.display(),
            "Created VM volume"
        );
        Ok((volume_record(&info, size_gb), true))
    }

    /// Delete the disk of `vm`. Returns `false` if it did not exist.
    ///
    /// # Errors
    /// Returns the hypervisor failure.
    pub async fn destroy_vm_volume(&self, cluster: &str, vm: &str) -> Result<bool, ClusterError> {
        let name = vm_volume_name(vm);
        match self.hypervisor.delete_volume(&pool_name(cluster), &name).await {
            Ok(()) => {
                info!(cluster = %cluster, vm = %vm, "Deleted VM volume");
                Ok(true)
            }
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the pool of `cluster`. With `force` every volume is deleted
    /// first; without it the image files stay on disk. Returns `false` if
    /// the pool did not exist.
    ///
    /// # Errors
    /// Returns the first hypervisor failure.
    pub async fn destroy_pool(&self, cluster: &str, force: bool) -> Result<bool, ClusterError> {
        let name = pool_name(cluster);
        if self.hypervisor.storage_pool(&name).await?.is_none() {
            debug!(cluster = %cluster, pool = %name, "Storage pool not found");
            return Ok(false);
        }

        if force {
            for volume in self.hypervisor.list_volumes(&name).await? {
                match self.hypervisor.delete_volume(&name, &volume.name).await {
                    Ok(()) => debug!(pool = %name, volume = %volume.name, "Deleted volume"),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        match self.hypervisor.destroy_storage_pool(&name).await {
            Ok(()) => {
                info!(cluster = %cluster, pool = %name, force, "Destroyed storage pool");
                Ok(true)
            }
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Check that the filesystem holding `pool_root` has `required_gb` free.
    ///
    /// Walks up to the nearest existing directory. If free space cannot be
    /// determined the check is skipped with a warning.
    ///
    /// # Errors
    /// Returns `ResourceExhausted` when there is not enough space.
    pub fn validate_pool_space(pool_root: &Path, required_gb: u64) -> Result<(), ClusterError> {
        let Some(existing) = pool_root.ancestors().find(|p| p.exists()) else {
            warn!(path = %pool_root.display(), "Storage path does not exist, skipping space check");
            return Ok(());
        };
        let stat = match nix::sys::statvfs::statvfs(existing) {
            Ok(stat) => stat,
            Err(e) => {
                warn!(path = %existing.display(), error = %e, "Could not verify storage space");
                return Ok(());
            }
        };
        #[allow(clippy::useless_conversion)]
        let available = u64::from(stat.blocks_available()) * u64::from(stat.fragment_size());
        let available_gb = available / GIB;
        debug!(path = %existing.display(), available_gb, required_gb, "Checked storage space");
        if available_gb < required_gb {
            return Err(ClusterError::ResourceExhausted(format!(
                "Insufficient storage space in {}: need {required_gb}GB, have {available_gb}GB",
                existing.display()
            )));
        }
        Ok(())
    }
}
