//! Host-wide GPU ownership record.
//!
//! A physical GPU (identified by PCI address) may be owned by at most one VM
//! across every cluster on the host. Ownership lives in a single JSON
//! document shared by all orchestrator instances:
//!
//! ```json
//! {"shared_resources": {"gpu_allocations": {"0000:01:00.0": "hpc-compute-01"},
//!                       "last_updated": "2026-01-01T00:00:00Z"}}
//! ```
//!
//! Every call is one read-modify-write performed under an exclusive
//! advisory `flock` on a sibling `.lock` file, so two processes allocating
//! concurrently cannot lose each other's update.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::Utc;
use nix::fcntl::{Flock, FlockArg};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ClusterError, PersistenceError};
use crate::pcie::PciAddress;
use crate::state::GpuAssignment;
use crate::state::atomic::{read_json, write_json_atomic};

static VENDOR_DEVICE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\(([0-9a-fA-F]{4}):([0-9a-fA-F]{4})\)").expect("vendor:device pattern is valid")
});

/// File name of the shared record inside the state directory.
pub const GLOBAL_STATE_FILE: &str = "global-state.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct GlobalState {
    #[serde(default)]
    shared_resources: SharedResources,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SharedResources {
    #[serde(default)]
    gpu_allocations: BTreeMap<PciAddress, String>,
    #[serde(default)]
    last_updated: Option<String>,
}

/// Tracks which VM owns which physical GPU.
#[derive(Debug, Clone)]
pub struct GpuAllocator {
    path: PathBuf,
    lock_path: PathBuf,
    max_backups: usize,
}

impl GpuAllocator {
    /// Allocator backed by the record at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_path = path.as_os_str().to_owned();
        lock_path.push(".lock");
        Self {
            path,
            lock_path: PathBuf::from(lock_path),
            max_backups: 5,
        }
    }

    /// Allocator for the shared record inside `state_dir`.
    #[must_use]
    pub fn in_state_dir(state_dir: &Path) -> Self {
        Self::new(state_dir.join(GLOBAL_STATE_FILE))
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

    fn lock(&self, arg: FlockArg) -> Result<Flock<File>, PersistenceError> {
        if let Some(dir) = self.lock_path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| PersistenceError::io(dir, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .map_err(|e| PersistenceError::io(&self.lock_path, e))?;
        Flock::lock(file, arg).map_err(|(_, source)| PersistenceError::Lock {
            path: self.lock_path.clone(),
            source,
        })
    }

    fn read(&self) -> Result<GlobalState, PersistenceError> {
        Ok(read_json(&self.path)?.unwrap_or_default())
    }

    /// Run `f` on the record under an exclusive lock; write it back if `f`
    /// reports a change.
    fn modify<T>(
        &self,
        f: impl FnOnce(&mut BTreeMap<PciAddress, String>) -> (T, bool),
    ) -> Result<T, PersistenceError> {
        let _guard = self.lock(FlockArg::LockExclusive)?;
        let mut state = self.read()?;
        let (result, changed) = f(&mut state.shared_resources.gpu_allocations);
        if changed {
            state.shared_resources.last_updated = Some(Utc::now().to_rfc3339());
            write_json_atomic(&self.path, &state, self.max_backups)?;
        }
        Ok(result)
    }

    fn snapshot(&self) -> Result<BTreeMap<PciAddress, String>, PersistenceError> {
        let _guard = self.lock(FlockArg::LockShared)?;
        Ok(self.read()?.shared_resources.gpu_allocations)
    }

    /// Assign `pci` to `owner`.
    ///
    /// Returns `true` if the GPU was free or already owned by `owner`, and
    /// `false` (leaving ownership unchanged) if another owner holds it.
    ///
    /// # Errors
    /// Returns an error if the record cannot be locked, read or written.
    pub fn allocate(&self, pci: &PciAddress, owner: &str) -> Result<bool, PersistenceError> {
        self.modify(|allocations| match allocations.get(pci) {
            Some(current) if current == owner => (true, false),
            Some(current) => {
                warn!(pci = %pci, owner = %owner, current = %current, "GPU already allocated");
                (false, false)
            }
            None => {
                allocations.insert(pci.clone(), owner.to_string());
                info!(pci = %pci, owner = %owner, "Allocated GPU");
                (true, true)
            }
        })
    }

    /// Release `pci`. Returns `false` if it was not allocated.
    ///
    /// # Errors
    /// Returns an error if the record cannot be locked, read or written.
    pub fn release(&self, pci: &PciAddress) -> Result<bool, PersistenceError> {
        self.modify(|allocations| match allocations.remove(pci) {
            Some(owner) => {
                info!(pci = %pci, owner = %owner, "Released GPU");
                (true, true)
            }
            None => (false, false),
        })
    }

    /// Release every GPU held by `owner`, returning the released addresses.
    ///
    /// # Errors
    /// Returns an error if the record cannot be locked, read or written.
    pub fn release_owned_by(&self, owner: &str) -> Result<Vec<PciAddress>, PersistenceError> {
        self.modify(|allocations| {
            let released: Vec<PciAddress> = allocations
                .iter()
                .filter(|(_, o)| o.as_str() == owner)
                .map(|(pci, _)| pci.clone())
                .collect();
            for pci in &released {
                allocations.remove(pci);
                info!(pci = %pci, owner = %owner, "Released GPU");
            }
            let changed = !released.is_empty();
            (released, changed)
        })
    }

    /// Whether `owner` may use `pci` (free, or already theirs).
    ///
    /// # Errors
    /// Returns an error if the record cannot be locked or read.
    pub fn is_available(&self, pci: &PciAddress, owner: &str) -> Result<bool, PersistenceError> {
        Ok(self
            .snapshot()?
            .get(pci)
            .is_none_or(|current| current == owner))
    }

    /// Current owner of `pci`, if any.
    ///
    /// # Errors
    /// Returns an error if the record cannot be locked or read.
    pub fn owner(&self, pci: &PciAddress) -> Result<Option<String>, PersistenceError> {
        Ok(self.snapshot()?.get(pci).cloned())
    }

    /// All current allocations.
    ///
    /// # Errors
    /// Returns an error if the record cannot be locked or read.
    pub fn allocations(&self) -> Result<BTreeMap<PciAddress, String>, PersistenceError> {
        self.snapshot()
    }

    /// Check a batch of GPUs for `owner` without allocating any of them.
    ///
    /// Returns `(true, None)` if every address is usable, otherwise `false`
    /// and a message naming the first conflicting address and its owner.
    ///
    /// # Errors
    /// Returns an error if the record cannot be locked or read.
    pub fn validate_all(
        &self,
        required: &[PciAddress],
        owner: &str,
    ) -> Result<(bool, Option<String>), PersistenceError> {
        let allocations = self.snapshot()?;
        for pci in required {
            if let Some(current) = allocations.get(pci) {
                if current != owner {
                    return Ok((
                        false,
                        Some(format!("GPU {pci} is currently allocated to '{current}'")),
                    ));
                }
            }
        }
        Ok((true, None))
    }
}

/// Parse an `lspci`-style GPU descriptor such as
/// `0000:01:00.0 (10de:2204) NVIDIA RTX A6000`.
///
/// The vendor/device pair is optional.
///
/// # Errors
/// Returns a configuration error if the leading PCI address is invalid.
pub fn parse_gpu_descriptor(descriptor: &str) -> Result<GpuAssignment, ClusterError> {
    let pci_address = PciAddress::from_descriptor(descriptor)?;
    let ids = VENDOR_DEVICE.captures(descriptor);
    let id = |i: usize| {
        ids.as_ref()
            .and_then(|c| c.get(i))
            .map(|m| m.as_str().to_lowercase())
    };
    Ok(GpuAssignment {
        pci_address,
        vendor_id: id(1),
        device_id: id(2),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};

    use tempfile::TempDir;

    use super::*;

    fn pci(s: &str) -> PciAddress {
        PciAddress::parse(s).unwrap()
    }

    fn allocator(dir: &TempDir) -> GpuAllocator {
        GpuAllocator::in_state_dir(dir.path())
    }

    #[test]
    fn test_allocation_is_mutually_exclusive() {
        let dir = TempDir::new().unwrap();
        let gpus = allocator(&dir);
        let gpu = pci("0000:01:00.0");

        assert!(gpus.allocate(&gpu, "A").unwrap());
        assert!(!gpus.allocate(&gpu, "B").unwrap());
        assert_eq!(gpus.owner(&gpu).unwrap().as_deref(), Some("A"));
        assert!(gpus.allocate(&gpu, "A").unwrap());
    }

    #[test]
    fn test_release() {
        let dir = TempDir::new().unwrap();
        let gpus = allocator(&dir);
        let gpu = pci("0000:01:00.0");

        assert!(!gpus.release(&gpu).unwrap());
        gpus.allocate(&gpu, "A").unwrap();
        assert!(gpus.release(&gpu).unwrap());
        assert!(gpus.allocate(&gpu, "B").unwrap());
        assert_eq!(gpus.owner(&gpu).unwrap().as_deref(), Some("B"));
    }

    #[test]
    fn test_is_available() {
        let dir = TempDir::new().unwrap();
        let gpus = allocator(&dir);
        let gpu = pci("0000:01:00.0");
        assert!(gpus.is_available(&gpu, "A").unwrap());
        gpus.allocate(&gpu, "A").unwrap();
        assert!(gpus.is_available(&gpu, "A").unwrap());
        assert!(!gpus.is_available(&gpu, "B").unwrap());
    }

    #[test]
    fn test_validate_all_reports_first_conflict() {
        let dir = TempDir::new().unwrap();
        let gpus = allocator(&dir);
        gpus.allocate(&pci("0000:01:00.0"), "D").unwrap();

        let (ok, message) = gpus
            .validate_all(&[pci("0000:01:00.0"), pci("0000:02:00.0")], "C")
            .unwrap();
        assert!(!ok);
        let message = message.unwrap();
        assert!(message.contains("0000:01:00.0"));
        assert!(message.contains("'D'"));

        // Nothing was allocated by the check.
        assert!(gpus.owner(&pci("0000:02:00.0")).unwrap().is_none());
        assert_eq!(gpus.validate_all(&[pci("0000:01:00.0")], "D").unwrap(), (true, None));
    }

    #[test]
    fn test_record_layout_is_shared() {
        let dir = TempDir::new().unwrap();
        let gpus = allocator(&dir);
        gpus.allocate(&pci("0000:01:00.0"), "hpc-compute-02").unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(gpus.path()).unwrap()).unwrap();
        assert_eq!(
            raw["shared_resources"]["gpu_allocations"]["0000:01:00.0"],
            "hpc-compute-02"
        );
        assert!(raw["shared_resources"]["last_updated"].is_string());

        // A second allocator on the same file sees the allocation.
        let other = GpuAllocator::new(gpus.path());
        assert!(!other.allocate(&pci("0000:01:00.0"), "cloud-gpu-worker-01").unwrap());
    }

    #[test]
    fn test_release_owned_by() {
        let dir = TempDir::new().unwrap();
        let gpus = allocator(&dir);
        gpus.allocate(&pci("0000:01:00.0"), "vm-a").unwrap();
        gpus.allocate(&pci("0000:02:00.0"), "vm-a").unwrap();
        gpus.allocate(&pci("0000:03:00.0"), "vm-b").unwrap();

        let released = gpus.release_owned_by("vm-a").unwrap();
        assert_eq!(released, vec![pci("0000:01:00.0"), pci("0000:02:00.0")]);
        assert_eq!(gpus.allocations().unwrap().len(), 1);
    }

    #[test]
    fn test_concurrent_allocation_has_one_winner() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(GLOBAL_STATE_FILE);
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let path = path.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let gpus = GpuAllocator::new(path);
                    barrier.wait();
                    gpus.allocate(&pci("0000:01:00.0"), &format!("owner-{i}")).unwrap()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_corrupt_record_is_not_discarded() {
        let dir = TempDir::new().unwrap();
        let gpus = allocator(&dir);
        std::fs::write(gpus.path(), "garbage").unwrap();
        assert!(matches!(
            gpus.allocate(&pci("0000:01:00.0"), "A"),
            Err(PersistenceError::Corrupt { .. })
        ));
        assert_eq!(std::fs::read_to_string(gpus.path()).unwrap(), "garbage");
    }

    #[test]
    fn test_parse_gpu_descriptor() {
        let gpu = parse_gpu_descriptor("0000:01:00.0 (10DE:2204) NVIDIA RTX A6000").unwrap();
        assert_eq!(gpu.pci_address, pci("0000:01:00.0"));
        assert_eq!(gpu.vendor_id.as_deref(), Some("10de"));
        assert_eq!(gpu.device_id.as_deref(), Some("2204"));

        let bare = parse_gpu_descriptor("0000:02:00.0").unwrap();
        assert_eq!(bare.vendor_id, None);
        assert!(parse_gpu_descriptor("NVIDIA RTX A6000").is_err());
    }
}
