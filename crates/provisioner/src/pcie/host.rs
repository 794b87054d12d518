//! Read-only view of the host's kernel and PCI topology.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::PciAddress;

/// Host introspection used by the passthrough validator.
#[cfg_attr(test, mockall::automock)]
pub trait HostSystem: Send + Sync {
    /// Machine architecture, e.g. `x86_64`.
    fn architecture(&self) -> String;

    /// Whether `/dev/kvm` exists.
    fn kvm_device_present(&self) -> bool;

    /// Whether kernel module `name` is loaded or built in.
    fn module_loaded(&self, name: &str) -> io::Result<bool>;

    /// Contents of `/proc/cmdline`.
    fn kernel_cmdline(&self) -> io::Result<String>;

    /// Addresses of every PCI device on the host.
    fn pci_devices(&self) -> io::Result<Vec<String>>;

    fn pci_device_exists(&self, address: &PciAddress) -> bool;

    /// A sysfs attribute such as `class`, `vendor` or `device`, trimmed.
    fn pci_attribute(&self, address: &PciAddress, attribute: &str) -> io::Result<Option<String>>;

    /// Name of the bound driver, `None` if unbound.
    fn pci_driver(&self, address: &PciAddress) -> io::Result<Option<String>>;

    /// IOMMU group number, `None` if the device has no group.
    fn iommu_group(&self, address: &PciAddress) -> io::Result<Option<String>>;

    /// Addresses of every device in IOMMU group `group`.
    fn iommu_group_devices(&self, group: &str) -> io::Result<Vec<String>>;
}

/// [`HostSystem`] backed by `/proc`, `/sys` and `/dev` under a root directory.
///
/// The root is `/` on a real host; tests point it at a fake tree.
#[derive(Debug, Clone)]
pub struct SysfsHost {
    root: PathBuf,
    architecture: String,
}

impl Default for SysfsHost {
    fn default() -> Self {
        Self::new("/")
    }
}

impl SysfsHost {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            architecture: std::env::consts::ARCH.to_string(),
        }
    }

    /// Override the reported architecture.
    #[must_use]
    pub fn with_architecture(mut self, architecture: &str) -> Self {
        self.architecture = architecture.to_string();
        self
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    fn device_dir(&self, address: &PciAddress) -> PathBuf {
        self.path("sys/bus/pci/devices").join(address.as_str())
    }
}

/// Final path component of a symlink target, `None` if `link` does not exist.
fn link_name(link: &Path) -> io::Result<Option<String>> {
    match fs::read_link(link) {
        Ok(target) => Ok(target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn dir_names(dir: &Path) -> io::Result<Vec<String>> {
    let mut names: Vec<String> = fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    Ok(names)
}

impl HostSystem for SysfsHost {
    fn architecture(&self) -> String {
        self.architecture.clone()
    }

    fn kvm_device_present(&self) -> bool {
        self.path("dev/kvm").exists()
    }

    fn module_loaded(&self, name: &str) -> io::Result<bool> {
        let modules = match fs::read_to_string(self.path("proc/modules")) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e),
        };
        let listed = modules
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .any(|module| module == name);
        // Built-in modules never show up in /proc/modules.
        Ok(listed || self.path("sys/module").join(name).exists())
    }

    fn kernel_cmdline(&self) -> io::Result<String> {
        fs::read_to_string(self.path("proc/cmdline"))
    }

    fn pci_devices(&self) -> io::Result<Vec<String>> {
        dir_names(&self.path("sys/bus/pci/devices"))
    }

    fn pci_device_exists(&self, address: &PciAddress) -> bool {
        self.device_dir(address).exists()
    }

    fn pci_attribute(&self, address: &PciAddress, attribute: &str) -> io::Result<Option<String>> {
        match fs::read_to_string(self.device_dir(address).join(attribute)) {
            Ok(value) => Ok(Some(value.trim().to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn pci_driver(&self, address: &PciAddress) -> io::Result<Option<String>> {
        link_name(&self.device_dir(address).join("driver"))
    }

    fn iommu_group(&self, address: &PciAddress) -> io::Result<Option<String>> {
        link_name(&self.device_dir(address).join("iommu_group"))
    }

    fn iommu_group_devices(&self, group: &str) -> io::Result<Vec<String>> {
        dir_names(&self.path("sys/kernel/iommu_groups").join(group).join("devices"))
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::symlink;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_sysfs_reads_driver_and_group() {
        let root = TempDir::new().unwrap();
        let dev = root.path().join("sys/bus/pci/devices/0000:01:00.0");
        fs::create_dir_all(&dev).unwrap();
        fs::write(dev.join("class"), "0x030000\n").unwrap();
        symlink("../../../bus/pci/drivers/vfio-pci", dev.join("driver")).unwrap();
        symlink("../../../kernel/iommu_groups/7", dev.join("iommu_group")).unwrap();
        let group = root.path().join("sys/kernel/iommu_groups/7/devices");
        fs::create_dir_all(&group).unwrap();
        symlink(&dev, group.join("0000:01:00.0")).unwrap();

        let host = SysfsHost::new(root.path());
        let addr = PciAddress::parse("0000:01:00.0").unwrap();
        assert!(host.pci_device_exists(&addr));
        assert_eq!(host.pci_driver(&addr).unwrap().as_deref(), Some("vfio-pci"));
        assert_eq!(host.iommu_group(&addr).unwrap().as_deref(), Some("7"));
        assert_eq!(host.iommu_group_devices("7").unwrap(), vec!["0000:01:00.0"]);
        assert_eq!(
            host.pci_attribute(&addr, "class").unwrap().as_deref(),
            Some("0x030000")
        );
        assert_eq!(host.pci_attribute(&addr, "vendor").unwrap(), None);
    }

    #[test]
    fn test_unbound_device_has_no_driver() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("sys/bus/pci/devices/0000:02:00.0")).unwrap();
        let host = SysfsHost::new(root.path());
        let addr = PciAddress::parse("0000:02:00.0").unwrap();
        assert_eq!(host.pci_driver(&addr).unwrap(), None);
        assert_eq!(host.iommu_group(&addr).unwrap(), None);
    }

    #[test]
    fn test_module_loaded_checks_proc_and_builtin() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("proc")).unwrap();
        fs::write(
            root.path().join("proc/modules"),
            "vfio_pci 16384 0 - Live 0x0\nkvm_intel 372736 0 - Live 0x0\n",
        )
        .unwrap();
        fs::create_dir_all(root.path().join("sys/module/vfio")).unwrap();

        let host = SysfsHost::new(root.path());
        assert!(host.module_loaded("vfio_pci").unwrap());
        assert!(host.module_loaded("vfio").unwrap());
        assert!(!host.module_loaded("kvm").unwrap());
        assert!(!host.module_loaded("vfio_iommu_type1").unwrap());
    }
}
