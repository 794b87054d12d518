//! PCIe passthrough readiness checks.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use super::host::HostSystem;
use super::{is_valid_pci_address, PciAddress};

/// Drivers that must not hold a passthrough device or any of its IOMMU group siblings.
pub const CONFLICTING_DRIVERS: &[&str] = &["nvidia", "nouveau", "radeon", "amdgpu", "snd_hda_intel"];

/// Kernel modules VFIO passthrough depends on.
pub const REQUIRED_VFIO_MODULES: &[&str] = &["vfio", "vfio_iommu_type1", "vfio_pci"];

/// Kernel command line parameters that turn the IOMMU on.
pub const IOMMU_PARAMETERS: &[&str] = &["intel_iommu=on", "amd_iommu=on", "iommu=pt", "iommu=on"];

/// The check that rejected a device or host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationCheck {
    Architecture,
    KvmDevice,
    KvmModule,
    IommuEnabled,
    VfioModules,
    AddressSyntax,
    DeviceExists,
    IommuGroup,
    GroupIsolation,
    ConflictingDriver,
    VfioBinding,
    HostIntrospection,
}

impl fmt::Display for ValidationCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Architecture => "architecture",
            Self::KvmDevice => "kvm_device",
            Self::KvmModule => "kvm_module",
            Self::IommuEnabled => "iommu_enabled",
            Self::VfioModules => "vfio_modules",
            Self::AddressSyntax => "address_syntax",
            Self::DeviceExists => "device_exists",
            Self::IommuGroup => "iommu_group",
            Self::GroupIsolation => "group_isolation",
            Self::ConflictingDriver => "conflicting_driver",
            Self::VfioBinding => "vfio_binding",
            Self::HostIntrospection => "host_introspection",
        };
        f.write_str(name)
    }
}

/// A device in an IOMMU group and the driver it is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupMember {
    pub address: String,
    pub driver: Option<String>,
}

/// Structured passthrough validation failure.
///
/// Carries the raw facts a presentation layer needs for remediation advice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    pub check: ValidationCheck,
    pub device: Option<String>,
    pub current_driver: Option<String>,
    pub iommu_group: Option<String>,
    pub group_members: Vec<GroupMember>,
    /// Members (possibly including the device) bound to a conflicting driver.
    pub conflicting: Vec<GroupMember>,
    pub detail: String,
}

impl ValidationError {
    fn new(check: ValidationCheck, detail: impl Into<String>) -> Self {
        Self {
            check,
            device: None,
            current_driver: None,
            iommu_group: None,
            group_members: Vec::new(),
            conflicting: Vec::new(),
            detail: detail.into(),
        }
    }

    fn device(mut self, device: &str) -> Self {
        self.device = Some(device.to_string());
        self
    }

    fn driver(mut self, driver: Option<String>) -> Self {
        self.current_driver = driver;
        self
    }

    fn introspection(device: Option<&str>, what: &str, e: &std::io::Error) -> Self {
        let mut err = Self::new(ValidationCheck::HostIntrospection, format!("failed to read {what}: {e}"));
        err.device = device.map(ToString::to_string);
        err
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PCIe validation failed ({})", self.check)?;
        if let Some(device) = &self.device {
            write!(f, " for {device}")?;
        }
        write!(f, ": {}", self.detail)
    }
}

impl std::error::Error for ValidationError {}

/// Live snapshot of one PCI device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PcieDevice {
    pub pci_address: PciAddress,
    pub vendor_id: Option<String>,
    pub device_id: Option<String>,
    /// Four hex digits of class and subclass, e.g. `0300`.
    pub device_class: Option<String>,
    pub current_driver: Option<String>,
    pub iommu_group: Option<String>,
    pub is_vfio_bound: bool,
    pub is_conflicting_driver: bool,
}

impl PcieDevice {
    /// Coarse device type derived from the PCI base class.
    #[must_use]
    pub fn class_name(&self) -> &'static str {
        match self.device_class.as_deref().map(|c| c.get(..2).unwrap_or("")) {
            Some("03") => "gpu",
            Some("02") => "network",
            Some("01") => "storage",
            Some("04") => "audio",
            Some("06") => "bridge",
            _ => "other",
        }
    }
}

/// Strip `0x` and keep the hex digits of a sysfs id attribute.
fn hex_id(raw: Option<String>, digits: usize) -> Option<String> {
    raw.map(|v| {
        let v = v.trim_start_matches("0x");
        v.get(..digits).unwrap_or(v).to_lowercase()
    })
}

/// Validates host and per-device readiness for VFIO passthrough.
#[derive(Clone)]
pub struct PcieValidator {
    host: Arc<dyn HostSystem>,
    conflicting_drivers: Vec<String>,
}

impl PcieValidator {
    #[must_use]
    pub fn new(host: Arc<dyn HostSystem>) -> Self {
        Self {
            host,
            conflicting_drivers: CONFLICTING_DRIVERS.iter().map(ToString::to_string).collect(),
        }
    }

    /// Replace the conflicting-driver list.
    #[must_use]
    pub fn with_conflicting_drivers(mut self, drivers: &[&str]) -> Self {
        self.conflicting_drivers = drivers.iter().map(ToString::to_string).collect();
        self
    }

    #[must_use]
    pub fn is_conflicting_driver(&self, driver: &str) -> bool {
        self.conflicting_drivers.iter().any(|c| driver.contains(c.as_str()))
    }

    fn is_vfio(driver: Option<&str>) -> bool {
        driver.is_some_and(|d| d.starts_with("vfio"))
    }

    /// Host-level prerequisites: architecture, KVM, IOMMU, VFIO modules.
    ///
    /// # Errors
    /// Returns the first failing check.
    pub fn validate_host(&self) -> Result<(), ValidationError> {
        let arch = self.host.architecture();
        if arch != "x86_64" {
            return Err(ValidationError::new(
                ValidationCheck::Architecture,
                format!("PCIe passthrough requires x86_64, host is {arch}"),
            ));
        }

        if !self.host.kvm_device_present() {
            return Err(ValidationError::new(
                ValidationCheck::KvmDevice,
                "/dev/kvm is not present",
            ));
        }
        let kvm = self
            .host
            .module_loaded("kvm")
            .map_err(|e| ValidationError::introspection(None, "/proc/modules", &e))?;
        if !kvm {
            return Err(ValidationError::new(
                ValidationCheck::KvmModule,
                "kvm kernel module is not loaded",
            ));
        }

        let cmdline = self
            .host
            .kernel_cmdline()
            .map_err(|e| ValidationError::introspection(None, "/proc/cmdline", &e))?;
        if !cmdline
            .split_whitespace()
            .any(|param| IOMMU_PARAMETERS.contains(&param))
        {
            return Err(ValidationError::new(
                ValidationCheck::IommuEnabled,
                format!(
                    "kernel command line enables no IOMMU (expected one of {})",
                    IOMMU_PARAMETERS.join(", ")
                ),
            ));
        }

        let mut missing = Vec::new();
        for module in REQUIRED_VFIO_MODULES {
            let loaded = self
                .host
                .module_loaded(module)
                .map_err(|e| ValidationError::introspection(None, "/proc/modules", &e))?;
            if !loaded {
                missing.push(*module);
            }
        }
        if !missing.is_empty() {
            return Err(ValidationError::new(
                ValidationCheck::VfioModules,
                format!("VFIO modules not loaded: {}", missing.join(", ")),
            ));
        }

        info!("Host is ready for PCIe passthrough");
        Ok(())
    }

    /// Read the live record of one device.
    ///
    /// # Errors
    /// Fails if the device does not exist or sysfs cannot be read.
    pub fn inspect_device(&self, address: &PciAddress) -> Result<PcieDevice, ValidationError> {
        let addr = address.as_str();
        if !self.host.pci_device_exists(address) {
            return Err(ValidationError::new(
                ValidationCheck::DeviceExists,
                "device not found on host",
            )
            .device(addr));
        }
        let io = |what: &str, e: std::io::Error| ValidationError::introspection(Some(addr), what, &e);

        let current_driver = self.host.pci_driver(address).map_err(|e| io("driver", e))?;
        let iommu_group = self
            .host
            .iommu_group(address)
            .map_err(|e| io("iommu_group", e))?;
        let device_class = hex_id(
            self.host
                .pci_attribute(address, "class")
                .map_err(|e| io("class", e))?,
            4,
        );
        let vendor_id = hex_id(
            self.host
                .pci_attribute(address, "vendor")
                .map_err(|e| io("vendor", e))?,
            4,
        );
        let device_id = hex_id(
            self.host
                .pci_attribute(address, "device")
                .map_err(|e| io("device", e))?,
            4,
        );

        let is_vfio_bound = Self::is_vfio(current_driver.as_deref());
        let is_conflicting_driver = current_driver
            .as_deref()
            .is_some_and(|d| self.is_conflicting_driver(d));

        Ok(PcieDevice {
            pci_address: address.clone(),
            vendor_id,
            device_id,
            device_class,
            current_driver,
            iommu_group,
            is_vfio_bound,
            is_conflicting_driver,
        })
    }

    /// Every PCI device on the host.
    ///
    /// # Errors
    /// Fails if the device list cannot be read.
    pub fn list_devices(&self) -> Result<Vec<PcieDevice>, ValidationError> {
        let names = self
            .host
            .pci_devices()
            .map_err(|e| ValidationError::introspection(None, "/sys/bus/pci/devices", &e))?;
        names
            .iter()
            .filter_map(|n| PciAddress::parse(n).ok())
            .map(|addr| self.inspect_device(&addr))
            .collect()
    }

    /// Per-device checks: syntax, existence, IOMMU group isolation, VFIO binding.
    ///
    /// # Errors
    /// Returns the first failing check with the device and group context.
    pub fn validate_device(&self, address: &str) -> Result<PcieDevice, ValidationError> {
        if !is_valid_pci_address(address) {
            return Err(ValidationError::new(
                ValidationCheck::AddressSyntax,
                "expected dddd:xx:xx.f",
            )
            .device(address));
        }
        let pci = PciAddress::parse(address).map_err(|e| {
            ValidationError::new(ValidationCheck::AddressSyntax, e.to_string()).device(address)
        })?;
        let device = self.inspect_device(&pci)?;
        let addr = pci.as_str();

        let Some(group) = device.iommu_group.clone() else {
            return Err(ValidationError::new(
                ValidationCheck::IommuGroup,
                "device has no IOMMU group; is the IOMMU enabled?",
            )
            .device(addr)
            .driver(device.current_driver.clone()));
        };

        let members = self.group_members(&group, addr)?;
        let conflicting: Vec<GroupMember> = members
            .iter()
            .filter(|m| m.address != addr)
            .filter(|m| m.driver.as_deref().is_some_and(|d| self.is_conflicting_driver(d)))
            .cloned()
            .collect();
        if !conflicting.is_empty() {
            let siblings: Vec<String> = conflicting
                .iter()
                .map(|m| format!("{} ({})", m.address, m.driver.as_deref().unwrap_or_default()))
                .collect();
            let mut err = ValidationError::new(
                ValidationCheck::GroupIsolation,
                format!(
                    "IOMMU group {group} also contains {} bound to a conflicting driver; \
                     unbind every device in the group before passing through {addr}",
                    siblings.join(", ")
                ),
            )
            .device(addr)
            .driver(device.current_driver.clone());
            err.iommu_group = Some(group);
            err.group_members = members;
            err.conflicting = conflicting;
            return Err(err);
        }

        if device.is_conflicting_driver {
            let driver = device.current_driver.clone().unwrap_or_default();
            let mut err = ValidationError::new(
                ValidationCheck::ConflictingDriver,
                format!("device is bound to conflicting driver {driver}"),
            )
            .device(addr)
            .driver(device.current_driver.clone());
            err.iommu_group = Some(group);
            err.conflicting = vec![GroupMember {
                address: addr.to_string(),
                driver: device.current_driver.clone(),
            }];
            err.group_members = members;
            return Err(err);
        }

        if !device.is_vfio_bound {
            let bound = device.current_driver.as_deref().unwrap_or("no driver");
            let mut err = ValidationError::new(
                ValidationCheck::VfioBinding,
                format!("device must be bound to vfio-pci, currently bound to {bound}"),
            )
            .device(addr)
            .driver(device.current_driver.clone());
            err.iommu_group = Some(group);
            err.group_members = members;
            return Err(err);
        }

        debug!(pci = %addr, group = %group, "Device is ready for passthrough");
        Ok(device)
    }

    fn group_members(&self, group: &str, device: &str) -> Result<Vec<GroupMember>, ValidationError> {
        let names = self
            .host
            .iommu_group_devices(group)
            .map_err(|e| ValidationError::introspection(Some(device), "IOMMU group devices", &e))?;
        let mut members = Vec::with_capacity(names.len());
        for name in names {
            let driver = match PciAddress::parse(&name) {
                Ok(pci) => self
                    .host
                    .pci_driver(&pci)
                    .map_err(|e| ValidationError::introspection(Some(device), "sibling driver", &e))?,
                Err(_) => None,
            };
            members.push(GroupMember {
                address: name,
                driver,
            });
        }
        Ok(members)
    }

    /// Host checks once, then every device in order.
    ///
    /// # Errors
    /// Returns the first failing check.
    pub fn validate_devices<S: AsRef<str>>(
        &self,
        addresses: &[S],
    ) -> Result<Vec<PcieDevice>, ValidationError> {
        if addresses.is_empty() {
            return Ok(Vec::new());
        }
        self.validate_host()?;
        addresses
            .iter()
            .map(|a| self.validate_device(a.as_ref()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;
    use crate::pcie::host::MockHostSystem;

    fn ready_host() -> MockHostSystem {
        let mut host = MockHostSystem::new();
        host.expect_architecture().returning(|| "x86_64".to_string());
        host.expect_kvm_device_present().returning(|| true);
        host.expect_module_loaded().returning(|_| Ok(true));
        host.expect_kernel_cmdline()
            .returning(|| Ok("BOOT_IMAGE=/vmlinuz ro quiet intel_iommu=on iommu=pt".to_string()));
        host
    }

    /// Devices: (address, driver, group). Everything else reads as absent.
    fn with_devices(mut host: MockHostSystem, devices: &'static [(&'static str, Option<&'static str>, &'static str)]) -> MockHostSystem {
        host.expect_pci_device_exists()
            .returning(move |a| devices.iter().any(|(d, _, _)| *d == a.as_str()));
        host.expect_pci_driver().returning(move |a| {
            Ok(devices
                .iter()
                .find(|(d, _, _)| *d == a.as_str())
                .and_then(|(_, drv, _)| drv.map(ToString::to_string)))
        });
        host.expect_iommu_group().returning(move |a| {
            Ok(devices
                .iter()
                .find(|(d, _, _)| *d == a.as_str())
                .map(|(_, _, g)| (*g).to_string()))
        });
        host.expect_iommu_group_devices().returning(move |g| {
            Ok(devices
                .iter()
                .filter(|(_, _, grp)| *grp == g)
                .map(|(d, _, _)| (*d).to_string())
                .collect())
        });
        host.expect_pci_attribute().returning(|_, attr| {
            Ok(match attr {
                "class" => Some("0x030000".to_string()),
                "vendor" => Some("0x10de".to_string()),
                "device" => Some("0x2684".to_string()),
                _ => None,
            })
        });
        host
    }

    #[test]
    fn test_host_ready() {
        let validator = PcieValidator::new(Arc::new(ready_host()));
        validator.validate_host().unwrap();
    }

    #[test]
    fn test_host_wrong_architecture() {
        let mut host = MockHostSystem::new();
        host.expect_architecture().returning(|| "aarch64".to_string());
        let err = PcieValidator::new(Arc::new(host)).validate_host().unwrap_err();
        assert_eq!(err.check, ValidationCheck::Architecture);
    }

    #[test]
    fn test_host_without_iommu() {
        let mut host = MockHostSystem::new();
        host.expect_architecture().returning(|| "x86_64".to_string());
        host.expect_kvm_device_present().returning(|| true);
        host.expect_module_loaded().returning(|_| Ok(true));
        host.expect_kernel_cmdline()
            .returning(|| Ok("BOOT_IMAGE=/vmlinuz ro intel_iommu=off".to_string()));
        let err = PcieValidator::new(Arc::new(host)).validate_host().unwrap_err();
        assert_eq!(err.check, ValidationCheck::IommuEnabled);
    }

    #[test]
    fn test_host_missing_vfio_modules() {
        let mut host = MockHostSystem::new();
        host.expect_architecture().returning(|| "x86_64".to_string());
        host.expect_kvm_device_present().returning(|| true);
        host.expect_module_loaded()
            .returning(|m| Ok(m == "kvm" || m == "vfio"));
        host.expect_kernel_cmdline()
            .returning(|| Ok("amd_iommu=on".to_string()));
        let err = PcieValidator::new(Arc::new(host)).validate_host().unwrap_err();
        assert_eq!(err.check, ValidationCheck::VfioModules);
        assert!(err.detail.contains("vfio_iommu_type1"));
        assert!(err.detail.contains("vfio_pci"));
    }

    #[test]
    fn test_host_without_kvm_device() {
        let mut host = MockHostSystem::new();
        host.expect_architecture().returning(|| "x86_64".to_string());
        host.expect_kvm_device_present().returning(|| false);
        let err = PcieValidator::new(Arc::new(host)).validate_host().unwrap_err();
        assert_eq!(err.check, ValidationCheck::KvmDevice);
    }

    #[test]
    fn test_host_introspection_failure() {
        let mut host = MockHostSystem::new();
        host.expect_architecture().returning(|| "x86_64".to_string());
        host.expect_kvm_device_present().returning(|| true);
        host.expect_module_loaded()
            .returning(|_| Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied")));
        let err = PcieValidator::new(Arc::new(host)).validate_host().unwrap_err();
        assert_eq!(err.check, ValidationCheck::HostIntrospection);
    }

    #[test]
    fn test_device_ready() {
        static DEVICES: &[(&str, Option<&str>, &str)] = &[
            ("0000:01:00.0", Some("vfio-pci"), "1"),
            ("0000:01:00.1", Some("vfio-pci"), "1"),
        ];
        let validator = PcieValidator::new(Arc::new(with_devices(ready_host(), DEVICES)));
        let device = validator.validate_device("0000:01:00.0").unwrap();
        assert!(device.is_vfio_bound);
        assert_eq!(device.vendor_id.as_deref(), Some("10de"));
        assert_eq!(device.device_id.as_deref(), Some("2684"));
        assert_eq!(device.device_class.as_deref(), Some("0300"));
        assert_eq!(device.class_name(), "gpu");
    }

    #[test]
    fn test_invalid_syntax_rejected_before_host_lookup() {
        let validator = PcieValidator::new(Arc::new(MockHostSystem::new()));
        let err = validator.validate_device("01:00.0").unwrap_err();
        assert_eq!(err.check, ValidationCheck::AddressSyntax);
        assert_eq!(err.device.as_deref(), Some("01:00.0"));
    }

    #[test]
    fn test_missing_device() {
        static DEVICES: &[(&str, Option<&str>, &str)] = &[];
        let validator = PcieValidator::new(Arc::new(with_devices(ready_host(), DEVICES)));
        let err = validator.validate_device("0000:09:00.0").unwrap_err();
        assert_eq!(err.check, ValidationCheck::DeviceExists);
    }

    #[test]
    fn test_sibling_bound_to_vendor_driver_rejects_group() {
        static DEVICES: &[(&str, Option<&str>, &str)] = &[
            ("0000:01:00.0", Some("vfio-pci"), "1"),
            ("0000:01:00.1", Some("nvidia"), "1"),
            ("0000:02:00.0", Some("nvme"), "2"),
        ];
        let validator = PcieValidator::new(Arc::new(with_devices(ready_host(), DEVICES)));
        let err = validator.validate_device("0000:01:00.0").unwrap_err();
        assert_eq!(err.check, ValidationCheck::GroupIsolation);
        assert_eq!(err.device.as_deref(), Some("0000:01:00.0"));
        assert_eq!(err.iommu_group.as_deref(), Some("1"));
        assert_eq!(err.group_members.len(), 2);
        assert_eq!(err.conflicting.len(), 1);
        assert_eq!(err.conflicting[0].address, "0000:01:00.1");
        assert_eq!(err.conflicting[0].driver.as_deref(), Some("nvidia"));
        let text = err.to_string();
        assert!(text.contains("0000:01:00.0"));
        assert!(text.contains("0000:01:00.1"));
        assert!(text.contains("nvidia"));
    }

    #[test]
    fn test_audio_sibling_conflicts() {
        static DEVICES: &[(&str, Option<&str>, &str)] = &[
            ("0000:01:00.0", Some("vfio-pci"), "4"),
            ("0000:01:00.1", Some("snd_hda_intel"), "4"),
        ];
        let validator = PcieValidator::new(Arc::new(with_devices(ready_host(), DEVICES)));
        let err = validator.validate_device("0000:01:00.0").unwrap_err();
        assert_eq!(err.check, ValidationCheck::GroupIsolation);
    }

    #[test]
    fn test_target_bound_to_conflicting_driver() {
        static DEVICES: &[(&str, Option<&str>, &str)] = &[("0000:01:00.0", Some("nouveau"), "1")];
        let validator = PcieValidator::new(Arc::new(with_devices(ready_host(), DEVICES)));
        let err = validator.validate_device("0000:01:00.0").unwrap_err();
        assert_eq!(err.check, ValidationCheck::ConflictingDriver);
        assert_eq!(err.current_driver.as_deref(), Some("nouveau"));
    }

    #[test]
    fn test_unbound_target_is_not_enough() {
        static DEVICES: &[(&str, Option<&str>, &str)] = &[("0000:01:00.0", None, "1")];
        let validator = PcieValidator::new(Arc::new(with_devices(ready_host(), DEVICES)));
        let err = validator.validate_device("0000:01:00.0").unwrap_err();
        assert_eq!(err.check, ValidationCheck::VfioBinding);
        assert!(err.detail.contains("no driver"));
    }

    #[test]
    fn test_validate_devices_skips_host_when_empty() {
        let validator = PcieValidator::new(Arc::new(MockHostSystem::new()));
        let none: [&str; 0] = [];
        assert!(validator.validate_devices(&none).unwrap().is_empty());
    }

    #[test]
    fn test_list_devices() {
        static DEVICES: &[(&str, Option<&str>, &str)] = &[
            ("0000:01:00.0", Some("vfio-pci"), "1"),
            ("0000:02:00.0", Some("nvidia"), "2"),
        ];
        let mut host = with_devices(ready_host(), DEVICES);
        host.expect_pci_devices().returning(|| {
            Ok(vec!["0000:01:00.0".to_string(), "0000:02:00.0".to_string()])
        });
        let devices = PcieValidator::new(Arc::new(host)).list_devices().unwrap();
        assert_eq!(devices.len(), 2);
        assert!(devices[1].is_conflicting_driver);
    }
}
