//! PCIe/IOMMU passthrough validation.
//!
//! Validation runs in two tiers. Host checks (architecture, KVM, IOMMU on the
//! kernel command line, VFIO modules) run once per provisioning operation.
//! Device checks resolve the device's IOMMU group and reject it if any member
//! of the group is held by a conflicting driver, since isolation is granted
//! per group rather than per device.

mod address;
mod host;
mod validator;

pub use address::{is_valid_pci_address, PciAddress};
pub use host::{HostSystem, SysfsHost};
pub use validator::{
    GroupMember, PcieDevice, PcieValidator, ValidationCheck, ValidationError, CONFLICTING_DRIVERS,
    IOMMU_PARAMETERS, REQUIRED_VFIO_MODULES,
};
