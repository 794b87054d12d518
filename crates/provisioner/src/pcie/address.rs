//! PCI addresses in `dddd:xx:xx.f` form.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ClusterError;

static PCI_ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-fA-F]{4}:[0-9a-fA-F]{2}:[0-9a-fA-F]{2}\.[0-7]$")
        .expect("PCI address pattern is valid")
});

/// Returns true when `s` is a full `domain:bus:device.function` address.
#[must_use]
pub fn is_valid_pci_address(s: &str) -> bool {
    PCI_ADDRESS.is_match(s)
}

/// A validated PCI address, normalized to lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PciAddress(String);

impl PciAddress {
    /// Parse and normalize an address.
    ///
    /// # Errors
    /// Returns a configuration error if the syntax is not `dddd:xx:xx.f`.
    pub fn parse(s: &str) -> Result<Self, ClusterError> {
        let trimmed = s.trim();
        if is_valid_pci_address(trimmed) {
            Ok(Self(trimmed.to_ascii_lowercase()))
        } else {
            Err(ClusterError::Configuration(format!(
                "invalid PCI address '{s}', expected dddd:xx:xx.f"
            )))
        }
    }

    /// Extract the address from a descriptor such as
    /// `"0000:01:00.0 (10de:2204) NVIDIA RTX A6000"`.
    ///
    /// # Errors
    /// Returns a configuration error if the first token is not an address.
    pub fn from_descriptor(descriptor: &str) -> Result<Self, ClusterError> {
        let first = descriptor.split_whitespace().next().unwrap_or_default();
        Self::parse(first)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Domain, bus, device and function parts for XML rendering.
    #[must_use]
    pub fn components(&self) -> (&str, &str, &str, &str) {
        // Syntax is guaranteed by construction: dddd:bb:ss.f
        (&self.0[0..4], &self.0[5..7], &self.0[8..10], &self.0[11..12])
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PciAddress {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PciAddress {
    type Error = ClusterError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PciAddress> for String {
    fn from(value: PciAddress) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_addresses() {
        for addr in [
            "0000:01:00.0",
            "0000:01:00.7",
            "abcd:EF:1f.3",
            "0001:ff:00.1",
        ] {
            assert!(is_valid_pci_address(addr), "{addr} should be valid");
        }
    }

    #[test]
    fn test_invalid_addresses() {
        for addr in [
            "",
            "01:00.0",
            "0000:01:00",
            "0000:01:00.8",
            "0000:01:00.0 ",
            "0000:01:00.00",
            "00000:01:00.0",
            "0000:1:00.0",
            "0000-01-00.0",
            "g000:01:00.0",
            "0000:01:00.0x",
        ] {
            assert!(!is_valid_pci_address(addr), "{addr:?} should be invalid");
        }
    }

    #[test]
    fn test_parse_normalizes_case() {
        let addr = PciAddress::parse("0000:0A:00.1").unwrap();
        assert_eq!(addr.as_str(), "0000:0a:00.1");
        assert_eq!(addr.components(), ("0000", "0a", "00", "1"));
    }

    #[test]
    fn test_from_descriptor() {
        let addr = PciAddress::from_descriptor("0000:01:00.0 (10de:2204) NVIDIA RTX A6000").unwrap();
        assert_eq!(addr.as_str(), "0000:01:00.0");
        assert!(PciAddress::from_descriptor("NVIDIA RTX A6000").is_err());
    }

    #[test]
    fn test_serde_rejects_bad_address() {
        let ok: PciAddress = serde_json::from_str("\"0000:01:00.0\"").unwrap();
        assert_eq!(ok.to_string(), "0000:01:00.0");
        assert!(serde_json::from_str::<PciAddress>("\"0000:01:00.9\"").is_err());
    }
}
