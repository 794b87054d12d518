//! Error taxonomy for cluster provisioning.
//!
//! Lifecycle and allocator methods return [`ClusterError`]. Only the
//! orchestrator wraps failures into [`ClusterError::Orchestration`], after
//! it has unwound whatever partial work a `start` produced.

use std::path::PathBuf;

use thiserror::Error;

use crate::hypervisor::HypervisorError;
use crate::pcie::ValidationError;

/// Crate-wide result alias.
pub type Result<T, E = ClusterError> = std::result::Result<T, E>;

/// Errors surfaced by the provisioning core.
#[derive(Error, Debug)]
pub enum ClusterError {
    /// Missing or invalid configuration (required fields, subnet or PCI syntax).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A resource is already owned or a name is already taken.
    #[error("resource conflict: {0}")]
    ResourceConflict(String),

    /// No IP address left, not enough storage space.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The operation needs privileges the process does not hold.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A host command (service restart) failed.
    #[error("host command failed: {0}")]
    HostCommand(String),

    /// A hypervisor control-plane call failed.
    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),

    /// A PCIe/IOMMU passthrough prerequisite is not met.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The state document is corrupt or could not be written.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// A step failed and removing what it had already created failed too.
    #[error("{source} (cleanup failed: {})", .cleanup_failures.join("; "))]
    Incomplete {
        #[source]
        source: Box<ClusterError>,
        cleanup_failures: Vec<String>,
    },

    /// A cluster operation failed; partial work has been unwound.
    #[error("{operation} of cluster '{cluster}' failed: {source}")]
    Orchestration {
        /// Operation that failed (`start`, `stop`, `destroy`).
        operation: &'static str,
        /// Cluster name.
        cluster: String,
        /// Underlying failure.
        #[source]
        source: Box<ClusterError>,
        /// Compensating actions that themselves failed during unwind.
        rollback_warnings: Vec<String>,
    },
}

impl ClusterError {
    /// Wrap `source` as a failed cluster operation.
    #[must_use]
    pub fn orchestration(
        operation: &'static str,
        cluster: impl Into<String>,
        source: ClusterError,
        rollback_warnings: Vec<String>,
    ) -> Self {
        Self::Orchestration {
            operation,
            cluster: cluster.into(),
            source: Box::new(source),
            rollback_warnings,
        }
    }

    /// Attach cleanup failures to `self`. No-op when there are none.
    #[must_use]
    pub fn with_cleanup_failures(self, cleanup_failures: Vec<String>) -> Self {
        if cleanup_failures.is_empty() {
            self
        } else {
            Self::Incomplete {
                source: Box::new(self),
                cleanup_failures,
            }
        }
    }

    /// Split off cleanup failures attached by [`Self::with_cleanup_failures`].
    #[must_use]
    pub fn take_cleanup_failures(self) -> (Self, Vec<String>) {
        match self {
            Self::Incomplete {
                source,
                cleanup_failures,
            } => (*source, cleanup_failures),
            other => (other, Vec::new()),
        }
    }

    /// The innermost error, looking through orchestration wrappers.
    #[must_use]
    pub fn root_cause(&self) -> &ClusterError {
        match self {
            Self::Orchestration { source, .. } | Self::Incomplete { source, .. } => {
                source.root_cause()
            }
            other => other,
        }
    }
}

/// Failures reading or writing persisted documents.
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// Filesystem failure.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The document exists but does not parse. It is left untouched.
    #[error("state file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Serialization of an in-memory document failed.
    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The advisory lock guarding a shared document could not be taken.
    #[error("failed to lock {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },
}

impl PersistenceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_cause_unwraps_orchestration() {
        let inner = ClusterError::ResourceExhausted("No available IP addresses".into());
        let wrapped = ClusterError::orchestration("start", "hpc", inner, vec![]);
        assert!(matches!(
            wrapped.root_cause(),
            ClusterError::ResourceExhausted(_)
        ));
        assert!(wrapped.to_string().contains("No available IP addresses"));
        assert!(wrapped.to_string().starts_with("start of cluster 'hpc' failed"));
    }

    #[test]
    fn test_cleanup_failures_round_trip() {
        let plain = ClusterError::HostCommand("dnsmasq".into()).with_cleanup_failures(vec![]);
        assert!(matches!(plain, ClusterError::HostCommand(_)));

        let err = ClusterError::HostCommand("dnsmasq".into())
            .with_cleanup_failures(vec!["undefine network hpc-network: busy".into()]);
        assert!(err.to_string().contains("cleanup failed: undefine network hpc-network: busy"));
        assert!(matches!(err.root_cause(), ClusterError::HostCommand(_)));

        let (inner, failures) = err.take_cleanup_failures();
        assert!(matches!(inner, ClusterError::HostCommand(_)));
        assert_eq!(failures.len(), 1);
    }
}
