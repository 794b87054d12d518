//! Compensating actions for a partially-completed cluster start.

use std::fmt;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::ClusterError;
use crate::pcie::PciAddress;

/// Undo step for one forward step that succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackAction {
    DestroyNetwork { cluster: String },
    DestroyPool { cluster: String },
    DestroyVolume { cluster: String, vm: String },
    ReleaseIp { cluster: String, vm: String },
    ReleaseGpu { pci: PciAddress },
    DestroyVm { name: String },
}

impl fmt::Display for RollbackAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DestroyNetwork { cluster } => write!(f, "destroy network of {cluster}"),
            Self::DestroyPool { cluster } => write!(f, "destroy storage pool of {cluster}"),
            Self::DestroyVolume { cluster, vm } => write!(f, "destroy volume of {vm} in {cluster}"),
            Self::ReleaseIp { cluster, vm } => write!(f, "release IP of {vm} in {cluster}"),
            Self::ReleaseGpu { pci } => write!(f, "release GPU {pci}"),
            Self::DestroyVm { name } => write!(f, "destroy VM {name}"),
        }
    }
}

/// Executes rollback actions.
#[async_trait]
pub trait Compensator: Send + Sync {
    async fn compensate(&self, action: &RollbackAction) -> Result<(), ClusterError>;
}

/// LIFO stack of compensating actions, local to one `start`.
#[derive(Debug, Default)]
pub struct RollbackManager {
    stack: Vec<RollbackAction>,
}

impl RollbackManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_action(&mut self, action: RollbackAction) {
        self.stack.push(action);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.stack.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// Pending actions, oldest first.
    #[must_use]
    pub fn actions(&self) -> &[RollbackAction] {
        &self.stack
    }

    /// Forget every action once the forward work has been committed.
    pub fn commit(&mut self) {
        self.stack.clear();
    }

    /// Run every action newest-first. Failures are logged and collected;
    /// they never stop the unwind.
    pub async fn unwind_all(&mut self, compensator: &dyn Compensator) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.stack.is_empty() {
            return warnings;
        }
        info!(actions = self.stack.len(), "Rolling back partial provisioning");
        while let Some(action) = self.stack.pop() {
            match compensator.compensate(&action).await {
                Ok(()) => info!(action = %action, "Rolled back"),
                Err(e) => {
                    warn!(action = %action, error = %e, "Rollback action failed");
                    warnings.push(format!("{action}: {e}"));
                }
            }
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
        fail_on: Option<String>,
    }

    #[async_trait]
    impl Compensator for Recorder {
        async fn compensate(&self, action: &RollbackAction) -> Result<(), ClusterError> {
            let RollbackAction::DestroyVm { name } = action else {
                return Ok(());
            };
            self.seen.lock().unwrap().push(name.clone());
            if self.fail_on.as_deref() == Some(name.as_str()) {
                return Err(ClusterError::Configuration(format!("{name} is stuck")));
            }
            Ok(())
        }
    }

    fn vm(name: &str) -> RollbackAction {
        RollbackAction::DestroyVm {
            name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn test_unwind_is_lifo_and_survives_failures() {
        let mut rollback = RollbackManager::new();
        for name in ["A", "B", "C"] {
            rollback.push_action(vm(name));
        }
        let recorder = Recorder {
            fail_on: Some("B".into()),
            ..Recorder::default()
        };

        let warnings = rollback.unwind_all(&recorder).await;
        assert_eq!(*recorder.seen.lock().unwrap(), vec!["C", "B", "A"]);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("destroy VM B"));
        assert!(rollback.is_empty());
    }

    #[tokio::test]
    async fn test_commit_discards_actions() {
        let mut rollback = RollbackManager::new();
        rollback.push_action(vm("A"));
        rollback.push_action(RollbackAction::DestroyPool {
            cluster: "hpc".into(),
        });
        assert_eq!(rollback.len(), 2);
        assert_eq!(rollback.actions()[0], vm("A"));

        rollback.commit();
        let recorder = Recorder::default();
        assert!(rollback.unwind_all(&recorder).await.is_empty());
        assert!(recorder.seen.lock().unwrap().is_empty());
    }
}
