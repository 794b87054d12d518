//! Cluster state persistence.
//!
//! One JSON document per cluster, written atomically with rotated backups.
//! The same writer backs the shared GPU record in [`crate::gpu`].

pub(crate) mod atomic;
mod models;
mod store;

pub use atomic::backups;
pub use models::*;
pub use store::{ClusterStateStore, DEFAULT_MAX_BACKUPS, STATE_FILE};
