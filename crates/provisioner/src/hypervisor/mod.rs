//! Hypervisor boundary and its adapters.

pub mod memory;
mod traits;
pub mod virsh;

pub use memory::MemoryHypervisor;
pub use traits::*;
pub use virsh::Virsh;
