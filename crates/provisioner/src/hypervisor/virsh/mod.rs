//! libvirt adapter driven through the `virsh` command line.
//!
//! Native XML for domains, networks, pools and volumes is rendered here and
//! nowhere else; the rest of the crate deals only in structured specs.

mod client;
mod xml;

pub use client::{Virsh, DEFAULT_URI};
