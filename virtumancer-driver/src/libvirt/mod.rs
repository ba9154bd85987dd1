//! Libvirt backend (requires the `libvirt` feature and system libvirt).

mod backend;

pub use backend::{LibvirtConnector, LibvirtDriver};
