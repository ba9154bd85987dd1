//! # Virtumancer Driver
//!
//! Hypervisor driver capability for the Virtumancer control plane.
//!
//! The [`Driver`] trait is the full contract the control plane consumes:
//! enumerate and inspect domains, execute lifecycle verbs, read per-device
//! counters and parse domain XML into a normalized hardware model. A
//! [`Connector`] dials hypervisor URIs into live handles.
//!
//! Two backends exist:
//! - **libvirt** (feature `libvirt`) - the production backend; the libvirt
//!   remote driver carries every supported transport, including SSH
//!   tunnels for `qemu+ssh` URIs.
//! - **mock** - an in-memory simulation for tests and development.

pub mod error;
pub mod mock;
pub mod traits;
pub mod types;
pub mod uri;
pub mod xml;

#[cfg(feature = "libvirt")]
pub mod libvirt;

pub use error::{DriverError, Result};
pub use mock::{MockConnector, MockDomain, MockDriver};
pub use traits::{Connector, Driver};
pub use types::*;
pub use uri::HypervisorUri;
pub use xml::{parse_domain_xml, ParsedDomain};

#[cfg(feature = "libvirt")]
pub use libvirt::{LibvirtConnector, LibvirtDriver};
