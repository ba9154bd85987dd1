//! Core hypervisor capability traits.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::types::*;

/// One live hypervisor connection.
///
/// A handle is safe to share across tasks; implementations serialize RPCs
/// internally as the underlying transport requires. All methods may suspend
/// on transport I/O.
#[async_trait]
pub trait Driver: Send + Sync {
    /// List all domains, both active and inactive.
    async fn list_domains(&self) -> Result<Vec<DomainRef>>;

    /// Look up a domain by name. Fails with `NotFound` when absent.
    async fn lookup_domain(&self, name: &str) -> Result<DomainRef>;

    /// Full identity/resource snapshot including graphics availability.
    async fn describe(&self, domain: &DomainRef) -> Result<VmInfo>;

    /// Normalized hardware model parsed from the domain definition.
    async fn hardware(&self, domain: &DomainRef) -> Result<HardwareInfo>;

    /// Current statistics sample.
    ///
    /// A domain that is not running yields zero counters with only the
    /// state and capacity fields populated.
    async fn stats(&self, domain: &DomainRef) -> Result<VmSample>;

    /// Start (boot) the domain.
    async fn start(&self, domain: &DomainRef) -> Result<()>;

    /// Request a graceful guest shutdown.
    async fn shutdown(&self, domain: &DomainRef) -> Result<()>;

    /// Request a graceful guest reboot.
    async fn reboot(&self, domain: &DomainRef) -> Result<()>;

    /// Hard power-off.
    async fn destroy(&self, domain: &DomainRef) -> Result<()>;

    /// Hard reset without guest cooperation.
    async fn reset(&self, domain: &DomainRef) -> Result<()>;

    /// Information about the hypervisor host machine.
    async fn host_info(&self) -> Result<HostSystemInfo>;

    /// Tear down the connection (and any tunnel it owns). Idempotent.
    async fn disconnect(&self) -> Result<()>;
}

/// Dials hypervisor URIs into live driver handles.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to the hypervisor at `uri`.
    ///
    /// Fails with `UnsupportedScheme`/`InvalidUri` for malformed URIs,
    /// `Dial` when the endpoint is unreachable and `Handshake` when the
    /// protocol negotiation fails.
    async fn connect(&self, uri: &str) -> Result<Arc<dyn Driver>>;
}
