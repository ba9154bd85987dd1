//! Mock hypervisor backend for testing and development.
//!
//! Simulates a hypervisor connection in memory: domains are fixtures that
//! tests (or a development deployment) mutate directly, statistics counters
//! advance deterministically on every poll, and connect failures can be
//! injected per URI.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info};

use crate::error::{DriverError, Result};
use crate::traits::{Connector, Driver};
use crate::types::*;
use crate::uri::HypervisorUri;

/// One simulated domain.
#[derive(Debug, Clone)]
pub struct MockDomain {
    pub uuid: String,
    pub description: String,
    pub state: VmState,
    pub vcpu_count: u32,
    pub memory_bytes: u64,
    pub max_memory_bytes: u64,
    pub disks: Vec<DiskInfo>,
    pub interfaces: Vec<InterfaceInfo>,
    pub graphics: Vec<GraphicsDevice>,
}

impl MockDomain {
    pub fn new(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            description: String::new(),
            state: VmState::Active,
            vcpu_count: 2,
            memory_bytes: 2 * 1024 * 1024 * 1024,
            max_memory_bytes: 2 * 1024 * 1024 * 1024,
            disks: Vec::new(),
            interfaces: Vec::new(),
            graphics: Vec::new(),
        }
    }

    pub fn with_state(mut self, state: VmState) -> Self {
        self.state = state;
        self
    }

    pub fn with_disk(mut self, path: &str, device: &str) -> Self {
        self.disks.push(DiskInfo {
            path: path.to_string(),
            device: device.to_string(),
            bus: "virtio".to_string(),
            format: "qcow2".to_string(),
        });
        self
    }

    pub fn with_interface(mut self, mac: &str, bridge: &str, device: &str) -> Self {
        self.interfaces.push(InterfaceInfo {
            mac_address: mac.to_string(),
            model: "virtio".to_string(),
            bridge: bridge.to_string(),
            device: device.to_string(),
        });
        self
    }

    pub fn with_graphics(mut self, kind: GraphicsKind, port: u16, listen: &str) -> Self {
        self.graphics.push(GraphicsDevice {
            kind,
            port: Some(port),
            tls_port: None,
            listen: Some(listen.to_string()),
        });
        self
    }
}

/// Mock hypervisor connection.
pub struct MockDriver {
    domains: RwLock<HashMap<String, MockDomain>>,
    connected: AtomicBool,
    ticks: AtomicU64,
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            domains: RwLock::new(HashMap::new()),
            connected: AtomicBool::new(true),
            ticks: AtomicU64::new(0),
        }
    }

    /// Install or replace a domain fixture.
    pub fn add_domain(&self, name: &str, domain: MockDomain) {
        self.domains
            .write()
            .expect("mock domains lock")
            .insert(name.to_string(), domain);
    }

    /// Remove a domain fixture, simulating an undefined domain.
    pub fn remove_domain(&self, name: &str) {
        self.domains.write().expect("mock domains lock").remove(name);
    }

    /// Flip a domain's power state.
    pub fn set_state(&self, name: &str, state: VmState) {
        if let Some(domain) = self
            .domains
            .write()
            .expect("mock domains lock")
            .get_mut(name)
        {
            domain.state = state;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(DriverError::Rpc("connection is closed".to_string()))
        }
    }

    fn with_domain<T>(&self, domain: &DomainRef, f: impl FnOnce(&MockDomain) -> T) -> Result<T> {
        let domains = self.domains.read().expect("mock domains lock");
        domains
            .get(&domain.name)
            .map(f)
            .ok_or_else(|| DriverError::NotFound(domain.name.clone()))
    }

    fn set_domain_state(&self, domain: &DomainRef, state: VmState) -> Result<()> {
        let mut domains = self.domains.write().expect("mock domains lock");
        let entry = domains
            .get_mut(&domain.name)
            .ok_or_else(|| DriverError::NotFound(domain.name.clone()))?;
        entry.state = state;
        Ok(())
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for MockDriver {
    async fn list_domains(&self) -> Result<Vec<DomainRef>> {
        self.ensure_connected()?;
        let domains = self.domains.read().expect("mock domains lock");
        let refs = domains
            .iter()
            .map(|(name, d)| DomainRef {
                uuid: d.uuid.clone(),
                name: name.clone(),
            })
            .collect::<Vec<_>>();
        debug!(count = refs.len(), "Listed mock domains");
        Ok(refs)
    }

    async fn lookup_domain(&self, name: &str) -> Result<DomainRef> {
        self.ensure_connected()?;
        let domains = self.domains.read().expect("mock domains lock");
        domains
            .get(name)
            .map(|d| DomainRef {
                uuid: d.uuid.clone(),
                name: name.to_string(),
            })
            .ok_or_else(|| DriverError::NotFound(name.to_string()))
    }

    async fn describe(&self, domain: &DomainRef) -> Result<VmInfo> {
        self.ensure_connected()?;
        self.with_domain(domain, |d| {
            let mut graphics = GraphicsInfo::default();
            for g in &d.graphics {
                if g.port.is_some() || g.tls_port.is_some() {
                    match g.kind {
                        GraphicsKind::Vnc => graphics.vnc = true,
                        GraphicsKind::Spice => graphics.spice = true,
                    }
                }
            }
            VmInfo {
                uuid: d.uuid.clone(),
                name: domain.name.clone(),
                description: d.description.clone(),
                state: d.state,
                memory_bytes: d.memory_bytes,
                max_memory_bytes: d.max_memory_bytes,
                vcpu_count: d.vcpu_count,
                cpu_time_ns: self.ticks.load(Ordering::SeqCst) * 1_000_000,
                uptime_seconds: 0,
                graphics,
            }
        })
    }

    async fn hardware(&self, domain: &DomainRef) -> Result<HardwareInfo> {
        self.ensure_connected()?;
        self.with_domain(domain, |d| HardwareInfo {
            disks: d.disks.clone(),
            interfaces: d.interfaces.clone(),
            graphics: d.graphics.clone(),
        })
    }

    async fn stats(&self, domain: &DomainRef) -> Result<VmSample> {
        self.ensure_connected()?;
        let tick = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
        self.with_domain(domain, |d| {
            if !d.state.is_running() {
                return VmSample::offline(d.state, d.max_memory_bytes, d.vcpu_count);
            }
            VmSample {
                state: d.state,
                memory_bytes: d.memory_bytes,
                max_mem_bytes: d.max_memory_bytes,
                vcpu: d.vcpu_count,
                cpu_time_ns: tick * 1_000_000,
                disks: d
                    .disks
                    .iter()
                    .filter(|disk| !disk.device.is_empty())
                    .map(|disk| BlockDeviceSample {
                        device: disk.device.clone(),
                        read_bytes: tick * 4096,
                        write_bytes: tick * 2048,
                    })
                    .collect(),
                nets: d
                    .interfaces
                    .iter()
                    .filter(|iface| !iface.device.is_empty())
                    .map(|iface| NetworkDeviceSample {
                        device: iface.device.clone(),
                        read_bytes: tick * 1024,
                        write_bytes: tick * 512,
                    })
                    .collect(),
            }
        })
    }

    async fn start(&self, domain: &DomainRef) -> Result<()> {
        self.ensure_connected()?;
        self.set_domain_state(domain, VmState::Active)
    }

    async fn shutdown(&self, domain: &DomainRef) -> Result<()> {
        self.ensure_connected()?;
        self.set_domain_state(domain, VmState::Stopped)
    }

    async fn reboot(&self, domain: &DomainRef) -> Result<()> {
        self.ensure_connected()?;
        // Reboot keeps the domain running.
        self.with_domain(domain, |_| ())
    }

    async fn destroy(&self, domain: &DomainRef) -> Result<()> {
        self.ensure_connected()?;
        self.set_domain_state(domain, VmState::Stopped)
    }

    async fn reset(&self, domain: &DomainRef) -> Result<()> {
        self.ensure_connected()?;
        self.with_domain(domain, |_| ())
    }

    async fn host_info(&self) -> Result<HostSystemInfo> {
        self.ensure_connected()?;
        Ok(HostSystemInfo {
            hostname: "mock-host".to_string(),
            cpu_count: 8,
            memory_bytes: 32 * 1024 * 1024 * 1024,
            cores: 4,
            threads: 2,
        })
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Connector over a registry of mock drivers keyed by URI.
///
/// In development mode (`auto_create`) an unknown URI gets a fresh empty
/// driver; tests register fixtures up front and can mark URIs as failing.
pub struct MockConnector {
    drivers: Mutex<HashMap<String, Arc<MockDriver>>>,
    failing: Mutex<HashSet<String>>,
    auto_create: bool,
}

impl MockConnector {
    /// Development-mode connector: every URI resolves to an empty host.
    pub fn new() -> Self {
        info!("Creating mock hypervisor connector");
        Self {
            drivers: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            auto_create: true,
        }
    }

    /// Test-mode connector: only registered URIs resolve.
    pub fn with_registry() -> Self {
        Self {
            drivers: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            auto_create: false,
        }
    }

    /// Register a driver for a URI, returning it for fixture setup.
    pub fn register(&self, uri: &str, driver: Arc<MockDriver>) -> Arc<MockDriver> {
        self.drivers
            .lock()
            .expect("mock connector lock")
            .insert(uri.to_string(), driver.clone());
        driver
    }

    /// Make subsequent connects to `uri` fail with a dial error.
    pub fn fail_uri(&self, uri: &str) {
        self.failing
            .lock()
            .expect("mock connector lock")
            .insert(uri.to_string());
    }
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn Driver>> {
        // Validate the URI exactly like the real backend would.
        HypervisorUri::parse(uri)?;

        if self.failing.lock().expect("mock connector lock").contains(uri) {
            return Err(DriverError::Dial(format!("mock dial failure for {uri}")));
        }

        let mut drivers = self.drivers.lock().expect("mock connector lock");
        if let Some(driver) = drivers.get(uri) {
            driver.connected.store(true, Ordering::SeqCst);
            return Ok(driver.clone());
        }
        if self.auto_create {
            let driver = Arc::new(MockDriver::new());
            drivers.insert(uri.to_string(), driver.clone());
            return Ok(driver);
        }
        Err(DriverError::Dial(format!("no mock host registered for {uri}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domain_ref(name: &str, uuid: &str) -> DomainRef {
        DomainRef {
            uuid: uuid.to_string(),
            name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn lookup_and_lifecycle() {
        let driver = MockDriver::new();
        driver.add_domain("vm1", MockDomain::new("uuid-1").with_state(VmState::Stopped));

        let dom = driver.lookup_domain("vm1").await.unwrap();
        assert_eq!(dom.uuid, "uuid-1");

        driver.start(&dom).await.unwrap();
        assert_eq!(
            driver.describe(&dom).await.unwrap().state,
            VmState::Active
        );

        driver.destroy(&dom).await.unwrap();
        assert_eq!(
            driver.describe(&dom).await.unwrap().state,
            VmState::Stopped
        );

        let missing = driver.lookup_domain("absent").await.unwrap_err();
        assert!(matches!(missing, DriverError::NotFound(_)));
    }

    #[tokio::test]
    async fn stats_counters_are_monotonic() {
        let driver = MockDriver::new();
        driver.add_domain(
            "vm1",
            MockDomain::new("uuid-1").with_disk("/img/vm1.qcow2", "vda"),
        );
        let dom = domain_ref("vm1", "uuid-1");

        let first = driver.stats(&dom).await.unwrap();
        let second = driver.stats(&dom).await.unwrap();
        assert!(second.disks[0].read_bytes > first.disks[0].read_bytes);
        assert!(second.cpu_time_ns > first.cpu_time_ns);
    }

    #[tokio::test]
    async fn stopped_domain_yields_zero_counters() {
        let driver = MockDriver::new();
        driver.add_domain(
            "vm1",
            MockDomain::new("uuid-1")
                .with_state(VmState::Stopped)
                .with_disk("/img/vm1.qcow2", "vda"),
        );
        let dom = domain_ref("vm1", "uuid-1");

        let sample = driver.stats(&dom).await.unwrap();
        assert_eq!(sample.state, VmState::Stopped);
        assert!(sample.disks.is_empty());
        assert_eq!(sample.cpu_time_ns, 0);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_blocks_rpcs() {
        let driver = MockDriver::new();
        driver.add_domain("vm1", MockDomain::new("uuid-1"));

        driver.disconnect().await.unwrap();
        driver.disconnect().await.unwrap();

        let err = driver.list_domains().await.unwrap_err();
        assert!(matches!(err, DriverError::Rpc(_)));
    }

    #[tokio::test]
    async fn connector_registry_and_failures() {
        let connector = MockConnector::with_registry();
        connector.register("qemu:///system", Arc::new(MockDriver::new()));

        assert!(connector.connect("qemu:///system").await.is_ok());
        assert!(matches!(
            connector.connect("qemu+tcp://other/system").await,
            Err(DriverError::Dial(_))
        ));

        connector.fail_uri("qemu:///system");
        assert!(matches!(
            connector.connect("qemu:///system").await,
            Err(DriverError::Dial(_))
        ));

        // Scheme validation happens before the registry lookup.
        assert!(matches!(
            connector.connect("xen://host/system").await,
            Err(DriverError::UnsupportedScheme(_))
        ));
    }
}
