//! Libvirt backend implementation.
//!
//! The libvirt remote driver owns the transport for every supported scheme,
//! including the SSH tunnel for `qemu+ssh` URIs, so closing the connection
//! tears down the tunnel and the RPC session together. libvirt serializes
//! RPCs on a connection internally, which makes one handle safe to share
//! across tasks.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use virt::connect::Connect;
use virt::domain::Domain;
use virt::sys;

use crate::error::{DriverError, Result};
use crate::traits::{Connector, Driver};
use crate::types::*;
use crate::uri::HypervisorUri;
use crate::xml::parse_domain_xml;

/// Libvirt/QEMU hypervisor connection.
pub struct LibvirtDriver {
    connection: Connect,
}

impl LibvirtDriver {
    /// Dial a hypervisor URI. The URI is validated and normalized first;
    /// scheme errors never reach the wire.
    pub async fn connect(uri: &str) -> Result<Self> {
        let parsed = HypervisorUri::parse(uri)?;
        let effective = parsed.effective_uri();
        info!(uri = %effective, "Connecting to libvirt");

        let connection = Connect::open(Some(&effective))
            .map_err(|e| DriverError::Dial(e.to_string()))?;

        info!("Connected to libvirt");
        Ok(Self { connection })
    }

    fn get_domain(&self, name: &str) -> Result<Domain> {
        Domain::lookup_by_name(&self.connection, name)
            .map_err(|e| DriverError::NotFound(format!("{name}: {e}")))
    }

    /// Convert a libvirt domain state to the cache state model.
    fn state_from_libvirt(state: sys::virDomainState) -> VmState {
        match state {
            sys::VIR_DOMAIN_RUNNING => VmState::Active,
            sys::VIR_DOMAIN_PAUSED => VmState::Paused,
            sys::VIR_DOMAIN_PMSUSPENDED => VmState::Suspended,
            _ => VmState::Stopped,
        }
    }

    fn domain_xml(&self, domain: &Domain) -> Result<crate::xml::ParsedDomain> {
        let xml = domain
            .get_xml_desc(0)
            .map_err(|e| DriverError::Rpc(e.to_string()))?;
        parse_domain_xml(&xml)
    }
}

#[async_trait]
impl Driver for LibvirtDriver {
    #[instrument(skip(self))]
    async fn list_domains(&self) -> Result<Vec<DomainRef>> {
        let flags =
            sys::VIR_CONNECT_LIST_DOMAINS_ACTIVE | sys::VIR_CONNECT_LIST_DOMAINS_INACTIVE;

        let domains = self
            .connection
            .list_all_domains(flags)
            .map_err(|e| DriverError::Rpc(e.to_string()))?;

        let mut refs = Vec::with_capacity(domains.len());
        for domain in domains {
            let uuid = domain
                .get_uuid_string()
                .map_err(|e| DriverError::Rpc(e.to_string()))?;
            let name = domain
                .get_name()
                .map_err(|e| DriverError::Rpc(e.to_string()))?;
            refs.push(DomainRef { uuid, name });
        }

        debug!(count = refs.len(), "Listed domains");
        Ok(refs)
    }

    #[instrument(skip(self), fields(name = %name))]
    async fn lookup_domain(&self, name: &str) -> Result<DomainRef> {
        let domain = self.get_domain(name)?;
        let uuid = domain
            .get_uuid_string()
            .map_err(|e| DriverError::Rpc(e.to_string()))?;
        Ok(DomainRef {
            uuid,
            name: name.to_string(),
        })
    }

    #[instrument(skip(self), fields(name = %domain.name))]
    async fn describe(&self, domain: &DomainRef) -> Result<VmInfo> {
        let dom = self.get_domain(&domain.name)?;

        let (state, _) = dom
            .get_state()
            .map_err(|e| DriverError::Rpc(e.to_string()))?;
        let info = dom.get_info().map_err(|e| DriverError::Rpc(e.to_string()))?;
        let parsed = self.domain_xml(&dom)?;

        Ok(VmInfo {
            uuid: domain.uuid.clone(),
            name: domain.name.clone(),
            description: parsed.description.clone(),
            state: Self::state_from_libvirt(state),
            memory_bytes: info.memory * 1024, // KiB to bytes
            max_memory_bytes: info.max_mem * 1024,
            vcpu_count: info.nr_virt_cpu as u32,
            cpu_time_ns: info.cpu_time,
            uptime_seconds: 0, // libvirt does not report uptime directly
            graphics: parsed.graphics_info(),
        })
    }

    #[instrument(skip(self), fields(name = %domain.name))]
    async fn hardware(&self, domain: &DomainRef) -> Result<HardwareInfo> {
        let dom = self.get_domain(&domain.name)?;
        Ok(self.domain_xml(&dom)?.hardware)
    }

    #[instrument(skip(self), fields(name = %domain.name))]
    async fn stats(&self, domain: &DomainRef) -> Result<VmSample> {
        let dom = self.get_domain(&domain.name)?;

        let (state, _) = dom
            .get_state()
            .map_err(|e| DriverError::Rpc(e.to_string()))?;
        let state = Self::state_from_libvirt(state);
        let info = dom.get_info().map_err(|e| DriverError::Rpc(e.to_string()))?;

        if !state.is_running() {
            return Ok(VmSample::offline(
                state,
                info.max_mem * 1024,
                info.nr_virt_cpu as u32,
            ));
        }

        let parsed = self.domain_xml(&dom)?;

        let mut disks = Vec::new();
        for disk in parsed
            .hardware
            .disks
            .iter()
            .filter(|d| !d.device.is_empty())
        {
            match dom.get_block_stats(&disk.device) {
                Ok(stats) => disks.push(BlockDeviceSample {
                    device: disk.device.clone(),
                    read_bytes: stats.rd_bytes.max(0) as u64,
                    write_bytes: stats.wr_bytes.max(0) as u64,
                }),
                Err(e) => debug!(device = %disk.device, error = %e, "Block stats unavailable"),
            }
        }

        let mut nets = Vec::new();
        for iface in parsed
            .hardware
            .interfaces
            .iter()
            .filter(|i| !i.device.is_empty())
        {
            match dom.interface_stats(&iface.device) {
                Ok(stats) => nets.push(NetworkDeviceSample {
                    device: iface.device.clone(),
                    read_bytes: stats.rx_bytes.max(0) as u64,
                    write_bytes: stats.tx_bytes.max(0) as u64,
                }),
                Err(e) => debug!(device = %iface.device, error = %e, "Interface stats unavailable"),
            }
        }

        Ok(VmSample {
            state,
            memory_bytes: info.memory * 1024,
            max_mem_bytes: info.max_mem * 1024,
            vcpu: info.nr_virt_cpu as u32,
            cpu_time_ns: info.cpu_time,
            disks,
            nets,
        })
    }

    #[instrument(skip(self), fields(name = %domain.name))]
    async fn start(&self, domain: &DomainRef) -> Result<()> {
        let dom = self.get_domain(&domain.name)?;
        dom.create().map_err(|e| DriverError::Rpc(e.to_string()))?;
        info!("Domain started");
        Ok(())
    }

    #[instrument(skip(self), fields(name = %domain.name))]
    async fn shutdown(&self, domain: &DomainRef) -> Result<()> {
        let dom = self.get_domain(&domain.name)?;
        dom.shutdown().map_err(|e| DriverError::Rpc(e.to_string()))?;
        info!("Domain shutdown requested");
        Ok(())
    }

    #[instrument(skip(self), fields(name = %domain.name))]
    async fn reboot(&self, domain: &DomainRef) -> Result<()> {
        let dom = self.get_domain(&domain.name)?;
        dom.reboot(sys::VIR_DOMAIN_REBOOT_DEFAULT)
            .map_err(|e| DriverError::Rpc(e.to_string()))?;
        info!("Domain reboot requested");
        Ok(())
    }

    #[instrument(skip(self), fields(name = %domain.name))]
    async fn destroy(&self, domain: &DomainRef) -> Result<()> {
        let dom = self.get_domain(&domain.name)?;
        dom.destroy().map_err(|e| DriverError::Rpc(e.to_string()))?;
        info!("Domain destroyed");
        Ok(())
    }

    #[instrument(skip(self), fields(name = %domain.name))]
    async fn reset(&self, domain: &DomainRef) -> Result<()> {
        let dom = self.get_domain(&domain.name)?;
        dom.reset().map_err(|e| DriverError::Rpc(e.to_string()))?;
        info!("Domain reset");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn host_info(&self) -> Result<HostSystemInfo> {
        let node = self
            .connection
            .get_node_info()
            .map_err(|e| DriverError::Rpc(e.to_string()))?;
        let hostname = self
            .connection
            .get_hostname()
            .map_err(|e| DriverError::Rpc(e.to_string()))?;

        Ok(HostSystemInfo {
            hostname,
            cpu_count: node.cpus,
            memory_bytes: node.memory * 1024, // KiB to bytes
            cores: node.cores,
            threads: node.threads,
        })
    }

    async fn disconnect(&self) -> Result<()> {
        // libvirt reference-counts the connection; the final release (and
        // the teardown of any SSH tunnel it carries) happens when the last
        // handle drops. Nothing to do here, and calling twice is harmless.
        debug!("Releasing libvirt connection");
        Ok(())
    }
}

/// Connector dialing real libvirt endpoints.
pub struct LibvirtConnector;

#[async_trait]
impl Connector for LibvirtConnector {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn Driver>> {
        Ok(Arc::new(LibvirtDriver::connect(uri).await?))
    }
}
