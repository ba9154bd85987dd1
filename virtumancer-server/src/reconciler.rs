//! Bidirectional sync between the live hypervisor inventory and the cache.
//!
//! The hypervisor is authoritative for state, the cache for UI reads:
//! reconciliation makes the cache converge. Driver reads happen before the
//! store transaction opens; every cache mutation for one domain commits
//! atomically, and a failed reconciliation rolls back leaving the cache in
//! its prior state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;
use virtumancer_driver::{DriverError, HardwareInfo, InterfaceInfo};
use virtumancer_store::{HardwareView, NewVm, Store, StoreTx, VmPatch};

use crate::error::Result;
use crate::pool::ConnectionPool;

#[derive(Clone)]
pub struct Reconciler {
    store: Store,
    pool: Arc<ConnectionPool>,
}

impl Reconciler {
    pub fn new(store: Store, pool: Arc<ConnectionPool>) -> Self {
        Self { store, pool }
    }

    /// Reconcile a single domain by name. Returns whether the cache changed.
    ///
    /// A domain the driver no longer knows prunes the cached row. A new
    /// domain is inserted; when its domain UUID already exists on another
    /// host (cross-host clone/restore) a fresh internal UUID is minted.
    /// Hardware is synced on every pass; the sync diffs live against
    /// cached content first, so an unchanged domain performs no store
    /// mutations.
    pub async fn reconcile_vm(&self, host_id: &str, vm_name: &str) -> Result<bool> {
        let driver = self.pool.get(host_id).await?;

        let domain = match driver.lookup_domain(vm_name).await {
            Ok(domain) => domain,
            Err(DriverError::NotFound(_)) => {
                let mut tx = self.store.begin().await?;
                let deleted = tx.delete_vm_by_name(host_id, vm_name).await?;
                tx.commit().await?;
                if deleted {
                    info!(host = %host_id, vm = %vm_name, "Pruned cached row for missing domain");
                }
                return Ok(deleted);
            }
            Err(e) => return Err(e.into()),
        };

        let vm = driver.describe(&domain).await?;
        let hardware = driver.hardware(&domain).await?;

        let mut tx = self.store.begin().await?;
        let existing = tx.vm_by_domain_uuid(host_id, &vm.uuid).await?;

        let (vm_id, mut changed) = match existing {
            None => {
                let internal_uuid = if tx.domain_uuid_on_other_host(host_id, &vm.uuid).await? {
                    let minted = Uuid::new_v4().to_string();
                    info!(
                        host = %host_id,
                        vm = %vm.name,
                        domain_uuid = %vm.uuid,
                        internal_uuid = %minted,
                        "Domain UUID exists on another host; minted new internal UUID"
                    );
                    minted
                } else {
                    vm.uuid.clone()
                };

                let id = tx
                    .insert_vm(&NewVm {
                        host_id,
                        name: &vm.name,
                        internal_uuid: &internal_uuid,
                        domain_uuid: &vm.uuid,
                        description: &vm.description,
                        state: vm.state.as_str(),
                        vcpu_count: vm.vcpu_count as i64,
                        memory_bytes: vm.memory_bytes as i64,
                    })
                    .await?;
                (id, true)
            }
            Some(row) => {
                let dirty = row.name != vm.name
                    || row.state != vm.state.as_str()
                    || row.vcpu_count != vm.vcpu_count as i64
                    || row.memory_bytes != vm.memory_bytes as i64;
                if dirty {
                    tx.update_vm(
                        row.id,
                        &VmPatch {
                            name: &vm.name,
                            description: &vm.description,
                            state: vm.state.as_str(),
                            vcpu_count: vm.vcpu_count as i64,
                            memory_bytes: vm.memory_bytes as i64,
                        },
                    )
                    .await?;
                }
                (row.id, dirty)
            }
        };

        changed |= sync_hardware(&mut tx, vm_id, host_id, &hardware).await?;
        tx.commit().await?;

        debug!(host = %host_id, vm = %vm_name, changed, "Domain reconciled");
        Ok(changed)
    }

    /// Reconcile every live domain on a host, then prune cached rows whose
    /// domain UUID is no longer reported. Returns the aggregate change flag.
    pub async fn reconcile_host(&self, host_id: &str) -> Result<bool> {
        let driver = self.pool.get(host_id).await?;
        let domains = driver.list_domains().await?;

        let mut changed = false;
        for domain in &domains {
            match self.reconcile_vm(host_id, &domain.name).await {
                Ok(c) => changed |= c,
                Err(e) => {
                    warn!(host = %host_id, vm = %domain.name, error = %e, "Failed to reconcile domain")
                }
            }
        }

        let live: HashSet<&str> = domains.iter().map(|d| d.uuid.as_str()).collect();
        let mut tx = self.store.begin().await?;
        let cached = tx.vms_for_host(host_id).await?;
        let mut pruned = 0u64;
        for row in cached {
            if !live.contains(row.domain_uuid.as_str()) {
                tx.delete_vm(row.id).await?;
                pruned += 1;
            }
        }
        tx.commit().await?;

        if pruned > 0 {
            info!(host = %host_id, pruned, "Pruned cached rows for vanished domains");
            changed = true;
        }
        Ok(changed)
    }
}

/// Sync the hardware attachments for one VM inside the open transaction.
/// Returns whether anything was written.
///
/// The live hardware is diffed against the cached attachments first;
/// identical content performs no mutations. On a difference, bindings and
/// attachments are replaced wholesale; `Volume`, `Network`, `Port` and
/// `GraphicsDevice` rows are upserted by their natural keys so they
/// survive across VMs and reconciliations.
async fn sync_hardware(
    tx: &mut StoreTx,
    vm_id: i64,
    host_id: &str,
    hardware: &HardwareInfo,
) -> Result<bool> {
    let cached = tx.hardware_for_vm(vm_id).await?;
    if hardware_matches(&cached, hardware) {
        return Ok(false);
    }

    tx.clear_vm_hardware(vm_id).await?;

    for disk in &hardware.disks {
        if disk.path.is_empty() {
            continue;
        }
        let volume_id = tx.upsert_volume(&disk.path, &disk.format).await?;
        tx.insert_volume_attachment(vm_id, volume_id, &disk.device, &disk.bus)
            .await?;
    }

    let mut seen_macs = HashSet::new();
    let mut ports: Vec<&InterfaceInfo> = Vec::new();
    for iface in &hardware.interfaces {
        if !seen_macs.insert(iface.mac_address.as_str()) {
            // Malformed host config; the later device overwrites the earlier.
            warn!(mac = %iface.mac_address, "Duplicate MAC address in domain definition");
            ports.retain(|existing| existing.mac_address != iface.mac_address);
        }
        ports.push(iface);
    }
    for iface in ports {
        let network_id = tx
            .upsert_network(&network_uuid(host_id, &iface.bridge), host_id, &iface.bridge)
            .await?;
        let port_id = tx
            .upsert_port(&iface.mac_address, vm_id, &iface.device, &iface.model)
            .await?;
        tx.ensure_port_binding(port_id, network_id).await?;
    }

    let mut kinds: Vec<&str> = hardware.graphics.iter().map(|g| g.kind.as_str()).collect();
    kinds.sort_unstable();
    kinds.dedup();
    for kind in kinds {
        let device_id = tx.upsert_graphics_device(kind).await?;
        tx.insert_graphics_attachment(vm_id, device_id).await?;
    }

    Ok(true)
}

/// Whether the cached attachments already reflect the live hardware.
/// Normalizes both sides the way the writer does: empty disk paths are
/// skipped, the last interface wins per MAC, graphics kinds are distinct.
fn hardware_matches(cached: &HardwareView, live: &HardwareInfo) -> bool {
    let mut cached_disks: Vec<(&str, &str, &str, &str)> = cached
        .disks
        .iter()
        .map(|d| {
            (
                d.device_name.as_str(),
                d.bus_type.as_str(),
                d.path.as_str(),
                d.format.as_str(),
            )
        })
        .collect();
    cached_disks.sort_unstable();
    let mut live_disks: Vec<(&str, &str, &str, &str)> = live
        .disks
        .iter()
        .filter(|d| !d.path.is_empty())
        .map(|d| (d.device.as_str(), d.bus.as_str(), d.path.as_str(), d.format.as_str()))
        .collect();
    live_disks.sort_unstable();
    if cached_disks != live_disks {
        return false;
    }

    let mut live_ports: HashMap<&str, (&str, &str, &str)> = HashMap::new();
    for iface in &live.interfaces {
        live_ports.insert(
            iface.mac_address.as_str(),
            (iface.device.as_str(), iface.model.as_str(), iface.bridge.as_str()),
        );
    }
    let mut live_ifaces: Vec<(&str, &str, &str, &str)> = live_ports
        .into_iter()
        .map(|(mac, (device, model, bridge))| (mac, device, model, bridge))
        .collect();
    live_ifaces.sort_unstable();
    let mut cached_ifaces: Vec<(&str, &str, &str, &str)> = cached
        .interfaces
        .iter()
        .map(|p| {
            (
                p.mac_address.as_str(),
                p.device_name.as_str(),
                p.model_name.as_str(),
                p.bridge_name.as_str(),
            )
        })
        .collect();
    cached_ifaces.sort_unstable();
    if cached_ifaces != live_ifaces {
        return false;
    }

    let mut live_kinds: Vec<&str> = live.graphics.iter().map(|g| g.kind.as_str()).collect();
    live_kinds.sort_unstable();
    live_kinds.dedup();
    let cached_kinds: Vec<&str> = cached.graphics.iter().map(String::as_str).collect();
    cached_kinds == live_kinds
}

/// Deterministic network UUID derived from `(host_id, bridge_name)`.
fn network_uuid(host_id: &str, bridge: &str) -> String {
    Uuid::new_v5(
        &Uuid::NAMESPACE_URL,
        format!("virtumancer/{host_id}/{bridge}").as_bytes(),
    )
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use virtumancer_driver::{DiskInfo, GraphicsDevice, GraphicsKind};
    use virtumancer_store::{DiskAttachmentView, PortView};

    #[test]
    fn network_uuid_is_deterministic() {
        assert_eq!(network_uuid("h1", "br0"), network_uuid("h1", "br0"));
        assert_ne!(network_uuid("h1", "br0"), network_uuid("h2", "br0"));
        assert_ne!(network_uuid("h1", "br0"), network_uuid("h1", "br1"));
    }

    fn live_disk(path: &str, device: &str) -> DiskInfo {
        DiskInfo {
            path: path.to_string(),
            device: device.to_string(),
            bus: "virtio".to_string(),
            format: "qcow2".to_string(),
        }
    }

    fn cached_disk(path: &str, device: &str) -> DiskAttachmentView {
        DiskAttachmentView {
            device_name: device.to_string(),
            bus_type: "virtio".to_string(),
            path: path.to_string(),
            format: "qcow2".to_string(),
        }
    }

    fn live_iface(mac: &str, bridge: &str) -> InterfaceInfo {
        InterfaceInfo {
            mac_address: mac.to_string(),
            model: "virtio".to_string(),
            bridge: bridge.to_string(),
            device: "vnet0".to_string(),
        }
    }

    fn cached_iface(mac: &str, bridge: &str) -> PortView {
        PortView {
            mac_address: mac.to_string(),
            device_name: "vnet0".to_string(),
            model_name: "virtio".to_string(),
            bridge_name: bridge.to_string(),
        }
    }

    #[test]
    fn hardware_matches_identical_content() {
        let cached = HardwareView {
            disks: vec![cached_disk("/img/a", "vda"), cached_disk("/img/b", "vdb")],
            interfaces: vec![cached_iface("52:54:00:00:00:01", "br0")],
            graphics: vec!["vnc".to_string()],
        };
        let live = HardwareInfo {
            // Live order differs from the cached (device-sorted) order.
            disks: vec![live_disk("/img/b", "vdb"), live_disk("/img/a", "vda")],
            interfaces: vec![live_iface("52:54:00:00:00:01", "br0")],
            graphics: vec![GraphicsDevice {
                kind: GraphicsKind::Vnc,
                port: Some(5901),
                tls_port: None,
                listen: None,
            }],
        };
        assert!(hardware_matches(&cached, &live));
        assert!(hardware_matches(&HardwareView::default(), &HardwareInfo::default()));
    }

    #[test]
    fn hardware_matches_detects_differences() {
        let cached = HardwareView {
            disks: vec![cached_disk("/img/a", "vda")],
            interfaces: vec![cached_iface("52:54:00:00:00:01", "br0")],
            graphics: vec![],
        };

        let mut extra_disk = HardwareInfo {
            disks: vec![live_disk("/img/a", "vda"), live_disk("/img/b", "vdb")],
            interfaces: vec![live_iface("52:54:00:00:00:01", "br0")],
            graphics: vec![],
        };
        assert!(!hardware_matches(&cached, &extra_disk));

        extra_disk.disks.truncate(1);
        assert!(hardware_matches(&cached, &extra_disk));

        let moved_bridge = HardwareInfo {
            disks: vec![live_disk("/img/a", "vda")],
            interfaces: vec![live_iface("52:54:00:00:00:01", "br1")],
            graphics: vec![],
        };
        assert!(!hardware_matches(&cached, &moved_bridge));
    }

    #[test]
    fn hardware_matches_mirrors_last_mac_wins() {
        // Duplicate MAC in the live definition: the writer keeps the last
        // occurrence, so the diff must compare against that one.
        let cached = HardwareView {
            disks: vec![],
            interfaces: vec![cached_iface("52:54:00:00:00:01", "br1")],
            graphics: vec![],
        };
        let live = HardwareInfo {
            disks: vec![],
            interfaces: vec![
                live_iface("52:54:00:00:00:01", "br0"),
                live_iface("52:54:00:00:00:01", "br1"),
            ],
            graphics: vec![],
        };
        assert!(hardware_matches(&cached, &live));
    }
}
