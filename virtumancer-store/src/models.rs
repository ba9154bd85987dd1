//! Row and view types for the persistent cache.

use serde::Serialize;

/// A registered hypervisor host.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostRow {
    pub id: String,
    pub uri: String,
}

/// Cached virtual machine row.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VmRow {
    pub id: i64,
    pub host_id: String,
    pub name: String,
    /// Cache-side identifier; equals `domain_uuid` unless a cross-host
    /// collision forced a freshly minted UUID.
    pub internal_uuid: String,
    /// Hypervisor-assigned identifier, unique per host.
    pub domain_uuid: String,
    pub description: String,
    pub state: String,
    pub vcpu_count: i64,
    pub memory_bytes: i64,
}

/// Fields for a new VM row.
#[derive(Debug, Clone)]
pub struct NewVm<'a> {
    pub host_id: &'a str,
    pub name: &'a str,
    pub internal_uuid: &'a str,
    pub domain_uuid: &'a str,
    pub description: &'a str,
    pub state: &'a str,
    pub vcpu_count: i64,
    pub memory_bytes: i64,
}

/// Mutable fields replaced on a VM row update.
#[derive(Debug, Clone)]
pub struct VmPatch<'a> {
    pub name: &'a str,
    pub description: &'a str,
    pub state: &'a str,
    pub vcpu_count: i64,
    pub memory_bytes: i64,
}

/// One disk attachment joined with its backing volume.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskAttachmentView {
    pub device_name: String,
    pub bus_type: String,
    pub path: String,
    pub format: String,
}

/// One network port joined with its bound network.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortView {
    pub mac_address: String,
    pub device_name: String,
    pub model_name: String,
    pub bridge_name: String,
}

/// Normalized hardware read model for one VM.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HardwareView {
    pub disks: Vec<DiskAttachmentView>,
    pub interfaces: Vec<PortView>,
    /// Attached graphics device kinds (`vnc`, `spice`).
    pub graphics: Vec<String>,
}
