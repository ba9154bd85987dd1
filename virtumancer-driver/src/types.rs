//! Type definitions for the hypervisor capability surface.

use serde::{Deserialize, Serialize};

/// Power state of a virtual machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VmState {
    Active,
    Paused,
    Stopped,
    Suspended,
}

impl VmState {
    /// Database/wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            VmState::Active => "ACTIVE",
            VmState::Paused => "PAUSED",
            VmState::Stopped => "STOPPED",
            VmState::Suspended => "SUSPENDED",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, VmState::Active)
    }
}

impl Default for VmState {
    fn default() -> Self {
        Self::Stopped
    }
}

/// Reference to a domain on one hypervisor connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainRef {
    /// Hypervisor-assigned UUID, stable for the domain's lifetime on that host.
    pub uuid: String,
    /// Domain name, unique per host.
    pub name: String,
}

/// Graphical console availability flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphicsInfo {
    pub vnc: bool,
    pub spice: bool,
}

/// Snapshot of one domain's identity and resources.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmInfo {
    pub uuid: String,
    pub name: String,
    pub description: String,
    pub state: VmState,
    /// Current memory in bytes.
    pub memory_bytes: u64,
    /// Maximum memory in bytes.
    pub max_memory_bytes: u64,
    pub vcpu_count: u32,
    pub cpu_time_ns: u64,
    /// Seconds since the domain started, 0 when unknown.
    pub uptime_seconds: u64,
    pub graphics: GraphicsInfo,
}

/// Kind of graphical console device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphicsKind {
    Vnc,
    Spice,
}

impl GraphicsKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GraphicsKind::Vnc => "vnc",
            GraphicsKind::Spice => "spice",
        }
    }
}

/// One `graphics` element from the domain definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphicsDevice {
    pub kind: GraphicsKind,
    /// Bound port, `None` when unbound or -1 (autoport not yet assigned).
    pub port: Option<u16>,
    /// TLS port for SPICE, when bound.
    pub tls_port: Option<u16>,
    /// Listen address as written in the definition.
    pub listen: Option<String>,
}

/// One disk from the domain definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskInfo {
    /// Backing path, unified from `source/file` or `source/dev`.
    pub path: String,
    /// Guest-visible device name (e.g. `vda`).
    pub device: String,
    pub bus: String,
    pub format: String,
}

/// One network interface from the domain definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceInfo {
    pub mac_address: String,
    pub model: String,
    /// Source bridge or network name.
    pub bridge: String,
    /// Host-side device name (e.g. `vnet0`), empty for inactive domains.
    pub device: String,
}

/// Normalized hardware model parsed from the domain definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HardwareInfo {
    pub disks: Vec<DiskInfo>,
    pub interfaces: Vec<InterfaceInfo>,
    pub graphics: Vec<GraphicsDevice>,
}

/// Per-block-device cumulative counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceSample {
    pub device: String,
    pub read_bytes: u64,
    pub write_bytes: u64,
}

/// Per-interface cumulative counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkDeviceSample {
    pub device: String,
    pub read_bytes: u64,
    pub write_bytes: u64,
}

/// One statistics sample for a domain. Not persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmSample {
    pub state: VmState,
    pub memory_bytes: u64,
    pub max_mem_bytes: u64,
    pub vcpu: u32,
    pub cpu_time_ns: u64,
    pub disks: Vec<BlockDeviceSample>,
    pub nets: Vec<NetworkDeviceSample>,
}

impl VmSample {
    /// Zero-counter sample for a domain that is not running (or unreachable).
    pub fn offline(state: VmState, max_mem_bytes: u64, vcpu: u32) -> Self {
        Self {
            state,
            memory_bytes: 0,
            max_mem_bytes,
            vcpu,
            cpu_time_ns: 0,
            disks: Vec::new(),
            nets: Vec::new(),
        }
    }
}

/// Information about the hypervisor host itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostSystemInfo {
    pub hostname: String,
    pub cpu_count: u32,
    pub memory_bytes: u64,
    pub cores: u32,
    pub threads: u32,
}
