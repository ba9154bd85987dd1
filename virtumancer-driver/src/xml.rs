//! Parsing of libvirt domain XML into the normalized hardware model.

use serde::Deserialize;

use crate::error::{DriverError, Result};
use crate::types::{
    DiskInfo, GraphicsDevice, GraphicsInfo, GraphicsKind, HardwareInfo, InterfaceInfo,
};

/// Identity and hardware extracted from one domain definition.
#[derive(Debug, Clone)]
pub struct ParsedDomain {
    pub name: String,
    pub uuid: String,
    pub description: String,
    pub hardware: HardwareInfo,
}

impl ParsedDomain {
    /// Console availability flags: a graphics element counts only when it
    /// has a bound port.
    pub fn graphics_info(&self) -> GraphicsInfo {
        let mut info = GraphicsInfo::default();
        for device in &self.hardware.graphics {
            if device.port.is_some() || device.tls_port.is_some() {
                match device.kind {
                    GraphicsKind::Vnc => info.vnc = true,
                    GraphicsKind::Spice => info.spice = true,
                }
            }
        }
        info
    }
}

/// Parse a domain XML document.
pub fn parse_domain_xml(xml: &str) -> Result<ParsedDomain> {
    let doc: DomainXml =
        quick_xml::de::from_str(xml).map_err(|e| DriverError::Xml(e.to_string()))?;

    let devices = doc.devices.unwrap_or_default();

    let disks = devices
        .disks
        .iter()
        .filter_map(|disk| {
            let path = disk
                .source
                .as_ref()
                .and_then(|s| s.file.clone().or_else(|| s.dev.clone()))?;
            let target = disk.target.as_ref()?;
            let device = target.dev.clone()?;
            Some(DiskInfo {
                path,
                device,
                bus: target.bus.clone().unwrap_or_default(),
                format: disk
                    .driver
                    .as_ref()
                    .and_then(|d| d.kind.clone())
                    .unwrap_or_default(),
            })
        })
        .collect();

    let interfaces = devices
        .interfaces
        .iter()
        .filter_map(|iface| {
            let mac = iface.mac.as_ref().and_then(|m| m.address.clone())?;
            Some(InterfaceInfo {
                mac_address: mac,
                model: iface
                    .model
                    .as_ref()
                    .and_then(|m| m.kind.clone())
                    .unwrap_or_default(),
                bridge: iface
                    .source
                    .as_ref()
                    .and_then(|s| s.bridge.clone().or_else(|| s.network.clone()))
                    .unwrap_or_default(),
                device: iface
                    .target
                    .as_ref()
                    .and_then(|t| t.dev.clone())
                    .unwrap_or_default(),
            })
        })
        .collect();

    let graphics = devices
        .graphics
        .iter()
        .filter_map(|g| {
            let kind = match g.kind.as_deref() {
                Some("vnc") => GraphicsKind::Vnc,
                Some("spice") => GraphicsKind::Spice,
                _ => return None,
            };
            let listen = g
                .listen
                .clone()
                .or_else(|| g.listens.first().and_then(|l| l.address.clone()));
            Some(GraphicsDevice {
                kind,
                port: parse_port(g.port.as_deref()),
                tls_port: parse_port(g.tls_port.as_deref()),
                listen,
            })
        })
        .collect();

    Ok(ParsedDomain {
        name: doc.name.unwrap_or_default(),
        uuid: doc.uuid.unwrap_or_default(),
        description: doc.description.unwrap_or_default(),
        hardware: HardwareInfo {
            disks,
            interfaces,
            graphics,
        },
    })
}

/// A port attribute is usable only when present and not `-1`.
fn parse_port(value: Option<&str>) -> Option<u16> {
    let value = value?;
    let port = value.parse::<i32>().ok()?;
    if port <= 0 {
        return None;
    }
    u16::try_from(port).ok()
}

#[derive(Debug, Deserialize)]
#[serde(rename = "domain")]
struct DomainXml {
    name: Option<String>,
    uuid: Option<String>,
    description: Option<String>,
    devices: Option<DevicesXml>,
}

#[derive(Debug, Default, Deserialize)]
struct DevicesXml {
    #[serde(rename = "disk", default)]
    disks: Vec<DiskXml>,
    #[serde(rename = "interface", default)]
    interfaces: Vec<InterfaceXml>,
    #[serde(rename = "graphics", default)]
    graphics: Vec<GraphicsXml>,
}

#[derive(Debug, Deserialize)]
struct DiskXml {
    driver: Option<DiskDriverXml>,
    source: Option<DiskSourceXml>,
    target: Option<TargetXml>,
}

#[derive(Debug, Deserialize)]
struct DiskDriverXml {
    #[serde(rename = "@type")]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DiskSourceXml {
    #[serde(rename = "@file")]
    file: Option<String>,
    #[serde(rename = "@dev")]
    dev: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TargetXml {
    #[serde(rename = "@dev")]
    dev: Option<String>,
    #[serde(rename = "@bus")]
    bus: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InterfaceXml {
    mac: Option<MacXml>,
    source: Option<InterfaceSourceXml>,
    model: Option<ModelXml>,
    target: Option<TargetXml>,
}

#[derive(Debug, Deserialize)]
struct MacXml {
    #[serde(rename = "@address")]
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InterfaceSourceXml {
    #[serde(rename = "@bridge")]
    bridge: Option<String>,
    #[serde(rename = "@network")]
    network: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelXml {
    #[serde(rename = "@type")]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphicsXml {
    #[serde(rename = "@type")]
    kind: Option<String>,
    #[serde(rename = "@port")]
    port: Option<String>,
    #[serde(rename = "@tlsPort")]
    tls_port: Option<String>,
    #[serde(rename = "@listen")]
    listen: Option<String>,
    #[serde(rename = "listen", default)]
    listens: Vec<ListenXml>,
}

#[derive(Debug, Deserialize)]
struct ListenXml {
    #[serde(rename = "@address")]
    address: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
<domain type='kvm'>
  <name>web01</name>
  <uuid>2c9f5d0e-6f2a-4c22-9c75-1f4a30f5a1aa</uuid>
  <description>Front-end web server</description>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='/var/lib/libvirt/images/web01.qcow2'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <disk type='block' device='disk'>
      <driver name='qemu' type='raw'/>
      <source dev='/dev/vg0/web01-data'/>
      <target dev='vdb' bus='virtio'/>
    </disk>
    <disk type='file' device='cdrom'>
      <driver name='qemu' type='raw'/>
      <target dev='sda' bus='sata'/>
    </disk>
    <interface type='bridge'>
      <mac address='52:54:00:12:34:56'/>
      <source bridge='br0'/>
      <model type='virtio'/>
      <target dev='vnet3'/>
    </interface>
    <graphics type='vnc' port='5901' autoport='no' listen='0.0.0.0'/>
    <graphics type='spice' port='-1' tlsPort='5902' autoport='yes'>
      <listen type='address' address='127.0.0.1'/>
    </graphics>
  </devices>
</domain>
"#;

    #[test]
    fn parses_identity() {
        let parsed = parse_domain_xml(SAMPLE).unwrap();
        assert_eq!(parsed.name, "web01");
        assert_eq!(parsed.uuid, "2c9f5d0e-6f2a-4c22-9c75-1f4a30f5a1aa");
        assert_eq!(parsed.description, "Front-end web server");
    }

    #[test]
    fn unifies_disk_sources() {
        let parsed = parse_domain_xml(SAMPLE).unwrap();
        // The cdrom without a source is dropped; file and dev sources unify.
        assert_eq!(parsed.hardware.disks.len(), 2);
        assert_eq!(
            parsed.hardware.disks[0].path,
            "/var/lib/libvirt/images/web01.qcow2"
        );
        assert_eq!(parsed.hardware.disks[0].device, "vda");
        assert_eq!(parsed.hardware.disks[0].format, "qcow2");
        assert_eq!(parsed.hardware.disks[1].path, "/dev/vg0/web01-data");
        assert_eq!(parsed.hardware.disks[1].bus, "virtio");
    }

    #[test]
    fn parses_interfaces() {
        let parsed = parse_domain_xml(SAMPLE).unwrap();
        assert_eq!(parsed.hardware.interfaces.len(), 1);
        let nic = &parsed.hardware.interfaces[0];
        assert_eq!(nic.mac_address, "52:54:00:12:34:56");
        assert_eq!(nic.bridge, "br0");
        assert_eq!(nic.model, "virtio");
        assert_eq!(nic.device, "vnet3");
    }

    #[test]
    fn graphics_ports_and_listen() {
        let parsed = parse_domain_xml(SAMPLE).unwrap();
        let graphics = &parsed.hardware.graphics;
        assert_eq!(graphics.len(), 2);

        assert_eq!(graphics[0].kind, GraphicsKind::Vnc);
        assert_eq!(graphics[0].port, Some(5901));
        assert_eq!(graphics[0].listen.as_deref(), Some("0.0.0.0"));

        // Port -1 means unbound; tlsPort is still usable.
        assert_eq!(graphics[1].kind, GraphicsKind::Spice);
        assert_eq!(graphics[1].port, None);
        assert_eq!(graphics[1].tls_port, Some(5902));
        assert_eq!(graphics[1].listen.as_deref(), Some("127.0.0.1"));
    }

    #[test]
    fn graphics_flags_require_bound_port() {
        let parsed = parse_domain_xml(SAMPLE).unwrap();
        let info = parsed.graphics_info();
        assert!(info.vnc);
        assert!(info.spice);

        let unbound = parse_domain_xml(
            "<domain><name>d</name><devices><graphics type='vnc' port='-1'/></devices></domain>",
        )
        .unwrap();
        assert!(!unbound.graphics_info().vnc);
    }

    #[test]
    fn empty_devices_section() {
        let parsed = parse_domain_xml("<domain><name>bare</name></domain>").unwrap();
        assert!(parsed.hardware.disks.is_empty());
        assert!(parsed.hardware.interfaces.is_empty());
        assert!(parsed.hardware.graphics.is_empty());
    }
}
