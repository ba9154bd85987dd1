//! Hypervisor connection URI parsing and normalization.
//!
//! Supported schemes:
//! - `qemu:///system` - local libvirt over its native socket
//! - `qemu+unix:///system` - explicit UNIX socket transport
//! - `qemu+tcp://host[:port]/system` - unencrypted TCP (default port 16509)
//! - `qemu+ssh://user@host[:port]/system` - SSH tunnel to the remote
//!   libvirt UNIX socket (default `/var/run/libvirt/libvirt-sock`)
//!
//! `effective_uri` renders the normalized URI handed to the libvirt remote
//! driver, which owns the transport (including the SSH tunnel) so that the
//! tunnel and the RPC session close together. SSH authentication uses the
//! caller's default private key; host-key verification is skipped
//! (`no_verify=1`), a trust-on-first-use decision left to the operator.

use std::fmt;

use crate::error::{DriverError, Result};

/// Default libvirtd TCP port.
pub const DEFAULT_TCP_PORT: u16 = 16509;
/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;
/// Default libvirt UNIX socket path on the (remote) host.
pub const DEFAULT_SOCKET: &str = "/var/run/libvirt/libvirt-sock";

/// Connection scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Qemu,
    QemuUnix,
    QemuTcp,
    QemuSsh,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Qemu => "qemu",
            Scheme::QemuUnix => "qemu+unix",
            Scheme::QemuTcp => "qemu+tcp",
            Scheme::QemuSsh => "qemu+ssh",
        }
    }
}

/// Parsed hypervisor connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HypervisorUri {
    pub scheme: Scheme,
    pub user: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Virtualization driver path, e.g. `/system`.
    pub path: String,
    /// Explicit UNIX socket path (`?socket=`), if any.
    pub socket: Option<String>,
    /// Explicit SSH private key path (`?keyfile=`), if any.
    pub keyfile: Option<String>,
}

impl HypervisorUri {
    /// Parse a connection string, validating the scheme and authority.
    pub fn parse(uri: &str) -> Result<Self> {
        let (scheme_str, rest) = uri
            .split_once("://")
            .ok_or_else(|| DriverError::InvalidUri(format!("missing scheme: {uri}")))?;

        let scheme = match scheme_str {
            "qemu" => Scheme::Qemu,
            "qemu+unix" => Scheme::QemuUnix,
            "qemu+tcp" => Scheme::QemuTcp,
            "qemu+ssh" => Scheme::QemuSsh,
            other => return Err(DriverError::UnsupportedScheme(other.to_string())),
        };

        let (main, query) = match rest.split_once('?') {
            Some((m, q)) => (m, Some(q)),
            None => (rest, None),
        };

        let (authority, path) = match main.find('/') {
            Some(idx) => (&main[..idx], main[idx..].to_string()),
            None => (main, String::new()),
        };

        let (user, hostport) = match authority.split_once('@') {
            Some((u, hp)) => (Some(u.to_string()), hp),
            None => (None, authority),
        };

        let (host, port) = match hostport.rsplit_once(':') {
            Some((h, p)) => {
                let port = p
                    .parse::<u16>()
                    .map_err(|_| DriverError::InvalidUri(format!("bad port in {uri}")))?;
                (Some(h.to_string()), Some(port))
            }
            None if hostport.is_empty() => (None, None),
            None => (Some(hostport.to_string()), None),
        };

        let mut socket = None;
        let mut keyfile = None;
        if let Some(query) = query {
            for pair in query.split('&') {
                match pair.split_once('=') {
                    Some(("socket", v)) => socket = Some(v.to_string()),
                    Some(("keyfile", v)) => keyfile = Some(v.to_string()),
                    _ => {}
                }
            }
        }

        let parsed = Self {
            scheme,
            user,
            host,
            port,
            path,
            socket,
            keyfile,
        };

        match parsed.scheme {
            Scheme::QemuTcp | Scheme::QemuSsh if parsed.host.is_none() => Err(
                DriverError::InvalidUri(format!("{} requires a host: {uri}", scheme.as_str())),
            ),
            _ => Ok(parsed),
        }
    }

    /// Host to dial for console traffic when the domain listens on a
    /// loopback or wildcard address. `None` for local schemes.
    pub fn remote_host(&self) -> Option<&str> {
        match self.scheme {
            Scheme::QemuTcp | Scheme::QemuSsh => self.host.as_deref(),
            Scheme::Qemu | Scheme::QemuUnix => None,
        }
    }

    /// Render the normalized URI handed to the libvirt remote driver.
    pub fn effective_uri(&self) -> String {
        let path = if self.path.is_empty() { "/system" } else { &self.path };
        match self.scheme {
            Scheme::Qemu => format!("qemu://{path}"),
            Scheme::QemuUnix => {
                let socket = self.socket.as_deref().unwrap_or(DEFAULT_SOCKET);
                format!("qemu+unix://{path}?socket={socket}")
            }
            Scheme::QemuTcp => {
                let host = self.host.as_deref().unwrap_or_default();
                let port = self.port.unwrap_or(DEFAULT_TCP_PORT);
                format!("qemu+tcp://{host}:{port}{path}")
            }
            Scheme::QemuSsh => {
                let host = self.host.as_deref().unwrap_or_default();
                let port = self.port.unwrap_or(DEFAULT_SSH_PORT);
                let user = self
                    .user
                    .as_ref()
                    .map(|u| format!("{u}@"))
                    .unwrap_or_default();
                let keyfile = self
                    .keyfile
                    .clone()
                    .unwrap_or_else(default_ssh_keyfile);
                let socket = self.socket.as_deref().unwrap_or(DEFAULT_SOCKET);
                format!(
                    "qemu+ssh://{user}{host}:{port}{path}?keyfile={keyfile}&no_verify=1&socket={socket}"
                )
            }
        }
    }
}

impl fmt::Display for HypervisorUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.effective_uri())
    }
}

fn default_ssh_keyfile() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
    format!("{home}/.ssh/id_rsa")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_local_uri() {
        let uri = HypervisorUri::parse("qemu:///system").unwrap();
        assert_eq!(uri.scheme, Scheme::Qemu);
        assert_eq!(uri.path, "/system");
        assert!(uri.host.is_none());
        assert_eq!(uri.effective_uri(), "qemu:///system");
        assert!(uri.remote_host().is_none());
    }

    #[test]
    fn unix_uri_gets_default_socket() {
        let uri = HypervisorUri::parse("qemu+unix:///system").unwrap();
        assert_eq!(
            uri.effective_uri(),
            "qemu+unix:///system?socket=/var/run/libvirt/libvirt-sock"
        );
    }

    #[test]
    fn tcp_uri_defaults_port() {
        let uri = HypervisorUri::parse("qemu+tcp://kvm1.example/system").unwrap();
        assert_eq!(uri.effective_uri(), "qemu+tcp://kvm1.example:16509/system");
        assert_eq!(uri.remote_host(), Some("kvm1.example"));
    }

    #[test]
    fn ssh_uri_carries_tunnel_parameters() {
        let uri = HypervisorUri::parse("qemu+ssh://root@kvm1.example/system").unwrap();
        assert_eq!(uri.user.as_deref(), Some("root"));
        let effective = uri.effective_uri();
        assert!(effective.starts_with("qemu+ssh://root@kvm1.example:22/system?"));
        assert!(effective.contains("no_verify=1"));
        assert!(effective.contains("keyfile="));
        assert!(effective.contains("socket=/var/run/libvirt/libvirt-sock"));
    }

    #[test]
    fn ssh_uri_explicit_port_and_key() {
        let uri =
            HypervisorUri::parse("qemu+ssh://admin@kvm2:2222/system?keyfile=/tmp/key").unwrap();
        assert_eq!(uri.port, Some(2222));
        assert_eq!(uri.keyfile.as_deref(), Some("/tmp/key"));
        assert_eq!(uri.remote_host(), Some("kvm2"));
    }

    #[test]
    fn rejects_unknown_scheme() {
        let err = HypervisorUri::parse("xen://host/system").unwrap_err();
        assert!(matches!(err, DriverError::UnsupportedScheme(_)));
    }

    #[test]
    fn rejects_remote_scheme_without_host() {
        let err = HypervisorUri::parse("qemu+ssh:///system").unwrap_err();
        assert!(matches!(err, DriverError::InvalidUri(_)));
    }
}
