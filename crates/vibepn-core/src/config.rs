//! Daemon configuration
//!
//! TOML file with an identity section, a peer list, a map of overlay
//! networks, and a daemon section for the listen endpoint and admin
//! socket path. Network addresses may be a literal IPv4 address or
//! `"auto"`, in which case the address is derived deterministically from
//! the node identity within the network prefix.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CoreError, CoreResult};
use crate::routes::IpNet;

/// Default QUIC listen endpoint.
pub const DEFAULT_LISTEN: &str = "0.0.0.0:51820";

/// Default admin socket path.
pub const DEFAULT_ADMIN_SOCKET: &str = "/var/run/vibepn.sock";

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node identity material
    pub identity: IdentityConfig,
    /// Peers to establish sessions with
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    /// Overlay networks, keyed by name
    #[serde(default)]
    pub networks: HashMap<String, NetworkConfig>,
    /// Listener and admin-socket settings
    #[serde(default)]
    pub daemon: DaemonConfig,
}

/// Identity section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// PEM certificate path
    pub cert: PathBuf,
    /// PEM private key path
    pub key: PathBuf,
    /// Expected fingerprint of the local certificate; checked at load
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

/// One configured peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Peer name; the trust-store pinning key
    pub name: String,
    /// Dial address, `host:port`
    pub address: String,
    /// Pinned fingerprint; optional when relying on TOFU
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// Networks this peer participates in
    #[serde(default)]
    pub networks: Vec<String>,
}

/// One overlay network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Local address within the prefix, or `"auto"`
    pub address: String,
    /// CIDR prefix of the network
    pub prefix: String,
    /// Whether to announce the prefix to peers
    #[serde(default)]
    pub export: bool,
}

/// Listener and admin-socket settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// UDP endpoint the QUIC listener binds
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Admin socket path
    #[serde(default = "default_admin_socket")]
    pub admin_socket: PathBuf,
}

fn default_listen() -> SocketAddr {
    DEFAULT_LISTEN.parse().expect("default listen address parses")
}

fn default_admin_socket() -> PathBuf {
    PathBuf::from(DEFAULT_ADMIN_SOCKET)
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            admin_socket: default_admin_socket(),
        }
    }
}

impl Config {
    /// Read and parse the configuration file.
    pub fn load(path: &Path) -> CoreResult<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("read {}: {e}", path.display())))?;
        toml::from_str(&contents)
            .map_err(|e| CoreError::Config(format!("parse {}: {e}", path.display())))
    }

    /// Validate the configuration.
    ///
    /// Checks identity fields, network addresses (`"auto"` or a literal
    /// IPv4 address), prefixes, and peer entries. Also applied by the
    /// admin `reload` path before the new snapshot replaces the old.
    pub fn validate(&self) -> CoreResult<()> {
        if self.identity.cert.as_os_str().is_empty() {
            return Err(CoreError::Config("identity cert path is empty".into()));
        }
        if self.identity.key.as_os_str().is_empty() {
            return Err(CoreError::Config("identity key path is empty".into()));
        }

        for (name, network) in &self.networks {
            if name.is_empty() || name.len() > 255 {
                return Err(CoreError::Config(format!(
                    "network name {name:?} must be 1-255 bytes"
                )));
            }
            if network.address != "auto" {
                if network.address.is_empty() {
                    return Err(CoreError::Config(format!(
                        "network {name} must have an address or use \"auto\""
                    )));
                }
                if network.address.parse::<Ipv4Addr>().is_err() {
                    return Err(CoreError::Config(format!(
                        "network {name} address {:?} is not an IPv4 address",
                        network.address
                    )));
                }
            }
            if IpNet::parse(&network.prefix).is_none() {
                return Err(CoreError::Config(format!(
                    "network {name} prefix {:?} is not a valid CIDR",
                    network.prefix
                )));
            }
        }

        for (i, peer) in self.peers.iter().enumerate() {
            if peer.name.is_empty() {
                return Err(CoreError::Config(format!("peer[{i}] has no name")));
            }
            if peer.address.is_empty() {
                return Err(CoreError::Config(format!("peer {} has no address", peer.name)));
            }
            for network in &peer.networks {
                if !self.networks.contains_key(network) {
                    return Err(CoreError::Config(format!(
                        "peer {} references unknown network {network:?}",
                        peer.name
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Resolve the local address for a network, deriving it from the node
/// identity when configured as `"auto"`.
pub fn resolve_address(
    network: &str,
    node_id: &str,
    config: &NetworkConfig,
) -> CoreResult<Ipv4Addr> {
    if config.address == "auto" {
        if node_id.is_empty() {
            return Err(CoreError::Config(
                "cannot derive auto address: node identity is empty".into(),
            ));
        }
        return derive_auto_address(network, node_id, &config.prefix);
    }

    config.address.parse::<Ipv4Addr>().map_err(|_| {
        CoreError::Config(format!(
            "invalid address for network {network}: {:?}",
            config.address
        ))
    })
}

/// Deterministic host address within `prefix`: hash of `network:node_id`
/// masked into the host bits, excluding network and broadcast addresses.
fn derive_auto_address(network: &str, node_id: &str, prefix: &str) -> CoreResult<Ipv4Addr> {
    let net = IpNet::parse(prefix)
        .ok_or_else(|| CoreError::Config(format!("invalid CIDR prefix for {network}: {prefix:?}")))?;
    if net.prefix_len() >= 31 {
        return Err(CoreError::Config(format!(
            "auto addressing for {network} requires a prefix shorter than /31"
        )));
    }

    let digest = Sha256::digest(format!("{network}:{node_id}").as_bytes());
    let hash = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    let host_mask = ((1u64 << (32 - net.prefix_len() as u64)) - 2) as u32;
    let host_offset = hash & host_mask;

    let base = u32::from(net.network_address());
    let derived = Ipv4Addr::from(base + host_offset);

    if !net.contains(derived) {
        return Err(CoreError::Config(format!(
            "derived address {derived} is outside {prefix}"
        )));
    }
    Ok(derived)
}

/// Netmask for a prefix length.
pub fn netmask(prefix_len: u8) -> Ipv4Addr {
    if prefix_len == 0 {
        Ipv4Addr::UNSPECIFIED
    } else {
        Ipv4Addr::from(!0u32 << (32 - prefix_len as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [identity]
        cert = "/etc/vibepn/certs/node.crt"
        key = "/etc/vibepn/certs/node.key"

        [[peers]]
        name = "b"
        address = "198.51.100.7:51820"
        networks = ["corp"]

        [networks.corp]
        address = "10.42.0.1"
        prefix = "10.42.0.0/24"
        export = true

        [daemon]
        listen = "0.0.0.0:51821"
        admin_socket = "/tmp/vibepn-test.sock"
    "#;

    #[test]
    fn test_parse_sample() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.peers.len(), 1);
        assert_eq!(config.peers[0].name, "b");
        let corp = &config.networks["corp"];
        assert!(corp.export);
        assert_eq!(corp.prefix, "10.42.0.0/24");
        assert_eq!(config.daemon.listen.port(), 51821);
    }

    #[test]
    fn test_daemon_section_defaults() {
        let minimal = r#"
            [identity]
            cert = "/a/cert.pem"
            key = "/a/key.pem"
        "#;
        let config: Config = toml::from_str(minimal).unwrap();
        assert_eq!(config.daemon.listen.port(), 51820);
        assert_eq!(
            config.daemon.admin_socket,
            PathBuf::from("/var/run/vibepn.sock")
        );
    }

    #[test]
    fn test_validate_rejects_bad_prefix() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.networks.get_mut("corp").unwrap().prefix = "not-a-cidr".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_address() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.networks.get_mut("corp").unwrap().address = "".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_auto_address() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.networks.get_mut("corp").unwrap().address = "auto".into();
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_unknown_peer_network() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.peers[0].networks.push("edge".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_auto_address_is_deterministic_and_contained() {
        let network = NetworkConfig {
            address: "auto".into(),
            prefix: "10.42.0.0/24".into(),
            export: true,
        };
        let a = resolve_address("corp", "abcdef0123456789", &network).unwrap();
        let b = resolve_address("corp", "abcdef0123456789", &network).unwrap();
        assert_eq!(a, b);
        assert!(IpNet::parse("10.42.0.0/24").unwrap().contains(a));

        // Different identity gives a different address, overwhelmingly.
        let c = resolve_address("corp", "fedcba9876543210", &network).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_auto_address_rejects_tiny_prefix() {
        let network = NetworkConfig {
            address: "auto".into(),
            prefix: "10.42.0.0/31".into(),
            export: true,
        };
        assert!(resolve_address("corp", "abc", &network).is_err());
    }

    #[test]
    fn test_netmask() {
        assert_eq!(netmask(24), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(netmask(16), Ipv4Addr::new(255, 255, 0, 0));
        assert_eq!(netmask(0), Ipv4Addr::UNSPECIFIED);
        assert_eq!(netmask(32), Ipv4Addr::new(255, 255, 255, 255));
    }
}
