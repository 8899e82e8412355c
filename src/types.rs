//! Value types shared by the connection core
//!
//! Everything here is plain data: locations, protocols, connection settings,
//! connect state and the adapter descriptors reported by tunnel backends.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use thiserror::Error;

/// Identifies a selectable destination
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LocationId {
    /// No location selected
    #[default]
    Empty,
    /// Ordinary server location from the API list
    Api { id: i32, city: String },
    /// "Best location" alias, resolved through the matching API location
    Best { id: i32, city: String },
    /// Static IP location dedicated to the account
    StaticIp { id: i32, city: String },
    /// User-supplied OpenVPN or WireGuard config file
    CustomConfig { path: String },
}

impl LocationId {
    pub fn is_valid(&self) -> bool {
        !matches!(self, LocationId::Empty)
    }

    pub fn is_custom_configs_location(&self) -> bool {
        matches!(self, LocationId::CustomConfig { .. })
    }

    pub fn is_static_ips_location(&self) -> bool {
        matches!(self, LocationId::StaticIp { .. })
    }

    pub fn is_best_location(&self) -> bool {
        matches!(self, LocationId::Best { .. })
    }

    /// Best-location aliases resolve to the API location they point at
    pub fn to_api_location(&self) -> LocationId {
        match self {
            LocationId::Best { id, city } => LocationId::Api {
                id: *id,
                city: city.clone(),
            },
            other => other.clone(),
        }
    }
}

impl fmt::Display for LocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocationId::Empty => write!(f, "<empty>"),
            LocationId::Api { id, city } => write!(f, "api:{}:{}", id, city),
            LocationId::Best { id, city } => write!(f, "best:{}:{}", id, city),
            LocationId::StaticIp { id, city } => write!(f, "static:{}:{}", id, city),
            LocationId::CustomConfig { path } => write!(f, "custom:{}", path),
        }
    }
}

/// Which backend family implements a protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    Ikev2,
    OpenVpn,
    WireGuard,
}

/// Tunnel protocol selectable by the user or the automatic mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    WireGuard,
    Ikev2,
    OpenVpnUdp,
    OpenVpnTcp,
}

impl Protocol {
    pub fn connection_type(self) -> ConnectionType {
        match self {
            Protocol::Ikev2 => ConnectionType::Ikev2,
            Protocol::OpenVpnUdp | Protocol::OpenVpnTcp => ConnectionType::OpenVpn,
            Protocol::WireGuard => ConnectionType::WireGuard,
        }
    }

    pub fn is_openvpn(self) -> bool {
        self.connection_type() == ConnectionType::OpenVpn
    }

    pub fn is_ikev2(self) -> bool {
        self == Protocol::Ikev2
    }

    pub fn is_wireguard(self) -> bool {
        self == Protocol::WireGuard
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::WireGuard => "WireGuard",
            Protocol::Ikev2 => "IKEv2",
            Protocol::OpenVpnUdp => "UDP",
            Protocol::OpenVpnTcp => "TCP",
        };
        f.write_str(name)
    }
}

/// Protocol + port choice for one connect attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    pub protocol: Protocol,
    pub port: u16,
    pub is_automatic: bool,
}

impl ConnectionSettings {
    pub fn new(protocol: Protocol, port: u16) -> Self {
        Self {
            protocol,
            port,
            is_automatic: false,
        }
    }

    pub fn automatic() -> Self {
        Self {
            is_automatic: true,
            ..Self::default()
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            protocol: Protocol::WireGuard,
            port: 443,
            is_automatic: true,
        }
    }
}

/// Ports the API offers for one protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapItem {
    pub protocol: Protocol,
    pub ports: Vec<u16>,
}

/// Protocol/port availability, in the API's preference order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMap {
    pub items: Vec<PortMapItem>,
}

impl PortMap {
    pub fn ports_for(&self, protocol: Protocol) -> &[u16] {
        self.items
            .iter()
            .find(|item| item.protocol == protocol)
            .map(|item| item.ports.as_slice())
            .unwrap_or(&[])
    }

    pub fn protocols(&self) -> impl Iterator<Item = Protocol> + '_ {
        self.items.iter().map(|item| item.protocol)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// User-chosen or detected packet size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketSize {
    pub is_automatic: bool,
    pub mtu: u32,
}

impl Default for PacketSize {
    fn default() -> Self {
        Self {
            is_automatic: true,
            mtu: 1500,
        }
    }
}

/// Connection state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The user asked for it
    ByUser,
    /// The backend went down on its own
    Itself,
    /// The attempt failed; see the accompanying [`ConnectError`]
    WithError,
}

/// Why a connection attempt ended
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("Authentication failed")]
    AuthError,
    #[error("Incorrect private key password")]
    PrivKeyPasswordError,
    #[error("Location does not exist")]
    LocationNotExist,
    #[error("Location has no active nodes")]
    LocationNoActiveNodes,
    #[error("Connection blocked")]
    ConnectionBlocked,
    #[error("No backend available for {0}")]
    ProtocolUnavailable(String),
    #[error("Tunnel adapter not installed")]
    NoInstalledTunTap,
    #[error("Tunnel adapter unusable")]
    AdapterFatal,
    #[error("Invalid connection config: {0}")]
    ConfigError(String),
    #[error("Tunnel driver failed: {0}")]
    DriverFailed(String),
}

impl ConnectError {
    /// Transport failures that another node or protocol may get past
    pub fn allows_fallback(&self) -> bool {
        matches!(self, ConnectError::DriverFailed(_))
    }
}

/// Adapter descriptor (default adapter or VPN adapter)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdapterInfo {
    pub adapter_name: String,
    pub adapter_ip: Option<IpAddr>,
    pub if_index: u32,
    pub dns_servers: Vec<IpAddr>,
    pub gateway: Option<IpAddr>,
    pub remote_ip: Option<IpAddr>,
}

impl AdapterInfo {
    pub fn is_empty(&self) -> bool {
        self.adapter_name.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyKind {
    #[default]
    None,
    Http,
    Socks,
}

/// Upstream proxy the tunnel backends must dial through
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySettings {
    pub kind: ProxyKind,
    pub address: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl ProxySettings {
    pub fn is_enabled(&self) -> bool {
        self.kind != ProxyKind::None && !self.address.is_empty()
    }

    /// Proxy address as an IP, when it is one
    pub fn ip(&self) -> Option<IpAddr> {
        if !self.is_enabled() {
            return None;
        }
        self.address.parse().ok()
    }
}

/// Account credentials for the API's own servers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerCredentials {
    pub openvpn_username: String,
    pub openvpn_password: String,
    pub ikev2_username: String,
    pub ikev2_password: String,
}

impl ServerCredentials {
    pub fn is_initialized(&self) -> bool {
        !self.openvpn_username.is_empty() || !self.ikev2_username.is_empty()
    }

    /// Username/password pair used by `protocol`
    pub fn for_protocol(&self, protocol: Protocol) -> (&str, &str) {
        if protocol.is_ikev2() {
            (&self.ikev2_username, &self.ikev2_password)
        } else {
            (&self.openvpn_username, &self.openvpn_password)
        }
    }
}

/// Current OS network, as reported by network detection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkInterface {
    pub index: u32,
    pub name: String,
    /// Network name or Wi-Fi SSID; keys the per-network settings
    pub network_or_ssid: String,
}

/// Peer/interface parameters for a WireGuard attempt
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireGuardConfig {
    pub private_key: String,
    pub address: String,
    pub dns: Vec<IpAddr>,
    pub peer_public_key: String,
    pub peer_preshared_key: String,
    pub allowed_ips: String,
}
