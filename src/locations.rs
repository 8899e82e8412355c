//! Location lookup for the connect sequence
//!
//! API locations arrive from the API resources layer; custom config locations
//! are read from the user's custom configs directory (`*.ovpn`, `*.conf`).

use crate::types::{ConnectionType, LocationId};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum LocationsError {
    #[error("Failed to read custom config: {0}")]
    ReadError(#[from] io::Error),
    #[error("No remote found in custom config: {0}")]
    NoRemote(String),
    #[error("Unsupported custom config file: {0}")]
    UnsupportedFile(String),
}

/// One server node of a location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub hostname: String,
    /// Resolved address; custom configs may only carry a hostname
    pub ip: Option<IpAddr>,
    pub weight: u32,
}

/// Custom config file backing a custom config location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomConfigFile {
    pub path: PathBuf,
    pub kind: ConnectionType,
    pub content: String,
}

impl CustomConfigFile {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationInfo {
    pub id: LocationId,
    pub name: String,
    pub nodes: Vec<Node>,
    /// Hostname used for DNS-based connects (IKEv2 remote id, OpenVPN verify-x509-name)
    pub dns_hostname: String,
    /// Ports to whitelist for static IP locations
    pub static_ip_ports: Vec<u16>,
    pub custom_config: Option<CustomConfigFile>,
    selected_node: usize,
}

impl LocationInfo {
    pub fn new(id: LocationId, name: impl Into<String>, nodes: Vec<Node>) -> Self {
        Self {
            id,
            name: name.into(),
            nodes,
            dns_hostname: String::new(),
            static_ip_ports: Vec::new(),
            custom_config: None,
            selected_node: 0,
        }
    }

    pub fn with_static_ip_ports(mut self, ports: Vec<u16>) -> Self {
        self.static_ip_ports = ports;
        self
    }

    pub fn is_exist_selected_node(&self) -> bool {
        self.selected_node < self.nodes.len()
    }

    pub fn selected_node(&self) -> Option<&Node> {
        self.nodes.get(self.selected_node)
    }

    /// Move to the next node, wrapping around; returns false when there is only one
    pub fn select_next_node(&mut self) -> bool {
        if self.nodes.len() < 2 {
            return false;
        }
        self.selected_node = (self.selected_node + 1) % self.nodes.len();
        true
    }
}

/// All locations the engine can connect to
#[derive(Debug, Default)]
pub struct Locations {
    api: HashMap<LocationId, LocationInfo>,
    custom: HashMap<LocationId, LocationInfo>,
}

impl Locations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_api_locations(&mut self, locations: Vec<LocationInfo>) {
        info!("Updating API locations: {}", locations.len());
        self.api = locations.into_iter().map(|l| (l.id.clone(), l)).collect();
    }

    pub fn set_custom_config_locations(&mut self, locations: Vec<LocationInfo>) {
        info!("Updating custom config locations: {}", locations.len());
        self.custom = locations.into_iter().map(|l| (l.id.clone(), l)).collect();
    }

    /// Resolve a location id, following best-location aliases
    pub fn get(&self, id: &LocationId) -> Option<&LocationInfo> {
        if id.is_custom_configs_location() {
            return self.custom.get(id);
        }
        self.api.get(&id.to_api_location()).or_else(|| self.api.get(id))
    }

    /// Node IPs pinged for latency outside the tunnel
    pub fn ping_ips(&self) -> Vec<IpAddr> {
        collect_ips(self.api.values())
    }

    /// Custom config remotes pinged outside the tunnel
    pub fn custom_config_ping_ips(&self) -> Vec<IpAddr> {
        collect_ips(self.custom.values())
    }
}

fn collect_ips<'a>(locations: impl Iterator<Item = &'a LocationInfo>) -> Vec<IpAddr> {
    let mut ips: Vec<IpAddr> = locations
        .flat_map(|l| l.nodes.iter().filter_map(|n| n.ip))
        .collect();
    ips.sort();
    ips.dedup();
    ips
}

/// Read every supported config file from `dir`
///
/// Files that fail to parse are skipped with a warning.
pub fn load_custom_configs(dir: &Path) -> Result<Vec<LocationInfo>, LocationsError> {
    let mut result = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        match load_custom_config(&path) {
            Ok(location) => result.push(location),
            Err(LocationsError::UnsupportedFile(_)) => {
                debug!("Skipping non-config file {}", path.display());
            }
            Err(e) => warn!("Skipping custom config {}: {}", path.display(), e),
        }
    }
    result.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(result)
}

pub fn load_custom_config(path: &Path) -> Result<LocationInfo, LocationsError> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    let kind = match extension.as_str() {
        "ovpn" => ConnectionType::OpenVpn,
        "conf" => ConnectionType::WireGuard,
        _ => return Err(LocationsError::UnsupportedFile(path.display().to_string())),
    };

    let content = fs::read_to_string(path)?;
    let remotes = match kind {
        ConnectionType::WireGuard => parse_wireguard_endpoints(&content),
        _ => parse_openvpn_remotes(&content),
    };
    if remotes.is_empty() {
        return Err(LocationsError::NoRemote(path.display().to_string()));
    }

    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("unknown")
        .to_string();

    let nodes = remotes
        .into_iter()
        .map(|host| Node {
            ip: host.parse().ok(),
            hostname: host,
            weight: 1,
        })
        .collect();

    let mut location = LocationInfo::new(
        LocationId::CustomConfig {
            path: path.display().to_string(),
        },
        name,
        nodes,
    );
    location.custom_config = Some(CustomConfigFile {
        path: path.to_path_buf(),
        kind,
        content,
    });
    Ok(location)
}

/// `remote <host> [port] [proto]` directives, in file order
fn parse_openvpn_remotes(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| line.to_lowercase().starts_with("remote "))
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(str::to_string)
        .collect()
}

/// `Endpoint = host:port` lines from `[Peer]` sections
fn parse_wireguard_endpoints(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| line.to_lowercase().starts_with("endpoint"))
        .filter_map(|line| line.split_once('='))
        .map(|(_, value)| value.trim())
        .filter_map(|value| value.rsplit_once(':').map(|(host, _)| host))
        .map(|host| host.trim_matches(['[', ']']).to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn api_location(id: i32, ips: &[&str]) -> LocationInfo {
        LocationInfo::new(
            LocationId::Api {
                id,
                city: format!("city-{}", id),
            },
            format!("Location {}", id),
            ips.iter()
                .map(|ip| Node {
                    hostname: format!("node-{}.example.net", ip),
                    ip: Some(ip.parse().unwrap()),
                    weight: 1,
                })
                .collect(),
        )
    }

    #[test]
    fn test_best_location_resolves_to_api() {
        let mut locations = Locations::new();
        locations.set_api_locations(vec![api_location(5, &["198.51.100.1"])]);

        let best = LocationId::Best {
            id: 5,
            city: "city-5".to_string(),
        };
        let info = locations.get(&best).unwrap();
        assert_eq!(info.name, "Location 5");
    }

    #[test]
    fn test_no_active_nodes() {
        let location = api_location(1, &[]);
        assert!(!location.is_exist_selected_node());
        assert!(location.selected_node().is_none());
    }

    #[test]
    fn test_select_next_node_wraps() {
        let mut location = api_location(1, &["198.51.100.1", "198.51.100.2"]);
        assert!(location.select_next_node());
        assert_eq!(location.selected_node().unwrap().hostname, "node-198.51.100.2.example.net");
        assert!(location.select_next_node());
        assert_eq!(location.selected_node().unwrap().hostname, "node-198.51.100.1.example.net");

        let mut single = api_location(2, &["198.51.100.3"]);
        assert!(!single.select_next_node());
    }

    #[test]
    fn test_ping_ips_are_deduplicated() {
        let mut locations = Locations::new();
        locations.set_api_locations(vec![
            api_location(1, &["198.51.100.2", "198.51.100.1"]),
            api_location(2, &["198.51.100.1"]),
        ]);
        let ips = locations.ping_ips();
        assert_eq!(ips.len(), 2);
        assert!(locations.custom_config_ping_ips().is_empty());
    }

    #[test]
    fn test_parse_openvpn_remotes() {
        let content = "client\nremote 203.0.113.5 1194 udp\nREMOTE vpn.example.org 443\n";
        assert_eq!(
            parse_openvpn_remotes(content),
            vec!["203.0.113.5".to_string(), "vpn.example.org".to_string()]
        );
    }

    #[test]
    fn test_parse_wireguard_endpoints() {
        let content = "[Interface]\nPrivateKey = abc\n[Peer]\nEndpoint = 203.0.113.9:51820\n";
        assert_eq!(parse_wireguard_endpoints(content), vec!["203.0.113.9".to_string()]);

        let v6 = "[Peer]\nEndpoint = [2001:db8::1]:51820\n";
        assert_eq!(parse_wireguard_endpoints(v6), vec!["2001:db8::1".to_string()]);
    }

    #[test]
    fn test_load_custom_configs_from_dir() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("home.ovpn"), "client\nremote 203.0.113.5 1194\n").unwrap();
        fs::write(dir.path().join("office.conf"), "[Peer]\nEndpoint = wg.example.org:51820\n").unwrap();
        fs::write(dir.path().join("broken.ovpn"), "client\n").unwrap();
        fs::write(dir.path().join("notes.txt"), "hello").unwrap();

        let configs = load_custom_configs(dir.path()).unwrap();
        assert_eq!(configs.len(), 2);

        let home = &configs[0];
        assert_eq!(home.name, "home");
        assert!(home.id.is_custom_configs_location());
        assert_eq!(home.nodes[0].ip, Some("203.0.113.5".parse().unwrap()));
        assert_eq!(home.custom_config.as_ref().unwrap().kind, ConnectionType::OpenVpn);

        let office = &configs[1];
        assert_eq!(office.nodes[0].hostname, "wg.example.org");
        assert_eq!(office.nodes[0].ip, None);
        assert_eq!(office.custom_config.as_ref().unwrap().file_name(), "office.conf");
    }
}
