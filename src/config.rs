//! Engine settings
//!
//! Persisted as TOML. Everything the engine reads at startup or on
//! `set_settings` lives here; per-network maps are keyed by network name or
//! Wi-Fi SSID.

use crate::dns::DnsPolicy;
use crate::firewall::FirewallSettings;
use crate::helper::SplitTunnelingSettings;
use crate::packet_size::MtuOffsets;
use crate::types::{ConnectionSettings, PacketSize, Protocol, ProxySettings};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const APP_DIR: &str = "vpn-orchestrator";
const SETTINGS_FILE: &str = "settings.toml";
const LOCAL_SETTINGS_FILE: &str = "vpn-orchestrator.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
}

/// Advanced overrides
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtraSettings {
    /// Replaces the node IP and is whitelisted before connecting
    pub remote_ip: Option<String>,
    pub mtu_offset_ikev2: Option<u32>,
    pub mtu_offset_wireguard: Option<u32>,
    pub ikev2_compression: bool,
}

impl ExtraSettings {
    pub fn remote_ip(&self) -> Option<IpAddr> {
        self.remote_ip.as_deref().and_then(|ip| ip.trim().parse().ok())
    }

    pub fn mtu_offsets(&self) -> MtuOffsets {
        let defaults = MtuOffsets::default();
        MtuOffsets {
            ikev2: self.mtu_offset_ikev2.unwrap_or(defaults.ikev2),
            wireguard: self.mtu_offset_wireguard.unwrap_or(defaults.wireguard),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub firewall: FirewallSettings,
    pub allow_lan_traffic: bool,
    pub terminate_sockets: bool,
    pub connection: ConnectionSettings,
    pub network_connection: BTreeMap<String, ConnectionSettings>,
    pub last_known_good_protocol: BTreeMap<String, Protocol>,
    pub packet_size: PacketSize,
    /// Host probed when detecting the packet size
    pub packet_size_probe_host: String,
    pub dns_policy: DnsPolicy,
    pub proxy: ProxySettings,
    pub split_tunneling: SplitTunnelingSettings,
    pub custom_configs_path: Option<PathBuf>,
    pub extra: ExtraSettings,
    /// `host:port` probed through the tunnel after connecting
    pub tunnel_test: Option<String>,
    pub blocking_disconnect_timeout_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            firewall: FirewallSettings::default(),
            allow_lan_traffic: false,
            terminate_sockets: true,
            connection: ConnectionSettings::automatic(),
            network_connection: BTreeMap::new(),
            last_known_good_protocol: BTreeMap::new(),
            packet_size: PacketSize::default(),
            packet_size_probe_host: "1.1.1.1".to_string(),
            dns_policy: DnsPolicy::default(),
            proxy: ProxySettings::default(),
            split_tunneling: SplitTunnelingSettings::default(),
            custom_configs_path: None,
            extra: ExtraSettings::default(),
            tunnel_test: None,
            blocking_disconnect_timeout_ms: 5000,
        }
    }
}

impl EngineSettings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let settings: EngineSettings = toml::from_str(&content)?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// `./vpn-orchestrator.toml` if present, else the per-user config dir
    pub fn default_path() -> PathBuf {
        let local = PathBuf::from(LOCAL_SETTINGS_FILE);
        if local.exists() {
            return local;
        }
        dirs::config_dir()
            .map(|dir| dir.join(APP_DIR).join(SETTINGS_FILE))
            .unwrap_or(local)
    }

    /// Settings for the given network, falling back to the global default
    pub fn connection_settings_for(&self, network: &str) -> ConnectionSettings {
        self.network_connection
            .get(network)
            .copied()
            .unwrap_or(self.connection)
    }

    pub fn blocking_disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.blocking_disconnect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::{FirewallMode, FirewallWhen};
    use tempfile::TempDir;

    #[test]
    fn test_default_settings() {
        let settings = EngineSettings::default();
        assert!(settings.connection.is_automatic);
        assert_eq!(settings.firewall.mode, FirewallMode::Manual);
        assert_eq!(settings.blocking_disconnect_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("settings.toml");

        let mut settings = EngineSettings::default();
        settings.firewall = FirewallSettings {
            mode: FirewallMode::Automatic,
            when: FirewallWhen::AfterConnection,
        };
        settings
            .network_connection
            .insert("HomeWiFi".to_string(), ConnectionSettings::new(Protocol::Ikev2, 500));
        settings
            .last_known_good_protocol
            .insert("Office".to_string(), Protocol::OpenVpnTcp);
        settings.save(&path).unwrap();

        let loaded = EngineSettings::load(&path).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let toml = r#"
allow_lan_traffic = true
dns_policy = "cloudflare"

[firewall]
mode = "always_on"
when = "before_connection"

[extra]
remote_ip = "203.0.113.10"
mtu_offset_wireguard = 60
"#;
        let settings: EngineSettings = toml::from_str(toml).unwrap();
        assert!(settings.allow_lan_traffic);
        assert_eq!(settings.dns_policy, DnsPolicy::Cloudflare);
        assert_eq!(settings.firewall.mode, FirewallMode::AlwaysOn);
        assert_eq!(settings.extra.remote_ip(), Some("203.0.113.10".parse().unwrap()));
        assert_eq!(settings.extra.mtu_offsets().wireguard, 60);
        assert_eq!(settings.extra.mtu_offsets().ikev2, 80);
        assert_eq!(settings.blocking_disconnect_timeout_ms, 5000);
    }

    #[test]
    fn test_connection_settings_per_network() {
        let mut settings = EngineSettings::default();
        let home = ConnectionSettings::new(Protocol::WireGuard, 51820);
        settings.network_connection.insert("Home".to_string(), home);

        assert_eq!(settings.connection_settings_for("Home"), home);
        assert_eq!(settings.connection_settings_for("Cafe"), settings.connection);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = EngineSettings::load(&dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError(_)));
    }
}
