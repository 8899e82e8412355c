//! Privileged OS integration capabilities
//!
//! [`Helper`] covers what the engine needs from the privileged side: routing
//! and socket policy around a tunnel, split tunneling and MTU changes.
//! [`VpnSharing`] covers Wi-Fi hotspot and proxy sharing, which only the
//! shutdown sequence touches.

use crate::types::{AdapterInfo, Protocol};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HelperError {
    #[error("Helper command failed: {0}")]
    CommandError(String),
    #[error("Failed to run helper command: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unsupported platform")]
    UnsupportedPlatform,
}

/// Tunnel status pushed to the helper on every connect and disconnect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectStatus {
    pub is_connected: bool,
    pub terminate_sockets: bool,
    pub allow_lan: bool,
    pub default_adapter: AdapterInfo,
    pub vpn_adapter: AdapterInfo,
    pub last_connected_ip: Option<IpAddr>,
    pub protocol: Option<Protocol>,
}

impl ConnectStatus {
    pub fn disconnected(
        terminate_sockets: bool,
        allow_lan: bool,
        default_adapter: AdapterInfo,
    ) -> Self {
        Self {
            is_connected: false,
            terminate_sockets,
            allow_lan,
            default_adapter,
            vpn_adapter: AdapterInfo::default(),
            last_connected_ip: None,
            protocol: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitTunnelingSettings {
    pub active: bool,
    /// Exclusive mode: listed apps/addresses bypass the tunnel.
    /// Otherwise only they use it.
    pub exclude: bool,
    pub apps: Vec<String>,
    pub ips: Vec<String>,
    pub hosts: Vec<String>,
}

impl SplitTunnelingSettings {
    pub fn off() -> Self {
        Self::default()
    }
}

pub trait Helper: Send + Sync {
    fn send_connect_status(&self, status: &ConnectStatus) -> Result<(), HelperError>;

    fn set_split_tunneling_settings(
        &self,
        settings: &SplitTunnelingSettings,
        allow_lan: bool,
    ) -> Result<(), HelperError>;

    fn change_mtu(&self, adapter_name: &str, mtu: u32) -> Result<(), HelperError>;

    /// Snapshot of the current default-route adapter
    fn detect_default_adapter(&self) -> AdapterInfo;
}

pub trait VpnSharing: Send + Sync {
    fn is_sharing_active(&self) -> bool;
    fn stop_wifi_sharing(&self);
    fn stop_proxy_sharing(&self);
}

/// For builds without sharing support
pub struct NoSharing;

impl VpnSharing for NoSharing {
    fn is_sharing_active(&self) -> bool {
        false
    }

    fn stop_wifi_sharing(&self) {}

    fn stop_proxy_sharing(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnected_status_has_no_vpn_adapter() {
        let default_adapter = AdapterInfo {
            adapter_name: "eth0".to_string(),
            ..AdapterInfo::default()
        };
        let status = ConnectStatus::disconnected(true, false, default_adapter);
        assert!(!status.is_connected);
        assert!(status.vpn_adapter.is_empty());
        assert_eq!(status.default_adapter.adapter_name, "eth0");
    }

    #[test]
    fn test_split_tunneling_off() {
        let off = SplitTunnelingSettings::off();
        assert!(!off.active);
        assert!(off.apps.is_empty());
    }

    #[test]
    fn test_helper_error_display() {
        let err = HelperError::CommandError("RTNETLINK answers: Operation not permitted".to_string());
        assert_eq!(
            err.to_string(),
            "Helper command failed: RTNETLINK answers: Operation not permitted"
        );
    }
}
