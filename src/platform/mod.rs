//! Platform-specific capability implementations

#[cfg(target_os = "linux")]
pub mod linux;

use crate::firewall::FirewallController;
use crate::helper::Helper;
use crate::packet_size::MtuProbe;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Required tool not found: {0}")]
    MissingTool(String),
    #[error("Unsupported platform")]
    UnsupportedPlatform,
}

/// OS-backed firewall, helper and MTU probe
pub struct PlatformCapabilities {
    pub firewall: Arc<dyn FirewallController>,
    pub helper: Arc<dyn Helper>,
    pub mtu_probe: Option<Arc<dyn MtuProbe>>,
}

/// Get the capabilities for the current platform
pub fn get_capabilities() -> Result<PlatformCapabilities, PlatformError> {
    #[cfg(target_os = "linux")]
    {
        linux::check_tools()?;
        Ok(PlatformCapabilities {
            firewall: Arc::new(linux::IptablesFirewall::new()),
            helper: Arc::new(linux::LinuxHelper::new()),
            mtu_probe: Some(Arc::new(linux::PingProbe)),
        })
    }

    #[cfg(not(target_os = "linux"))]
    {
        Err(PlatformError::UnsupportedPlatform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_error_display() {
        let err = PlatformError::MissingTool("iptables".to_string());
        assert_eq!(err.to_string(), "Required tool not found: iptables");

        let err = PlatformError::UnsupportedPlatform;
        assert_eq!(err.to_string(), "Unsupported platform");
    }

    #[cfg(not(target_os = "linux"))]
    #[test]
    fn test_unsupported_platform() {
        assert!(matches!(
            get_capabilities(),
            Err(PlatformError::UnsupportedPlatform)
        ));
    }
}
