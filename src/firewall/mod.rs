//! Kill-switch firewall capability
//!
//! The OS firewall is a process-wide resource. Only the engine calls into a
//! [`FirewallController`], always with an exception set computed by
//! [`FirewallExceptions`].

pub mod exceptions;
pub mod policy;

pub use exceptions::FirewallExceptions;
pub use policy::{AfterConnectAction, ExitAction, FirewallMode, FirewallSettings, FirewallWhen};

use std::collections::BTreeSet;
use std::net::IpAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FirewallError {
    #[error("Failed to apply firewall rules: {0}")]
    ApplyError(String),
    #[error("Failed to remove firewall rules: {0}")]
    RemoveError(String),
    #[error("Failed to update boot rules: {0}")]
    BootError(String),
    #[error("Unsupported platform")]
    UnsupportedPlatform,
}

pub trait FirewallController: Send + Sync {
    /// Block everything except `exception_ips` and `connecting_ip`;
    /// calling it while already on replaces the rule set
    fn firewall_on(
        &self,
        connecting_ip: Option<IpAddr>,
        exception_ips: &BTreeSet<IpAddr>,
        allow_lan: bool,
        is_custom_config: bool,
    ) -> Result<(), FirewallError>;

    fn firewall_off(&self) -> Result<(), FirewallError>;

    /// Whether the rules are currently installed
    fn firewall_actual_state(&self) -> bool;

    fn whitelist_ports(&self, ports: &[u16]) -> Result<(), FirewallError>;

    fn delete_whitelist_ports(&self) -> Result<(), FirewallError>;

    fn enable_firewall_on_boot(
        &self,
        enable: bool,
        ips: &BTreeSet<IpAddr>,
    ) -> Result<(), FirewallError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_firewall_error_display() {
        let err = FirewallError::ApplyError("iptables-restore exited with 1".to_string());
        assert_eq!(
            err.to_string(),
            "Failed to apply firewall rules: iptables-restore exited with 1"
        );
        assert_eq!(FirewallError::UnsupportedPlatform.to_string(), "Unsupported platform");
    }
}
