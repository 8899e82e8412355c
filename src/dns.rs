//! DNS server bookkeeping
//!
//! The OS resolver configuration is process-wide. The engine is the only
//! writer; it swaps between the policy servers (disconnected) and the
//! servers pushed by the tunnel (connected).

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use tracing::debug;

/// Resolver policy used while no tunnel is up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DnsPolicy {
    #[default]
    OsDefault,
    Cloudflare,
    Google,
}

impl DnsPolicy {
    /// Resolvers that must stay reachable outside the tunnel
    pub fn servers(self) -> Vec<IpAddr> {
        match self {
            DnsPolicy::OsDefault => Vec::new(),
            DnsPolicy::Cloudflare => vec![
                IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
                IpAddr::V4(Ipv4Addr::new(1, 0, 0, 1)),
            ],
            DnsPolicy::Google => vec![
                IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
                IpAddr::V4(Ipv4Addr::new(8, 8, 4, 4)),
            ],
        }
    }
}

#[derive(Debug, Default)]
pub struct DnsConfiguration {
    policy: DnsPolicy,
    connected_servers: Option<Vec<IpAddr>>,
}

impl DnsConfiguration {
    pub fn new(policy: DnsPolicy) -> Self {
        Self {
            policy,
            connected_servers: None,
        }
    }

    pub fn policy(&self) -> DnsPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: DnsPolicy) -> bool {
        if self.policy == policy {
            return false;
        }
        debug!("DNS policy: {:?} -> {:?}", self.policy, policy);
        self.policy = policy;
        true
    }

    pub fn set_connected_state(&mut self, servers: Vec<IpAddr>) {
        debug!("DNS switched to tunnel servers: {:?}", servers);
        self.connected_servers = Some(servers);
    }

    pub fn set_disconnected_state(&mut self) {
        if self.connected_servers.take().is_some() {
            debug!("DNS switched back to policy {:?}", self.policy);
        }
    }

    pub fn is_connected_state(&self) -> bool {
        self.connected_servers.is_some()
    }

    /// Resolvers currently in effect
    pub fn current_servers(&self) -> Vec<IpAddr> {
        match &self.connected_servers {
            Some(servers) => servers.clone(),
            None => self.policy.servers(),
        }
    }
}
