//! Allow-listed addresses for the kill-switch firewall
//!
//! Recomputing the set never touches the OS; the engine applies it through
//! [`super::FirewallController`] as a separate step.

use crate::dns::DnsPolicy;
use crate::types::ProxySettings;
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};

#[derive(Debug, Default, Clone)]
pub struct FirewallExceptions {
    host_ips: BTreeSet<IpAddr>,
    proxy_ip: Option<IpAddr>,
    custom_remote_ip: Option<IpAddr>,
    connecting_ip: Option<IpAddr>,
    dns_servers: Vec<IpAddr>,
    location_ping_ips: BTreeSet<IpAddr>,
    custom_config_ping_ips: BTreeSet<IpAddr>,
    dns_policy: DnsPolicy,
}

fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

impl FirewallExceptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// API transport addresses (primary and backup endpoints)
    pub fn set_host_ips(&mut self, ips: impl IntoIterator<Item = IpAddr>) -> bool {
        replace(&mut self.host_ips, ips.into_iter().collect())
    }

    pub fn set_proxy(&mut self, proxy: &ProxySettings) -> bool {
        replace(&mut self.proxy_ip, proxy.ip())
    }

    pub fn set_custom_remote_ip(&mut self, ip: Option<IpAddr>) -> bool {
        replace(&mut self.custom_remote_ip, ip)
    }

    pub fn set_connecting_ip(&mut self, ip: Option<IpAddr>) -> bool {
        replace(&mut self.connecting_ip, ip)
    }

    pub fn set_dns_servers(&mut self, servers: Vec<IpAddr>) -> bool {
        replace(&mut self.dns_servers, servers)
    }

    pub fn set_location_ping_ips(&mut self, ips: impl IntoIterator<Item = IpAddr>) -> bool {
        replace(&mut self.location_ping_ips, ips.into_iter().collect())
    }

    pub fn set_custom_config_ping_ips(&mut self, ips: impl IntoIterator<Item = IpAddr>) -> bool {
        replace(&mut self.custom_config_ping_ips, ips.into_iter().collect())
    }

    pub fn set_dns_policy(&mut self, policy: DnsPolicy) -> bool {
        replace(&mut self.dns_policy, policy)
    }

    pub fn connecting_ip(&self) -> Option<IpAddr> {
        self.connecting_ip
    }

    /// Everything that must stay reachable while no tunnel is up
    pub fn ips_for_firewall(&self) -> BTreeSet<IpAddr> {
        let mut ips = self.always_allowed();
        ips.extend(self.connecting_ip);
        ips.extend(self.dns_servers.iter().copied());
        ips.extend(self.dns_policy.servers());
        ips
    }

    /// Tunnel is up: the connecting IP is passed separately and DNS goes
    /// through the tunnel
    pub fn ips_for_connected_state(&self) -> BTreeSet<IpAddr> {
        self.always_allowed()
    }

    fn always_allowed(&self) -> BTreeSet<IpAddr> {
        let mut ips = BTreeSet::from([IpAddr::V4(Ipv4Addr::LOCALHOST)]);
        ips.extend(self.host_ips.iter().copied());
        ips.extend(self.proxy_ip);
        ips.extend(self.custom_remote_ip);
        ips.extend(self.location_ping_ips.iter().copied());
        ips.extend(self.custom_config_ping_ips.iter().copied());
        ips
    }
}
