//! Linux capability implementations
//!
//! Everything shells out to `iptables`, `ip` and `ping`, the same way the
//! routing code always has.

use super::PlatformError;
use crate::firewall::{FirewallController, FirewallError};
use crate::helper::{ConnectStatus, Helper, HelperError, SplitTunnelingSettings};
use crate::packet_size::MtuProbe;
use crate::types::AdapterInfo;
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

const CHAIN: &str = "VPN_ORCHESTRATOR";
const PORTS_CHAIN: &str = "VPN_ORCHESTRATOR_PORTS";
const BOOT_RULES_PATH: &str = "/etc/vpn-orchestrator/firewall-boot.rules";
const RESOLV_CONF: &str = "/etc/resolv.conf";

const LAN_RANGES: [&str; 5] = [
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "169.254.0.0/16",
    "224.0.0.0/4",
];

/// Run a tool and return its stdout, or stderr as the error
fn run<S: AsRef<str>>(program: &str, args: &[S]) -> Result<String, String> {
    let output = Command::new(program)
        .args(args.iter().map(|a| a.as_ref()))
        .output()
        .map_err(|e| format!("{}: {}", program, e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("{} {}: {}", program, args.first().map(|a| a.as_ref()).unwrap_or(""), stderr.trim()));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

fn iptables<S: AsRef<str>>(args: &[S]) -> Result<String, String> {
    let mut full = vec!["-w".to_string()];
    full.extend(args.iter().map(|a| a.as_ref().to_string()));
    run("iptables", &full)
}

pub fn check_tools() -> Result<(), PlatformError> {
    run("iptables", &["--version"]).map_err(|_| PlatformError::MissingTool("iptables".to_string()))?;
    run("ip", &["-V"]).map_err(|_| PlatformError::MissingTool("ip".to_string()))?;
    Ok(())
}

fn rule(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

/// Body of the kill-switch chain, in order
///
/// IPv6 exceptions are skipped; the chain only lives in the IPv4 table.
fn chain_rules(
    connecting_ip: Option<IpAddr>,
    exception_ips: &BTreeSet<IpAddr>,
    allow_lan: bool,
    is_custom_config: bool,
) -> Vec<Vec<String>> {
    let mut rules = vec![rule(&["-A", CHAIN, "-o", "lo", "-j", "ACCEPT"])];

    let interfaces: &[&str] = if is_custom_config {
        &["tun+", "tap+", "wg+"]
    } else {
        &["tun+", "wg+"]
    };
    for interface in interfaces {
        rules.push(rule(&["-A", CHAIN, "-o", interface, "-j", "ACCEPT"]));
    }

    let ips: BTreeSet<Ipv4Addr> = exception_ips
        .iter()
        .chain(connecting_ip.iter())
        .filter_map(|ip| match ip {
            IpAddr::V4(v4) => Some(*v4),
            IpAddr::V6(_) => None,
        })
        .collect();
    for ip in ips {
        rules.push(rule(&["-A", CHAIN, "-d", &ip.to_string(), "-j", "ACCEPT"]));
    }

    if allow_lan {
        for range in LAN_RANGES {
            rules.push(rule(&["-A", CHAIN, "-d", range, "-j", "ACCEPT"]));
        }
    }

    rules.push(rule(&["-A", CHAIN, "-j", "DROP"]));
    rules
}

/// `iptables-restore` input that recreates the chain at boot
fn boot_rules(ips: &BTreeSet<IpAddr>) -> String {
    let mut lines = vec![
        "*filter".to_string(),
        format!(":{} - [0:0]", CHAIN),
        format!("-A OUTPUT -j {}", CHAIN),
    ];
    lines.extend(chain_rules(None, ips, false, false).iter().map(|r| r.join(" ")));
    lines.push("COMMIT".to_string());
    lines.join("\n") + "\n"
}

/// Kill-switch firewall as a dedicated iptables chain hooked into OUTPUT
pub struct IptablesFirewall {
    boot_rules_path: PathBuf,
}

impl IptablesFirewall {
    pub fn new() -> Self {
        Self {
            boot_rules_path: PathBuf::from(BOOT_RULES_PATH),
        }
    }

    pub fn with_boot_rules_path(path: impl Into<PathBuf>) -> Self {
        Self {
            boot_rules_path: path.into(),
        }
    }

    fn remove_chain(chain: &str, hook: &str) -> Result<(), String> {
        while iptables(&["-C", hook, "-j", chain]).is_ok() {
            iptables(&["-D", hook, "-j", chain])?;
        }
        // Missing chains are fine here
        let _ = iptables(&["-F", chain]);
        let _ = iptables(&["-X", chain]);
        Ok(())
    }
}

impl Default for IptablesFirewall {
    fn default() -> Self {
        Self::new()
    }
}

impl FirewallController for IptablesFirewall {
    fn firewall_on(
        &self,
        connecting_ip: Option<IpAddr>,
        exception_ips: &BTreeSet<IpAddr>,
        allow_lan: bool,
        is_custom_config: bool,
    ) -> Result<(), FirewallError> {
        // Already exists when the rules are being replaced
        let _ = iptables(&["-N", CHAIN]);
        iptables(&["-F", CHAIN]).map_err(FirewallError::ApplyError)?;

        let rules = chain_rules(connecting_ip, exception_ips, allow_lan, is_custom_config);
        for rule in &rules {
            iptables(rule).map_err(FirewallError::ApplyError)?;
        }

        if iptables(&["-C", "OUTPUT", "-j", CHAIN]).is_err() {
            iptables(&["-I", "OUTPUT", "1", "-j", CHAIN]).map_err(FirewallError::ApplyError)?;
        }
        info!("Firewall on: {} rule(s)", rules.len());
        Ok(())
    }

    fn firewall_off(&self) -> Result<(), FirewallError> {
        Self::remove_chain(CHAIN, "OUTPUT").map_err(FirewallError::RemoveError)?;
        info!("Firewall off");
        Ok(())
    }

    fn firewall_actual_state(&self) -> bool {
        iptables(&["-C", "OUTPUT", "-j", CHAIN]).is_ok()
    }

    fn whitelist_ports(&self, ports: &[u16]) -> Result<(), FirewallError> {
        let _ = iptables(&["-N", PORTS_CHAIN]);
        iptables(&["-F", PORTS_CHAIN]).map_err(FirewallError::ApplyError)?;
        for port in ports {
            let port = port.to_string();
            for proto in ["tcp", "udp"] {
                iptables(&["-A", PORTS_CHAIN, "-p", proto, "--dport", port.as_str(), "-j", "ACCEPT"])
                    .map_err(FirewallError::ApplyError)?;
            }
        }
        if iptables(&["-C", "INPUT", "-j", PORTS_CHAIN]).is_err() {
            iptables(&["-I", "INPUT", "1", "-j", PORTS_CHAIN])
                .map_err(FirewallError::ApplyError)?;
        }
        debug!("Whitelisted ports {:?}", ports);
        Ok(())
    }

    fn delete_whitelist_ports(&self) -> Result<(), FirewallError> {
        Self::remove_chain(PORTS_CHAIN, "INPUT").map_err(FirewallError::RemoveError)
    }

    fn enable_firewall_on_boot(
        &self,
        enable: bool,
        ips: &BTreeSet<IpAddr>,
    ) -> Result<(), FirewallError> {
        let path = &self.boot_rules_path;
        if !enable {
            if path.exists() {
                std::fs::remove_file(path).map_err(|e| FirewallError::BootError(e.to_string()))?;
                info!("Removed boot firewall rules {}", path.display());
            }
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| FirewallError::BootError(e.to_string()))?;
        }
        std::fs::write(path, boot_rules(ips)).map_err(|e| FirewallError::BootError(e.to_string()))?;
        info!("Wrote boot firewall rules to {}", path.display());
        Ok(())
    }
}

/// `default via 192.168.1.1 dev eth0 proto dhcp src 192.168.1.20 metric 100`
fn parse_default_route(output: &str) -> Option<(Option<IpAddr>, String, Option<IpAddr>)> {
    let line = output.lines().find(|l| l.trim_start().starts_with("default"))?;
    let words: Vec<&str> = line.split_whitespace().collect();
    let value_after = |key: &str| {
        words
            .iter()
            .position(|w| *w == key)
            .and_then(|i| words.get(i + 1))
            .copied()
    };

    let device = value_after("dev")?.to_string();
    let gateway = value_after("via").and_then(|v| v.parse().ok());
    let source = value_after("src").and_then(|v| v.parse().ok());
    Some((gateway, device, source))
}

fn parse_resolv_conf(content: &str) -> Vec<IpAddr> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.starts_with('#'))
        .filter_map(|l| l.strip_prefix("nameserver"))
        .filter_map(|rest| rest.trim().parse().ok())
        .collect()
}

/// Hosts are resolved once, when the routes are installed
fn split_tunnel_destinations(settings: &SplitTunnelingSettings) -> Vec<String> {
    let mut destinations: Vec<String> = settings.ips.clone();
    for host in &settings.hosts {
        match (host.as_str(), 0).to_socket_addrs() {
            Ok(addrs) => destinations.extend(
                addrs
                    .filter(|a| a.is_ipv4())
                    .map(|a| a.ip().to_string()),
            ),
            Err(e) => warn!("Cannot resolve split tunnel host {}: {}", host, e),
        }
    }
    destinations.sort();
    destinations.dedup();
    destinations
}

/// Privileged OS operations via the `ip` tool
pub struct LinuxHelper {
    split_tunneling: Mutex<SplitTunnelingSettings>,
    routes: Mutex<Vec<String>>,
}

impl LinuxHelper {
    pub fn new() -> Self {
        Self {
            split_tunneling: Mutex::new(SplitTunnelingSettings::off()),
            routes: Mutex::new(Vec::new()),
        }
    }

    fn routes(&self) -> MutexGuard<'_, Vec<String>> {
        self.routes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn clear_routes(&self) {
        for destination in self.routes().drain(..) {
            if let Err(e) = run("ip", &["route", "delete", destination.as_str()]) {
                debug!("Route {} already gone: {}", destination, e);
            }
        }
    }
}

impl Default for LinuxHelper {
    fn default() -> Self {
        Self::new()
    }
}

impl Helper for LinuxHelper {
    fn send_connect_status(&self, status: &ConnectStatus) -> Result<(), HelperError> {
        self.clear_routes();
        if !status.is_connected {
            debug!("Routing reset to defaults");
            return Ok(());
        }

        let settings = self
            .split_tunneling
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if !settings.active {
            return Ok(());
        }
        if !settings.apps.is_empty() {
            warn!("Per-application split tunneling is not supported on Linux");
        }

        let gateway = if settings.exclude {
            status.default_adapter.gateway
        } else {
            status.vpn_adapter.gateway
        };
        let Some(gateway) = gateway else {
            return Err(HelperError::CommandError(
                "No gateway for split tunnel routes".to_string(),
            ));
        };

        let gateway = gateway.to_string();
        for destination in split_tunnel_destinations(&settings) {
            run("ip", &["route", "replace", destination.as_str(), "via", gateway.as_str()])
                .map_err(HelperError::CommandError)?;
            self.routes().push(destination);
        }
        info!(
            "Split tunneling: {} route(s) via {}",
            self.routes().len(),
            gateway
        );
        Ok(())
    }

    fn set_split_tunneling_settings(
        &self,
        settings: &SplitTunnelingSettings,
        _allow_lan: bool,
    ) -> Result<(), HelperError> {
        *self
            .split_tunneling
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = settings.clone();
        if !settings.active {
            self.clear_routes();
        }
        Ok(())
    }

    fn change_mtu(&self, adapter_name: &str, mtu: u32) -> Result<(), HelperError> {
        let mtu = mtu.to_string();
        run("ip", &["link", "set", "dev", adapter_name, "mtu", mtu.as_str()])
            .map_err(HelperError::CommandError)?;
        Ok(())
    }

    fn detect_default_adapter(&self) -> AdapterInfo {
        let output = match run("ip", &["-4", "route", "show", "default"]) {
            Ok(output) => output,
            Err(e) => {
                warn!("Failed to read default route: {}", e);
                return AdapterInfo::default();
            }
        };
        let Some((gateway, device, source)) = parse_default_route(&output) else {
            debug!("No default route");
            return AdapterInfo::default();
        };

        let if_index = nix::net::if_::if_nametoindex(device.as_str()).unwrap_or(0);
        let dns_servers = std::fs::read_to_string(Path::new(RESOLV_CONF))
            .map(|c| parse_resolv_conf(&c))
            .unwrap_or_default();
        AdapterInfo {
            adapter_name: device,
            adapter_ip: source,
            if_index,
            dns_servers,
            gateway,
            remote_ip: None,
        }
    }
}

/// Don't-fragment ICMP echo via `ping -M do`
pub struct PingProbe;

impl MtuProbe for PingProbe {
    fn probe(&self, host: &str, payload: u32) -> bool {
        let payload = payload.to_string();
        Command::new("ping")
            .args(["-M", "do", "-s", payload.as_str(), "-c", "1", "-W", "1", host])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ips(list: &[&str]) -> BTreeSet<IpAddr> {
        list.iter().map(|ip| ip.parse().unwrap()).collect()
    }

    #[test]
    fn test_chain_rules_order() {
        let rules = chain_rules(
            Some("198.51.100.7".parse().unwrap()),
            &ips(&["127.0.0.1", "2001:db8::1"]),
            false,
            false,
        );
        let joined: Vec<String> = rules.iter().map(|r| r.join(" ")).collect();
        assert_eq!(
            joined,
            vec![
                "-A VPN_ORCHESTRATOR -o lo -j ACCEPT",
                "-A VPN_ORCHESTRATOR -o tun+ -j ACCEPT",
                "-A VPN_ORCHESTRATOR -o wg+ -j ACCEPT",
                "-A VPN_ORCHESTRATOR -d 127.0.0.1 -j ACCEPT",
                "-A VPN_ORCHESTRATOR -d 198.51.100.7 -j ACCEPT",
                "-A VPN_ORCHESTRATOR -j DROP",
            ]
        );
    }

    #[test]
    fn test_chain_rules_lan_and_custom_config() {
        let rules = chain_rules(None, &BTreeSet::new(), true, true);
        let joined: Vec<String> = rules.iter().map(|r| r.join(" ")).collect();
        assert!(joined.contains(&"-A VPN_ORCHESTRATOR -o tap+ -j ACCEPT".to_string()));
        assert!(joined.contains(&"-A VPN_ORCHESTRATOR -d 192.168.0.0/16 -j ACCEPT".to_string()));
        assert_eq!(joined.last().unwrap(), "-A VPN_ORCHESTRATOR -j DROP");
    }

    #[test]
    fn test_boot_rules_format() {
        let rules = boot_rules(&ips(&["192.0.2.1"]));
        assert!(rules.starts_with("*filter\n:VPN_ORCHESTRATOR - [0:0]\n-A OUTPUT -j VPN_ORCHESTRATOR\n"));
        assert!(rules.contains("-A VPN_ORCHESTRATOR -d 192.0.2.1 -j ACCEPT\n"));
        assert!(rules.ends_with("COMMIT\n"));
    }

    #[test]
    fn test_enable_firewall_on_boot_writes_and_removes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("boot").join("firewall.rules");
        let firewall = IptablesFirewall::with_boot_rules_path(&path);

        firewall
            .enable_firewall_on_boot(true, &ips(&["192.0.2.1"]))
            .unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("192.0.2.1"));

        firewall.enable_firewall_on_boot(false, &BTreeSet::new()).unwrap();
        assert!(!path.exists());
        // Removing twice is fine
        firewall.enable_firewall_on_boot(false, &BTreeSet::new()).unwrap();
    }

    #[test]
    fn test_parse_default_route() {
        let output = "default via 192.168.1.1 dev eth0 proto dhcp src 192.168.1.20 metric 100\n";
        let (gateway, device, source) = parse_default_route(output).unwrap();
        assert_eq!(gateway, Some("192.168.1.1".parse().unwrap()));
        assert_eq!(device, "eth0");
        assert_eq!(source, Some("192.168.1.20".parse().unwrap()));

        let (gateway, device, _) = parse_default_route("default dev ppp0 scope link\n").unwrap();
        assert_eq!(gateway, None);
        assert_eq!(device, "ppp0");

        assert!(parse_default_route("").is_none());
    }

    #[test]
    fn test_parse_resolv_conf() {
        let content = "# generated\nnameserver 10.0.0.53\nsearch example.net\nnameserver  1.1.1.1\n";
        assert_eq!(
            parse_resolv_conf(content),
            vec![
                "10.0.0.53".parse::<IpAddr>().unwrap(),
                "1.1.1.1".parse::<IpAddr>().unwrap()
            ]
        );
    }

    #[test]
    fn test_split_tunnel_destinations_dedup() {
        let settings = SplitTunnelingSettings {
            active: true,
            exclude: true,
            apps: Vec::new(),
            ips: vec!["203.0.113.0/24".to_string(), "203.0.113.0/24".to_string()],
            hosts: vec!["localhost".to_string()],
        };
        let destinations = split_tunnel_destinations(&settings);
        assert_eq!(destinations.iter().filter(|d| d.as_str() == "203.0.113.0/24").count(), 1);
    }
}
