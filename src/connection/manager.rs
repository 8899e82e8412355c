//! Drives one tunnel attempt at a time
//!
//! The manager lives inside the engine actor. It picks the protocol, creates
//! the backend through the registered [`ConnectionFactory`]s and translates
//! backend events for the current generation into [`ManagerEvent`]s. Events
//! stamped with an older generation belong to a backend that has already
//! been retired and are dropped.
//!
//! Errors are never retried here; the engine decides what to do with them.

use super::{
    ConnectParams, Connection, ConnectionEvent, ConnectionFactory, EventSender, EventSink, Slot,
};
use crate::helper::Helper;
use crate::locations::LocationInfo;
use crate::types::{
    AdapterInfo, ConnectError, ConnectionSettings, ConnectionType, DisconnectReason, PacketSize,
    PortMap, Protocol, ProxySettings, ServerCredentials, WireGuardConfig,
};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};

const DISCONNECT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const TUNNEL_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Inputs of one user-initiated connect
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub ovpn_config: String,
    pub credentials: ServerCredentials,
    pub location: LocationInfo,
    pub settings: ConnectionSettings,
    pub port_map: PortMap,
    pub proxy: ProxySettings,
    pub emit_auth_error_on_failure: bool,
    /// Last protocol that worked on the current network
    pub preferred_protocol: Option<Protocol>,
    pub wireguard: Option<WireGuardConfig>,
    pub ikev2_compression: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    Connected(AdapterInfo),
    Disconnected(DisconnectReason),
    Reconnecting,
    Error(ConnectError),
    StatisticsUpdated {
        bytes_in: u64,
        bytes_out: u64,
        is_total: bool,
    },
    InterfaceUpdated(String),
    /// Carries the custom config file name the credential is for
    RequestUsername(String),
    RequestPassword(String),
    RequestPrivKeyPassword(String),
    ConnectingToHostname {
        hostname: String,
        ip: Option<IpAddr>,
        dns_servers: Vec<IpAddr>,
    },
    ProtocolPortChanged {
        protocol: Protocol,
        port: u16,
    },
    TestTunnelResult(bool),
    WireGuardAtKeyLimit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContinueOutcome {
    Resumed,
    /// Empty credential: treated as a cancel, disconnect already requested
    Cancelled,
    Failed(ConnectError),
}

struct Attempt {
    request: ConnectRequest,
    protocol: Protocol,
    port: u16,
    /// Node/protocol combinations that have failed so far
    failed: usize,
}

/// Interactive credentials supplied for the current custom config attempt
#[derive(Default)]
struct CustomCredentials {
    username: String,
    password: String,
    priv_key_password: String,
}

pub struct ConnectionManager {
    slot: Slot,
    factories: Vec<Arc<dyn ConnectionFactory>>,
    sender: EventSender,
    helper: Arc<dyn Helper>,

    generation: u64,
    connection: Option<Box<dyn Connection>>,
    /// Torn-down backends that may still be releasing OS resources
    retiring: Vec<Box<dyn Connection>>,
    attempt: Option<Attempt>,
    user_disconnect: bool,
    custom: CustomCredentials,

    last_connected_ip: Option<IpAddr>,
    default_adapter: AdapterInfo,

    // Used from the next attempt on
    settings: ConnectionSettings,
    port_map: PortMap,
    proxy: ProxySettings,
    packet_size: PacketSize,
    tunnel_test_target: Option<String>,
}

impl ConnectionManager {
    pub fn new(
        slot: Slot,
        factories: Vec<Arc<dyn ConnectionFactory>>,
        sender: EventSender,
        helper: Arc<dyn Helper>,
    ) -> Self {
        Self {
            slot,
            factories,
            sender,
            helper,
            generation: 0,
            connection: None,
            retiring: Vec::new(),
            attempt: None,
            user_disconnect: false,
            custom: CustomCredentials::default(),
            last_connected_ip: None,
            default_adapter: AdapterInfo::default(),
            settings: ConnectionSettings::automatic(),
            port_map: PortMap::default(),
            proxy: ProxySettings::default(),
            packet_size: PacketSize::default(),
            tunnel_test_target: None,
        }
    }

    pub fn click_connect(&mut self, request: ConnectRequest) -> Result<(), ConnectError> {
        if self.connection.is_some() {
            warn!("[{:?}] connect while a backend is active, retiring it", self.slot);
            self.retire_connection();
        }
        self.retiring.retain(|c| !c.is_disconnected());

        self.user_disconnect = false;
        self.custom = CustomCredentials::default();
        self.settings = request.settings;
        self.port_map = request.port_map.clone();
        self.proxy = request.proxy.clone();

        let (protocol, port) = select_protocol(
            &request.location,
            request.settings,
            &request.port_map,
            request.preferred_protocol,
            |kind| self.has_factory(kind),
        )?;
        info!(
            "[{:?}] connecting to {} with {}:{}",
            self.slot, request.location.name, protocol, port
        );

        self.attempt = Some(Attempt {
            request,
            protocol,
            port,
            failed: 0,
        });
        self.do_connect()
    }

    /// Returns false when there was no backend to disconnect
    pub fn click_disconnect(&mut self) -> bool {
        match self.connection.as_mut() {
            Some(connection) => {
                debug!("[{:?}] disconnect requested", self.slot);
                self.user_disconnect = true;
                connection.start_disconnect();
                true
            }
            None => false,
        }
    }

    /// Tear down and wait until every backend has released its adapter,
    /// or until `limit` elapses
    pub async fn blocking_disconnect(&mut self, limit: Duration) -> bool {
        if let Some(connection) = self.connection.as_mut() {
            self.user_disconnect = true;
            connection.start_disconnect();
        }

        let deadline = Instant::now() + limit;
        let released = loop {
            self.retiring.retain(|c| !c.is_disconnected());
            let current_done = self.connection.as_ref().is_none_or(|c| c.is_disconnected());
            if current_done && self.retiring.is_empty() {
                break true;
            }
            if Instant::now() >= deadline {
                warn!("[{:?}] backend did not stop within {:?}", self.slot, limit);
                break false;
            }
            sleep(DISCONNECT_POLL_INTERVAL).await;
        };

        self.connection = None;
        self.retiring.clear();
        self.generation += 1;
        released
    }

    pub fn continue_with_username_and_password(
        &mut self,
        username: &str,
        password: &str,
        need_reconnect: bool,
    ) -> ContinueOutcome {
        if username.is_empty() || password.is_empty() {
            return self.cancel_credentials();
        }
        self.custom.username = username.to_string();
        self.custom.password = password.to_string();
        self.resume(need_reconnect, |c| c.continue_with_username_and_password(username, password))
    }

    pub fn continue_with_password(&mut self, password: &str, need_reconnect: bool) -> ContinueOutcome {
        if password.is_empty() {
            return self.cancel_credentials();
        }
        self.custom.password = password.to_string();
        self.resume(need_reconnect, |c| c.continue_with_password(password))
    }

    pub fn continue_with_priv_key_password(
        &mut self,
        password: &str,
        need_reconnect: bool,
    ) -> ContinueOutcome {
        if password.is_empty() {
            return self.cancel_credentials();
        }
        self.custom.priv_key_password = password.to_string();
        self.resume(need_reconnect, |c| c.continue_with_priv_key_password(password))
    }

    /// Probe the tunnel target; the result arrives as
    /// [`ManagerEvent::TestTunnelResult`] for this generation only
    pub fn start_tunnel_tests(&self) {
        let Some(target) = self.tunnel_test_target.clone() else {
            debug!("[{:?}] no tunnel test target configured", self.slot);
            return;
        };
        let sink = EventSink::new(self.slot, self.generation, self.sender.clone());
        tokio::spawn(async move {
            let ok = matches!(
                timeout(TUNNEL_TEST_TIMEOUT, TcpStream::connect(target.as_str())).await,
                Ok(Ok(_))
            );
            debug!("Tunnel test to {}: {}", target, ok);
            sink.emit(ConnectionEvent::TunnelTestResult(ok));
        });
    }

    /// Takes effect on the next attempt; an in-flight attempt keeps its parameters
    pub fn update_connection_settings(
        &mut self,
        settings: ConnectionSettings,
        port_map: PortMap,
        proxy: ProxySettings,
    ) {
        self.settings = settings;
        self.port_map = port_map;
        self.proxy = proxy;
    }

    pub fn set_packet_size(&mut self, packet_size: PacketSize) {
        self.packet_size = packet_size;
    }

    pub fn set_tunnel_test_target(&mut self, target: Option<String>) {
        self.tunnel_test_target = target;
    }

    /// Translate a backend event; `None` for stale or internally handled events
    pub fn handle_event(&mut self, generation: u64, event: ConnectionEvent) -> Option<ManagerEvent> {
        if generation != self.generation {
            debug!(
                "[{:?}] dropping stale event from generation {}: {:?}",
                self.slot, generation, event
            );
            return None;
        }

        match event {
            ConnectionEvent::Connected(adapter) => {
                info!("[{:?}] connected on {}", self.slot, adapter.adapter_name);
                self.last_connected_ip = adapter.remote_ip.or(self.attempt_ip());
                self.default_adapter = self.helper.detect_default_adapter();
                Some(ManagerEvent::Connected(adapter))
            }
            ConnectionEvent::Disconnected => {
                let reason = if self.user_disconnect {
                    DisconnectReason::ByUser
                } else {
                    DisconnectReason::Itself
                };
                info!("[{:?}] disconnected: {:?}", self.slot, reason);
                self.connection = None;
                self.generation += 1;
                Some(ManagerEvent::Disconnected(reason))
            }
            ConnectionEvent::Reconnecting => Some(ManagerEvent::Reconnecting),
            ConnectionEvent::Error(error) => {
                warn!("[{:?}] backend error: {}", self.slot, error);
                match error {
                    ConnectError::AuthError => {
                        self.custom.username.clear();
                        self.custom.password.clear();
                    }
                    ConnectError::PrivKeyPasswordError => self.custom.priv_key_password.clear(),
                    _ => {}
                }
                self.retire_connection();
                Some(ManagerEvent::Error(error))
            }
            ConnectionEvent::StatisticsUpdated {
                bytes_in,
                bytes_out,
                is_total,
            } => Some(ManagerEvent::StatisticsUpdated {
                bytes_in,
                bytes_out,
                is_total,
            }),
            ConnectionEvent::InterfaceUpdated(name) => Some(ManagerEvent::InterfaceUpdated(name)),
            ConnectionEvent::RequestUsername => {
                if !self.custom.username.is_empty() && !self.custom.password.is_empty() {
                    let (u, p) = (self.custom.username.clone(), self.custom.password.clone());
                    self.with_connection(|c| c.continue_with_username_and_password(&u, &p));
                    return None;
                }
                Some(ManagerEvent::RequestUsername(self.custom_config_name()))
            }
            ConnectionEvent::RequestPassword => {
                if !self.custom.password.is_empty() {
                    let p = self.custom.password.clone();
                    self.with_connection(|c| c.continue_with_password(&p));
                    return None;
                }
                Some(ManagerEvent::RequestPassword(self.custom_config_name()))
            }
            ConnectionEvent::RequestPrivKeyPassword => {
                if !self.custom.priv_key_password.is_empty() {
                    let p = self.custom.priv_key_password.clone();
                    self.with_connection(|c| c.continue_with_priv_key_password(&p));
                    return None;
                }
                Some(ManagerEvent::RequestPrivKeyPassword(self.custom_config_name()))
            }
            ConnectionEvent::WireGuardAtKeyLimit => Some(ManagerEvent::WireGuardAtKeyLimit),
            ConnectionEvent::ConnectingToHostname {
                hostname,
                ip,
                dns_servers,
            } => Some(ManagerEvent::ConnectingToHostname {
                hostname,
                ip,
                dns_servers,
            }),
            ConnectionEvent::ProtocolPortChanged { protocol, port } => {
                Some(ManagerEvent::ProtocolPortChanged { protocol, port })
            }
            ConnectionEvent::TunnelTestResult(ok) => Some(ManagerEvent::TestTunnelResult(ok)),
        }
    }

    pub fn has_connection(&self) -> bool {
        self.connection.is_some()
    }

    pub fn is_disconnected(&self) -> bool {
        self.connection.as_ref().is_none_or(|c| c.is_disconnected())
    }

    pub fn is_allow_firewall_after_connection(&self) -> bool {
        self.connection
            .as_ref()
            .is_none_or(|c| c.is_allow_firewall_after_connection())
    }

    pub fn emit_auth_error_on_failure(&self) -> bool {
        self.attempt
            .as_ref()
            .is_some_and(|a| a.request.emit_auth_error_on_failure)
    }

    pub fn current_protocol(&self) -> Option<Protocol> {
        self.attempt.as_ref().map(|a| a.protocol)
    }

    pub fn current_location(&self) -> Option<&LocationInfo> {
        self.attempt.as_ref().map(|a| &a.request.location)
    }

    pub fn is_custom_config_connection(&self) -> bool {
        self.current_location()
            .is_some_and(|l| l.id.is_custom_configs_location())
    }

    pub fn is_static_ips_location(&self) -> bool {
        self.current_location()
            .is_some_and(|l| l.id.is_static_ips_location())
    }

    pub fn custom_config_name(&self) -> String {
        self.current_location()
            .and_then(|l| l.custom_config.as_ref())
            .map(|c| c.file_name())
            .unwrap_or_default()
    }

    pub fn last_connected_ip(&self) -> Option<IpAddr> {
        self.last_connected_ip
    }

    pub fn default_adapter(&self) -> &AdapterInfo {
        &self.default_adapter
    }

    pub fn packet_size(&self) -> PacketSize {
        self.packet_size
    }

    /// Re-run the last request with the current settings and `emit_auth_error_on_failure`
    pub fn reconnect(&mut self, emit_auth_error_on_failure: bool) -> Result<(), ConnectError> {
        let Some(attempt) = self.attempt.as_mut() else {
            return Err(ConnectError::LocationNotExist);
        };
        attempt.request.emit_auth_error_on_failure = emit_auth_error_on_failure;
        self.user_disconnect = false;
        self.do_connect()
    }

    /// Move the attempt to the next node, or to the next protocol once every
    /// node has failed with the current one
    ///
    /// Only automatic connects to API locations fail over. Returns false once
    /// every node/protocol combination has failed.
    pub fn select_next_attempt(&mut self) -> bool {
        let Some(attempt) = self.attempt.as_ref() else {
            return false;
        };
        let request = &attempt.request;
        if request.location.custom_config.is_some() || !request.settings.is_automatic {
            return false;
        }
        let protocols = candidate_protocols(
            request.settings,
            &request.port_map,
            request.preferred_protocol,
            |kind| self.has_factory(kind),
        );
        let nodes = request.location.nodes.len().max(1);
        let failed = attempt.failed + 1;
        if failed >= nodes * protocols.len() {
            info!("[{:?}] every node and protocol failed", self.slot);
            return false;
        }

        let Some(attempt) = self.attempt.as_mut() else {
            return false;
        };
        attempt.failed = failed;
        attempt.request.location.select_next_node();
        if failed % nodes == 0
            && let Some(&protocol) = protocols.get(failed / nodes)
        {
            attempt.protocol = protocol;
            attempt.port = port_for(&attempt.request.port_map, attempt.request.settings, protocol);
        }
        info!(
            "[{:?}] trying {} with {}:{}",
            self.slot,
            attempt
                .request
                .location
                .selected_node()
                .map(|n| n.hostname.as_str())
                .unwrap_or(""),
            attempt.protocol,
            attempt.port
        );
        true
    }

    /// Refresh the cached server credentials before a reconnect
    pub fn set_server_credentials(&mut self, credentials: ServerCredentials) {
        if let Some(attempt) = self.attempt.as_mut() {
            attempt.request.credentials = credentials;
        }
    }

    fn has_factory(&self, kind: ConnectionType) -> bool {
        self.factories.iter().any(|f| f.connection_type() == kind)
    }

    fn attempt_ip(&self) -> Option<IpAddr> {
        self.attempt
            .as_ref()
            .and_then(|a| a.request.location.selected_node())
            .and_then(|n| n.ip)
    }

    fn with_connection(&mut self, f: impl FnOnce(&mut Box<dyn Connection>)) {
        match self.connection.as_mut() {
            Some(connection) => f(connection),
            None => debug!("[{:?}] no backend to forward credentials to", self.slot),
        }
    }

    fn resume(
        &mut self,
        need_reconnect: bool,
        forward: impl FnOnce(&mut Box<dyn Connection>),
    ) -> ContinueOutcome {
        if need_reconnect || self.connection.is_none() {
            return match self.do_connect() {
                Ok(()) => ContinueOutcome::Resumed,
                Err(e) => ContinueOutcome::Failed(e),
            };
        }
        self.with_connection(forward);
        ContinueOutcome::Resumed
    }

    fn cancel_credentials(&mut self) -> ContinueOutcome {
        info!("[{:?}] credential prompt cancelled", self.slot);
        self.click_disconnect();
        ContinueOutcome::Cancelled
    }

    fn retire_connection(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.start_disconnect();
            self.retiring.push(connection);
        }
        self.retiring.retain(|c| !c.is_disconnected());
        self.generation += 1;
    }

    fn do_connect(&mut self) -> Result<(), ConnectError> {
        let Some(attempt) = self.attempt.as_ref() else {
            return Err(ConnectError::LocationNotExist);
        };
        let location = &attempt.request.location;
        let node = location
            .selected_node()
            .ok_or(ConnectError::LocationNoActiveNodes)?;
        let factory = self
            .factories
            .iter()
            .find(|f| f.connection_type() == attempt.protocol.connection_type())
            .cloned()
            .ok_or_else(|| ConnectError::ProtocolUnavailable(attempt.protocol.to_string()))?;

        let custom_config = location.custom_config.as_ref();
        let (username, password) = match custom_config {
            Some(_) => (self.custom.username.clone(), self.custom.password.clone()),
            None => {
                let (u, p) = attempt.request.credentials.for_protocol(attempt.protocol);
                (u.to_string(), p.to_string())
            }
        };

        let config = match (custom_config, attempt.protocol.connection_type()) {
            (Some(file), _) => file.content.clone(),
            (None, ConnectionType::OpenVpn) => build_ovpn_config(
                &attempt.request.ovpn_config,
                node.ip.map(|ip| ip.to_string()).unwrap_or(node.hostname.clone()),
                attempt.port,
                attempt.protocol,
            ),
            (None, ConnectionType::Ikev2) => node.hostname.clone(),
            (None, ConnectionType::WireGuard) => String::new(),
        };

        let params = ConnectParams {
            config,
            ip: node.ip,
            hostname: node.hostname.clone(),
            dns_hostname: location.dns_hostname.clone(),
            port: attempt.port,
            username,
            password,
            proxy: self.proxy.clone(),
            wireguard: attempt.request.wireguard.clone(),
            ikev2_compression: attempt.request.ikev2_compression,
            is_automatic_mode: attempt.request.settings.is_automatic,
        };
        let (protocol, port, hostname, ip) = (attempt.protocol, attempt.port, node.hostname.clone(), node.ip);

        self.generation += 1;
        let sink = EventSink::new(self.slot, self.generation, self.sender.clone());
        sink.emit(ConnectionEvent::ConnectingToHostname {
            hostname,
            ip,
            dns_servers: Vec::new(),
        });
        if custom_config.is_none() {
            sink.emit(ConnectionEvent::ProtocolPortChanged { protocol, port });
        }

        let mut connection = factory.create();
        if let Err(e) = connection.start_connect(params, sink) {
            warn!("[{:?}] backend failed to start: {}", self.slot, e);
            self.generation += 1;
            return Err(ConnectError::DriverFailed(e.to_string()));
        }
        self.connection = Some(connection);
        Ok(())
    }
}

/// Explicit settings win; automatic mode tries the network's last good
/// protocol first, then the port map in order
pub fn select_protocol(
    location: &LocationInfo,
    settings: ConnectionSettings,
    port_map: &PortMap,
    preferred: Option<Protocol>,
    available: impl Fn(ConnectionType) -> bool,
) -> Result<(Protocol, u16), ConnectError> {
    if let Some(file) = &location.custom_config {
        let protocol = match file.kind {
            ConnectionType::OpenVpn => Protocol::OpenVpnUdp,
            ConnectionType::WireGuard => Protocol::WireGuard,
            ConnectionType::Ikev2 => {
                return Err(ConnectError::ConfigError(file.file_name()));
            }
        };
        if !available(protocol.connection_type()) {
            return Err(ConnectError::ProtocolUnavailable(protocol.to_string()));
        }
        return Ok((protocol, 0));
    }

    if !settings.is_automatic {
        if !available(settings.protocol.connection_type()) {
            return Err(ConnectError::ProtocolUnavailable(settings.protocol.to_string()));
        }
        return Ok((settings.protocol, settings.port));
    }

    candidate_protocols(settings, port_map, preferred, available)
        .first()
        .map(|&p| (p, port_for(port_map, settings, p)))
        .ok_or_else(|| ConnectError::ProtocolUnavailable("no usable protocol".to_string()))
}

/// Protocols an automatic attempt may use, best first
fn candidate_protocols(
    settings: ConnectionSettings,
    port_map: &PortMap,
    preferred: Option<Protocol>,
    available: impl Fn(ConnectionType) -> bool,
) -> Vec<Protocol> {
    let offered = |p: Protocol| port_map.is_empty() || !port_map.ports_for(p).is_empty();
    let mut protocols = Vec::new();
    for protocol in preferred
        .into_iter()
        .chain(port_map.protocols())
        .chain(std::iter::once(settings.protocol).filter(|_| port_map.is_empty()))
    {
        if offered(protocol)
            && available(protocol.connection_type())
            && !protocols.contains(&protocol)
        {
            protocols.push(protocol);
        }
    }
    protocols
}

fn port_for(port_map: &PortMap, settings: ConnectionSettings, protocol: Protocol) -> u16 {
    port_map
        .ports_for(protocol)
        .first()
        .copied()
        .unwrap_or(settings.port)
}

fn build_ovpn_config(template: &str, remote: String, port: u16, protocol: Protocol) -> String {
    let proto = match protocol {
        Protocol::OpenVpnTcp => "tcp-client",
        _ => "udp",
    };
    format!("{}\nremote {} {}\nproto {}\n", template.trim_end(), remote, port, proto)
}
