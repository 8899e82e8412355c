//! Engine
//!
//! The single owner of connection state. Every command, backend event and
//! API notification is posted to one queue and handled in order by an actor
//! task, so side effects around state transitions (firewall, DNS, helper)
//! never interleave. [`EngineHandle`] is the cloneable front end; UI-facing
//! notifications come back as [`EngineEvent`]s on the receiver returned by
//! [`Engine::start`].

use crate::api::{ApiEvent, ApiResources, LoginError, LoginRequest, SessionStatus};
use crate::config::EngineSettings;
use crate::connect_state::{ConnectStateChange, ConnectStateController};
use crate::connection::{
    ConnectRequest, ConnectionEvent, ConnectionFactory, ConnectionManager, ContinueOutcome,
    EventSender, ManagerEvent, Slot,
};
use crate::credentials::CredentialStore;
use crate::dns::DnsConfiguration;
use crate::emergency::{EmergencyConfig, EmergencyController, EmergencyEvent};
use crate::firewall::policy::{self, AfterConnectAction, ExitAction};
use crate::firewall::{FirewallController, FirewallExceptions, FirewallMode};
use crate::helper::{ConnectStatus, Helper, SplitTunnelingSettings, VpnSharing};
use crate::locations::{self, Locations};
use crate::packet_size::{self, MtuProbe};
use crate::types::{
    AdapterInfo, ConnectError, ConnectState, ConnectionSettings, DisconnectReason, LocationId,
    NetworkInterface, PacketSize, Protocol,
};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};


/// Requests accepted by the engine
pub enum Command {
    Connect {
        location: LocationId,
        /// One-shot override, dropped after the next disconnect
        settings: Option<ConnectionSettings>,
    },
    Disconnect,
    SetBlockConnect(bool),
    SignOut {
        keep_firewall_on: bool,
    },
    Login(LoginRequest),
    ContinueWithUsernameAndPassword {
        username: String,
        password: String,
        save: bool,
    },
    ContinueWithPassword {
        password: String,
        save: bool,
    },
    ContinueWithPrivKeyPassword {
        password: String,
        save: bool,
    },
    SetSettings(Box<EngineSettings>),
    FirewallOn,
    FirewallOff,
    EmergencyConnect,
    EmergencyDisconnect,
    NetworkChanged(NetworkInterface),
    DetectPacketSize,
    UpdatePacketSize(PacketSize),
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Connect { .. } => "connect",
            Command::Disconnect => "disconnect",
            Command::SetBlockConnect(_) => "set_block_connect",
            Command::SignOut { .. } => "sign_out",
            Command::Login(_) => "login",
            Command::ContinueWithUsernameAndPassword { .. } => "continue_with_username_and_password",
            Command::ContinueWithPassword { .. } => "continue_with_password",
            Command::ContinueWithPrivKeyPassword { .. } => "continue_with_priv_key_password",
            Command::SetSettings(_) => "set_settings",
            Command::FirewallOn => "firewall_on",
            Command::FirewallOff => "firewall_off",
            Command::EmergencyConnect => "emergency_connect",
            Command::EmergencyDisconnect => "emergency_disconnect",
            Command::NetworkChanged(_) => "network_changed",
            Command::DetectPacketSize => "detect_packet_size",
            Command::UpdatePacketSize(_) => "update_packet_size",
        }
    }
}

/// Inputs to the shutdown firewall policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupOptions {
    pub exit_with_restart: bool,
    pub firewall_checked: bool,
    pub firewall_always_on: bool,
    pub launch_on_start: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    ConnectStateChanged(ConnectStateChange),
    EmergencyStateChanged(ConnectStateChange),
    /// Custom config needs credentials; argument is the config file name
    RequestUsername(String),
    RequestPassword(String),
    RequestPrivKeyPassword(String),
    StatisticsUpdated {
        bytes_in: u64,
        bytes_out: u64,
        is_total: bool,
    },
    ProtocolPortChanged {
        protocol: Protocol,
        port: u16,
    },
    FirewallStateChanged(bool),
    PacketSizeChanged(PacketSize),
    PacketSizeDetectionFinished {
        success: bool,
    },
    LastKnownGoodProtocolChanged {
        network: String,
        protocol: Protocol,
    },
    EmergencyConnected,
    EmergencyDisconnected,
    EmergencyConnectError(ConnectError),
    HelperSplitTunnelingStartFailed,
    TestTunnelResult(bool),
    WireGuardAtKeyLimit,
    LoginFailed {
        error: LoginError,
        message: String,
    },
    SessionUpdated(SessionStatus),
    LocationsUpdated,
    ReadyForLogin,
    MyIpUpdated {
        ip: IpAddr,
        is_disconnected: bool,
    },
    NetworkChanged(NetworkInterface),
    SignOutFinished,
    CleanupFinished,
}

enum Message {
    Command(Command),
    Connection {
        slot: Slot,
        generation: u64,
        event: ConnectionEvent,
    },
    Api(ApiEvent),
    PacketSizeDetected(Option<PacketSize>),
    Cleanup(CleanupOptions),
}

#[derive(Debug, Default, Clone, Copy)]
struct Flags {
    initialized: bool,
    block_connect: bool,
}

struct Shared {
    stopping: AtomicBool,
    flags: Mutex<Flags>,
    finished: watch::Sender<bool>,
}

impl Shared {
    fn flags(&self) -> MutexGuard<'_, Flags> {
        self.flags.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Capabilities the engine drives
pub struct EngineDeps {
    pub firewall: Arc<dyn FirewallController>,
    pub helper: Arc<dyn Helper>,
    pub api: Arc<dyn ApiResources>,
    pub sharing: Arc<dyn VpnSharing>,
    pub credentials: Arc<dyn CredentialStore>,
    pub factories: Vec<Arc<dyn ConnectionFactory>>,
    pub mtu_probe: Option<Arc<dyn MtuProbe>>,
    pub emergency: EmergencyConfig,
}

/// Cloneable front end to the engine actor
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<Message>,
    shared: Arc<Shared>,
    state: Arc<ConnectStateController>,
    emergency_state: Arc<ConnectStateController>,
}

impl EngineHandle {
    /// Queue a command; dropped once cleanup has started
    pub fn send(&self, command: Command) {
        if self.shared.stopping.load(Ordering::SeqCst) {
            debug!("Engine is stopping, ignoring {}", command.name());
            return;
        }
        if self.tx.send(Message::Command(command)).is_err() {
            warn!("Engine is not running");
        }
    }

    pub fn connect(&self, location: LocationId, settings: Option<ConnectionSettings>) {
        self.send(Command::Connect { location, settings });
    }

    pub fn disconnect(&self) {
        self.send(Command::Disconnect);
    }

    pub fn set_block_connect(&self, block: bool) {
        self.send(Command::SetBlockConnect(block));
    }

    pub fn sign_out(&self, keep_firewall_on: bool) {
        self.send(Command::SignOut { keep_firewall_on });
    }

    pub fn login(&self, request: LoginRequest) {
        self.send(Command::Login(request));
    }

    /// Empty values cancel the pending connect
    pub fn continue_with_username_and_password(&self, username: &str, password: &str, save: bool) {
        self.send(Command::ContinueWithUsernameAndPassword {
            username: username.to_string(),
            password: password.to_string(),
            save,
        });
    }

    pub fn continue_with_password(&self, password: &str, save: bool) {
        self.send(Command::ContinueWithPassword {
            password: password.to_string(),
            save,
        });
    }

    pub fn continue_with_priv_key_password(&self, password: &str, save: bool) {
        self.send(Command::ContinueWithPrivKeyPassword {
            password: password.to_string(),
            save,
        });
    }

    pub fn set_settings(&self, settings: EngineSettings) {
        self.send(Command::SetSettings(Box::new(settings)));
    }

    pub fn firewall_on(&self) {
        self.send(Command::FirewallOn);
    }

    pub fn firewall_off(&self) {
        self.send(Command::FirewallOff);
    }

    pub fn emergency_connect(&self) {
        self.send(Command::EmergencyConnect);
    }

    pub fn emergency_disconnect(&self) {
        self.send(Command::EmergencyDisconnect);
    }

    pub fn network_changed(&self, network: NetworkInterface) {
        self.send(Command::NetworkChanged(network));
    }

    pub fn detect_packet_size(&self) {
        self.send(Command::DetectPacketSize);
    }

    pub fn update_packet_size(&self, packet_size: PacketSize) {
        self.send(Command::UpdatePacketSize(packet_size));
    }

    /// Shut the engine down and wait for teardown to finish
    ///
    /// Safe to call from several places at once; only the first call runs
    /// the teardown and every caller returns when it is done.
    pub async fn cleanup(&self, options: CleanupOptions) {
        let mut finished = self.shared.finished.subscribe();
        if !self.shared.stopping.swap(true, Ordering::SeqCst) {
            info!("Cleanup requested");
            if self.tx.send(Message::Cleanup(options)).is_err() {
                self.shared.finished.send_replace(true);
            }
        }
        let _ = finished.wait_for(|done| *done).await;
    }

    pub fn connect_state(&self) -> ConnectState {
        self.state.current_state()
    }

    pub fn connect_location(&self) -> LocationId {
        self.state.location()
    }

    pub fn emergency_connect_state(&self) -> ConnectState {
        self.emergency_state.current_state()
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.flags().initialized
    }

    pub fn is_block_connect(&self) -> bool {
        self.shared.flags().block_connect
    }

    pub fn is_cleanup_finished(&self) -> bool {
        *self.shared.finished.borrow()
    }
}

/// Completion tag checked when a disconnect settles
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum PendingAction {
    #[default]
    None,
    Reconnect,
    SignOut { keep_firewall_on: bool },
}

pub struct Engine {
    settings: EngineSettings,
    state: Arc<ConnectStateController>,
    emergency_state: Arc<ConnectStateController>,
    manager: ConnectionManager,
    emergency: EmergencyController,
    firewall: Arc<dyn FirewallController>,
    helper: Arc<dyn Helper>,
    api: Arc<dyn ApiResources>,
    sharing: Arc<dyn VpnSharing>,
    credentials: Arc<dyn CredentialStore>,
    mtu_probe: Option<Arc<dyn MtuProbe>>,
    exceptions: FirewallExceptions,
    dns: DnsConfiguration,
    locations: Locations,
    location_id: LocationId,
    settings_override: Option<ConnectionSettings>,
    pending: PendingAction,
    need_reconnect_after_auth: bool,
    awaiting_server_credentials: bool,
    ports_whitelisted: bool,
    block_connect: bool,
    network: NetworkInterface,
    events: mpsc::UnboundedSender<EngineEvent>,
    messages: mpsc::WeakUnboundedSender<Message>,
    shared: Arc<Shared>,
}

impl Engine {
    /// Spawn the actor on the current tokio runtime
    pub fn start(
        settings: EngineSettings,
        deps: EngineDeps,
    ) -> (EngineHandle, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();

        let state_events = events.clone();
        let state = Arc::new(ConnectStateController::new("primary", move |change| {
            let _ = state_events.send(EngineEvent::ConnectStateChanged(change.clone()));
        }));
        let emergency_events = events.clone();
        let emergency_state = Arc::new(ConnectStateController::new("emergency", move |change| {
            let _ = emergency_events.send(EngineEvent::EmergencyStateChanged(change.clone()));
        }));

        let (finished, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            stopping: AtomicBool::new(false),
            flags: Mutex::new(Flags::default()),
            finished,
        });

        let messages = tx.downgrade();
        let backend_tx = messages.clone();
        let sender: EventSender = Arc::new(move |slot, generation, event| {
            if let Some(tx) = backend_tx.upgrade() {
                let _ = tx.send(Message::Connection {
                    slot,
                    generation,
                    event,
                });
            }
        });

        // Subscribe before spawning so no API event is lost to a race
        let api_tx = messages.clone();
        deps.api.subscribe(Arc::new(move |event| {
            if let Some(tx) = api_tx.upgrade() {
                let _ = tx.send(Message::Api(event));
            }
        }));

        let dns_policy = settings.dns_policy;
        let engine = Engine {
            manager: ConnectionManager::new(
                Slot::Primary,
                deps.factories.clone(),
                sender.clone(),
                deps.helper.clone(),
            ),
            emergency: EmergencyController::new(
                deps.emergency,
                deps.factories,
                sender,
                deps.helper.clone(),
            ),
            settings,
            state: state.clone(),
            emergency_state: emergency_state.clone(),
            firewall: deps.firewall,
            helper: deps.helper,
            api: deps.api,
            sharing: deps.sharing,
            credentials: deps.credentials,
            mtu_probe: deps.mtu_probe,
            exceptions: FirewallExceptions::new(),
            dns: DnsConfiguration::new(dns_policy),
            locations: Locations::new(),
            location_id: LocationId::Empty,
            settings_override: None,
            pending: PendingAction::None,
            need_reconnect_after_auth: false,
            awaiting_server_credentials: false,
            ports_whitelisted: false,
            block_connect: false,
            network: NetworkInterface::default(),
            events,
            messages,
            shared: shared.clone(),
        };
        tokio::spawn(engine.run(rx));

        let handle = EngineHandle {
            tx,
            shared,
            state,
            emergency_state,
        };
        (handle, events_rx)
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Message>) {
        self.init();

        while let Some(message) = rx.recv().await {
            match message {
                Message::Cleanup(options) => {
                    self.cleanup(options).await;
                    break;
                }
                Message::Command(command) => self.handle_command(command),
                Message::Connection {
                    slot: Slot::Primary,
                    generation,
                    event,
                } => self.on_connection_event(generation, event),
                Message::Connection {
                    slot: Slot::Emergency,
                    generation,
                    event,
                } => self.on_emergency_event(generation, event),
                Message::Api(event) => self.on_api_event(event).await,
                Message::PacketSizeDetected(result) => self.on_packet_size_detected(result),
            }
        }

        // Dropping self here releases the managers and any running backend
        self.shared.finished.send_replace(true);
        info!("Engine stopped");
    }

    fn init(&mut self) {
        info!("Engine init");
        self.exceptions.set_dns_policy(self.settings.dns_policy);
        self.exceptions.set_proxy(&self.settings.proxy);
        self.exceptions.set_custom_remote_ip(self.settings.extra.remote_ip());
        self.reload_custom_configs();

        self.apply_connection_settings();
        self.manager.set_packet_size(self.settings.packet_size);
        self.manager
            .set_tunnel_test_target(self.settings.tunnel_test.clone());

        if self.settings.split_tunneling.active {
            self.apply_split_tunneling();
        }
        if self.settings.firewall.mode == FirewallMode::AlwaysOn
            && !self.firewall.firewall_actual_state()
        {
            info!("Firewall mode is always on");
            self.firewall_on_impl();
        }

        self.shared.flags().initialized = true;
        info!("Engine initialized");
    }

    fn handle_command(&mut self, command: Command) {
        debug!("Command: {}", command.name());
        match command {
            Command::Connect { location, settings } => self.connect_click(location, settings),
            Command::Disconnect => self.disconnect_click(),
            Command::SetBlockConnect(block) => {
                info!("Block connect: {}", block);
                self.block_connect = block;
                self.shared.flags().block_connect = block;
            }
            Command::SignOut { keep_firewall_on } => self.sign_out(keep_firewall_on),
            Command::Login(request) => self.api.login(request),
            Command::ContinueWithUsernameAndPassword {
                username,
                password,
                save,
            } => self.continue_with_username_and_password(&username, &password, save),
            Command::ContinueWithPassword { password, save } => {
                self.continue_with_password(&password, save)
            }
            Command::ContinueWithPrivKeyPassword { password, save } => {
                self.continue_with_priv_key_password(&password, save)
            }
            Command::SetSettings(settings) => self.set_settings(*settings),
            Command::FirewallOn => self.firewall_on_impl(),
            Command::FirewallOff => self.firewall_off_impl(),
            Command::EmergencyConnect => self.emergency_connect(),
            Command::EmergencyDisconnect => self.emergency_disconnect(),
            Command::NetworkChanged(network) => self.network_changed(network),
            Command::DetectPacketSize => self.detect_packet_size(),
            Command::UpdatePacketSize(packet_size) => self.update_packet_size(packet_size),
        }
    }

    fn emit(&self, event: EngineEvent) {
        if self.events.send(event).is_err() {
            debug!("No engine event listener");
        }
    }

    // ---- connect / disconnect ----

    fn connect_click(&mut self, location: LocationId, settings: Option<ConnectionSettings>) {
        info!("Connect to {}", location);
        self.location_id = location;
        self.settings_override = settings;

        let state = self.state.current_state();
        if state != ConnectState::Disconnected {
            info!("Connect while {:?}, disconnecting first", state);
            self.pending = PendingAction::Reconnect;
            self.disconnect_click();
            return;
        }
        self.connect_sequence();
    }

    fn connect_sequence(&mut self) {
        let location = self.location_id.clone();

        if self.block_connect && !location.is_custom_configs_location() {
            warn!("Connect to {} blocked", location);
            self.state.set_connecting_state(&location);
            self.finish_with_error(ConnectError::ConnectionBlocked);
            return;
        }

        self.state.set_connecting_state(&location);

        match self.locations.get(&location) {
            None => {
                warn!("Location {} does not exist", location);
                self.finish_with_error(ConnectError::LocationNotExist);
                return;
            }
            Some(info) if !info.is_exist_selected_node() => {
                warn!("Location {} has no active nodes", location);
                self.finish_with_error(ConnectError::LocationNoActiveNodes);
                return;
            }
            Some(_) => {}
        }

        if self
            .exceptions
            .set_custom_remote_ip(self.settings.extra.remote_ip())
        {
            self.update_firewall_settings();
        }

        if policy::enable_before_connection(self.settings.firewall)
            && !self.firewall.firewall_actual_state()
        {
            info!("Enabling firewall before connection");
            self.firewall_on_impl();
        }

        self.do_connect();
    }

    fn do_connect(&mut self) {
        let Some(location) = self.locations.get(&self.location_id).cloned() else {
            return self.finish_with_error(ConnectError::LocationNotExist);
        };
        let settings = self.current_connection_settings();
        let preferred_protocol = if settings.is_automatic {
            self.settings
                .last_known_good_protocol
                .get(&self.network.network_or_ssid)
                .copied()
        } else {
            None
        };

        let request = ConnectRequest {
            ovpn_config: self.api.ovpn_config(),
            credentials: self.api.server_credentials(),
            location,
            settings,
            port_map: self.api.port_map(),
            proxy: self.settings.proxy.clone(),
            emit_auth_error_on_failure: false,
            preferred_protocol,
            wireguard: self.api.wireguard_config(),
            ikev2_compression: self.settings.extra.ikev2_compression,
        };
        if let Err(e) = self.manager.click_connect(request) {
            self.restore_after_disconnect();
            self.finish_with_error(e);
        }
    }

    fn disconnect_click(&mut self) {
        match self.state.current_state() {
            ConnectState::Disconnected => debug!("Already disconnected"),
            ConnectState::Disconnecting => debug!("Disconnect already in progress"),
            ConnectState::Connecting | ConnectState::Connected => {
                info!("Disconnecting from {}", self.location_id);
                self.awaiting_server_credentials = false;
                self.state.set_disconnecting_state();
                if !self.manager.click_disconnect() {
                    self.on_disconnected(DisconnectReason::ByUser);
                }
            }
        }
    }

    /// Terminal failure of the current attempt
    fn finish_with_error(&mut self, error: ConnectError) {
        warn!("Connect failed: {}", error);
        self.settings_override = None;
        self.awaiting_server_credentials = false;
        self.remove_port_whitelist();
        self.api.request_external_ip();
        if self.state.current_state() == ConnectState::Connected {
            self.state.set_disconnecting_state();
        }
        self.state
            .set_disconnected_state(DisconnectReason::WithError, Some(error));
    }

    fn current_connection_settings(&self) -> ConnectionSettings {
        self.settings_override.unwrap_or_else(|| {
            self.settings
                .connection_settings_for(&self.network.network_or_ssid)
        })
    }

    fn apply_connection_settings(&mut self) {
        self.manager.update_connection_settings(
            self.current_connection_settings(),
            self.api.port_map(),
            self.settings.proxy.clone(),
        );
    }

    // ---- backend events ----

    fn on_connection_event(&mut self, generation: u64, event: ConnectionEvent) {
        let Some(event) = self.manager.handle_event(generation, event) else {
            return;
        };
        match event {
            ManagerEvent::Connected(adapter) => self.on_connected(adapter),
            ManagerEvent::Disconnected(reason) => self.on_disconnected(reason),
            ManagerEvent::Reconnecting => self.on_reconnecting(),
            ManagerEvent::Error(error) => self.on_error(error),
            ManagerEvent::StatisticsUpdated {
                bytes_in,
                bytes_out,
                is_total,
            } => self.emit(EngineEvent::StatisticsUpdated {
                bytes_in,
                bytes_out,
                is_total,
            }),
            ManagerEvent::InterfaceUpdated(name) => debug!("Tunnel interface: {}", name),
            ManagerEvent::RequestUsername(config) => self.on_request_username(config),
            ManagerEvent::RequestPassword(config) => self.on_request_password(config),
            ManagerEvent::RequestPrivKeyPassword(config) => {
                self.on_request_priv_key_password(config)
            }
            ManagerEvent::ConnectingToHostname {
                hostname,
                ip,
                dns_servers,
            } => self.on_connecting_to_hostname(&hostname, ip, dns_servers),
            ManagerEvent::ProtocolPortChanged { protocol, port } => {
                self.emit(EngineEvent::ProtocolPortChanged { protocol, port })
            }
            ManagerEvent::TestTunnelResult(ok) => {
                info!("Tunnel test: {}", if ok { "passed" } else { "failed" });
                self.emit(EngineEvent::TestTunnelResult(ok));
            }
            ManagerEvent::WireGuardAtKeyLimit => self.emit(EngineEvent::WireGuardAtKeyLimit),
        }
    }

    fn on_connecting_to_hostname(
        &mut self,
        hostname: &str,
        ip: Option<IpAddr>,
        dns_servers: Vec<IpAddr>,
    ) {
        if !matches!(
            self.state.current_state(),
            ConnectState::Connecting | ConnectState::Connected
        ) {
            return;
        }
        info!("Connecting to {} ({:?})", hostname, ip);
        self.state.set_connecting_state(&self.location_id);

        let ip_changed = self.exceptions.set_connecting_ip(ip);
        let dns_changed = self.exceptions.set_dns_servers(dns_servers);
        if ip_changed || dns_changed {
            self.update_firewall_settings();
        }
    }

    fn on_connected(&mut self, adapter: AdapterInfo) {
        if self.state.current_state() != ConnectState::Connecting {
            debug!(
                "Ignoring connected event in state {:?}",
                self.state.current_state()
            );
            return;
        }
        info!(
            "Connected to {} via {}",
            self.location_id, adapter.adapter_name
        );
        let protocol = self.manager.current_protocol();

        if let Some(protocol) = protocol
            && let Some(mtu) = packet_size::mtu_for_protocol(
                self.manager.packet_size(),
                protocol,
                self.settings.extra.mtu_offsets(),
            )
        {
            info!("Setting MTU {} on {}", mtu, adapter.adapter_name);
            if let Err(e) = self.helper.change_mtu(&adapter.adapter_name, mtu) {
                warn!("Failed to change MTU: {}", e);
            }
        }

        let mut firewall_applied = false;
        match policy::after_connection(
            self.settings.firewall,
            self.manager.is_allow_firewall_after_connection(),
        ) {
            AfterConnectAction::Enable if !self.firewall.firewall_actual_state() => {
                info!("Enabling firewall after connection");
                self.apply_firewall(true);
                self.emit(EngineEvent::FirewallStateChanged(
                    self.firewall.firewall_actual_state(),
                ));
                firewall_applied = true;
            }
            AfterConnectAction::Disable if self.firewall.firewall_actual_state() => {
                info!("Backend does not allow the firewall once connected");
                self.firewall_off_impl();
            }
            _ => {}
        }
        if !firewall_applied && self.firewall.firewall_actual_state() {
            self.apply_firewall(true);
        }

        if self.manager.is_static_ips_location()
            && let Some(location) = self.manager.current_location()
        {
            let ports = location.static_ip_ports.clone();
            info!("Whitelisting static IP ports {:?}", ports);
            match self.firewall.whitelist_ports(&ports) {
                Ok(()) => self.ports_whitelisted = true,
                Err(e) => error!("Failed to whitelist ports: {}", e),
            }
        }

        self.dns.set_connected_state(adapter.dns_servers.clone());

        let status = ConnectStatus {
            is_connected: true,
            terminate_sockets: self.settings.terminate_sockets,
            allow_lan: self.settings.allow_lan_traffic,
            default_adapter: self.manager.default_adapter().clone(),
            vpn_adapter: adapter,
            last_connected_ip: self.manager.last_connected_ip(),
            protocol,
        };
        if let Err(e) = self.helper.send_connect_status(&status) {
            error!("Helper rejected connect status: {}", e);
            self.emit(EngineEvent::HelperSplitTunnelingStartFailed);
        }

        if let Some(protocol) = protocol {
            self.remember_protocol(protocol);
        }

        self.state.set_connected_state(&self.location_id);
        self.manager.start_tunnel_tests();

        if !self.api.is_logged_in() && !self.location_id.is_custom_configs_location() {
            info!("Connected but not logged in, retrying login");
            self.api.retry_login();
        }
    }

    fn remember_protocol(&mut self, protocol: Protocol) {
        if !self.current_connection_settings().is_automatic
            || self.location_id.is_custom_configs_location()
        {
            return;
        }
        let network = self.network.network_or_ssid.clone();
        if self.settings.last_known_good_protocol.get(&network) == Some(&protocol) {
            return;
        }
        debug!("Last known good protocol for '{}': {}", network, protocol);
        self.settings
            .last_known_good_protocol
            .insert(network.clone(), protocol);
        self.emit(EngineEvent::LastKnownGoodProtocolChanged { network, protocol });
    }

    fn on_disconnected(&mut self, reason: DisconnectReason) {
        info!("Disconnected: {:?}", reason);
        if self.state.current_state() == ConnectState::Connected {
            self.state.set_disconnecting_state();
        }
        self.remove_port_whitelist();
        self.awaiting_server_credentials = false;
        self.need_reconnect_after_auth = false;
        self.restore_after_disconnect();

        match std::mem::take(&mut self.pending) {
            PendingAction::Reconnect => {
                self.state.set_disconnected_state(reason, None);
                info!("Reconnecting to {}", self.location_id);
                self.connect_sequence();
                return;
            }
            PendingAction::SignOut { keep_firewall_on } => {
                self.settings_override = None;
                self.state.set_disconnected_state(reason, None);
                self.sign_out_after_disconnect(keep_firewall_on);
                return;
            }
            PendingAction::None => {}
        }

        self.settings_override = None;
        self.api.request_external_ip();
        if reason == DisconnectReason::ByUser
            && policy::disable_on_user_disconnect(self.settings.firewall)
            && self.firewall.firewall_actual_state()
        {
            info!("Disabling firewall after user disconnect");
            self.firewall_off_impl();
        }
        self.state.set_disconnected_state(reason, None);
    }

    fn remove_port_whitelist(&mut self) {
        if !std::mem::take(&mut self.ports_whitelisted) {
            return;
        }
        if let Err(e) = self.firewall.delete_whitelist_ports() {
            error!("Failed to delete whitelisted ports: {}", e);
        }
    }

    /// Undo the connected-state side effects of the primary tunnel
    fn restore_after_disconnect(&mut self) {
        if self.emergency_state.current_state() != ConnectState::Connected {
            self.dns.set_disconnected_state();
        }
        self.send_disconnected_status();

        let ip_changed = self.exceptions.set_connecting_ip(None);
        let dns_changed = self.exceptions.set_dns_servers(Vec::new());
        if ip_changed || dns_changed {
            self.update_firewall_settings();
        }
    }

    fn send_disconnected_status(&self) {
        let status = ConnectStatus::disconnected(
            self.settings.terminate_sockets,
            self.settings.allow_lan_traffic,
            self.helper.detect_default_adapter(),
        );
        if let Err(e) = self.helper.send_connect_status(&status) {
            warn!("Helper rejected disconnect status: {}", e);
        }
    }

    fn on_reconnecting(&mut self) {
        if !matches!(
            self.state.current_state(),
            ConnectState::Connecting | ConnectState::Connected
        ) {
            return;
        }
        info!("Tunnel reconnecting");
        self.dns.set_disconnected_state();
        self.state.set_connecting_state(&self.location_id);
        self.update_firewall_settings();
    }

    fn on_error(&mut self, error: ConnectError) {
        match self.state.current_state() {
            ConnectState::Disconnected => {
                debug!("Ignoring error while disconnected: {}", error);
                return;
            }
            ConnectState::Disconnecting => {
                debug!("Error while disconnecting: {}", error);
                self.on_disconnected(DisconnectReason::ByUser);
                return;
            }
            _ => {}
        }
        warn!("Connection error: {}", error);

        match error {
            ConnectError::AuthError => self.on_auth_error(),
            ConnectError::PrivKeyPasswordError => self.on_priv_key_password_error(),
            error => {
                if error.allows_fallback()
                    && self.state.current_state() == ConnectState::Connecting
                    && self.manager.select_next_attempt()
                {
                    info!("Attempt failed ({}), trying the next node or protocol", error);
                    let emit_auth_error = self.manager.emit_auth_error_on_failure();
                    if let Err(e) = self.manager.reconnect(emit_auth_error) {
                        self.restore_after_disconnect();
                        self.finish_with_error(e);
                    }
                    return;
                }
                self.restore_after_disconnect();
                self.finish_with_error(error);
            }
        }
    }

    fn on_auth_error(&mut self) {
        self.restore_after_disconnect();
        if self.state.current_state() == ConnectState::Connected {
            self.state.set_connecting_state(&self.location_id);
        }

        if self.manager.is_custom_config_connection() {
            let config = self.manager.custom_config_name();
            info!("Credentials rejected for {}, asking again", config);
            self.credentials.remove_credentials(&config);
            self.need_reconnect_after_auth = true;
            self.emit(EngineEvent::RequestUsername(config));
        } else if self.manager.emit_auth_error_on_failure() {
            self.finish_with_error(ConnectError::AuthError);
        } else {
            info!("Server credentials rejected, refreshing session and credentials");
            self.awaiting_server_credentials = true;
            self.api.fetch_session();
            self.api.fetch_server_credentials();
        }
    }

    fn on_priv_key_password_error(&mut self) {
        self.restore_after_disconnect();
        if self.state.current_state() == ConnectState::Connected {
            self.state.set_connecting_state(&self.location_id);
        }
        let config = self.manager.custom_config_name();
        info!("Private key password rejected for {}", config);
        self.credentials.remove_priv_key_password(&config);
        self.need_reconnect_after_auth = true;
        self.emit(EngineEvent::RequestPrivKeyPassword(config));
    }

    fn on_server_credentials_fetched(&mut self) {
        if !self.awaiting_server_credentials {
            debug!("Server credentials updated");
            return;
        }
        self.awaiting_server_credentials = false;
        if self.state.current_state() != ConnectState::Connecting {
            return;
        }
        info!("Retrying connect with refreshed server credentials");
        self.manager
            .set_server_credentials(self.api.server_credentials());
        if let Err(e) = self.manager.reconnect(true) {
            self.restore_after_disconnect();
            self.finish_with_error(e);
        }
    }

    // ---- custom config credentials ----

    fn on_request_username(&mut self, config: String) {
        let stored = self.credentials.get(&config);
        if stored.has_username_and_password() {
            debug!("Using stored credentials for {}", config);
            let outcome =
                self.manager
                    .continue_with_username_and_password(&stored.username, &stored.password, false);
            self.on_continue_outcome(outcome);
            return;
        }
        self.need_reconnect_after_auth = false;
        self.emit(EngineEvent::RequestUsername(config));
    }

    fn on_request_password(&mut self, config: String) {
        let stored = self.credentials.get(&config);
        if !stored.password.is_empty() {
            debug!("Using stored password for {}", config);
            let outcome = self.manager.continue_with_password(&stored.password, false);
            self.on_continue_outcome(outcome);
            return;
        }
        self.need_reconnect_after_auth = false;
        self.emit(EngineEvent::RequestPassword(config));
    }

    fn on_request_priv_key_password(&mut self, config: String) {
        let stored = self.credentials.get(&config);
        if !stored.priv_key_password.is_empty() {
            debug!("Using stored private key password for {}", config);
            let outcome = self
                .manager
                .continue_with_priv_key_password(&stored.priv_key_password, false);
            self.on_continue_outcome(outcome);
            return;
        }
        self.need_reconnect_after_auth = false;
        self.emit(EngineEvent::RequestPrivKeyPassword(config));
    }

    fn is_waiting_for_credentials(&self) -> bool {
        if self.state.current_state() != ConnectState::Connecting {
            debug!("No credential request pending");
            return false;
        }
        true
    }

    fn continue_with_username_and_password(&mut self, username: &str, password: &str, save: bool) {
        if !self.is_waiting_for_credentials() {
            return;
        }
        let config = self.manager.custom_config_name();
        if save && !username.is_empty() && !password.is_empty() {
            self.credentials
                .set_username_and_password(&config, username, password);
        }
        let need_reconnect = std::mem::take(&mut self.need_reconnect_after_auth);
        let outcome = self
            .manager
            .continue_with_username_and_password(username, password, need_reconnect);
        self.on_continue_outcome(outcome);
    }

    fn continue_with_password(&mut self, password: &str, save: bool) {
        if !self.is_waiting_for_credentials() {
            return;
        }
        let config = self.manager.custom_config_name();
        if save && !password.is_empty() {
            self.credentials.set_password(&config, password);
        }
        let need_reconnect = std::mem::take(&mut self.need_reconnect_after_auth);
        let outcome = self.manager.continue_with_password(password, need_reconnect);
        self.on_continue_outcome(outcome);
    }

    fn continue_with_priv_key_password(&mut self, password: &str, save: bool) {
        if !self.is_waiting_for_credentials() {
            return;
        }
        let config = self.manager.custom_config_name();
        if save && !password.is_empty() {
            self.credentials.set_priv_key_password(&config, password);
        }
        let need_reconnect = std::mem::take(&mut self.need_reconnect_after_auth);
        let outcome = self
            .manager
            .continue_with_priv_key_password(password, need_reconnect);
        self.on_continue_outcome(outcome);
    }

    fn on_continue_outcome(&mut self, outcome: ContinueOutcome) {
        match outcome {
            ContinueOutcome::Resumed => {}
            ContinueOutcome::Cancelled => {
                if matches!(
                    self.state.current_state(),
                    ConnectState::Connecting | ConnectState::Connected
                ) {
                    self.state.set_disconnecting_state();
                    if !self.manager.has_connection() {
                        self.on_disconnected(DisconnectReason::ByUser);
                    }
                }
            }
            ContinueOutcome::Failed(error) => {
                self.restore_after_disconnect();
                self.finish_with_error(error);
            }
        }
    }

    // ---- firewall ----

    fn apply_firewall(&self, connected: bool) {
        let is_custom_config = self.location_id.is_custom_configs_location();
        let allow_lan = self.settings.allow_lan_traffic;
        let result = if connected {
            self.firewall.firewall_on(
                self.manager.last_connected_ip(),
                &self.exceptions.ips_for_connected_state(),
                allow_lan,
                is_custom_config,
            )
        } else {
            self.firewall.firewall_on(
                self.exceptions.connecting_ip(),
                &self.exceptions.ips_for_firewall(),
                allow_lan,
                is_custom_config,
            )
        };
        if let Err(e) = result {
            error!("Failed to apply firewall rules: {}", e);
        }
    }

    /// Re-apply the rules after an exception change; no-op while off
    fn update_firewall_settings(&self) {
        if self.firewall.firewall_actual_state() {
            self.apply_firewall(self.state.current_state() == ConnectState::Connected);
        }
    }

    fn firewall_on_impl(&mut self) {
        self.apply_firewall(self.state.current_state() == ConnectState::Connected);
        self.emit(EngineEvent::FirewallStateChanged(
            self.firewall.firewall_actual_state(),
        ));
    }

    fn firewall_off_impl(&mut self) {
        if let Err(e) = self.firewall.firewall_off() {
            error!("Failed to disable firewall: {}", e);
        }
        self.emit(EngineEvent::FirewallStateChanged(
            self.firewall.firewall_actual_state(),
        ));
    }

    // ---- account ----

    fn sign_out(&mut self, keep_firewall_on: bool) {
        info!("Sign out");
        if self.state.current_state() != ConnectState::Disconnected {
            self.pending = PendingAction::SignOut { keep_firewall_on };
            self.disconnect_click();
            return;
        }
        self.sign_out_after_disconnect(keep_firewall_on);
    }

    fn sign_out_after_disconnect(&mut self, keep_firewall_on: bool) {
        self.locations.set_api_locations(Vec::new());
        if self.exceptions.set_location_ping_ips(Vec::new()) {
            self.update_firewall_settings();
        }
        if let Err(e) = self.firewall.enable_firewall_on_boot(false, &BTreeSet::new()) {
            warn!("Failed to disable firewall on boot: {}", e);
        }
        self.api.sign_out();
        if !keep_firewall_on && self.firewall.firewall_actual_state() {
            self.firewall_off_impl();
        }
        self.emit(EngineEvent::SignOutFinished);
        info!("Sign out finished");
    }

    async fn on_api_event(&mut self, event: ApiEvent) {
        match event {
            ApiEvent::LoginFailed { error, message } => {
                warn!("Login failed: {}", message);
                self.emit(EngineEvent::LoginFailed { error, message });
            }
            ApiEvent::SessionUpdated(status) => {
                if status.is_blocked {
                    warn!("Session is blocked");
                }
                self.emit(EngineEvent::SessionUpdated(status));
            }
            ApiEvent::ServerCredentialsFetched => self.on_server_credentials_fetched(),
            ApiEvent::LocationsUpdated(list) => {
                info!("Locations updated: {}", list.len());
                self.locations.set_api_locations(list);
                if self.exceptions.set_location_ping_ips(self.locations.ping_ips()) {
                    self.update_firewall_settings();
                }
                self.apply_connection_settings();
                self.emit(EngineEvent::LocationsUpdated);
            }
            ApiEvent::ReadyForLogin => self.on_ready_for_login().await,
            ApiEvent::HostIpsChanged(ips) => {
                if self.exceptions.set_host_ips(ips) {
                    self.update_firewall_settings();
                }
            }
            ApiEvent::ExternalIpUpdated(ip) => self.emit(EngineEvent::MyIpUpdated {
                ip,
                is_disconnected: self.state.current_state() == ConnectState::Disconnected,
            }),
        }
    }

    async fn on_ready_for_login(&mut self) {
        if self.emergency_state.current_state() != ConnectState::Disconnected
            || !self.emergency.is_disconnected()
        {
            info!("Stopping emergency connection before login");
            self.emergency
                .blocking_disconnect(self.settings.blocking_disconnect_timeout())
                .await;
            self.settle_emergency_disconnected();
        }
        self.api.request_external_ip();
        if self.state.current_state() == ConnectState::Disconnected {
            self.send_disconnected_status();
        }
        self.emit(EngineEvent::ReadyForLogin);
        if self.api.auth_hash().is_some() {
            self.api.login(LoginRequest::AuthHash);
        }
    }

    // ---- settings ----

    fn set_settings(&mut self, settings: EngineSettings) {
        let old = std::mem::replace(&mut self.settings, settings);
        // Learned entries the caller has not persisted yet
        for (network, protocol) in old.last_known_good_protocol.iter() {
            self.settings
                .last_known_good_protocol
                .entry(network.clone())
                .or_insert(*protocol);
        }

        let mut firewall_dirty = old.allow_lan_traffic != self.settings.allow_lan_traffic;
        if old.dns_policy != self.settings.dns_policy {
            info!("DNS policy changed to {:?}", self.settings.dns_policy);
            firewall_dirty |= self.exceptions.set_dns_policy(self.settings.dns_policy);
            self.dns.set_policy(self.settings.dns_policy);
        }
        if old.proxy != self.settings.proxy {
            firewall_dirty |= self.exceptions.set_proxy(&self.settings.proxy);
        }
        if old.extra.remote_ip != self.settings.extra.remote_ip {
            firewall_dirty |= self
                .exceptions
                .set_custom_remote_ip(self.settings.extra.remote_ip());
        }
        if firewall_dirty {
            self.update_firewall_settings();
        }

        if old.packet_size != self.settings.packet_size {
            self.manager.set_packet_size(self.settings.packet_size);
            self.emit(EngineEvent::PacketSizeChanged(self.settings.packet_size));
        }
        if old.custom_configs_path != self.settings.custom_configs_path {
            self.reload_custom_configs();
        }
        if old.split_tunneling != self.settings.split_tunneling
            || old.allow_lan_traffic != self.settings.allow_lan_traffic
        {
            self.apply_split_tunneling();
        }
        if old.tunnel_test != self.settings.tunnel_test {
            self.manager
                .set_tunnel_test_target(self.settings.tunnel_test.clone());
        }
        self.apply_connection_settings();

        if old.firewall.mode != self.settings.firewall.mode
            && self.settings.firewall.mode == FirewallMode::AlwaysOn
            && !self.firewall.firewall_actual_state()
        {
            info!("Firewall mode switched to always on");
            self.firewall_on_impl();
        }
    }

    fn reload_custom_configs(&mut self) {
        let configs = match &self.settings.custom_configs_path {
            Some(dir) => locations::load_custom_configs(dir).unwrap_or_else(|e| {
                warn!("Failed to read custom configs from {}: {}", dir.display(), e);
                Vec::new()
            }),
            None => Vec::new(),
        };
        info!("Loaded {} custom config(s)", configs.len());
        self.locations.set_custom_config_locations(configs);
        if self
            .exceptions
            .set_custom_config_ping_ips(self.locations.custom_config_ping_ips())
        {
            self.update_firewall_settings();
        }
    }

    fn apply_split_tunneling(&self) {
        if let Err(e) = self.helper.set_split_tunneling_settings(
            &self.settings.split_tunneling,
            self.settings.allow_lan_traffic,
        ) {
            warn!("Failed to apply split tunneling: {}", e);
        }
    }

    fn network_changed(&mut self, network: NetworkInterface) {
        if network == self.network {
            return;
        }
        info!(
            "Network changed: {} ({})",
            network.name, network.network_or_ssid
        );
        self.network = network.clone();
        // Applies to the next attempt only
        self.apply_connection_settings();
        if self.state.current_state() == ConnectState::Disconnected {
            self.send_disconnected_status();
        }
        self.emit(EngineEvent::NetworkChanged(network));
    }

    // ---- packet size ----

    fn detect_packet_size(&mut self) {
        let Some(probe) = self.mtu_probe.clone() else {
            warn!("Packet size detection is not available");
            self.emit(EngineEvent::PacketSizeDetectionFinished { success: false });
            return;
        };
        let host = self.settings.packet_size_probe_host.clone();
        let messages = self.messages.clone();
        info!("Detecting packet size against {}", host);
        tokio::spawn(async move {
            let result = packet_size::detect_packet_size(probe, host).await;
            if let Some(tx) = messages.upgrade() {
                let _ = tx.send(Message::PacketSizeDetected(result));
            }
        });
    }

    fn on_packet_size_detected(&mut self, result: Option<PacketSize>) {
        self.emit(EngineEvent::PacketSizeDetectionFinished {
            success: result.is_some(),
        });
        match result {
            Some(detected) => self.update_packet_size(PacketSize {
                is_automatic: self.settings.packet_size.is_automatic,
                mtu: detected.mtu,
            }),
            None => warn!("Packet size detection failed"),
        }
    }

    fn update_packet_size(&mut self, packet_size: PacketSize) {
        self.manager.set_packet_size(packet_size);
        if self.settings.packet_size != packet_size {
            info!("Packet size changed to {:?}", packet_size);
            self.settings.packet_size = packet_size;
            self.emit(EngineEvent::PacketSizeChanged(packet_size));
        }
    }

    // ---- emergency ----

    fn emergency_connect(&mut self) {
        if self.emergency_state.current_state() != ConnectState::Disconnected {
            debug!("Emergency connection already active");
            return;
        }
        self.emergency_state.set_connecting_state(&LocationId::Empty);
        if let Err(e) = self.emergency.click_connect(self.settings.proxy.clone()) {
            self.emergency_state
                .set_disconnected_state(DisconnectReason::WithError, Some(e.clone()));
            self.emit(EngineEvent::EmergencyConnectError(e));
        }
    }

    fn emergency_disconnect(&mut self) {
        match self.emergency_state.current_state() {
            ConnectState::Connecting | ConnectState::Connected => {
                self.emergency_state.set_disconnecting_state();
                if !self.emergency.click_disconnect() {
                    self.on_emergency_disconnected(DisconnectReason::ByUser);
                }
            }
            state => debug!("Emergency disconnect ignored in state {:?}", state),
        }
    }

    fn on_emergency_event(&mut self, generation: u64, event: ConnectionEvent) {
        let Some(event) = self.emergency.handle_event(generation, event) else {
            return;
        };
        match event {
            EmergencyEvent::Connected(adapter) => {
                if self.emergency_state.current_state() != ConnectState::Connecting {
                    return;
                }
                self.dns.set_connected_state(adapter.dns_servers);
                self.emergency_state.set_connected_state(&LocationId::Empty);
                self.emit(EngineEvent::EmergencyConnected);
            }
            EmergencyEvent::Disconnected(reason) => self.on_emergency_disconnected(reason),
            EmergencyEvent::Error(error) => match self.emergency_state.current_state() {
                ConnectState::Disconnected => {}
                ConnectState::Disconnecting => {
                    self.on_emergency_disconnected(DisconnectReason::ByUser)
                }
                state => {
                    warn!("Emergency connection failed: {}", error);
                    if state == ConnectState::Connected {
                        self.emergency_state.set_disconnecting_state();
                    }
                    self.restore_emergency_dns();
                    self.emergency_state
                        .set_disconnected_state(DisconnectReason::WithError, Some(error.clone()));
                    self.emit(EngineEvent::EmergencyConnectError(error));
                }
            },
        }
    }

    fn on_emergency_disconnected(&mut self, reason: DisconnectReason) {
        if self.emergency_state.current_state() == ConnectState::Disconnected {
            return;
        }
        if self.emergency_state.current_state() == ConnectState::Connected {
            self.emergency_state.set_disconnecting_state();
        }
        self.restore_emergency_dns();
        self.emergency_state.set_disconnected_state(reason, None);
        self.emit(EngineEvent::EmergencyDisconnected);
    }

    fn restore_emergency_dns(&mut self) {
        if self.state.current_state() != ConnectState::Connected {
            self.dns.set_disconnected_state();
        }
    }

    fn settle_emergency_disconnected(&mut self) {
        let was_active = self.emergency_state.current_state() != ConnectState::Disconnected;
        settle_disconnected(&self.emergency_state);
        self.restore_emergency_dns();
        if was_active {
            self.emit(EngineEvent::EmergencyDisconnected);
        }
    }

    // ---- shutdown ----

    async fn cleanup(&mut self, options: CleanupOptions) {
        info!("Cleanup started");
        let limit = self.settings.blocking_disconnect_timeout();

        if self.emergency_state.current_state() != ConnectState::Disconnected
            || !self.emergency.is_disconnected()
        {
            if !self.emergency.blocking_disconnect(limit).await {
                warn!("Emergency connection did not stop in time");
            }
            self.settle_emergency_disconnected();
        }

        if self.state.current_state() != ConnectState::Disconnected
            || !self.manager.is_disconnected()
        {
            if !self.manager.blocking_disconnect(limit).await {
                warn!("Connection did not stop in time");
            }
            self.pending = PendingAction::None;
            self.awaiting_server_credentials = false;
            settle_disconnected(&self.state);
        }

        self.remove_port_whitelist();
        self.dns.set_disconnected_state();
        if let Err(e) = self.helper.set_split_tunneling_settings(
            &SplitTunnelingSettings::off(),
            self.settings.allow_lan_traffic,
        ) {
            warn!("Failed to disable split tunneling: {}", e);
        }
        self.send_disconnected_status();

        if !options.exit_with_restart {
            self.sharing.stop_wifi_sharing();
            self.sharing.stop_proxy_sharing();
        }

        match policy::on_exit(
            options.firewall_checked,
            options.exit_with_restart,
            options.launch_on_start,
            options.firewall_always_on,
        ) {
            ExitAction::OnBoot => {
                info!("Leaving firewall on and enabling it on boot");
                let ips = self.exceptions.ips_for_firewall();
                if let Err(e) = self.firewall.enable_firewall_on_boot(true, &ips) {
                    error!("Failed to enable firewall on boot: {}", e);
                }
            }
            ExitAction::Off => {
                if let Err(e) = self.firewall.enable_firewall_on_boot(false, &BTreeSet::new()) {
                    warn!("Failed to disable firewall on boot: {}", e);
                }
                if self.firewall.firewall_actual_state() {
                    self.firewall_off_impl();
                }
            }
        }

        self.emit(EngineEvent::CleanupFinished);
        info!("Cleanup finished");
    }
}

/// Walk a controller to Disconnected through legal transitions
fn settle_disconnected(controller: &ConnectStateController) {
    match controller.current_state() {
        ConnectState::Connecting | ConnectState::Connected => {
            controller.set_disconnecting_state();
            controller.set_disconnected_state(DisconnectReason::ByUser, None);
        }
        ConnectState::Disconnecting => {
            controller.set_disconnected_state(DisconnectReason::ByUser, None);
        }
        ConnectState::Disconnected => {}
    }
}
