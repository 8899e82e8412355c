//! In-memory capability doubles shared by the unit and engine tests

use crate::api::{ApiEvent, ApiEventSink, ApiResources, LoginRequest, SessionStatus};
use crate::connection::{
    ConnectParams, Connection, ConnectionError, ConnectionEvent, ConnectionFactory, EventSink,
};
use crate::firewall::{FirewallController, FirewallError};
use crate::helper::{ConnectStatus, Helper, HelperError, SplitTunnelingSettings, VpnSharing};
use crate::locations::{LocationInfo, Node};
use crate::types::{
    AdapterInfo, ConnectError, ConnectionType, LocationId, PortMap, ServerCredentials,
    WireGuardConfig,
};
use std::collections::{BTreeSet, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub fn sample_location(id: i32) -> LocationInfo {
    LocationInfo::new(
        LocationId::Api {
            id,
            city: format!("City {}", id),
        },
        format!("Location {}", id),
        vec![Node {
            hostname: format!("node{}.example.net", id),
            ip: Some(format!("198.51.100.{}", id).parse().unwrap()),
            weight: 1,
        }],
    )
}

pub fn tunnel_adapter() -> AdapterInfo {
    AdapterInfo {
        adapter_name: "tun0".to_string(),
        adapter_ip: Some("10.8.0.2".parse().unwrap()),
        if_index: 12,
        dns_servers: vec!["10.8.0.1".parse().unwrap()],
        gateway: Some("10.8.0.1".parse().unwrap()),
        remote_ip: None,
    }
}

/// What a fake backend does once `start_connect` is called
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Script {
    Idle,
    Connect,
    Fail(ConnectError),
    RequestUsername,
    RequestPrivKeyPassword,
}

#[derive(Default)]
struct BackendLog {
    created: usize,
    params: Vec<ConnectParams>,
    sinks: Vec<EventSink>,
    credentials: Vec<(String, String)>,
    disconnect_calls: usize,
    stuck: bool,
    scripts: VecDeque<Script>,
}

/// Factories for every backend type, sharing one log
#[derive(Clone)]
pub struct FakeBackends {
    log: Arc<Mutex<BackendLog>>,
    default_script: Script,
}

impl FakeBackends {
    /// Backends that start and then wait for the test to drive them
    pub fn new() -> Self {
        Self {
            log: Arc::new(Mutex::new(BackendLog::default())),
            default_script: Script::Idle,
        }
    }

    /// Backends that report `Connected` as soon as they start
    pub fn connecting() -> Self {
        Self {
            default_script: Script::Connect,
            ..Self::new()
        }
    }

    /// Scripts consumed one per started backend, before the default applies
    pub fn push_script(&self, script: Script) {
        self.log.lock().unwrap().scripts.push_back(script);
    }

    pub fn factories(&self) -> Vec<Arc<dyn ConnectionFactory>> {
        [ConnectionType::WireGuard, ConnectionType::Ikev2, ConnectionType::OpenVpn]
            .into_iter()
            .map(|kind| {
                Arc::new(FakeFactory {
                    kind,
                    backends: self.clone(),
                }) as Arc<dyn ConnectionFactory>
            })
            .collect()
    }

    pub fn last_params(&self) -> Option<ConnectParams> {
        self.log.lock().unwrap().params.last().cloned()
    }

    pub fn last_sink(&self) -> Option<EventSink> {
        self.log.lock().unwrap().sinks.last().cloned()
    }

    pub fn credentials(&self) -> Vec<(String, String)> {
        self.log.lock().unwrap().credentials.clone()
    }

    pub fn disconnect_calls(&self) -> usize {
        self.log.lock().unwrap().disconnect_calls
    }

    pub fn created(&self) -> usize {
        self.log.lock().unwrap().created
    }

    pub fn started(&self) -> usize {
        self.log.lock().unwrap().params.len()
    }

    /// Stuck backends never finish disconnecting
    pub fn set_stuck(&self, stuck: bool) {
        self.log.lock().unwrap().stuck = stuck;
    }
}

struct FakeFactory {
    kind: ConnectionType,
    backends: FakeBackends,
}

impl ConnectionFactory for FakeFactory {
    fn connection_type(&self) -> ConnectionType {
        self.kind
    }

    fn create(&self) -> Box<dyn Connection> {
        self.backends.log.lock().unwrap().created += 1;
        Box::new(FakeConnection {
            kind: self.kind,
            backends: self.backends.clone(),
            sink: None,
            disconnected: false,
        })
    }
}

struct FakeConnection {
    kind: ConnectionType,
    backends: FakeBackends,
    sink: Option<EventSink>,
    disconnected: bool,
}

impl FakeConnection {
    fn emit(&self, event: ConnectionEvent) {
        if let Some(sink) = &self.sink {
            sink.emit(event);
        }
    }
}

impl Connection for FakeConnection {
    fn start_connect(
        &mut self,
        params: ConnectParams,
        sink: EventSink,
    ) -> Result<(), ConnectionError> {
        let script = {
            let mut log = self.backends.log.lock().unwrap();
            log.params.push(params);
            log.sinks.push(sink.clone());
            log.scripts
                .pop_front()
                .unwrap_or_else(|| self.backends.default_script.clone())
        };
        self.sink = Some(sink);

        match script {
            Script::Idle => {}
            Script::Connect => self.emit(ConnectionEvent::Connected(tunnel_adapter())),
            Script::Fail(error) => self.emit(ConnectionEvent::Error(error)),
            Script::RequestUsername => self.emit(ConnectionEvent::RequestUsername),
            Script::RequestPrivKeyPassword => self.emit(ConnectionEvent::RequestPrivKeyPassword),
        }
        Ok(())
    }

    fn start_disconnect(&mut self) {
        let stuck = {
            let mut log = self.backends.log.lock().unwrap();
            log.disconnect_calls += 1;
            log.stuck
        };
        if !stuck && !self.disconnected {
            self.disconnected = true;
            self.emit(ConnectionEvent::Disconnected);
        }
    }

    fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    fn connection_type(&self) -> ConnectionType {
        self.kind
    }

    fn continue_with_username_and_password(&mut self, username: &str, password: &str) {
        self.backends
            .log
            .lock()
            .unwrap()
            .credentials
            .push((username.to_string(), password.to_string()));
        self.emit(ConnectionEvent::Connected(tunnel_adapter()));
    }

    fn continue_with_password(&mut self, password: &str) {
        self.backends
            .log
            .lock()
            .unwrap()
            .credentials
            .push((String::new(), password.to_string()));
        self.emit(ConnectionEvent::Connected(tunnel_adapter()));
    }

    fn continue_with_priv_key_password(&mut self, _password: &str) {
        self.emit(ConnectionEvent::Connected(tunnel_adapter()));
    }
}

#[derive(Default)]
pub struct RecordingHelper {
    statuses: Mutex<Vec<ConnectStatus>>,
    split_tunneling: Mutex<Vec<SplitTunnelingSettings>>,
    mtu_changes: Mutex<Vec<(String, u32)>>,
    fail_connect_status: AtomicBool,
}

impl RecordingHelper {
    pub fn statuses(&self) -> Vec<ConnectStatus> {
        self.statuses.lock().unwrap().clone()
    }

    pub fn split_tunneling(&self) -> Vec<SplitTunnelingSettings> {
        self.split_tunneling.lock().unwrap().clone()
    }

    pub fn mtu_changes(&self) -> Vec<(String, u32)> {
        self.mtu_changes.lock().unwrap().clone()
    }

    pub fn set_fail_connect_status(&self, fail: bool) {
        self.fail_connect_status.store(fail, Ordering::SeqCst);
    }
}

impl Helper for RecordingHelper {
    fn send_connect_status(&self, status: &ConnectStatus) -> Result<(), HelperError> {
        self.statuses.lock().unwrap().push(status.clone());
        if self.fail_connect_status.load(Ordering::SeqCst) {
            return Err(HelperError::CommandError("split tunneling refused".to_string()));
        }
        Ok(())
    }

    fn set_split_tunneling_settings(
        &self,
        settings: &SplitTunnelingSettings,
        _allow_lan: bool,
    ) -> Result<(), HelperError> {
        self.split_tunneling.lock().unwrap().push(settings.clone());
        Ok(())
    }

    fn change_mtu(&self, adapter_name: &str, mtu: u32) -> Result<(), HelperError> {
        self.mtu_changes
            .lock()
            .unwrap()
            .push((adapter_name.to_string(), mtu));
        Ok(())
    }

    fn detect_default_adapter(&self) -> AdapterInfo {
        AdapterInfo {
            adapter_name: "eth0".to_string(),
            adapter_ip: Some("192.168.1.20".parse().unwrap()),
            if_index: 2,
            dns_servers: Vec::new(),
            gateway: Some("192.168.1.1".parse().unwrap()),
            remote_ip: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirewallOp {
    On {
        connecting_ip: Option<IpAddr>,
        exceptions: BTreeSet<IpAddr>,
    },
    Off,
    Whitelist(Vec<u16>),
    DeleteWhitelist,
    Boot(bool),
}

#[derive(Default)]
pub struct RecordingFirewall {
    ops: Mutex<Vec<FirewallOp>>,
    on: AtomicBool,
}

impl RecordingFirewall {
    pub fn ops(&self) -> Vec<FirewallOp> {
        self.ops.lock().unwrap().clone()
    }

    pub fn is_on(&self) -> bool {
        self.on.load(Ordering::SeqCst)
    }

    /// Rules left behind by a previous run
    pub fn set_on(&self, on: bool) {
        self.on.store(on, Ordering::SeqCst);
    }

    pub fn count(&self, matches: impl Fn(&FirewallOp) -> bool) -> usize {
        self.ops.lock().unwrap().iter().filter(|op| matches(op)).count()
    }
}

impl FirewallController for RecordingFirewall {
    fn firewall_on(
        &self,
        connecting_ip: Option<IpAddr>,
        exception_ips: &BTreeSet<IpAddr>,
        _allow_lan: bool,
        _is_custom_config: bool,
    ) -> Result<(), FirewallError> {
        self.ops.lock().unwrap().push(FirewallOp::On {
            connecting_ip,
            exceptions: exception_ips.clone(),
        });
        self.on.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn firewall_off(&self) -> Result<(), FirewallError> {
        self.ops.lock().unwrap().push(FirewallOp::Off);
        self.on.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn firewall_actual_state(&self) -> bool {
        self.is_on()
    }

    fn whitelist_ports(&self, ports: &[u16]) -> Result<(), FirewallError> {
        self.ops
            .lock()
            .unwrap()
            .push(FirewallOp::Whitelist(ports.to_vec()));
        Ok(())
    }

    fn delete_whitelist_ports(&self) -> Result<(), FirewallError> {
        self.ops.lock().unwrap().push(FirewallOp::DeleteWhitelist);
        Ok(())
    }

    fn enable_firewall_on_boot(
        &self,
        enable: bool,
        _ips: &BTreeSet<IpAddr>,
    ) -> Result<(), FirewallError> {
        self.ops.lock().unwrap().push(FirewallOp::Boot(enable));
        Ok(())
    }
}

/// API double; refreshes complete immediately through the subscribed sink
pub struct FakeApi {
    sink: Mutex<Option<ApiEventSink>>,
    logged_in: AtomicBool,
    credentials: ServerCredentials,
    session_fetches: AtomicUsize,
    credential_fetches: AtomicUsize,
    external_ip_requests: AtomicUsize,
    sign_outs: AtomicUsize,
    logins: Mutex<Vec<LoginRequest>>,
}

impl Default for FakeApi {
    fn default() -> Self {
        Self {
            sink: Mutex::new(None),
            logged_in: AtomicBool::new(true),
            credentials: ServerCredentials {
                openvpn_username: "ovpn-user".to_string(),
                openvpn_password: "ovpn-pass".to_string(),
                ikev2_username: "ike-user".to_string(),
                ikev2_password: "ike-pass".to_string(),
            },
            session_fetches: AtomicUsize::new(0),
            credential_fetches: AtomicUsize::new(0),
            external_ip_requests: AtomicUsize::new(0),
            sign_outs: AtomicUsize::new(0),
            logins: Mutex::new(Vec::new()),
        }
    }
}

impl FakeApi {
    pub fn emit(&self, event: ApiEvent) {
        let sink = self.sink.lock().unwrap().clone();
        if let Some(sink) = sink {
            sink(event);
        }
    }

    pub fn credential_fetches(&self) -> usize {
        self.credential_fetches.load(Ordering::SeqCst)
    }

    pub fn session_fetches(&self) -> usize {
        self.session_fetches.load(Ordering::SeqCst)
    }

    pub fn external_ip_requests(&self) -> usize {
        self.external_ip_requests.load(Ordering::SeqCst)
    }

    pub fn sign_outs(&self) -> usize {
        self.sign_outs.load(Ordering::SeqCst)
    }

    pub fn logins(&self) -> Vec<LoginRequest> {
        self.logins.lock().unwrap().clone()
    }
}

impl ApiResources for FakeApi {
    fn subscribe(&self, sink: ApiEventSink) {
        *self.sink.lock().unwrap() = Some(sink);
    }

    fn auth_hash(&self) -> Option<String> {
        Some("hash".to_string())
    }

    fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    fn session_status(&self) -> SessionStatus {
        SessionStatus::default()
    }

    fn server_credentials(&self) -> ServerCredentials {
        self.credentials.clone()
    }

    fn ovpn_config(&self) -> String {
        "client\ndev tun".to_string()
    }

    fn port_map(&self) -> PortMap {
        PortMap::default()
    }

    fn wireguard_config(&self) -> Option<WireGuardConfig> {
        None
    }

    fn fetch_session(&self) {
        self.session_fetches.fetch_add(1, Ordering::SeqCst);
        self.emit(ApiEvent::SessionUpdated(SessionStatus::default()));
    }

    fn fetch_server_credentials(&self) {
        self.credential_fetches.fetch_add(1, Ordering::SeqCst);
        self.emit(ApiEvent::ServerCredentialsFetched);
    }

    fn login(&self, request: LoginRequest) {
        self.logins.lock().unwrap().push(request);
    }

    fn retry_login(&self) {}

    fn sign_out(&self) {
        self.sign_outs.fetch_add(1, Ordering::SeqCst);
        self.logged_in.store(false, Ordering::SeqCst);
    }

    fn request_external_ip(&self) {
        self.external_ip_requests.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct RecordingSharing {
    stops: AtomicUsize,
}

impl RecordingSharing {
    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl VpnSharing for RecordingSharing {
    fn is_sharing_active(&self) -> bool {
        false
    }

    fn stop_wifi_sharing(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn stop_proxy_sharing(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}
