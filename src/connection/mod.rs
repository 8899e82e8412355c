//! Tunnel backend contract
//!
//! A backend ([`Connection`]) owns one tunnel attempt. It runs its work on
//! its own tokio tasks and reports back only through the [`EventSink`] it is
//! handed in [`Connection::start_connect`]. Every sink is stamped with the
//! attempt's generation so events from a torn-down backend can be told apart
//! from the current one.

pub mod manager;
pub mod openvpn;

pub use manager::{ConnectRequest, ConnectionManager, ContinueOutcome, ManagerEvent};

use crate::types::{
    AdapterInfo, ConnectError, ConnectionType, Protocol, ProxySettings, WireGuardConfig,
};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Failed to start tunnel process: {0}")]
    SpawnError(#[from] std::io::Error),
    #[error("Backend does not support this config: {0}")]
    UnsupportedConfig(String),
    #[error("Backend already running")]
    AlreadyRunning,
}

/// Which connection an event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Primary,
    Emergency,
}

/// Everything a backend needs for one attempt
#[derive(Clone, Default)]
pub struct ConnectParams {
    /// OpenVPN config text, or the IKEv2 server URL
    pub config: String,
    pub ip: Option<IpAddr>,
    pub hostname: String,
    pub dns_hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub proxy: ProxySettings,
    pub wireguard: Option<WireGuardConfig>,
    pub ikev2_compression: bool,
    pub is_automatic_mode: bool,
}

impl fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectParams")
            .field("ip", &self.ip)
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("is_automatic_mode", &self.is_automatic_mode)
            .finish_non_exhaustive()
    }
}

/// Events a backend may report
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected(AdapterInfo),
    Disconnected,
    Reconnecting,
    Error(ConnectError),
    StatisticsUpdated {
        bytes_in: u64,
        bytes_out: u64,
        is_total: bool,
    },
    InterfaceUpdated(String),
    RequestUsername,
    RequestPassword,
    RequestPrivKeyPassword,
    WireGuardAtKeyLimit,
    /// Posted by the manager, not by backends
    ConnectingToHostname {
        hostname: String,
        ip: Option<IpAddr>,
        dns_servers: Vec<IpAddr>,
    },
    /// Posted by the manager
    ProtocolPortChanged { protocol: Protocol, port: u16 },
    /// Posted by the manager's tunnel test task
    TunnelTestResult(bool),
}

pub type EventSender = Arc<dyn Fn(Slot, u64, ConnectionEvent) + Send + Sync>;

#[derive(Clone)]
pub struct EventSink {
    slot: Slot,
    generation: u64,
    sender: EventSender,
}

impl EventSink {
    pub fn new(slot: Slot, generation: u64, sender: EventSender) -> Self {
        Self {
            slot,
            generation,
            sender,
        }
    }

    pub fn emit(&self, event: ConnectionEvent) {
        (self.sender)(self.slot, self.generation, event);
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("slot", &self.slot)
            .field("generation", &self.generation)
            .finish()
    }
}

pub trait Connection: Send {
    fn start_connect(&mut self, params: ConnectParams, sink: EventSink)
    -> Result<(), ConnectionError>;

    /// Request teardown; completion is reported as [`ConnectionEvent::Disconnected`]
    fn start_disconnect(&mut self);

    /// True once the adapter and routes have been released
    fn is_disconnected(&self) -> bool;

    fn connection_type(&self) -> ConnectionType;

    /// Backends may opt out of the "firewall on after connect" policy
    fn is_allow_firewall_after_connection(&self) -> bool {
        true
    }

    fn continue_with_username_and_password(&mut self, username: &str, password: &str);

    fn continue_with_password(&mut self, password: &str);

    fn continue_with_priv_key_password(&mut self, _password: &str) {}
}

/// Creates backends of one connection type
pub trait ConnectionFactory: Send + Sync {
    fn connection_type(&self) -> ConnectionType;
    fn create(&self) -> Box<dyn Connection>;
}
