//! Emergency connection
//!
//! A second, independent OpenVPN connection to a fixed list of fallback
//! endpoints, used to reach the API when it is otherwise blocked. It has its
//! own [`ConnectionManager`] on [`Slot::Emergency`] and walks the endpoint
//! list until one connects.

use crate::connection::{
    ConnectRequest, ConnectionEvent, ConnectionFactory, ConnectionManager, EventSender,
    ManagerEvent, Slot,
};
use crate::helper::Helper;
use crate::locations::{LocationInfo, Node};
use crate::types::{
    AdapterInfo, ConnectError, ConnectionSettings, DisconnectReason, LocationId, PortMap,
    Protocol, ProxySettings, ServerCredentials,
};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyEndpoint {
    pub ip: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmergencyConfig {
    pub ovpn_config: String,
    pub username: String,
    pub password: String,
    pub endpoints: Vec<EmergencyEndpoint>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmergencyEvent {
    Connected(AdapterInfo),
    Disconnected(DisconnectReason),
    /// Every endpoint failed
    Error(ConnectError),
}

pub struct EmergencyController {
    manager: ConnectionManager,
    config: EmergencyConfig,
    proxy: ProxySettings,
    next_endpoint: usize,
    disconnecting: bool,
    /// An endpoint reached Connected during this session
    connected: bool,
}

impl EmergencyController {
    pub fn new(
        config: EmergencyConfig,
        factories: Vec<Arc<dyn ConnectionFactory>>,
        sender: EventSender,
        helper: Arc<dyn Helper>,
    ) -> Self {
        Self {
            manager: ConnectionManager::new(Slot::Emergency, factories, sender, helper),
            config,
            proxy: ProxySettings::default(),
            next_endpoint: 0,
            disconnecting: false,
            connected: false,
        }
    }

    pub fn click_connect(&mut self, proxy: ProxySettings) -> Result<(), ConnectError> {
        info!(
            "Emergency connect, {} endpoint(s)",
            self.config.endpoints.len()
        );
        self.proxy = proxy;
        self.next_endpoint = 0;
        self.disconnecting = false;
        self.connected = false;
        self.connect_next()
    }

    /// Returns false when nothing was running
    pub fn click_disconnect(&mut self) -> bool {
        self.disconnecting = true;
        self.manager.click_disconnect()
    }

    pub async fn blocking_disconnect(&mut self, limit: Duration) -> bool {
        self.disconnecting = true;
        self.manager.blocking_disconnect(limit).await
    }

    pub fn is_disconnected(&self) -> bool {
        self.manager.is_disconnected()
    }

    pub fn handle_event(&mut self, generation: u64, event: ConnectionEvent) -> Option<EmergencyEvent> {
        match self.manager.handle_event(generation, event)? {
            ManagerEvent::Connected(adapter) => {
                info!("Emergency connected via {}", adapter.adapter_name);
                self.connected = true;
                Some(EmergencyEvent::Connected(adapter))
            }
            ManagerEvent::Disconnected(reason) => Some(EmergencyEvent::Disconnected(reason)),
            ManagerEvent::Error(error) => {
                // Only walk the endpoint list while the first connect is pending
                if self.disconnecting || self.connected {
                    return Some(EmergencyEvent::Error(error));
                }
                match self.connect_next() {
                    Ok(()) => None,
                    Err(_) => Some(EmergencyEvent::Error(error)),
                }
            }
            other => {
                debug!("Emergency event ignored: {:?}", other);
                None
            }
        }
    }

    fn connect_next(&mut self) -> Result<(), ConnectError> {
        let Some(endpoint) = self.config.endpoints.get(self.next_endpoint).cloned() else {
            warn!("No emergency endpoints left");
            return Err(ConnectError::LocationNoActiveNodes);
        };
        self.next_endpoint += 1;
        info!(
            "Emergency attempt {} via {} {}:{}",
            self.next_endpoint, endpoint.protocol, endpoint.ip, endpoint.port
        );

        let location = LocationInfo::new(
            LocationId::Empty,
            "Emergency",
            vec![Node {
                hostname: endpoint.ip.to_string(),
                ip: Some(endpoint.ip),
                weight: 1,
            }],
        );
        let request = ConnectRequest {
            ovpn_config: self.config.ovpn_config.clone(),
            credentials: ServerCredentials {
                openvpn_username: self.config.username.clone(),
                openvpn_password: self.config.password.clone(),
                ..ServerCredentials::default()
            },
            location,
            settings: ConnectionSettings::new(endpoint.protocol, endpoint.port),
            port_map: PortMap::default(),
            proxy: self.proxy.clone(),
            emit_auth_error_on_failure: true,
            preferred_protocol: None,
            wireguard: None,
            ikev2_compression: false,
        };

        match self.manager.click_connect(request) {
            Ok(()) => Ok(()),
            // Backend could not even start; try the next endpoint
            Err(e) if self.next_endpoint < self.config.endpoints.len() => {
                warn!("Emergency endpoint failed to start: {}", e);
                self.connect_next()
            }
            Err(e) => Err(e),
        }
    }
}
