//! Remote API capability
//!
//! The HTTP transport, backup endpoints and session handling live outside
//! this crate. The engine reads cached resources synchronously and starts
//! refreshes; completions come back as [`ApiEvent`]s through the sink handed
//! over in [`ApiResources::subscribe`].

use crate::locations::LocationInfo;
use crate::types::{PortMap, ServerCredentials, WireGuardConfig};
use std::net::IpAddr;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginError {
    BadCredentials,
    NoConnectivity,
    SslError,
    Other(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStatus {
    pub is_premium: bool,
    /// Banned or suspended accounts must not connect
    pub is_blocked: bool,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginRequest {
    AuthHash,
    Credentials {
        username: String,
        password: String,
        code_2fa: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiEvent {
    LoginFailed { error: LoginError, message: String },
    SessionUpdated(SessionStatus),
    ServerCredentialsFetched,
    LocationsUpdated(Vec<LocationInfo>),
    ReadyForLogin,
    /// API endpoint addresses, which stay reachable through the firewall
    HostIpsChanged(Vec<IpAddr>),
    ExternalIpUpdated(IpAddr),
}

pub type ApiEventSink = Arc<dyn Fn(ApiEvent) + Send + Sync>;

pub trait ApiResources: Send + Sync {
    fn subscribe(&self, sink: ApiEventSink);

    fn auth_hash(&self) -> Option<String>;
    fn is_logged_in(&self) -> bool;
    fn session_status(&self) -> SessionStatus;
    fn server_credentials(&self) -> ServerCredentials;
    fn ovpn_config(&self) -> String;
    fn port_map(&self) -> PortMap;
    fn wireguard_config(&self) -> Option<WireGuardConfig>;

    /// Completes with [`ApiEvent::SessionUpdated`]
    fn fetch_session(&self);
    /// Completes with [`ApiEvent::ServerCredentialsFetched`]
    fn fetch_server_credentials(&self);
    fn login(&self, request: LoginRequest);
    /// Re-run login in the background, e.g. once a tunnel makes the API reachable
    fn retry_login(&self);
    fn sign_out(&self);
    /// Completes with [`ApiEvent::ExternalIpUpdated`]
    fn request_external_ip(&self);
}

/// No API: custom configs only
pub struct OfflineApi;

impl ApiResources for OfflineApi {
    fn subscribe(&self, _sink: ApiEventSink) {}

    fn auth_hash(&self) -> Option<String> {
        None
    }

    fn is_logged_in(&self) -> bool {
        false
    }

    fn session_status(&self) -> SessionStatus {
        SessionStatus::default()
    }

    fn server_credentials(&self) -> ServerCredentials {
        ServerCredentials::default()
    }

    fn ovpn_config(&self) -> String {
        String::new()
    }

    fn port_map(&self) -> PortMap {
        PortMap::default()
    }

    fn wireguard_config(&self) -> Option<WireGuardConfig> {
        None
    }

    fn fetch_session(&self) {}

    fn fetch_server_credentials(&self) {}

    fn login(&self, _request: LoginRequest) {}

    fn retry_login(&self) {}

    fn sign_out(&self) {}

    fn request_external_ip(&self) {}
}
