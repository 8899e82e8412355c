//! VPN orchestrator - connection orchestration core for a VPN client
//!
//! This crate drives a single VPN tunnel through its connect lifecycle:
//! protocol and port selection, the kill-switch firewall, DNS and MTU
//! handling, credential prompts for custom configs, an emergency fallback
//! connection and an orderly shutdown. The OS and the tunnel drivers sit
//! behind capability traits so the engine can run against fakes.
//!
//! # Architecture
//!
//! - `engine`: The actor that owns all state and serializes every input
//! - `connection`: Backend abstraction, connection manager, OpenVPN backend
//! - `connect_state`: Connect state machine with change notifications
//! - `emergency`: Fallback connection over fixed endpoints
//! - `firewall`: Kill-switch capability, exception IPs, on/off policy
//! - `locations`, `api`, `credentials`, `dns`, `packet_size`, `helper`
//! - `config`: Engine settings (TOML)
//! - `platform`: Linux implementations of the OS capabilities
//!
//! # Usage
//!
//! ```bash
//! sudo vpn-orchestrator connect ./office.ovpn
//! ```

pub mod api;
pub mod config;
pub mod connect_state;
pub mod connection;
pub mod credentials;
pub mod dns;
pub mod emergency;
pub mod engine;
pub mod firewall;
pub mod helper;
pub mod locations;
pub mod packet_size;
pub mod platform;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::EngineSettings;
pub use engine::{CleanupOptions, Command, Engine, EngineDeps, EngineEvent, EngineHandle};
pub use types::{ConnectError, ConnectState, LocationId, Protocol};
