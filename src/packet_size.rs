//! Packet size and per-protocol MTU
//!
//! The user-facing packet size is the path MTU outside the tunnel. Each
//! protocol subtracts its own header overhead; OpenVPN handles fragmentation
//! itself and is left alone.

use crate::types::{PacketSize, Protocol};
use std::sync::Arc;
use tracing::{debug, info};

pub const MTU_OFFSET_IKEV2: u32 = 80;
pub const MTU_OFFSET_WIREGUARD: u32 = 80;

/// Largest payload tried when probing; ICMP + IPv4 headers add 28 bytes
const PROBE_MAX_PAYLOAD: u32 = 1472;
const PROBE_MIN_PAYLOAD: u32 = 548;
const ICMP_IP_HEADERS: u32 = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MtuOffsets {
    pub ikev2: u32,
    pub wireguard: u32,
}

impl Default for MtuOffsets {
    fn default() -> Self {
        Self {
            ikev2: MTU_OFFSET_IKEV2,
            wireguard: MTU_OFFSET_WIREGUARD,
        }
    }
}

/// MTU to set on the tunnel adapter, or `None` to keep the driver default
pub fn mtu_for_protocol(
    packet_size: PacketSize,
    protocol: Protocol,
    offsets: MtuOffsets,
) -> Option<u32> {
    if packet_size.is_automatic {
        debug!("Packet size mode auto, using default MTU");
        return None;
    }

    let offset = match protocol {
        Protocol::WireGuard => offsets.wireguard,
        Protocol::Ikev2 => offsets.ikev2,
        Protocol::OpenVpnUdp | Protocol::OpenVpnTcp => return None,
    };

    match packet_size.mtu.checked_sub(offset) {
        Some(mtu) if mtu > 0 => Some(mtu),
        _ => {
            debug!(
                "Using default MTU, {} minus overhead {} is too low",
                packet_size.mtu, offset
            );
            None
        }
    }
}

/// Sends one don't-fragment probe of the given payload size
pub trait MtuProbe: Send + Sync {
    fn probe(&self, host: &str, payload: u32) -> bool;
}

/// Binary search for the largest payload that passes unfragmented
///
/// Runs the probes on the blocking pool. Returns `None` when even the
/// minimum payload fails (no connectivity).
pub async fn detect_packet_size(probe: Arc<dyn MtuProbe>, host: String) -> Option<PacketSize> {
    let result = tokio::task::spawn_blocking(move || {
        if !probe.probe(&host, PROBE_MIN_PAYLOAD) {
            return None;
        }
        let (mut low, mut high) = (PROBE_MIN_PAYLOAD, PROBE_MAX_PAYLOAD);
        while low < high {
            let mid = low + (high - low + 1) / 2;
            if probe.probe(&host, mid) {
                low = mid;
            } else {
                high = mid - 1;
            }
        }
        Some(low)
    })
    .await
    .ok()
    .flatten()?;

    let mtu = result + ICMP_IP_HEADERS;
    info!("Detected packet size: {}", mtu);
    Some(PacketSize {
        is_automatic: true,
        mtu,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manual(mtu: u32) -> PacketSize {
        PacketSize {
            is_automatic: false,
            mtu,
        }
    }

    #[test]
    fn test_automatic_keeps_default() {
        let auto = PacketSize::default();
        assert_eq!(mtu_for_protocol(auto, Protocol::WireGuard, MtuOffsets::default()), None);
    }

    #[test]
    fn test_offsets_per_protocol() {
        let offsets = MtuOffsets {
            ikev2: 100,
            wireguard: 80,
        };
        assert_eq!(mtu_for_protocol(manual(1400), Protocol::WireGuard, offsets), Some(1320));
        assert_eq!(mtu_for_protocol(manual(1400), Protocol::Ikev2, offsets), Some(1300));
        assert_eq!(mtu_for_protocol(manual(1400), Protocol::OpenVpnUdp, offsets), None);
    }

    #[test]
    fn test_too_small_mtu_skipped() {
        let offsets = MtuOffsets::default();
        assert_eq!(mtu_for_protocol(manual(80), Protocol::WireGuard, offsets), None);
        assert_eq!(mtu_for_protocol(manual(40), Protocol::Ikev2, offsets), None);
    }

    struct PathMtu(u32);

    impl MtuProbe for PathMtu {
        fn probe(&self, _host: &str, payload: u32) -> bool {
            payload + ICMP_IP_HEADERS <= self.0
        }
    }

    #[tokio::test]
    async fn test_detect_finds_path_mtu() {
        let detected = detect_packet_size(Arc::new(PathMtu(1420)), "example.com".to_string()).await;
        assert_eq!(detected.map(|p| p.mtu), Some(1420));

        let full = detect_packet_size(Arc::new(PathMtu(1500)), "example.com".to_string()).await;
        assert_eq!(full.map(|p| p.mtu), Some(1500));
    }

    #[tokio::test]
    async fn test_detect_offline() {
        let detected = detect_packet_size(Arc::new(PathMtu(100)), "example.com".to_string()).await;
        assert_eq!(detected, None);
    }
}
