//! UDP discovery broadcaster and listener (§4.D).
//!
//! Grounded on the teacher's `src-tauri/src/runtime/lan/discovery.rs`: the same
//! reusable-bind-via-`socket2` + broadcast/listen task pair, generalized
//! from a fixed `DiscoveryBeacon` struct to the spec's full `DeviceInfo`
//! identity announcement, with per-device-id rate limiting on the listener
//! side (§4.D) replacing the teacher's unconditional upsert.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use crate::error::{CoreError, CoreResult};
use crate::packet::DeviceInfo;

/// UDP datagrams are bounded; a truncated-for-UDP `DeviceInfo` plus
/// envelope comfortably fits this.
const MAX_DATAGRAM_BYTES: usize = 2048;

/// Emitted by the listener task whenever a peer is seen for the first time
/// or re-announces after the per-peer rate-limit window has elapsed.
#[derive(Debug, Clone)]
pub struct PeerSeen {
    pub info: DeviceInfo,
    pub addr: IpAddr,
}

/// Bind a UDP socket with `SO_REUSEADDR`/`SO_REUSEPORT` so the discovery
/// port can be shared across processes during development, exactly as the
/// teacher's `bind_reusable_udp` does.
pub fn bind_reusable_udp(port: u16) -> CoreResult<UdpSocket> {
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(|e| {
        CoreError::FatalInit(format!("failed to create discovery socket: {e}"))
    })?;

    if let Err(e) = socket.set_reuse_address(true) {
        warn!("SO_REUSEADDR failed (non-fatal): {e}");
    }
    #[cfg(not(target_os = "windows"))]
    if let Err(e) = socket.set_reuse_port(true) {
        warn!("SO_REUSEPORT failed (non-fatal): {e}");
    }
    socket.set_broadcast(true).map_err(|e| {
        CoreError::FatalInit(format!("SO_BROADCAST failed: {e}"))
    })?;
    socket.set_nonblocking(true).ok();
    socket
        .bind(&socket2::SockAddr::from(addr))
        .map_err(|e| CoreError::FatalInit(format!("discovery bind failed on port {port}: {e}")))?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
        .map_err(|e| CoreError::FatalInit(format!("tokio UDP conversion failed: {e}")))
}

/// Periodically broadcasts `info_provider()` on the LAN every
/// `interval_secs` (§4.D: 30s default), until `cancel` fires.
pub async fn run_broadcaster(
    info_provider: impl Fn() -> DeviceInfo,
    discovery_port: u16,
    interval_secs: u64,
    cancel: CancellationToken,
) {
    let socket = match UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).await {
        Ok(s) => s,
        Err(e) => {
            warn!("discovery broadcaster bind failed: {e}");
            return;
        }
    };
    if let Err(e) = socket.set_broadcast(true) {
        warn!("discovery broadcaster set_broadcast failed: {e}");
        return;
    }

    let broadcast_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, discovery_port));
    info!("discovery broadcaster started on port {discovery_port}");

    let mut tick = interval(Duration::from_secs(interval_secs));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                let info = info_provider().truncated_for_udp(MAX_DATAGRAM_BYTES);
                match serde_json::to_vec(&info) {
                    Ok(bytes) => {
                        if let Err(e) = socket.send_to(&bytes, broadcast_addr).await {
                            warn!("discovery beacon send failed: {e}");
                        }
                    }
                    Err(e) => warn!("discovery beacon encode failed: {e}"),
                }
            }
        }
    }
    debug!("discovery broadcaster stopped");
}

struct RateLimiter {
    last_emitted: Mutex<HashMap<String, Instant>>,
    window: Duration,
}

impl RateLimiter {
    fn new(window: Duration) -> Self {
        Self {
            last_emitted: Mutex::new(HashMap::new()),
            window,
        }
    }

    /// Returns `true` if a beacon from `device_id` should be forwarded now.
    fn allow(&self, device_id: &str) -> bool {
        let mut map = self.last_emitted.lock();
        let now = Instant::now();
        match map.get(device_id) {
            Some(last) if now.duration_since(*last) < self.window => false,
            _ => {
                map.insert(device_id.to_string(), now);
                true
            }
        }
    }
}

/// Listens for identity beacons from LAN peers and forwards at most one
/// [`PeerSeen`] per device id per `rate_limit_secs` window (§4.D), dropping
/// our own beacons and anything that doesn't parse as a `DeviceInfo`.
pub async fn run_listener(
    own_device_id: String,
    socket: UdpSocket,
    rate_limit_secs: u64,
    events: mpsc::Sender<PeerSeen>,
    cancel: CancellationToken,
) {
    info!("discovery listener started");
    let limiter = Arc::new(RateLimiter::new(Duration::from_secs(rate_limit_secs)));
    let mut buf = [0u8; MAX_DATAGRAM_BYTES];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, src)) => {
                        let Ok(info) = serde_json::from_slice::<DeviceInfo>(&buf[..len]) else {
                            continue;
                        };
                        if info.id == own_device_id {
                            continue;
                        }
                        if !limiter.allow(&info.id) {
                            continue;
                        }
                        let seen = PeerSeen { info, addr: src.ip() };
                        if events.send(seen).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("discovery recv error: {e}"),
                }
            }
        }
    }
    debug!("discovery listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_allows_first_then_blocks_within_window() {
        let limiter = RateLimiter::new(Duration::from_secs(60));
        assert!(limiter.allow("peer1"));
        assert!(!limiter.allow("peer1"));
        assert!(limiter.allow("peer2"));
    }

    #[test]
    fn rate_limiter_allows_again_after_window() {
        let limiter = RateLimiter::new(Duration::from_millis(10));
        assert!(limiter.allow("peer1"));
        std::thread::sleep(Duration::from_millis(20));
        assert!(limiter.allow("peer1"));
    }
}
