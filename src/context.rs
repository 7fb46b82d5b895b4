//! `CoreContext` (§9 redesign note: "replace the global singleton runtime
//! with an explicit context object the host constructs and owns"): wires
//! identity, discovery, the link provider, the device registry and the
//! plugin router together and drives the background tasks.
//!
//! Grounded on the teacher's `AppState`/`Runtime` construction in
//! `GUI/src/runtime/mod.rs`, which assembles its LAN runtime, config and
//! event channel in one place rather than behind `lazy_static`s.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::CoreConfig;
use crate::discovery::{self, PeerSeen};
use crate::error::{CoreError, CoreResult};
use crate::identity::IdentityStore;
use crate::link::Link;
use crate::observer::Observer;
use crate::packet::{DeviceInfo, DeviceType, Packet};
use crate::plugin::PluginRegistry;
use crate::provider::{self, EstablishedLink};
use crate::registry::DeviceRegistry;

/// Top-level handle a host application owns for the lifetime of the
/// connectivity session. Dropping it does not stop background tasks;
/// call [`CoreContext::shutdown`] explicitly (§5: cooperative cancellation
/// via `CancellationToken`, matching the teacher's shutdown channel).
pub struct CoreContext {
    pub identity: Arc<IdentityStore>,
    pub registry: Arc<DeviceRegistry>,
    pub plugins: Arc<PluginRegistry>,
    config: CoreConfig,
    device_type: DeviceType,
    observer: Arc<dyn Observer>,
    cancel: CancellationToken,
}

impl CoreContext {
    pub fn new(
        identity: Arc<IdentityStore>,
        config: CoreConfig,
        device_type: DeviceType,
        plugins: PluginRegistry,
        observer: Arc<dyn Observer>,
    ) -> Arc<Self> {
        let plugins = Arc::new(plugins);
        let registry = Arc::new(DeviceRegistry::new(
            identity.clone(),
            plugins.clone(),
            observer.clone(),
            Duration::from_secs(config.pairing_timeout_secs),
        ));
        Arc::new(Self {
            identity,
            registry,
            plugins,
            config,
            device_type,
            observer,
            cancel: CancellationToken::new(),
        })
    }

    pub fn observer(&self) -> &Arc<dyn Observer> {
        &self.observer
    }

    fn local_info(&self, tcp_port: u16) -> DeviceInfo {
        let active_incoming = self
            .plugins
            .descriptors()
            .iter()
            .flat_map(|d| d.declared_incoming_types.iter().cloned())
            .collect();
        let active_outgoing = self
            .plugins
            .descriptors()
            .iter()
            .flat_map(|d| d.declared_outgoing_types.iter().cloned())
            .collect();
        self.identity.local_info(
            self.device_type,
            crate::packet::PROTOCOL_VERSION,
            active_incoming,
            active_outgoing,
            tcp_port,
        )
    }

    /// Bind the TCP listener and spawn the accept loop, the UDP
    /// broadcaster, and the UDP listener. Runs until [`Self::shutdown`] is
    /// called.
    pub async fn run(self: &Arc<Self>) -> CoreResult<()> {
        let listener = provider::bind_first_free(self.config.tcp_port_range).await?;
        let tcp_port = listener.local_addr().map(|a| a.port()).unwrap_or(0);

        self.spawn_accept_loop(listener);
        self.spawn_discovery(tcp_port);
        Ok(())
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn spawn_accept_loop(self: &Arc<Self>, listener: tokio::net::TcpListener) {
        let ctx = self.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => {
                        let (stream, addr) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                warn!("accept failed: {e}");
                                continue;
                            }
                        };
                        let ctx = ctx.clone();
                        tokio::spawn(async move { ctx.handle_inbound(stream, addr).await });
                    }
                }
            }
        });
    }

    async fn handle_inbound(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        match provider::accept_flow(stream, addr, &self.identity, self.config.max_frame_bytes).await {
            Ok(established) => self.finish_handshake(established).await,
            // §7: a pin violation on the accept side is just as much a
            // security signal as one on the connect side (§8.4).
            Err(CoreError::CertificatePinViolation { device_id }) => {
                warn!("inbound handshake from {addr} rejected: certificate pin violation for {device_id}");
                self.observer.on_pair_violation(&device_id);
            }
            Err(e) => warn!("inbound handshake from {addr} failed: {e}"),
        }
    }

    fn spawn_discovery(self: &Arc<Self>, tcp_port: u16) {
        let ctx = self.clone();
        let cancel = self.cancel.clone();
        let discovery_port = self.config.discovery_port;
        let interval = self.config.discovery_interval_secs;
        tokio::spawn(async move {
            discovery::run_broadcaster(
                move || ctx.local_info(tcp_port),
                discovery_port,
                interval,
                cancel,
            )
            .await;
        });

        let ctx = self.clone();
        let cancel = self.cancel.clone();
        let (tx, mut rx) = mpsc::channel::<PeerSeen>(64);
        let own_id = self.identity.device_id().to_string();
        let rate_limit = self.config.peer_rate_limit_secs;
        tokio::spawn(async move {
            match discovery::bind_reusable_udp(discovery_port) {
                Ok(socket) => {
                    discovery::run_listener(own_id, socket, rate_limit, tx, cancel).await;
                }
                Err(e) => warn!("failed to bind discovery socket: {e}"),
            }
        });

        tokio::spawn(async move {
            while let Some(seen) = rx.recv().await {
                ctx.clone().handle_peer_seen(seen).await;
            }
        });
    }

    async fn handle_peer_seen(self: Arc<Self>, seen: PeerSeen) {
        let local_id = self.identity.device_id().to_string();
        if seen.info.id == local_id {
            return;
        }
        let device = self.registry.get_or_create(seen.info.clone());
        if device.is_reachable() {
            return;
        }
        if !provider::should_initiate_connect(&local_id, &seen.info.id) {
            return;
        }

        let local_info = self.local_info(0);
        let peer_addr = SocketAddr::new(seen.addr, seen.info.tcp_port);
        let connect_timeout = Duration::from_secs(self.config.connect_timeout_secs);
        match provider::connect_flow(peer_addr, &seen.info, &self.identity, &local_info, connect_timeout).await {
            Ok(established) => self.finish_handshake(established).await,
            // §7: a pin mismatch never auto-unpairs, but the host still
            // needs to know a peer presented the wrong certificate.
            Err(CoreError::CertificatePinViolation { device_id }) => {
                warn!("outbound connect to {device_id} rejected: certificate pin violation");
                self.observer.on_pair_violation(&device_id);
            }
            Err(e) => warn!("outbound connect to {} failed: {e}", seen.info.id),
        }
    }

    async fn finish_handshake(self: Arc<Self>, established: EstablishedLink) {
        let peer_addr = established.peer_addr;
        let peer_info = established.peer_info.clone();
        let peer_id = peer_info.id.clone();
        let max_frame_bytes = self.config.max_frame_bytes;

        // §4.G/§5: packets on one link must be delivered to the device in
        // receive order, with packet N fully routed before N+1 starts. The
        // reader task only enqueues here — it never blocks on routing — and
        // a single drain task `await`s `route_packet` one packet at a time.
        let (packet_tx, mut packet_rx) = mpsc::unbounded_channel::<Packet>();
        let ctx_for_drain = self.clone();
        let peer_id_for_drain = peer_id.clone();
        tokio::spawn(async move {
            while let Some(packet) = packet_rx.recv().await {
                if let Some(device) = ctx_for_drain.registry.get(&peer_id_for_drain) {
                    device.route_packet(packet).await;
                }
            }
        });

        let ctx_for_broken = self.clone();

        let link: Arc<Link> = Link::spawn(
            established.stream,
            peer_id.clone(),
            peer_addr,
            1,
            max_frame_bytes,
            move |packet| {
                let _ = packet_tx.send(packet);
            },
            move || {
                ctx_for_broken.registry.handle_link_broken(&peer_id, peer_addr);
            },
        );

        info!("link established with {} at {peer_addr}", peer_info.id);
        let device = self.registry.attach_link(peer_info, link);
        device.record_handshake_cert(established.peer_cert_der);
    }
}
