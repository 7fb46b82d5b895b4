//! Device (§4.G): the per-peer durable entity — link aggregation, the
//! pairing state machine (§4.7), and packet routing/dispatch.
//!
//! Grounded on the teacher's session model in `src-tauri/src/runtime/lan/peer.rs`
//! (one task per live connection, a single writer lock, heartbeat-driven
//! liveness) generalized from "one peer, one link" to "one peer, N
//! ranked links" plus the pairing and plugin-routing layers the teacher's
//! clipboard-only protocol never needed.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::RwLock;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::error::CoreError;
use crate::identity::IdentityStore;
use crate::link::{Link, LinkState};
use crate::observer::Observer;
use crate::packet::{is_pair_type, DeviceInfo, Packet};
use crate::plugin::{PacketSender, Plugin, PluginRegistry};

/// §3 PairState / §4.7 pairing state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    Unpaired,
    RequestedByUs,
    RequestedByThem,
    Paired,
}

/// Outcome delivered to the caller of [`Device::send_packet`].
#[derive(Debug)]
pub enum SendOutcome {
    Sent,
    Failed(CoreError),
}

pub type SendCallback = Box<dyn FnOnce(SendOutcome) + Send>;

struct ActivePlugin {
    instance: Arc<dyn Plugin>,
}

/// The per-device packet sender handed to plugins (§9 redesign note: a
/// non-owning handle instead of a back-reference to `Device`).
struct DeviceSender {
    device: std::sync::Weak<Device>,
}

impl PacketSender for DeviceSender {
    fn send_packet(&self, packet: Packet) {
        if let Some(device) = self.device.upgrade() {
            tokio::spawn(async move {
                device.send_packet(packet, None).await;
            });
        }
    }
}

pub struct Device {
    pub id: String,
    info: RwLock<DeviceInfo>,
    pair_state: RwLock<PairState>,
    links: RwLock<Vec<Arc<Link>>>,
    plugins: RwLock<HashMap<String, ActivePlugin>>,
    /// packet type -> plugin key, rebuilt on every `reload_plugins`.
    dispatch_table: RwLock<HashMap<String, String>>,
    identity: Arc<IdentityStore>,
    plugin_registry: Arc<PluginRegistry>,
    observer: Arc<dyn Observer>,
    pairing_timeout: Duration,
    pairing_timer_cancel: AsyncMutex<Option<CancellationToken>>,
    /// DER captured at TLS handshake time, persisted to the trust store
    /// only once pairing actually completes (§3 `peerCert`).
    pending_peer_cert_der: RwLock<Option<Vec<u8>>>,
    retiring: AtomicBool,
}

impl Device {
    pub fn new(
        info: DeviceInfo,
        identity: Arc<IdentityStore>,
        plugin_registry: Arc<PluginRegistry>,
        observer: Arc<dyn Observer>,
        pairing_timeout: Duration,
    ) -> Arc<Self> {
        let pair_state = if identity.is_trusted(&info.id) {
            PairState::Paired
        } else {
            PairState::Unpaired
        };
        Arc::new(Self {
            id: info.id.clone(),
            info: RwLock::new(info),
            pair_state: RwLock::new(pair_state),
            links: RwLock::new(Vec::new()),
            plugins: RwLock::new(HashMap::new()),
            dispatch_table: RwLock::new(HashMap::new()),
            identity,
            plugin_registry,
            observer,
            pairing_timeout,
            pairing_timer_cancel: AsyncMutex::new(None),
            pending_peer_cert_der: RwLock::new(None),
            retiring: AtomicBool::new(false),
        })
    }

    pub fn info(&self) -> DeviceInfo {
        self.info.read().clone()
    }

    pub fn pair_state(&self) -> PairState {
        *self.pair_state.read()
    }

    /// §4.G item 2: adopt an identity update if it differs from the last
    /// stored copy.
    pub fn update_info(&self, new_info: DeviceInfo) {
        let changed = {
            let mut info = self.info.write();
            if *info == new_info {
                false
            } else {
                *info = new_info;
                true
            }
        };
        if changed {
            self.observer.on_device_plugins_changed(&self.id);
        }
    }

    /// §4.G item 1: add a newly-established link and rank by priority.
    pub fn adopt_link(self: &Arc<Self>, link: Arc<Link>) {
        let was_empty = {
            let mut links = self.links.write();
            let was_empty = links.is_empty();
            links.push(link);
            links.sort_by(|a, b| b.priority.cmp(&a.priority));
            was_empty
        };
        if was_empty {
            self.observer.on_device_reachability_changed(&self.id, true);
        }
    }

    /// §4.G item 7: drop a broken/closed link; notify reachability if the
    /// last one just went away.
    pub fn drop_link(&self, peer_addr: std::net::SocketAddr) {
        let now_empty = {
            let mut links = self.links.write();
            links.retain(|l| l.peer_addr != peer_addr);
            links.is_empty()
        };
        if now_empty {
            self.observer.on_device_reachability_changed(&self.id, false);
        }
    }

    pub fn is_reachable(&self) -> bool {
        !self.links.read().is_empty()
    }

    fn best_link(&self) -> Option<Arc<Link>> {
        self.links
            .read()
            .iter()
            .find(|l| l.state() == LinkState::Authenticated)
            .cloned()
    }

    /// §4.G item 5: enqueue a packet on the highest-priority live link.
    /// Fire-and-forget when `callback` is `None`; otherwise the callback
    /// fires exactly once (§8 invariant 3).
    pub async fn send_packet(&self, packet: Packet, callback: Option<SendCallback>) {
        let Some(link) = self.best_link() else {
            if let Some(cb) = callback {
                cb(SendOutcome::Failed(CoreError::LinkBroken {
                    device_id: self.id.clone(),
                }));
            }
            return;
        };
        match link.send(&packet).await {
            Ok(()) => {
                if let Some(cb) = callback {
                    cb(SendOutcome::Sent);
                }
            }
            Err(e) => {
                if let Some(cb) = callback {
                    cb(SendOutcome::Failed(e));
                }
            }
        }
    }

    /// §4.G item 4: route one received packet. Pairing packets go to the
    /// state machine; everything else is dispatched by declared incoming
    /// type to the matching plugin, gated on `Paired` (§8 invariant 6).
    pub async fn route_packet(self: &Arc<Self>, packet: Packet) {
        if is_pair_type(&packet.packet_type) {
            self.handle_pair_packet(packet.pair_decision()).await;
            return;
        }

        if self.pair_state() != PairState::Paired {
            debug!(
                "device {}: dropping non-pair packet {} while unpaired",
                self.id, packet.packet_type
            );
            return;
        }

        let plugin_key = self.dispatch_table.read().get(&packet.packet_type).cloned();
        let Some(plugin_key) = plugin_key else {
            debug!(
                "device {}: no plugin registered for packet type {}",
                self.id, packet.packet_type
            );
            return;
        };

        let instance = self.plugins.read().get(&plugin_key).map(|p| p.instance.clone());
        if let Some(instance) = instance {
            let handled = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                instance.on_packet_received(&packet)
            }))
            .unwrap_or(false);
            if !handled {
                debug!(
                    "device {}: plugin {} did not handle packet {}",
                    self.id, plugin_key, packet.packet_type
                );
            }
        }
    }

    // ── Pairing state machine (§4.7) ────────────────────────────────────

    pub async fn request_pair(self: &Arc<Self>) {
        let should_send = {
            let mut state = self.pair_state.write();
            if *state == PairState::Unpaired {
                *state = PairState::RequestedByUs;
                true
            } else {
                false
            }
        };
        if !should_send {
            return;
        }
        self.start_pairing_timer();
        self.observer.on_device_pair_state_changed(&self.id, PairState::RequestedByUs);
        self.send_packet(Packet::pair_request(true), None).await;
    }

    pub async fn accept_pair(self: &Arc<Self>) {
        let should_send = {
            let mut state = self.pair_state.write();
            if *state == PairState::RequestedByThem {
                *state = PairState::Paired;
                true
            } else {
                false
            }
        };
        if !should_send {
            return;
        }
        self.store_peer_cert();
        self.observer.on_device_pair_state_changed(&self.id, PairState::Paired);
        self.send_packet(Packet::pair_request(true), None).await;
        self.reload_plugins(&HashSet::new(), &HashSet::new());
    }

    pub async fn reject_pair(self: &Arc<Self>) {
        let should_send = {
            let mut state = self.pair_state.write();
            if *state == PairState::RequestedByThem {
                *state = PairState::Unpaired;
                true
            } else {
                false
            }
        };
        if !should_send {
            return;
        }
        self.observer.on_device_pair_state_changed(&self.id, PairState::Unpaired);
        self.send_packet(Packet::pair_request(false), None).await;
    }

    pub async fn unpair(self: &Arc<Self>) {
        let should_send = {
            let mut state = self.pair_state.write();
            if *state == PairState::Paired {
                *state = PairState::Unpaired;
                true
            } else {
                false
            }
        };
        if !should_send {
            return;
        }
        let _ = self.identity.untrust(&self.id);
        self.observer.on_device_pair_state_changed(&self.id, PairState::Unpaired);
        self.send_packet(Packet::pair_request(false), None).await;
    }

    async fn handle_pair_packet(self: &Arc<Self>, accept: bool) {
        let transition = {
            let mut state = self.pair_state.write();
            match (*state, accept) {
                (PairState::Unpaired, true) => {
                    *state = PairState::RequestedByThem;
                    Some(PairState::RequestedByThem)
                }
                (PairState::RequestedByUs, true) => {
                    *state = PairState::Paired;
                    Some(PairState::Paired)
                }
                (PairState::RequestedByUs, false) => {
                    *state = PairState::Unpaired;
                    Some(PairState::Unpaired)
                }
                (PairState::Paired, false) => {
                    *state = PairState::Unpaired;
                    Some(PairState::Unpaired)
                }
                _ => None,
            }
        };
        let Some(new_state) = transition else { return };

        match new_state {
            PairState::Paired => {
                self.cancel_pairing_timer().await;
                self.store_peer_cert();
                self.reload_plugins(&HashSet::new(), &HashSet::new());
            }
            PairState::RequestedByThem => {}
            PairState::Unpaired => {
                self.cancel_pairing_timer().await;
                if self.identity.is_trusted(&self.id) {
                    let _ = self.identity.untrust(&self.id);
                }
            }
            PairState::RequestedByUs => {}
        }
        self.observer.on_device_pair_state_changed(&self.id, new_state);
    }

    fn store_peer_cert(&self) {
        let info = self.info();
        if let Some(der) = self.pending_peer_cert_der.read().clone() {
            if let Err(e) = self
                .identity
                .trust(&self.id, &info.name, info.device_type, der)
            {
                warn!("device {}: failed to persist trust: {e}", self.id);
            }
        }
    }

    /// Records the DER captured at TLS handshake time so a later
    /// successful pairing can persist it (§3 `peerCert`: "captured at
    /// first successful TLS handshake; subsequently compared byte-for-byte").
    pub fn record_handshake_cert(&self, der: Vec<u8>) {
        *self.pending_peer_cert_der.write() = Some(der);
    }

    fn start_pairing_timer(self: &Arc<Self>) {
        let token = CancellationToken::new();
        let device = self.clone();
        let timeout = self.pairing_timeout;
        let child = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = child.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    let fired = {
                        let mut state = device.pair_state.write();
                        if *state == PairState::RequestedByUs {
                            *state = PairState::Unpaired;
                            true
                        } else {
                            false
                        }
                    };
                    if fired {
                        device.observer.on_device_pair_state_changed(&device.id, PairState::Unpaired);
                    }
                }
            }
        });
        // Only one `RequestedByUs` window is ever active at a time per the
        // state machine, but store the token off the sync path since this
        // function can't itself be async.
        tokio::spawn(Self::store_timer_token(self.clone(), token));
    }

    async fn store_timer_token(self_arc: Arc<Self>, token: CancellationToken) {
        let mut slot = self_arc.pairing_timer_cancel.lock().await;
        if let Some(old) = slot.replace(token) {
            old.cancel();
        }
    }

    async fn cancel_pairing_timer(&self) {
        if let Some(token) = self.pairing_timer_cancel.lock().await.take() {
            token.cancel();
        }
    }

    // ── Plugin routing (§4.I) ───────────────────────────────────────────

    /// Recompute the active plugin set for this device's current
    /// capabilities and rebuild the dispatch table. Called on pairing and
    /// whenever capabilities change (§4.I).
    pub fn reload_plugins(self: &Arc<Self>, user_disabled: &HashSet<String>, granted_permissions: &HashSet<String>) {
        let info = self.info();
        let desired = self.plugin_registry.compute_active(
            &info.incoming_capabilities,
            &info.outgoing_capabilities,
            user_disabled,
            granted_permissions,
        );

        let mut plugins = self.plugins.write();
        let current: BTreeSet<String> = plugins.keys().cloned().collect();

        for removed_key in current.difference(&desired) {
            if let Some(p) = plugins.remove(removed_key) {
                p.instance.on_destroy();
            }
        }

        for added_key in desired.difference(&current) {
            let Some(factory) = self.plugin_registry.factory_for(added_key) else {
                continue;
            };
            let instance = factory();
            let sender: Arc<dyn PacketSender> = Arc::new(DeviceSender {
                device: Arc::downgrade(self),
            });
            if instance.on_create(sender) {
                plugins.insert(added_key.clone(), ActivePlugin { instance });
            }
        }
        drop(plugins);

        self.rebuild_dispatch_table();
        self.observer.on_device_plugins_changed(&self.id);
    }

    fn rebuild_dispatch_table(&self) {
        let plugins = self.plugins.read();
        let mut table = HashMap::new();
        for (key, _) in plugins.iter() {
            if let Some(descriptor) = self
                .plugin_registry
                .descriptors()
                .iter()
                .find(|d| &d.key == key)
            {
                for packet_type in &descriptor.declared_incoming_types {
                    table.entry(packet_type.clone()).or_insert_with(|| key.clone());
                }
            }
        }
        *self.dispatch_table.write() = table;
    }

    /// §4.G item 7: retire only when unpaired and unreachable.
    pub fn should_retire(&self) -> bool {
        self.pair_state() != PairState::Paired && !self.is_reachable()
    }

    pub fn mark_retiring(&self) -> bool {
        !self.retiring.swap(true, Ordering::SeqCst)
    }
}
