//! Device Registry (§4.H): the single map from device id to [`Device`],
//! owned by the provider's accept/connect path (§5: "single-writer-path
//! ... the provider thread that accepts/connects"); everyone else reads
//! a snapshot.
//!
//! Grounded on the teacher's `PeerManager` (`src-tauri/src/runtime/lan/mod.rs`), a
//! `Mutex<HashMap<PeerId, PeerHandle>>` behind the same accept loop that
//! owns the listen socket. Generalized here to retire entries per the
//! spec's lifecycle rule instead of the teacher's "drop on disconnect".

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::info;
use parking_lot::RwLock;

use crate::device::Device;
use crate::identity::IdentityStore;
use crate::link::Link;
use crate::observer::Observer;
use crate::packet::DeviceInfo;
use crate::plugin::PluginRegistry;

/// Owns every known [`Device`], keyed by device id. Entries are created on
/// first discovery or first inbound connection and retired once unpaired
/// and unreachable (§3 "Lifecycle").
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, Arc<Device>>>,
    identity: Arc<IdentityStore>,
    plugin_registry: Arc<PluginRegistry>,
    observer: Arc<dyn Observer>,
    pairing_timeout: Duration,
}

impl DeviceRegistry {
    pub fn new(
        identity: Arc<IdentityStore>,
        plugin_registry: Arc<PluginRegistry>,
        observer: Arc<dyn Observer>,
        pairing_timeout: Duration,
    ) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            identity,
            plugin_registry,
            observer,
            pairing_timeout,
        }
    }

    pub fn get(&self, device_id: &str) -> Option<Arc<Device>> {
        self.devices.read().get(device_id).cloned()
    }

    pub fn snapshot(&self) -> Vec<Arc<Device>> {
        self.devices.read().values().cloned().collect()
    }

    /// Look up the device for `info.id`, creating it (and notifying the
    /// host) the first time it's seen, per §4.H "create-on-first-sight".
    pub fn get_or_create(self: &Arc<Self>, info: DeviceInfo) -> Arc<Device> {
        if let Some(existing) = self.get(&info.id) {
            existing.update_info(info);
            return existing;
        }

        let device = Device::new(
            info.clone(),
            self.identity.clone(),
            self.plugin_registry.clone(),
            self.observer.clone(),
            self.pairing_timeout,
        );
        self.devices.write().insert(info.id.clone(), device.clone());
        info!("registry: new device {} ({})", info.id, info.name);
        self.observer.on_device_discovered(&info.id);
        device
    }

    /// Attach a freshly-authenticated link to its owning device, creating
    /// the device entry if discovery never announced it (an inbound
    /// connection can arrive before its UDP beacon).
    pub fn attach_link(self: &Arc<Self>, peer_info: DeviceInfo, link: Arc<Link>) -> Arc<Device> {
        let device = self.get_or_create(peer_info);
        device.adopt_link(link);
        device
    }

    /// Drop a link that just broke and retire the owning device if the
    /// lifecycle rule (§3: unpaired AND unreachable) now applies.
    pub fn handle_link_broken(&self, device_id: &str, peer_addr: SocketAddr) {
        let Some(device) = self.get(device_id) else {
            return;
        };
        device.drop_link(peer_addr);
        if device.should_retire() && device.mark_retiring() {
            self.devices.write().remove(device_id);
            info!("registry: retired device {device_id}");
        }
    }
}
