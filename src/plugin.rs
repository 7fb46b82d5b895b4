//! Plugin Router (§4.I): a static registry of plugin descriptors plus the
//! capability-intersection algorithm that decides, per device, which
//! plugins get instantiated.
//!
//! The core neither parses nor validates plugin packet bodies (§1
//! Non-goals); it only matches declared incoming/outgoing packet-type
//! sets against a peer's declared capabilities. Grounded on the teacher's
//! separation between transport (`src-tauri/src/runtime/lan`) and feature logic
//! (`src-tauri/src/runtime/messages.rs` defines payloads the transport never inspects);
//! here that boundary becomes an explicit trait instead of being implicit
//! in module layout, per the redesign note against baking plugin behavior
//! into the transport.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use crate::packet::Packet;

/// A non-owning handle a plugin uses to emit packets back to its device,
/// breaking the Device→Plugin→Device reference cycle a naive design would
/// create (§9 redesign note).
pub trait PacketSender: Send + Sync {
    fn send_packet(&self, packet: Packet);
}

/// One feature handler attached to a single paired device. Implementations
/// live outside this crate (§1: plugin *behaviors* are out of scope); this
/// crate only defines the seam.
pub trait Plugin: Send + Sync {
    /// Called when the plugin is instantiated for a device. Returning
    /// `false` removes it from the active set immediately (§4.I step 5).
    fn on_create(&self, sender: Arc<dyn PacketSender>) -> bool;

    fn on_destroy(&self);

    /// Called on the reader task for the owning link; must return quickly
    /// (§5: long work belongs on the shared worker pool). A panic here is
    /// caught by the router and treated as `false` (§7 propagation rule:
    /// plugin exceptions never tear down the link).
    fn on_packet_received(&self, packet: &Packet) -> bool;
}

pub type PluginFactory = Arc<dyn Fn() -> Arc<dyn Plugin> + Send + Sync>;

/// Static description of a plugin, independent of any particular device
/// (§4.I: "declared statically").
#[derive(Clone)]
pub struct PluginDescriptor {
    pub key: String,
    pub display_name: String,
    pub default_enabled: bool,
    pub declared_incoming_types: BTreeSet<String>,
    pub declared_outgoing_types: BTreeSet<String>,
    pub required_host_permissions: BTreeSet<String>,
    pub has_settings: bool,
    pub factory: PluginFactory,
}

impl std::fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("key", &self.key)
            .field("display_name", &self.display_name)
            .field("default_enabled", &self.default_enabled)
            .finish()
    }
}

/// The static table of all plugins this host knows about. Populated by the
/// host application; the router itself has no built-in plugins.
#[derive(Default, Clone)]
pub struct PluginRegistry {
    descriptors: Vec<PluginDescriptor>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: PluginDescriptor) {
        self.descriptors.push(descriptor);
    }

    pub fn descriptors(&self) -> &[PluginDescriptor] {
        &self.descriptors
    }

    /// §4.I step 1-3: compute which plugin keys should be active for a
    /// peer whose capabilities are `peer_incoming`/`peer_outgoing`, given
    /// the host's `user_disabled` set and `granted_permissions`.
    pub fn compute_active(
        &self,
        peer_incoming_capabilities: &BTreeSet<String>,
        peer_outgoing_capabilities: &BTreeSet<String>,
        user_disabled: &HashSet<String>,
        granted_permissions: &HashSet<String>,
    ) -> BTreeSet<String> {
        self.descriptors
            .iter()
            .filter(|d| {
                intersects(&d.declared_incoming_types, peer_outgoing_capabilities)
                    || intersects(&d.declared_outgoing_types, peer_incoming_capabilities)
            })
            .filter(|d| !user_disabled.contains(&d.key))
            .filter(|d| {
                d.required_host_permissions
                    .iter()
                    .all(|p| granted_permissions.contains(p))
            })
            .map(|d| d.key.clone())
            .collect()
    }

    pub fn factory_for(&self, key: &str) -> Option<PluginFactory> {
        self.descriptors
            .iter()
            .find(|d| d.key == key)
            .map(|d| d.factory.clone())
    }
}

fn intersects(a: &BTreeSet<String>, b: &BTreeSet<String>) -> bool {
    a.iter().any(|item| b.contains(item))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopPlugin;
    impl Plugin for NoopPlugin {
        fn on_create(&self, _sender: Arc<dyn PacketSender>) -> bool {
            true
        }
        fn on_destroy(&self) {}
        fn on_packet_received(&self, _packet: &Packet) -> bool {
            true
        }
    }

    fn descriptor(key: &str, incoming: &[&str], outgoing: &[&str]) -> PluginDescriptor {
        PluginDescriptor {
            key: key.to_string(),
            display_name: key.to_string(),
            default_enabled: true,
            declared_incoming_types: incoming.iter().map(|s| s.to_string()).collect(),
            declared_outgoing_types: outgoing.iter().map(|s| s.to_string()).collect(),
            required_host_permissions: BTreeSet::new(),
            has_settings: false,
            factory: Arc::new(|| Arc::new(NoopPlugin) as Arc<dyn Plugin>),
        }
    }

    #[test]
    fn active_set_matches_declared_capability_intersection() {
        let mut registry = PluginRegistry::new();
        registry.register(descriptor("ping", &["cconnect.ping"], &["cconnect.ping"]));
        registry.register(descriptor("battery", &["cconnect.battery"], &["cconnect.battery"]));

        let peer_incoming = BTreeSet::from(["cconnect.ping".to_string()]);
        let peer_outgoing = BTreeSet::from(["cconnect.ping".to_string()]);

        let active = registry.compute_active(
            &peer_incoming,
            &peer_outgoing,
            &HashSet::new(),
            &HashSet::new(),
        );
        assert_eq!(active, BTreeSet::from(["ping".to_string()]));
    }

    #[test]
    fn user_disabled_plugin_is_excluded() {
        let mut registry = PluginRegistry::new();
        registry.register(descriptor("ping", &["cconnect.ping"], &["cconnect.ping"]));

        let peer_incoming = BTreeSet::from(["cconnect.ping".to_string()]);
        let peer_outgoing = BTreeSet::from(["cconnect.ping".to_string()]);
        let disabled = HashSet::from(["ping".to_string()]);

        let active =
            registry.compute_active(&peer_incoming, &peer_outgoing, &disabled, &HashSet::new());
        assert!(active.is_empty());
    }

    #[test]
    fn missing_permission_excludes_plugin() {
        let mut registry = PluginRegistry::new();
        let mut d = descriptor("files", &["cconnect.share"], &["cconnect.share"]);
        d.required_host_permissions = BTreeSet::from(["filesystem".to_string()]);
        registry.register(d);

        let peer_incoming = BTreeSet::from(["cconnect.share".to_string()]);
        let peer_outgoing = BTreeSet::from(["cconnect.share".to_string()]);

        let active = registry.compute_active(
            &peer_incoming,
            &peer_outgoing,
            &HashSet::new(),
            &HashSet::new(),
        );
        assert!(active.is_empty());

        let granted = HashSet::from(["filesystem".to_string()]);
        let active = registry.compute_active(&peer_incoming, &peer_outgoing, &HashSet::new(), &granted);
        assert_eq!(active, BTreeSet::from(["files".to_string()]));
    }
}
