//! Plugin Router (§4.I) exercised at the `Device` level: capability
//! intersection drives which plugins actually get created/destroyed and
//! wired into the dispatch table.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cosmic_connect_core::packet::Packet;
use cosmic_connect_core::{
    DeviceInfo, DeviceType, IdentityStore, Observer, PacketSender, Plugin, PluginDescriptor,
    PluginRegistry,
};

struct NoopObserver;
impl Observer for NoopObserver {}

struct RecordingPlugin {
    created: AtomicUsize,
    destroyed: AtomicUsize,
    received: Mutex<Vec<String>>,
}

impl Plugin for RecordingPlugin {
    fn on_create(&self, _sender: Arc<dyn PacketSender>) -> bool {
        self.created.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn on_destroy(&self) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_packet_received(&self, packet: &Packet) -> bool {
        self.received.lock().unwrap().push(packet.packet_type.clone());
        true
    }
}

fn ping_descriptor(plugin: Arc<RecordingPlugin>) -> PluginDescriptor {
    PluginDescriptor {
        key: "ping".into(),
        display_name: "Ping".into(),
        default_enabled: true,
        declared_incoming_types: BTreeSet::from(["cconnect.ping".to_string()]),
        declared_outgoing_types: BTreeSet::from(["cconnect.ping".to_string()]),
        required_host_permissions: BTreeSet::new(),
        has_settings: false,
        factory: Arc::new(move || plugin.clone() as Arc<dyn Plugin>),
    }
}

fn peer_with_ping() -> DeviceInfo {
    DeviceInfo {
        id: "d".repeat(32),
        name: "Peer".into(),
        device_type: DeviceType::Phone,
        protocol_version: 7,
        incoming_capabilities: BTreeSet::from(["cconnect.ping".to_string()]),
        outgoing_capabilities: BTreeSet::from(["cconnect.ping".to_string()]),
        tcp_port: 1716,
    }
}

#[tokio::test]
async fn matching_capability_activates_and_dispatches_to_the_plugin() {
    let dir = tempfile::tempdir().unwrap();
    let identity = Arc::new(IdentityStore::init(dir.path(), "host").unwrap());
    let plugin = Arc::new(RecordingPlugin {
        created: AtomicUsize::new(0),
        destroyed: AtomicUsize::new(0),
        received: Mutex::new(Vec::new()),
    });

    let mut registry = PluginRegistry::new();
    registry.register(ping_descriptor(plugin.clone()));

    let device = cosmic_connect_core::Device::new(
        peer_with_ping(),
        identity,
        Arc::new(registry),
        Arc::new(NoopObserver),
        Duration::from_secs(30),
    );

    // Pairing is what triggers the first `reload_plugins` in normal
    // operation; drive it directly here since there is no live link.
    device.route_packet(Packet::pair_request(true)).await;
    device.accept_pair().await;

    assert_eq!(plugin.created.load(Ordering::SeqCst), 1);

    device
        .route_packet(Packet::builder("cconnect.ping").body(Default::default()).build().unwrap())
        .await;
    assert_eq!(plugin.received.lock().unwrap().as_slice(), ["cconnect.ping"]);
}

#[tokio::test]
async fn disabling_a_plugin_tears_it_down_on_reload() {
    let dir = tempfile::tempdir().unwrap();
    let identity = Arc::new(IdentityStore::init(dir.path(), "host").unwrap());
    let plugin = Arc::new(RecordingPlugin {
        created: AtomicUsize::new(0),
        destroyed: AtomicUsize::new(0),
        received: Mutex::new(Vec::new()),
    });

    let mut registry = PluginRegistry::new();
    registry.register(ping_descriptor(plugin.clone()));

    let device = cosmic_connect_core::Device::new(
        peer_with_ping(),
        identity,
        Arc::new(registry),
        Arc::new(NoopObserver),
        Duration::from_secs(30),
    );

    device.route_packet(Packet::pair_request(true)).await;
    device.accept_pair().await;
    assert_eq!(plugin.created.load(Ordering::SeqCst), 1);

    let disabled = HashSet::from(["ping".to_string()]);
    device.reload_plugins(&disabled, &HashSet::new());
    assert_eq!(plugin.destroyed.load(Ordering::SeqCst), 1);
}
