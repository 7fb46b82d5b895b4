//! Pairing state machine (§4.7) exercised directly against `Device`,
//! without a real network link.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cosmic_connect_core::packet::Packet;
use cosmic_connect_core::{DeviceInfo, DeviceType, IdentityStore, Observer, PairState, PluginRegistry};

struct CountingObserver {
    pair_changes: AtomicUsize,
}

impl Observer for CountingObserver {
    fn on_device_pair_state_changed(&self, _device_id: &str, _state: PairState) {
        self.pair_changes.fetch_add(1, Ordering::SeqCst);
    }
}

fn peer_info(id: &str) -> DeviceInfo {
    DeviceInfo {
        id: id.to_string(),
        name: "Peer".into(),
        device_type: DeviceType::Phone,
        protocol_version: 7,
        incoming_capabilities: Default::default(),
        outgoing_capabilities: Default::default(),
        tcp_port: 1716,
    }
}

fn new_device(observer: Arc<dyn Observer>) -> Arc<cosmic_connect_core::Device> {
    let dir = tempfile::tempdir().unwrap();
    let identity = Arc::new(IdentityStore::init(dir.path(), "host").unwrap());
    cosmic_connect_core::Device::new(
        peer_info(&"c".repeat(32)),
        identity,
        Arc::new(PluginRegistry::new()),
        observer,
        Duration::from_secs(30),
    )
}

#[tokio::test]
async fn new_unknown_device_starts_unpaired() {
    let device = new_device(Arc::new(CountingObserver { pair_changes: AtomicUsize::new(0) }));
    assert_eq!(device.pair_state(), PairState::Unpaired);
}

#[tokio::test]
async fn requesting_pair_moves_to_requested_by_us() {
    let device = new_device(Arc::new(CountingObserver { pair_changes: AtomicUsize::new(0) }));
    device.request_pair().await;
    assert_eq!(device.pair_state(), PairState::RequestedByUs);
}

#[tokio::test]
async fn receiving_a_pair_accept_while_requested_by_us_completes_pairing() {
    let device = new_device(Arc::new(CountingObserver { pair_changes: AtomicUsize::new(0) }));
    device.request_pair().await;
    device.route_packet(Packet::pair_request(true)).await;
    assert_eq!(device.pair_state(), PairState::Paired);
}

#[tokio::test]
async fn receiving_a_pair_request_while_unpaired_becomes_requested_by_them() {
    let device = new_device(Arc::new(CountingObserver { pair_changes: AtomicUsize::new(0) }));
    device.route_packet(Packet::pair_request(true)).await;
    assert_eq!(device.pair_state(), PairState::RequestedByThem);
}

#[tokio::test]
async fn accepting_an_incoming_request_completes_pairing() {
    let device = new_device(Arc::new(CountingObserver { pair_changes: AtomicUsize::new(0) }));
    device.route_packet(Packet::pair_request(true)).await;
    device.accept_pair().await;
    assert_eq!(device.pair_state(), PairState::Paired);
}

#[tokio::test]
async fn unpairing_a_paired_device_returns_to_unpaired() {
    let device = new_device(Arc::new(CountingObserver { pair_changes: AtomicUsize::new(0) }));
    device.route_packet(Packet::pair_request(true)).await;
    device.accept_pair().await;
    device.unpair().await;
    assert_eq!(device.pair_state(), PairState::Unpaired);
}

#[tokio::test]
async fn non_pair_packets_are_dropped_while_unpaired() {
    let device = new_device(Arc::new(CountingObserver { pair_changes: AtomicUsize::new(0) }));
    // No plugins registered, so there is nothing to observe besides the
    // absence of a panic/route on an unpaired device.
    device
        .route_packet(Packet::builder("cconnect.ping").body(Default::default()).build().unwrap())
        .await;
    assert_eq!(device.pair_state(), PairState::Unpaired);
}

#[tokio::test]
async fn reject_pair_on_incoming_request_returns_to_unpaired() {
    let device = new_device(Arc::new(CountingObserver { pair_changes: AtomicUsize::new(0) }));
    device.route_packet(Packet::pair_request(true)).await;
    device.reject_pair().await;
    assert_eq!(device.pair_state(), PairState::Unpaired);
}

#[tokio::test]
async fn pair_state_changes_notify_the_observer() {
    let observer = Arc::new(CountingObserver { pair_changes: AtomicUsize::new(0) });
    let device = new_device(observer.clone());
    device.request_pair().await;
    device.route_packet(Packet::pair_request(true)).await;
    assert!(observer.pair_changes.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn unsolicited_pair_decline_is_ignored() {
    let device = new_device(Arc::new(CountingObserver { pair_changes: AtomicUsize::new(0) }));
    // Declining a request we never made (state is Unpaired) is a no-op.
    device.route_packet(Packet::pair_request(false)).await;
    assert_eq!(device.pair_state(), PairState::Unpaired);
}
