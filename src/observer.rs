//! Host-facing observer callbacks (§6 "Observer callbacks").

use crate::device::PairState;

/// Notifications the core pushes up to the host application. Implementors
/// should return quickly; long work belongs on the host's own thread pool
/// (mirrors the teacher's `RuntimeEvent` channel, generalized from a single
/// enum shipped over an `mpsc::Sender` to a trait so hosts can filter by
/// method instead of matching on a variant).
pub trait Observer: Send + Sync {
    fn on_device_discovered(&self, device_id: &str) {
        let _ = device_id;
    }

    fn on_device_reachability_changed(&self, device_id: &str, reachable: bool) {
        let _ = (device_id, reachable);
    }

    fn on_device_pair_state_changed(&self, device_id: &str, state: PairState) {
        let _ = (device_id, state);
    }

    fn on_device_plugins_changed(&self, device_id: &str) {
        let _ = device_id;
    }

    /// Not one of the four core callbacks in §6, but required by §7's
    /// `CertificatePinViolation` policy ("emit `PairViolation(deviceId)` to
    /// host so it can surface a security warning").
    fn on_pair_violation(&self, device_id: &str) {
        let _ = device_id;
    }
}
