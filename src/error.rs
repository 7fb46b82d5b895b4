//! Typed error surface for the connectivity core.
//!
//! Call sites that only need to propagate a failure use `anyhow::Result`
//! (the teacher's convention throughout `src-tauri/src/runtime/lan/*.rs`); call sites that
//! branch on *kind* — link state transitions, pairing-violation reporting —
//! match on [`CoreError`].

use std::net::SocketAddr;

/// One variant per error kind in the spec's error-handling table.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Read/write failure on an otherwise-authenticated link. The link is
    /// marked `Broken` and closed; discovery + reconnect takes over.
    #[error("io error on link to {device_id}: {source}")]
    IoTransient {
        device_id: String,
        #[source]
        source: std::io::Error,
    },

    /// TLS handshake failed during link setup. The socket is dropped; no
    /// existing link is affected.
    #[error("TLS handshake failed with {addr}: {source}")]
    TlsHandshakeFailure {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The peer's certificate did not match the one pinned at pair time.
    /// The core reports this and drops the new connection; it does NOT
    /// auto-unpair the existing, legitimately-paired peer.
    #[error("certificate pin violation for device {device_id}")]
    CertificatePinViolation { device_id: String },

    /// A handshake certificate's CN did not match the announced device id.
    #[error("certificate CN {cn} does not match announced device id {announced}")]
    IdentityMismatch { cn: String, announced: String },

    /// Malformed JSON, missing `type`, or an oversize frame. The offending
    /// link is closed; other links are unaffected.
    #[error("protocol violation on link: {0}")]
    ProtocolViolation(String),

    /// A single payload transfer failed; the primary link is unaffected.
    #[error("payload transfer failed: {0}")]
    PayloadFailure(String),

    /// The pairing handshake did not complete within the timeout.
    #[error("pairing with {device_id} timed out")]
    PairTimeout { device_id: String },

    /// The peer explicitly rejected a pairing request.
    #[error("pairing with {device_id} was rejected")]
    PairRejected { device_id: String },

    /// A plugin required a host permission that was not granted.
    #[error("plugin {plugin} requires permission(s) not granted: {missing:?}")]
    CapabilityMissing {
        plugin: String,
        missing: Vec<String>,
    },

    /// The trust store already has a *different* certificate pinned for
    /// this device id; the caller must untrust before re-trusting.
    #[error("device {device_id} is already trusted to a different certificate")]
    TrustCollision { device_id: String },

    /// The requested device id is not present in the registry / trust store.
    #[error("unknown device id {0}")]
    UnknownDevice(String),

    /// The link selected for a send was not live.
    #[error("link to {device_id} is broken")]
    LinkBroken { device_id: String },

    /// Process-level initialization failure: unwritable trust store, no
    /// usable network interface, or key generation failure. The core
    /// remains inert until the host retries.
    #[error("fatal initialization error: {0}")]
    FatalInit(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
