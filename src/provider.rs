//! Link Provider (§4.F): owns the TCP listen socket, drives the two
//! symmetric accept/connect flows, and decides which side of a
//! simultaneous discovery initiates the TCP connection.
//!
//! Grounded on the teacher's `run_tcp_host`/`run_tcp_client` pair
//! (`src-tauri/src/runtime/lan/peer.rs`): bind-with-fallback, a `tokio::select!` accept
//! loop, and a handshake performed before handing the session off.
//! Generalized to perform a pre-TLS identity exchange and a TLS upgrade
//! with certificate pinning (§4.A) in place of the teacher's plaintext
//! `Hello`/`Welcome`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsStream;

use crate::error::{CoreError, CoreResult};
use crate::identity::IdentityStore;
use crate::packet::{read_packet, write_packet, DeviceInfo, Packet, ReadOutcome};
use crate::tls::{build_acceptor, build_connector, placeholder_server_name, HandshakeVerifier};

/// Bind the first free port in `range` (inclusive), matching §6's "TCP
/// listen range 1714-1764; the first successful bind is used".
pub async fn bind_first_free(range: (u16, u16)) -> CoreResult<TcpListener> {
    let (start, end) = range;
    for port in start..=end {
        let addr = format!("0.0.0.0:{port}");
        match TcpListener::bind(&addr).await {
            Ok(listener) => {
                info!("link provider listening on {addr}");
                return Ok(listener);
            }
            Err(e) => {
                warn!("bind on {addr} failed, trying next port: {e}");
            }
        }
    }
    Err(CoreError::FatalInit(format!(
        "no free TCP port in range {start}-{end}"
    )))
}

/// `true` when the local side should actively connect out to `peer_id`
/// rather than wait to accept (§4.F role rule): the lexicographically
/// lesser device id is the TCP client.
pub fn should_initiate_connect(local_id: &str, peer_id: &str) -> bool {
    local_id < peer_id
}

/// The result of a successful accept or connect flow: an authenticated
/// TLS stream plus the peer's announced identity, ready to be wrapped in
/// a [`crate::link::Link`] by the caller (which owns packet routing).
pub struct EstablishedLink {
    pub stream: TlsStream<TcpStream>,
    pub peer_addr: SocketAddr,
    pub peer_info: DeviceInfo,
    /// The peer's end-entity certificate DER, as presented during the
    /// handshake just completed. `verify_peer` already pinned it; the
    /// caller persists it only once pairing actually completes (§3
    /// `peerCert`).
    pub peer_cert_der: Vec<u8>,
}

/// Turn an opaque handshake I/O failure into the typed error the verifier
/// actually observed, when it observed one — a pin violation must surface
/// as [`CoreError::CertificatePinViolation`], not a generic
/// [`CoreError::TlsHandshakeFailure`], regardless of which side accepted.
fn handshake_error(verifier: &HandshakeVerifier, addr: SocketAddr, source: std::io::Error) -> CoreError {
    match verifier.take_error() {
        Some(e @ CoreError::CertificatePinViolation { .. }) => e,
        Some(e @ CoreError::IdentityMismatch { .. }) => e,
        _ => CoreError::TlsHandshakeFailure { addr, source },
    }
}

/// Pull the peer's end-entity certificate DER out of a just-completed
/// handshake. Mandatory client auth (§4.C) means this is always present.
fn peer_cert_der(stream: &TlsStream<TcpStream>) -> CoreResult<Vec<u8>> {
    let certs = stream
        .get_ref()
        .1
        .peer_certificates()
        .ok_or_else(|| CoreError::ProtocolViolation("peer presented no certificate".into()))?;
    let first = certs
        .first()
        .ok_or_else(|| CoreError::ProtocolViolation("peer certificate chain was empty".into()))?;
    Ok(first.as_ref().to_vec())
}

/// Flow 1 (§4.F): accept one peer-initiated connection. Reads the pre-TLS
/// identity frame, then upgrades to TLS acting as the server with mutual
/// auth pinned against `identity`.
pub async fn accept_flow(
    stream: TcpStream,
    peer_addr: SocketAddr,
    identity: &Arc<IdentityStore>,
    max_frame_bytes: usize,
) -> CoreResult<EstablishedLink> {
    configure_keepalive(&stream);

    let mut plain = BufReader::new(stream);
    let peer_info = read_identity_frame(&mut plain, max_frame_bytes).await?;

    let verifier = HandshakeVerifier::new(identity.clone());
    verifier.expect_device_id(&peer_info.id);
    let acceptor = build_acceptor(identity, &verifier)?;

    // Safe to discard the BufReader here: the peer sends only the identity
    // frame before waiting for us to start the TLS handshake, so nothing
    // past the trailing '\n' has been buffered.
    let stream = plain.into_inner();
    let tls_stream = acceptor
        .accept(stream)
        .await
        .map_err(|e| handshake_error(&verifier, peer_addr, e))?;

    let stream = TlsStream::Server(tls_stream);
    let cert_der = peer_cert_der(&stream)?;

    Ok(EstablishedLink {
        stream,
        peer_addr,
        peer_info,
        peer_cert_der: cert_der,
    })
}

/// Flow 2 (§4.F): actively connect to a peer discovered via UDP. Writes
/// our identity frame (pre-TLS), then upgrades to TLS acting as the
/// client.
pub async fn connect_flow(
    peer_addr: SocketAddr,
    peer: &DeviceInfo,
    identity: &Arc<IdentityStore>,
    local_info: &DeviceInfo,
    connect_timeout: Duration,
) -> CoreResult<EstablishedLink> {
    let expected_peer_id = peer.id.as_str();
    let target = SocketAddr::new(peer_addr.ip(), peer.tcp_port);
    let stream = timeout(connect_timeout, TcpStream::connect(target))
        .await
        .map_err(|_| CoreError::TlsHandshakeFailure {
            addr: target,
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
        })?
        .map_err(|e| CoreError::IoTransient {
            device_id: expected_peer_id.to_string(),
            source: e,
        })?;

    configure_keepalive(&stream);

    let mut plain = stream;
    let identity_packet = Packet::identity(local_info);
    write_packet(&mut plain, &identity_packet)
        .await
        .map_err(|_| CoreError::IoTransient {
            device_id: expected_peer_id.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "identity write failed"),
        })?;

    let verifier = HandshakeVerifier::new(identity.clone());
    verifier.expect_device_id(expected_peer_id);
    let connector = build_connector(identity, &verifier)?;

    let tls_stream = connector
        .connect(placeholder_server_name(), plain)
        .await
        .map_err(|e| handshake_error(&verifier, target, e))?;

    let stream = TlsStream::Client(tls_stream);
    let cert_der = peer_cert_der(&stream)?;

    Ok(EstablishedLink {
        stream,
        peer_addr: target,
        peer_info: peer.clone(),
        peer_cert_der: cert_der,
    })
}

async fn read_identity_frame(
    reader: &mut BufReader<TcpStream>,
    max_frame_bytes: usize,
) -> CoreResult<DeviceInfo> {
    match read_packet(reader, max_frame_bytes).await? {
        ReadOutcome::Packet(packet) if crate::packet::is_identity_type(&packet.packet_type) => {
            packet.into_device_info()
        }
        ReadOutcome::Packet(_) => Err(CoreError::ProtocolViolation(
            "expected identity packet as first frame".into(),
        )),
        ReadOutcome::Skipped(reason) => Err(CoreError::ProtocolViolation(format!(
            "first frame was unparseable: {reason}"
        ))),
        ReadOutcome::Eof => Err(CoreError::ProtocolViolation(
            "connection closed before identity frame".into(),
        )),
    }
}

/// SO_KEEPALIVE with an ~60s idle probe, per §4.E: "the transport relies
/// on TCP keepalive ... (SO_KEEPALIVE, ~60s idle)".
fn configure_keepalive(stream: &TcpStream) {
    let keepalive = socket2::TcpKeepalive::new().with_time(Duration::from_secs(60));
    let sock_ref = socket2::SockRef::from(stream);
    if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
        warn!("failed to set SO_KEEPALIVE: {e}");
    }
}
