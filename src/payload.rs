//! Payload Channel (§4.C): an ephemeral, single-use TLS connection carrying
//! the bulk bytes a packet's `payloadTransferInfo` describes, separate from
//! the control link so a large file transfer never head-of-line blocks
//! packet delivery.
//!
//! Grounded on the teacher's session upgrade in `src-tauri/src/runtime/lan/peer.rs`
//! (bind-with-fallback, `tokio::time::timeout` around the first accept)
//! generalized from a persistent control socket to a one-shot transfer
//! socket, and on `tls.rs` for the pinned mutual-TLS setup reused as-is.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::warn;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;

use crate::error::{CoreError, CoreResult};
use crate::identity::IdentityStore;
use crate::tls::{build_acceptor, build_connector, placeholder_server_name, HandshakeVerifier};

/// Handle returned to the sender of a payload: progress 0-100 (§4.C
/// "monotonic, sender-reported") plus a cooperative cancellation switch.
pub struct PayloadHandle {
    progress: watch::Receiver<u8>,
    cancel: Arc<AtomicBool>,
}

impl PayloadHandle {
    pub fn progress(&self) -> watch::Receiver<u8> {
        self.progress.clone()
    }

    /// Best-effort: the in-flight read/write loop checks this between
    /// chunks and aborts with [`CoreError::PayloadFailure`] (§7: failure is
    /// scoped to this payload only; the owning link is unaffected).
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }
}

/// Bind an ephemeral listener inside `port_range`, matching the control
/// link's bind-with-fallback behavior (§4.F) rather than inventing a
/// different port-selection rule for payloads.
async fn bind_in_range(range: (u16, u16)) -> CoreResult<TcpListener> {
    let (start, end) = range;
    for port in start..=end {
        let addr = format!("0.0.0.0:{port}");
        if let Ok(listener) = TcpListener::bind(&addr).await {
            return Ok(listener);
        }
    }
    Err(CoreError::PayloadFailure(format!(
        "no free payload port in range {start}-{end}"
    )))
}

/// Sender side (§4.C step 2-4): bind, report the bound port to the caller
/// so it can be embedded in `payloadTransferInfo`, accept exactly one
/// connection within `accept_timeout`, then stream `payload_size` bytes
/// from `source` reporting progress as they go.
pub async fn offer<R>(
    identity: Arc<IdentityStore>,
    peer_id: String,
    port_range: (u16, u16),
    accept_timeout: Duration,
    payload_size: u64,
    mut source: R,
) -> CoreResult<(u16, PayloadHandle)>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let listener = bind_in_range(port_range).await?;
    let bound_port = listener
        .local_addr()
        .map_err(|e| CoreError::PayloadFailure(e.to_string()))?
        .port();

    let (progress_tx, progress_rx) = watch::channel(0u8);
    let cancel = Arc::new(AtomicBool::new(false));
    let handle = PayloadHandle {
        progress: progress_rx,
        cancel: cancel.clone(),
    };

    tokio::spawn(async move {
        let verifier = HandshakeVerifier::new(identity.clone());
        verifier.expect_device_id(&peer_id);
        let acceptor = match build_acceptor(&identity, &verifier) {
            Ok(a) => a,
            Err(e) => {
                warn!("payload offer to {peer_id}: failed to build acceptor: {e}");
                return;
            }
        };

        let accepted = timeout(accept_timeout, listener.accept()).await;
        let (stream, _addr) = match accepted {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                warn!("payload offer to {peer_id}: accept failed: {e}");
                return;
            }
            Err(_) => {
                warn!("payload offer to {peer_id}: no connection within accept timeout");
                return;
            }
        };

        let tls_stream = match acceptor.accept(stream).await {
            Ok(s) => s,
            Err(e) => {
                warn!("payload offer to {peer_id}: TLS handshake failed: {e}");
                return;
            }
        };

        if let Err(e) = stream_bytes(tls_stream, &mut source, payload_size, &progress_tx, &cancel).await {
            warn!("payload offer to {peer_id}: transfer failed: {e}");
        }
    });

    Ok((bound_port, handle))
}

/// Receiver side (§4.C step 1, 5): connect to the peer's *link* IP — never
/// the packet body, which only carries the port — on `payload_port`, with
/// mutual TLS pinned the same way the control link is, then read exactly
/// `payload_size` bytes into `sink`.
pub async fn receive<W>(
    identity: Arc<IdentityStore>,
    peer_id: String,
    link_peer_ip: IpAddr,
    payload_port: u16,
    connect_timeout: Duration,
    payload_size: u64,
    mut sink: W,
) -> CoreResult<()>
where
    W: AsyncWrite + Unpin,
{
    let target = SocketAddr::new(link_peer_ip, payload_port);
    let stream = timeout(connect_timeout, TcpStream::connect(target))
        .await
        .map_err(|_| CoreError::PayloadFailure(format!("connect to {target} timed out")))?
        .map_err(|e| CoreError::PayloadFailure(e.to_string()))?;

    let verifier = HandshakeVerifier::new(identity.clone());
    verifier.expect_device_id(&peer_id);
    let connector = build_connector(&identity, &verifier)?;

    let mut tls_stream = connector
        .connect(placeholder_server_name(), stream)
        .await
        .map_err(|e| CoreError::PayloadFailure(format!("payload TLS handshake failed: {e}")))?;

    let mut remaining = payload_size;
    let mut buf = vec![0u8; 64 * 1024];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let read = tls_stream
            .read(&mut buf[..want])
            .await
            .map_err(|e| CoreError::PayloadFailure(e.to_string()))?;
        if read == 0 {
            return Err(CoreError::PayloadFailure(format!(
                "connection closed with {remaining} bytes remaining"
            )));
        }
        sink.write_all(&buf[..read])
            .await
            .map_err(|e| CoreError::PayloadFailure(e.to_string()))?;
        remaining -= read as u64;
    }
    Ok(())
}

async fn stream_bytes<S, R>(
    mut stream: S,
    source: &mut R,
    payload_size: u64,
    progress_tx: &watch::Sender<u8>,
    cancel: &AtomicBool,
) -> CoreResult<()>
where
    S: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let mut sent: u64 = 0;
    let mut buf = vec![0u8; 64 * 1024];
    while sent < payload_size {
        if cancel.load(Ordering::SeqCst) {
            return Err(CoreError::PayloadFailure("cancelled by sender".into()));
        }
        let want = (payload_size - sent).min(buf.len() as u64) as usize;
        let read = source
            .read(&mut buf[..want])
            .await
            .map_err(|e| CoreError::PayloadFailure(e.to_string()))?;
        if read == 0 {
            return Err(CoreError::PayloadFailure(format!(
                "source exhausted with {} bytes remaining",
                payload_size - sent
            )));
        }
        stream
            .write_all(&buf[..read])
            .await
            .map_err(|e| CoreError::PayloadFailure(e.to_string()))?;
        sent += read as u64;

        let percent = if payload_size == 0 {
            100
        } else {
            ((sent * 100) / payload_size) as u8
        };
        let _ = progress_tx.send(percent);
    }
    stream.flush().await.map_err(|e| CoreError::PayloadFailure(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stream_bytes_reports_monotonic_progress() {
        let data = vec![1u8; 10 * 64 * 1024 + 1];
        let mut sink = Vec::new();
        let (tx, mut rx) = watch::channel(0u8);
        let cancel = AtomicBool::new(false);
        let mut source = &data[..];

        stream_bytes(&mut sink, &mut source, data.len() as u64, &tx, &cancel)
            .await
            .unwrap();

        assert_eq!(sink, data);
        assert_eq!(*rx.borrow_and_update(), 100);
    }

    #[tokio::test]
    async fn stream_bytes_honors_cancellation() {
        let data = vec![0u8; 64 * 1024 * 4];
        let mut sink = Vec::new();
        let (tx, _rx) = watch::channel(0u8);
        let cancel = AtomicBool::new(true);
        let mut source = &data[..];

        let result = stream_bytes(&mut sink, &mut source, data.len() as u64, &tx, &cancel).await;
        assert!(result.is_err());
    }
}
