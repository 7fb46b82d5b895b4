//! Link Transport (§4.E): one TLS-over-TCP full-duplex channel to a peer.
//!
//! Grounded on the teacher's `run_peer_session` shared loop
//! (`src-tauri/src/runtime/lan/peer.rs`): split the stream once, wrap the writer half in
//! a `tokio::sync::Mutex` so every sender serializes through one lock, and
//! run the reader as its own task that dispatches parsed frames and
//! terminates the link on any I/O error. Generalized from the teacher's
//! fixed clipboard/heartbeat messages to the spec's typed packet stream,
//! and from a plain `TcpStream` to a `tokio_rustls` TLS stream.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use tokio::io::{split, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio_rustls::TlsStream;

use crate::error::CoreResult;
use crate::packet::{read_packet, write_packet, Packet, ReadOutcome};

/// Mirrors the §4.E state diagram. `UnauthenticatedTcp` and `TlsHandshake`
/// are transient and live only in [`crate::provider::LinkProvider`]'s
/// accept/connect flows; a [`Link`] only ever starts life `Authenticated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Authenticated,
    Broken,
    Closed,
}

/// A single authenticated duplex channel to one peer. Reads are dispatched
/// to `on_packet`/`on_broken` from a dedicated task; writes are serialized
/// through `writer`.
pub struct Link {
    pub peer_id: String,
    pub peer_addr: SocketAddr,
    /// Higher wins when a Device picks among several concurrent links
    /// (§4.G "ranked by provider priority").
    pub priority: u8,
    writer: AsyncMutex<WriteHalf<TlsStream<TcpStream>>>,
    state: std::sync::RwLock<LinkState>,
    closed: Arc<AtomicBool>,
}

impl Link {
    /// Takes ownership of an already-authenticated TLS stream, splits it,
    /// and spawns the reader task. `on_packet` is invoked once per parsed
    /// frame, in receive order (§5 ordering guarantee); `on_broken` fires
    /// at most once, when the reader observes EOF, a protocol violation,
    /// or an I/O error.
    pub fn spawn(
        stream: TlsStream<TcpStream>,
        peer_id: String,
        peer_addr: SocketAddr,
        priority: u8,
        max_frame_bytes: usize,
        on_packet: impl Fn(Packet) + Send + Sync + 'static,
        on_broken: impl FnOnce() + Send + 'static,
    ) -> Arc<Link> {
        let (read_half, write_half) = split(stream);
        let closed = Arc::new(AtomicBool::new(false));

        let link = Arc::new(Link {
            peer_id: peer_id.clone(),
            peer_addr,
            priority,
            writer: AsyncMutex::new(write_half),
            state: std::sync::RwLock::new(LinkState::Authenticated),
            closed: closed.clone(),
        });

        let reader_peer_id = peer_id;
        let reader_state = link.clone();
        tokio::spawn(async move {
            run_reader(
                read_half,
                &reader_peer_id,
                max_frame_bytes,
                &on_packet,
                closed,
            )
            .await;
            reader_state.mark_broken();
            on_broken();
        });

        link
    }

    pub fn state(&self) -> LinkState {
        *self.state.read().unwrap()
    }

    fn mark_broken(&self) {
        let mut state = self.state.write().unwrap();
        if *state == LinkState::Authenticated {
            *state = LinkState::Broken;
        }
    }

    /// Serialize and send one packet. Blocks (asynchronously) until the
    /// writer lock is free and the bytes are flushed; callers needing a
    /// non-blocking variant should `tokio::spawn` this themselves, per the
    /// "fire-and-forget or blocking" choice left to `Device::send_packet`.
    pub async fn send(&self, packet: &Packet) -> CoreResult<()> {
        let mut w = self.writer.lock().await;
        write_packet(&mut *w, packet).await
    }

    /// Idempotent: a second call after the link is already `Closed` is a
    /// no-op (§8 "`disconnect()` called twice equals once").
    pub async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.state.write().unwrap() = LinkState::Closed;
        let mut w = self.writer.lock().await;
        let _ = w.shutdown().await;
    }
}

async fn run_reader(
    read_half: ReadHalf<TlsStream<TcpStream>>,
    peer_id: &str,
    max_frame_bytes: usize,
    on_packet: &(impl Fn(Packet) + Send + Sync + 'static),
    closed: Arc<AtomicBool>,
) {
    let mut reader = BufReader::new(read_half);
    loop {
        if closed.load(Ordering::SeqCst) {
            break;
        }
        match read_packet(&mut reader, max_frame_bytes).await {
            Ok(ReadOutcome::Packet(packet)) => on_packet(packet),
            Ok(ReadOutcome::Skipped(reason)) => {
                warn!("link to {peer_id}: skipped malformed frame: {reason}");
            }
            Ok(ReadOutcome::Eof) => {
                debug!("link to {peer_id}: peer closed the connection");
                break;
            }
            Err(e) => {
                warn!("link to {peer_id}: read error: {e}");
                break;
            }
        }
    }
}
