//! Packet data model and the newline-delimited JSON wire codec (§3, §4.B).
//!
//! Framing: one packet per line of UTF-8 JSON terminated by `\n`. Readers
//! buffer until `\n`; a frame whose JSON envelope exceeds
//! [`CoreConfig::max_frame_bytes`] is a protocol error that closes the link.
//! This mirrors the teacher's own length-delimited framing discipline in
//! `src-tauri/src/runtime/lan/peer.rs::read_peer_message` — same "read until we know the
//! frame is complete, reject absurd sizes" shape, adapted from a 4-byte
//! length prefix to a newline terminator per the wire format this core must
//! preserve compatibility with.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{CoreError, CoreResult};

/// Protocol version this implementation announces (§3: "integer >= 7").
pub const PROTOCOL_VERSION: u32 = 7;

/// Canonical identity packet type this implementation emits.
pub const PACKET_TYPE_IDENTITY: &str = "cconnect.identity";
/// Canonical pair packet type this implementation emits.
pub const PACKET_TYPE_PAIR: &str = "cconnect.pair";

/// Other namespaces seen in the wider peer ecosystem (§9 Open Question):
/// accepted on receipt and normalized to the canonical type above, never
/// emitted by this core.
const IDENTITY_TYPE_ALIASES: &[&str] = &["kdeconnect.identity", "cosmicconnect.identity"];
const PAIR_TYPE_ALIASES: &[&str] = &["kdeconnect.pair", "cosmicconnect.pair"];

/// True if `packet_type` should be treated as an identity packet, whether
/// or not it used our canonical string.
pub fn is_identity_type(packet_type: &str) -> bool {
    packet_type == PACKET_TYPE_IDENTITY || IDENTITY_TYPE_ALIASES.contains(&packet_type)
}

/// True if `packet_type` should be treated as a pair packet.
pub fn is_pair_type(packet_type: &str) -> bool {
    packet_type == PACKET_TYPE_PAIR || PAIR_TYPE_ALIASES.contains(&packet_type)
}

/// Device category, as carried in [`DeviceInfo::device_type`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Phone,
    Tablet,
    Tv,
    Desktop,
    Laptop,
}

/// Immutable-per-announcement device advertisement (§3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    pub protocol_version: u32,
    pub incoming_capabilities: BTreeSet<String>,
    pub outgoing_capabilities: BTreeSet<String>,
    /// Advisory; meaningful only in announcement context (UDP discovery and
    /// the pre-TLS identity frame). Peers must tolerate connections from
    /// other ports after the first handshake.
    pub tcp_port: u16,
}

impl DeviceInfo {
    /// Truncate optional fields (capability lists first) so the announced
    /// identity fits inside a single UDP datagram. Used only for the UDP
    /// broadcast path (§6); the TCP pre-TLS identity frame is never
    /// truncated.
    pub fn truncated_for_udp(&self, max_len: usize) -> DeviceInfo {
        let mut info = self.clone();
        loop {
            let encoded = serde_json::to_vec(&info).unwrap_or_default();
            if encoded.len() <= max_len || (info.incoming_capabilities.is_empty() && info.outgoing_capabilities.is_empty()) {
                break;
            }
            if !info.outgoing_capabilities.is_empty() {
                info.outgoing_capabilities.clear();
            } else {
                info.incoming_capabilities.clear();
            }
        }
        info
    }
}

/// The wire-level packet envelope (§3, §6). Immutable once built; senders
/// go through [`PacketBuilder`] so `payload_size` / `payload_transfer_info`
/// consistency is validated before a `Packet` can exist (§9 redesign note:
/// no setter-based mutable packet object).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packet {
    pub id: i64,
    #[serde(rename = "type")]
    pub packet_type: String,
    pub body: Map<String, Value>,
    pub payload_size: i64,
    #[serde(rename = "payloadTransferInfo", skip_serializing_if = "Option::is_none")]
    pub payload_transfer_info: Option<Map<String, Value>>,
}

impl Packet {
    pub fn builder(packet_type: impl Into<String>) -> PacketBuilder {
        PacketBuilder::new(packet_type)
    }

    pub fn payload_port(&self) -> Option<u16> {
        self.payload_transfer_info
            .as_ref()?
            .get("port")?
            .as_u64()
            .and_then(|p| u16::try_from(p).ok())
    }

    /// Build the canonical identity packet for `info`.
    pub fn identity(info: &DeviceInfo) -> Packet {
        let body = serde_json::to_value(info)
            .expect("DeviceInfo is always representable as a JSON object")
            .as_object()
            .cloned()
            .expect("DeviceInfo serializes to a JSON object");
        Packet::builder(PACKET_TYPE_IDENTITY)
            .body(body)
            .build()
            .expect("identity packets never carry a payload")
    }

    /// Parse `self` back into a [`DeviceInfo`], used when receiving an
    /// identity packet (either alias or canonical type).
    pub fn into_device_info(self) -> CoreResult<DeviceInfo> {
        serde_json::from_value(Value::Object(self.body))
            .map_err(|e| CoreError::ProtocolViolation(format!("malformed identity body: {e}")))
    }

    pub fn pair_request(accept: bool) -> Packet {
        let mut body = Map::new();
        body.insert("pair".to_string(), Value::Bool(accept));
        Packet::builder(PACKET_TYPE_PAIR)
            .body(body)
            .build()
            .expect("pair packets never carry a payload")
    }

    /// `true`/`false`/missing-field all resolve to a pair decision; a
    /// missing `pair` field is treated as `false` (reject) rather than a
    /// protocol error, matching the tolerant-parsing rule in §4.B.
    pub fn pair_decision(&self) -> bool {
        self.body.get("pair").and_then(Value::as_bool).unwrap_or(false)
    }
}

/// Validating builder for [`Packet`] (§9 redesign note).
pub struct PacketBuilder {
    id: i64,
    packet_type: String,
    body: Map<String, Value>,
    payload_size: i64,
    payload_transfer_info: Option<Map<String, Value>>,
}

impl PacketBuilder {
    pub fn new(packet_type: impl Into<String>) -> Self {
        Self {
            id: now_millis(),
            packet_type: packet_type.into(),
            body: Map::new(),
            payload_size: 0,
            payload_transfer_info: None,
        }
    }

    pub fn id(mut self, id: i64) -> Self {
        self.id = id;
        self
    }

    pub fn body(mut self, body: Map<String, Value>) -> Self {
        self.body = body;
        self
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.body.insert(key.into(), value.into());
        self
    }

    pub fn payload(mut self, size: i64, port: u16) -> Self {
        self.payload_size = size;
        let mut info = Map::new();
        info.insert("port".to_string(), Value::from(port));
        self.payload_transfer_info = Some(info);
        self
    }

    /// Validates the payload-size / payload-transfer-info invariant (§3)
    /// before producing a `Packet`.
    pub fn build(self) -> CoreResult<Packet> {
        let has_info = self.payload_transfer_info.is_some();
        if self.payload_size > 0 && !has_info {
            return Err(CoreError::ProtocolViolation(
                "payloadSize > 0 requires payloadTransferInfo".into(),
            ));
        }
        if self.payload_size == 0 && has_info {
            return Err(CoreError::ProtocolViolation(
                "payloadSize == 0 must not carry payloadTransferInfo".into(),
            ));
        }
        if self.payload_size > 0 {
            let has_port = self
                .payload_transfer_info
                .as_ref()
                .and_then(|m| m.get("port"))
                .is_some();
            if !has_port {
                return Err(CoreError::ProtocolViolation(
                    "payloadTransferInfo must carry a port".into(),
                ));
            }
        }
        Ok(Packet {
            id: self.id,
            packet_type: self.packet_type,
            body: self.body,
            payload_size: self.payload_size,
            payload_transfer_info: self.payload_transfer_info,
        })
    }
}

fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Write one packet as a single newline-terminated JSON line.
pub async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, packet: &Packet) -> CoreResult<()> {
    let mut line = serde_json::to_vec(packet)
        .map_err(|e| CoreError::ProtocolViolation(format!("failed to serialize packet: {e}")))?;
    line.push(b'\n');
    writer
        .write_all(&line)
        .await
        .map_err(|e| CoreError::IoTransient {
            device_id: String::new(),
            source: e,
        })?;
    writer.flush().await.map_err(|e| CoreError::IoTransient {
        device_id: String::new(),
        source: e,
    })
}

/// Outcome of reading a single frame: either a well-formed packet, or a
/// tolerated parse failure that should be logged and skipped without
/// closing the link (§4.B — interop with peers that emit extensions).
#[derive(Debug)]
pub enum ReadOutcome {
    Packet(Packet),
    Skipped(String),
    Eof,
}

/// Read one newline-terminated frame and parse it.
///
/// - A frame exceeding `max_frame_bytes` is [`CoreError::ProtocolViolation`]
///   and the caller must close the link.
/// - A truncated stream (EOF mid-frame, i.e. no terminating `\n` was ever
///   seen) is returned as [`ReadOutcome::Eof`]; the caller treats the link
///   as lost.
/// - Invalid JSON or a missing `type` field is tolerated: returned as
///   [`ReadOutcome::Skipped`] so the caller can log a warning and keep
///   reading.
pub async fn read_packet<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    max_frame_bytes: usize,
) -> CoreResult<ReadOutcome> {
    let mut line = Vec::new();
    let n = reader
        .read_until(b'\n', &mut line)
        .await
        .map_err(|e| CoreError::IoTransient {
            device_id: String::new(),
            source: e,
        })?;

    if n == 0 {
        return Ok(ReadOutcome::Eof);
    }

    if line.last() != Some(&b'\n') {
        // Stream ended mid-frame: truncated.
        return Ok(ReadOutcome::Eof);
    }
    line.pop();

    if line.len() > max_frame_bytes {
        return Err(CoreError::ProtocolViolation(format!(
            "oversize frame: {} bytes (max {})",
            line.len(),
            max_frame_bytes
        )));
    }

    let value: Value = match serde_json::from_slice(&line) {
        Ok(v) => v,
        Err(e) => return Ok(ReadOutcome::Skipped(format!("invalid JSON: {e}"))),
    };

    let Some(obj) = value.as_object() else {
        return Ok(ReadOutcome::Skipped("frame is not a JSON object".into()));
    };

    let Some(packet_type) = obj.get("type").and_then(Value::as_str) else {
        return Ok(ReadOutcome::Skipped("missing `type` field".into()));
    };

    let id = obj.get("id").and_then(Value::as_i64).unwrap_or(0);
    let body = obj
        .get("body")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    let payload_size = obj.get("payloadSize").and_then(Value::as_i64).unwrap_or(0);
    let payload_transfer_info = obj
        .get("payloadTransferInfo")
        .and_then(Value::as_object)
        .cloned();

    Ok(ReadOutcome::Packet(Packet {
        id,
        packet_type: packet_type.to_string(),
        body,
        payload_size,
        payload_transfer_info,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tokio::io::BufReader;

    fn sample_info() -> DeviceInfo {
        DeviceInfo {
            id: "a1c4deadbeefdeadbeefdeadbeefdead".into(),
            name: "alice-laptop".into(),
            device_type: DeviceType::Laptop,
            protocol_version: 7,
            incoming_capabilities: BTreeSet::from(["cconnect.ping".to_string()]),
            outgoing_capabilities: BTreeSet::from(["cconnect.ping".to_string()]),
            tcp_port: 1716,
        }
    }

    #[tokio::test]
    async fn encode_decode_roundtrip_is_identity() {
        let packet = Packet::builder("cconnect.ping")
            .set("message", "hi")
            .build()
            .unwrap();

        let mut buf = Vec::new();
        write_packet(&mut buf, &packet).await.unwrap();

        let mut reader = BufReader::new(&buf[..]);
        match read_packet(&mut reader, 1024 * 1024).await.unwrap() {
            ReadOutcome::Packet(decoded) => {
                assert_eq!(decoded.id, packet.id);
                assert_eq!(decoded.packet_type, packet.packet_type);
                assert_eq!(decoded.body, packet.body);
                assert_eq!(decoded.payload_size, 0);
                assert!(decoded.payload_transfer_info.is_none());
            }
            _ => panic!("expected a decoded packet"),
        }
    }

    #[tokio::test]
    async fn unknown_body_values_round_trip_unchanged() {
        let mut body = Map::new();
        body.insert(
            "nested".into(),
            serde_json::json!({"a": [1, 2, {"b": true}], "c": null}),
        );
        let packet = Packet::builder("plugin.custom").body(body.clone()).build().unwrap();
        let mut buf = Vec::new();
        write_packet(&mut buf, &packet).await.unwrap();
        let mut reader = BufReader::new(&buf[..]);
        let ReadOutcome::Packet(decoded) = read_packet(&mut reader, 1024 * 1024).await.unwrap() else {
            panic!("expected packet")
        };
        assert_eq!(decoded.body, body);
    }

    #[test]
    fn builder_rejects_payload_without_transfer_info() {
        let mut builder = Packet::builder("cconnect.share.request");
        builder.payload_size = 10;
        assert!(builder.build().is_err());
    }

    #[test]
    fn builder_rejects_transfer_info_without_payload() {
        let builder = Packet::builder("cconnect.share.request").payload(0, 1742);
        // payload(0, ..) sets payload_size to 0 but leaves transfer info set.
        assert!(builder.build().is_err());
    }

    #[test]
    fn builder_accepts_consistent_payload() {
        let packet = Packet::builder("cconnect.share.request")
            .payload(1024, 1742)
            .build()
            .unwrap();
        assert_eq!(packet.payload_port(), Some(1742));
    }

    #[tokio::test]
    async fn oversize_frame_is_protocol_violation() {
        let huge_value = "x".repeat(2000);
        let packet = Packet::builder("cconnect.ping").set("pad", huge_value).build().unwrap();
        let mut buf = Vec::new();
        write_packet(&mut buf, &packet).await.unwrap();
        let mut reader = BufReader::new(&buf[..]);
        let result = read_packet(&mut reader, 100).await;
        assert!(matches!(result, Err(CoreError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn truncated_stream_is_eof() {
        let mut reader = BufReader::new(&b"{\"id\":1,\"type\":\"cconnect.ping\""[..]);
        let outcome = read_packet(&mut reader, 1024).await.unwrap();
        assert!(matches!(outcome, ReadOutcome::Eof));
    }

    #[tokio::test]
    async fn invalid_json_is_skipped_not_fatal() {
        let mut reader = BufReader::new(&b"not json at all\n"[..]);
        let outcome = read_packet(&mut reader, 1024).await.unwrap();
        assert!(matches!(outcome, ReadOutcome::Skipped(_)));
    }

    #[tokio::test]
    async fn missing_type_is_skipped_not_fatal() {
        let mut reader = BufReader::new(&b"{\"id\":1}\n"[..]);
        let outcome = read_packet(&mut reader, 1024).await.unwrap();
        assert!(matches!(outcome, ReadOutcome::Skipped(_)));
    }

    #[test]
    fn identity_packet_roundtrips_device_info() {
        let info = sample_info();
        let packet = Packet::identity(&info);
        assert!(is_identity_type(&packet.packet_type));
        let decoded = packet.into_device_info().unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn aliases_are_recognized_on_receipt() {
        assert!(is_identity_type("kdeconnect.identity"));
        assert!(is_pair_type("kdeconnect.pair"));
        assert!(!is_identity_type("cconnect.ping"));
    }

    #[test]
    fn truncation_drops_capabilities_before_failing() {
        let mut info = sample_info();
        for i in 0..500 {
            info.outgoing_capabilities.insert(format!("plugin.synthetic.{i}"));
        }
        let truncated = info.truncated_for_udp(512);
        assert!(serde_json::to_vec(&truncated).unwrap().len() <= 512 || truncated.outgoing_capabilities.is_empty());
    }
}
