//! Wire-level framing behavior (§4.B): newline-delimited JSON, oversize
//! frames rejected, malformed lines skipped without tearing down the
//! stream.

use std::collections::BTreeSet;

use cosmic_connect_core::packet::{read_packet, write_packet, Packet, ReadOutcome};

fn sample_packet() -> Packet {
    Packet::builder("cconnect.ping")
        .body(serde_json::Map::new())
        .build()
        .unwrap()
}

#[tokio::test]
async fn roundtrip_through_the_in_memory_pipe() {
    let (client, server) = tokio::io::duplex(4096);
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (server_read, _server_write) = tokio::io::split(server);

    let packet = sample_packet();
    write_packet(&mut client_write, &packet).await.unwrap();
    drop(client_write);

    let mut reader = tokio::io::BufReader::new(server_read);
    match read_packet(&mut reader, 1024 * 1024).await.unwrap() {
        ReadOutcome::Packet(received) => assert_eq!(received.packet_type, "cconnect.ping"),
        other => panic!("expected a packet, got {other:?}"),
    }

    // Nothing else was written; next read observes EOF.
    match read_packet(&mut reader, 1024 * 1024).await.unwrap() {
        ReadOutcome::Eof => {}
        other => panic!("expected EOF, got {other:?}"),
    }

    let _ = &mut client_read; // unused after the one write
}

#[tokio::test]
async fn oversize_frame_is_a_protocol_error() {
    let (client, server) = tokio::io::duplex(1 << 20);
    let (_client_read, mut client_write) = tokio::io::split(client);
    let (server_read, _server_write) = tokio::io::split(server);

    let huge_body = "x".repeat(2048);
    let mut body = serde_json::Map::new();
    body.insert("data".into(), serde_json::Value::String(huge_body));
    let packet = Packet::builder("cconnect.ping").body(body).build().unwrap();

    write_packet(&mut client_write, &packet).await.unwrap();

    let mut reader = tokio::io::BufReader::new(server_read);
    let result = read_packet(&mut reader, 64).await;
    assert!(result.is_err(), "a frame over the byte cap must be rejected");
}

#[tokio::test]
async fn malformed_line_is_skipped_not_fatal() {
    let (client, server) = tokio::io::duplex(4096);
    let (_client_read, mut client_write) = tokio::io::split(client);
    let (server_read, _server_write) = tokio::io::split(server);

    tokio::io::AsyncWriteExt::write_all(&mut client_write, b"not json\n").await.unwrap();
    write_packet(&mut client_write, &sample_packet()).await.unwrap();

    let mut reader = tokio::io::BufReader::new(server_read);
    match read_packet(&mut reader, 1024 * 1024).await.unwrap() {
        ReadOutcome::Skipped(_) => {}
        other => panic!("expected the malformed line to be skipped, got {other:?}"),
    }
    match read_packet(&mut reader, 1024 * 1024).await.unwrap() {
        ReadOutcome::Packet(p) => assert_eq!(p.packet_type, "cconnect.ping"),
        other => panic!("expected the next valid packet, got {other:?}"),
    }
}

#[test]
fn identity_packet_carries_device_info_round_trip() {
    let info = cosmic_connect_core::DeviceInfo {
        id: "a".repeat(32),
        name: "Test Device".into(),
        device_type: cosmic_connect_core::DeviceType::Phone,
        protocol_version: 7,
        incoming_capabilities: BTreeSet::from(["cconnect.ping".to_string()]),
        outgoing_capabilities: BTreeSet::new(),
        tcp_port: 1716,
    };
    let packet = Packet::identity(&info);
    let decoded = packet.into_device_info().unwrap();
    assert_eq!(decoded, info);
}
