//! Byte-literal exercises of the adaptor event loop, driven over an
//! in-memory duplex pipe exactly the way a TCP client would drive it.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use nabunet_protocol as proto;
use nabunetd::adaptor;
use nabunetd::config::{ChannelConfig, ChannelKindConfig};
use nabunetd::conn::{ConnKind, ConnRef, ConnState, Connection};
use nabunetd::conn_io::ConnIo;
use nabunetd::image::Catalogue;
use nabunetd::{nhacp, retronet, Server};

const ACK: [u8; 2] = [0x10, 0x06];
const FINISHED: [u8; 2] = [0x10, 0xe1];
const CONFIRMED: u8 = 0xe4;

struct TempDir(std::path::PathBuf);

impl TempDir {
    fn new(tag: &str) -> Self {
        let dir = std::env::temp_dir().join(format!("nabunet-e2e-{}-{}", tag, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        Self(dir)
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

struct Harness {
    server: Arc<Server>,
    conn: ConnRef,
    client: DuplexStream,
    worker: tokio::task::JoinHandle<()>,
}

fn server_with_channel(dir: &Path, kind: ChannelKindConfig) -> Arc<Server> {
    let catalogue = Catalogue::from_config(&[ChannelConfig {
        number: 1,
        name: "test channel".into(),
        kind,
        directory: dir.to_path_buf(),
        default_file: None,
        retronet: false,
    }])
    .unwrap();
    Arc::new(Server::new(catalogue))
}

fn server_without_channels() -> Arc<Server> {
    Arc::new(Server::new(Catalogue::from_config(&[]).unwrap()))
}

fn start(server: Arc<Server>, watchdog: Option<Duration>) -> Harness {
    let (ours, client) = tokio::io::duplex(4096);
    let (reader, writer) = tokio::io::split(ours);

    let conn = Connection::new(ConnKind::Tcp, "test-client".into(), None);
    server.registry.insert(&conn);

    let mut io = ConnIo::new(conn.clone(), Box::new(reader), Box::new(writer));
    if let Some(timo) = watchdog {
        io.request_watchdog = timo;
    }

    let worker = tokio::spawn({
        let server = server.clone();
        let conn = conn.clone();
        async move {
            adaptor::event_loop(&mut io, &server).await;
            drop(io);
            conn.destroy(&server.registry);
        }
    });

    Harness {
        server,
        conn,
        client,
        worker,
    }
}

async fn read_u8(client: &mut DuplexStream) -> u8 {
    let mut buf = [0u8; 1];
    tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut buf))
        .await
        .expect("read timed out")
        .unwrap();
    buf[0]
}

async fn read_exact(client: &mut DuplexStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut buf))
        .await
        .expect("read timed out")
        .unwrap();
    buf
}

/// Read one escaped packet off the wire, undoing the doubled-escape
/// convention, until `decoded_len` packet bytes have arrived.
async fn read_packet(client: &mut DuplexStream, decoded_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(decoded_len);
    while out.len() < decoded_len {
        let b = read_u8(client).await;
        if b == proto::MSG_ESCAPE {
            let b2 = read_u8(client).await;
            assert_eq!(b2, proto::MSG_ESCAPE, "bare escape byte inside a packet");
        }
        out.push(b);
    }
    out
}

/// Drive one PACKET_REQUEST through the AUTHORIZED/ACK handshake.
/// Returns the unescaped packet, or None when the server answered
/// UNAUTHORIZED.
async fn request_segment(
    client: &mut DuplexStream,
    segment: u8,
    image_id: u32,
    decoded_len: usize,
) -> Option<Vec<u8>> {
    let mut req = vec![0x84, segment];
    req.push(image_id as u8);
    req.push((image_id >> 8) as u8);
    req.push((image_id >> 16) as u8);
    client.write_all(&req).await.unwrap();

    assert_eq!(read_exact(client, 2).await, ACK);
    assert_eq!(read_u8(client).await, CONFIRMED);

    match read_u8(client).await {
        0x91 => {
            // AUTHORIZED; ACK it and collect the packet.
            client.write_all(&ACK).await.unwrap();
            let pkt = read_packet(client, decoded_len).await;
            assert_eq!(read_exact(client, 2).await, FINISHED);
            Some(pkt)
        }
        0x90 => {
            // UNAUTHORIZED wants an ACK too.
            client.write_all(&ACK).await.unwrap();
            None
        }
        other => panic!("unexpected service byte 0x{other:02x}"),
    }
}

#[tokio::test]
async fn startup_and_status() {
    let mut h = start(server_without_channels(), None);

    // START_UP.
    h.client.write_all(&[0x83]).await.unwrap();
    assert_eq!(read_exact(&mut h.client, 2).await, ACK);
    assert_eq!(read_u8(&mut h.client).await, CONFIRMED);

    // GET_STATUS / SIGNAL with no channel selected: NO.
    h.client.write_all(&[0x82, 0x01]).await.unwrap();
    assert_eq!(read_exact(&mut h.client, 2).await, ACK);
    assert_eq!(read_u8(&mut h.client).await, 0x9f);
    assert_eq!(read_exact(&mut h.client, 2).await, FINISHED);

    // GET_STATUS / TRANSMIT is always YES.
    h.client.write_all(&[0x82, 0x1e]).await.unwrap();
    assert_eq!(read_exact(&mut h.client, 2).await, ACK);
    assert_eq!(read_u8(&mut h.client).await, 0x1f);
    assert_eq!(read_exact(&mut h.client, 2).await, FINISHED);

    drop(h.client);
    h.worker.await.unwrap();
}

#[tokio::test]
async fn mystery_handshake() {
    let mut h = start(server_without_channels(), None);

    h.client.write_all(&[0x81, 0xde, 0xad]).await.unwrap();
    assert_eq!(read_exact(&mut h.client, 2).await, ACK);
    assert_eq!(read_u8(&mut h.client).await, CONFIRMED);

    drop(h.client);
    h.worker.await.unwrap();
}

#[tokio::test]
async fn channel_change_selects_and_status_flips() {
    let dir = TempDir::new("chan");
    let mut h = start(server_with_channel(dir.path(), ChannelKindConfig::Nabu), None);

    // CHANGE_CHANNEL to 1.
    h.client.write_all(&[0x85, 0x01, 0x00]).await.unwrap();
    assert_eq!(read_exact(&mut h.client, 2).await, ACK);
    assert_eq!(read_u8(&mut h.client).await, CONFIRMED);
    assert_eq!(h.conn.channel().unwrap().number, 1);

    // Signal status is YES now.
    h.client.write_all(&[0x82, 0x01]).await.unwrap();
    assert_eq!(read_exact(&mut h.client, 2).await, ACK);
    assert_eq!(read_u8(&mut h.client).await, 0x1f);
    assert_eq!(read_exact(&mut h.client, 2).await, FINISHED);

    // An unknown channel clears the selection again.
    h.client.write_all(&[0x85, 0x63, 0x00]).await.unwrap();
    assert_eq!(read_exact(&mut h.client, 2).await, ACK);
    assert_eq!(read_u8(&mut h.client).await, CONFIRMED);
    assert!(h.conn.channel().is_none());

    drop(h.client);
    h.worker.await.unwrap();
}

#[tokio::test]
async fn time_packet_is_wrapped_and_escaped() {
    let mut h = start(server_without_channels(), None);

    let decoded_len = proto::HEADER_SIZE + proto::TIME_PACKET_SIZE + proto::FOOTER_SIZE;
    let pkt = request_segment(&mut h.client, 0, proto::IMAGE_TIME, decoded_len)
        .await
        .expect("time packet should be authorized");

    // Header: time image, segment 0, first + last.
    assert_eq!(proto::get_u24_be(&pkt[0..3]), proto::IMAGE_TIME);
    assert_eq!(pkt[3], 0);
    assert_eq!(pkt[11], 0xb1);
    assert_eq!(proto::get_u16_le(&pkt[12..14]), 0);
    assert_eq!(proto::get_u16_be(&pkt[14..16]), 0);

    // Time payload: mystery bytes, then plausible calendar fields with
    // the year pinned to 1984.
    let t = &pkt[proto::HEADER_SIZE..proto::HEADER_SIZE + proto::TIME_PACKET_SIZE];
    assert_eq!(&t[0..2], &[0x02, 0x02]);
    assert!((1..=7).contains(&t[2]));
    assert_eq!(t[3], 84);
    assert!((1..=12).contains(&t[4]));
    assert!((1..=31).contains(&t[5]));
    assert!(t[6] < 24);
    assert!(t[7] < 60);
    assert!(t[8] < 60);

    // CRC-16/GENIBUS over header + payload.
    let crc_at = decoded_len - proto::FOOTER_SIZE;
    assert_eq!(
        proto::read_crc(&pkt[crc_at..]),
        proto::crc16_genibus(&pkt[..crc_at])
    );

    // Segment 1 of the time image does not exist.
    assert!(
        request_segment(&mut h.client, 1, proto::IMAGE_TIME, 0)
            .await
            .is_none()
    );

    drop(h.client);
    h.worker.await.unwrap();
}

#[tokio::test]
async fn raw_image_two_segments_and_out_of_range() {
    let dir = TempDir::new("raw");
    let image: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(dir.path().join("000001.nabu"), &image).unwrap();

    let mut h = start(server_with_channel(dir.path(), ChannelKindConfig::Nabu), None);

    h.client.write_all(&[0x85, 0x01, 0x00]).await.unwrap();
    assert_eq!(read_exact(&mut h.client, 2).await, ACK);
    assert_eq!(read_u8(&mut h.client).await, CONFIRMED);

    // Segment 0: full payload, not last.
    let len0 = proto::HEADER_SIZE + proto::MAX_PAYLOAD_SIZE + proto::FOOTER_SIZE;
    let pkt0 = request_segment(&mut h.client, 0, 1, len0).await.unwrap();
    assert_eq!(pkt0[11], 0xa1);
    assert_eq!(proto::get_u16_be(&pkt0[14..16]), 0);
    let payload0 = &pkt0[proto::HEADER_SIZE..proto::HEADER_SIZE + proto::MAX_PAYLOAD_SIZE];

    // Segment 1: the 509-byte remainder, flagged last.
    let rest = 1500 - proto::MAX_PAYLOAD_SIZE;
    let len1 = proto::HEADER_SIZE + rest + proto::FOOTER_SIZE;
    let pkt1 = request_segment(&mut h.client, 1, 1, len1).await.unwrap();
    assert_eq!(pkt1[11], 0x30);
    assert_eq!(
        proto::get_u16_be(&pkt1[14..16]),
        proto::MAX_PAYLOAD_SIZE as u16
    );
    let payload1 = &pkt1[proto::HEADER_SIZE..proto::HEADER_SIZE + rest];

    // The two payloads reassemble the original image exactly.
    let mut whole = payload0.to_vec();
    whole.extend_from_slice(payload1);
    assert_eq!(whole, image);

    // Both CRCs hold.
    for pkt in [&pkt0, &pkt1] {
        let crc_at = pkt.len() - proto::FOOTER_SIZE;
        assert_eq!(
            proto::read_crc(&pkt[crc_at..]),
            proto::crc16_genibus(&pkt[..crc_at])
        );
    }

    // Segment 2 is past the end.
    assert!(request_segment(&mut h.client, 2, 1, 0).await.is_none());

    drop(h.client);
    h.worker.await.unwrap();
}

#[tokio::test]
async fn pak_image_segment_extraction() {
    let dir = TempDir::new("pak");

    // Build a two-segment PAK archive: each record is 2 length-ish bytes
    // followed by a pre-wrapped segment whose CRC is stale.
    let seg0_payload = vec![0x11u8; proto::MAX_PAYLOAD_SIZE];
    let seg1_payload = vec![0x22u8; 100];
    let mut pak = Vec::new();
    for (seg, payload) in [(0u16, &seg0_payload), (1u16, &seg1_payload)] {
        let mut rec = vec![0u8; proto::HEADER_SIZE + payload.len() + proto::FOOTER_SIZE];
        let n =
            proto::write_packet_header(&mut rec, 1, seg, seg * 991, seg == 1).unwrap();
        rec[n..n + payload.len()].copy_from_slice(payload);
        // Deliberately stale CRC bytes.
        let len = rec.len();
        rec[len - 2] = 0xde;
        rec[len - 1] = 0xad;
        pak.extend_from_slice(&[0x00, 0x00]);
        pak.extend_from_slice(&rec);
    }
    std::fs::write(dir.path().join("000001.pak"), &pak).unwrap();

    let mut h = start(server_with_channel(dir.path(), ChannelKindConfig::Pak), None);

    h.client.write_all(&[0x85, 0x01, 0x00]).await.unwrap();
    assert_eq!(read_exact(&mut h.client, 2).await, ACK);
    assert_eq!(read_u8(&mut h.client).await, CONFIRMED);

    // Segment 0 covers TOTAL_PAYLOAD_SIZE bytes starting at offset 2.
    let pkt0 = request_segment(&mut h.client, 0, 1, proto::TOTAL_PAYLOAD_SIZE)
        .await
        .unwrap();
    assert_eq!(&pkt0[..proto::HEADER_SIZE + 4], &pak[2..2 + proto::HEADER_SIZE + 4]);

    // The stale CRC was refreshed on the way out.
    let crc_at = pkt0.len() - proto::FOOTER_SIZE;
    assert_eq!(
        proto::read_crc(&pkt0[crc_at..]),
        proto::crc16_genibus(&pkt0[..crc_at])
    );

    // Segment 1 starts at TOTAL_PAYLOAD_SIZE + 4 and runs to the end.
    let off1 = proto::TOTAL_PAYLOAD_SIZE + 2 * 1 + 2;
    let len1 = pak.len() - off1;
    let pkt1 = request_segment(&mut h.client, 1, 1, len1).await.unwrap();
    let crc_at = pkt1.len() - proto::FOOTER_SIZE;
    assert_eq!(&pkt1[..crc_at], &pak[off1..off1 + crc_at]);
    assert_eq!(
        proto::read_crc(&pkt1[crc_at..]),
        proto::crc16_genibus(&pkt1[..crc_at])
    );

    // Far past the archive: UNAUTHORIZED.
    assert!(request_segment(&mut h.client, 9, 1, 0).await.is_none());

    drop(h.client);
    h.worker.await.unwrap();
}

#[tokio::test]
async fn unknown_opcode_writes_nothing_and_loop_survives() {
    let mut h = start(server_without_channels(), None);

    h.client.write_all(&[0xfa]).await.unwrap();

    // Nothing comes back for it.
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_millis(200), h.client.read_exact(&mut buf));
    assert!(read.await.is_err(), "server wrote bytes for an unknown opcode");

    // And the loop is still alive for the next request.
    h.client.write_all(&[0x83]).await.unwrap();
    assert_eq!(read_exact(&mut h.client, 2).await, ACK);
    assert_eq!(read_u8(&mut h.client).await, CONFIRMED);

    drop(h.client);
    h.worker.await.unwrap();
}

#[tokio::test]
async fn watchdog_aborts_half_finished_request() {
    let mut h = start(
        server_without_channels(),
        Some(Duration::from_millis(100)),
    );

    // PACKET_REQUEST, then silence: the follow-up 4 bytes never arrive.
    h.client.write_all(&[0x84]).await.unwrap();
    assert_eq!(read_exact(&mut h.client, 2).await, ACK);

    tokio::time::timeout(Duration::from_secs(2), h.worker)
        .await
        .expect("worker did not exit after watchdog expiry")
        .unwrap();

    assert_eq!(h.conn.state(), ConnState::Aborted);
    assert!(h.server.registry.is_empty());
}

#[tokio::test]
async fn reset_clears_sub_protocol_state() {
    let mut h = start(server_without_channels(), None);

    // Start an NHACP session (legacy opcode) and stash a RetroNet blob.
    h.client.write_all(&[nhacp::MSG_START_NHACP_0_0]).await.unwrap();
    let len = read_exact(&mut h.client, 2).await;
    let reply = read_exact(&mut h.client, proto::get_u16_le(&len) as usize).await;
    assert_eq!(reply[0], 0x80); /* NHACP-STARTED */
    assert_eq!(h.conn.nhacp_sessions.lock().unwrap().len(), 1);

    retronet::store_blob(&h.conn, 0, "file://boot".into(), vec![0u8; 64]);
    assert_eq!(retronet::blob_size(&h.conn, 0), Some(64));

    // RESET throws all of it away.
    h.client.write_all(&[0x80]).await.unwrap();
    assert_eq!(read_exact(&mut h.client, 2).await, ACK);
    assert_eq!(read_u8(&mut h.client).await, CONFIRMED);

    assert!(h.conn.nhacp_sessions.lock().unwrap().is_empty());
    assert!(h.conn.retronet.lock().unwrap().is_none());

    drop(h.client);
    h.worker.await.unwrap();
}

#[tokio::test]
async fn cancel_tears_down_idle_connection() {
    let h = start(server_without_channels(), None);
    assert_eq!(h.server.registry.len(), 1);

    h.conn.cancel();

    tokio::time::timeout(Duration::from_secs(2), h.worker)
        .await
        .expect("worker did not exit after cancellation")
        .unwrap();
    assert_eq!(h.conn.state(), ConnState::Cancelled);
    assert!(h.server.registry.is_empty());
}
