//! The classic Adaptor request/response state machine, one instance per
//! connection worker.
//!
//! The loop waits forever for a request opcode, then holds the client to
//! the watchdog for the rest of the exchange. Unknown opcodes are offered
//! to RetroNet, then NHACP, and otherwise logged and dropped; the protocol
//! has no resynchronization, the NABU sorts itself out by resetting.

use std::sync::Arc;

use chrono::{Datelike, Local, Timelike};

use nabunet_protocol as proto;

use crate::conn::ConnState;
use crate::conn_io::ConnIo;
use crate::image::{self, Image};
use crate::{nhacp, retronet, Server};

/// Main event loop for the Adaptor emulation.
pub async fn event_loop(io: &mut ConnIo, server: &Arc<Server>) {
    log::info!(target: "adaptor", "[{}] Connection starting.", io.name());

    loop {
        // Between requests we are happy to wait forever.
        io.stop_watchdog();

        log::debug!(target: "adaptor", "[{}] Waiting for NABU.", io.name());
        let Some(msg) = io.recv_byte().await else {
            if !io.conn().check_state() {
                break;
            }
            log::debug!(
                target: "adaptor",
                "[{}] recv_byte() failed, continuing event loop.",
                io.name()
            );
            continue;
        };

        // A request has started; any single I/O from here on has to
        // finish inside the watchdog.
        let timo = io.request_watchdog;
        io.start_watchdog(timo);

        if classic_request(io, server, msg).await {
            continue;
        }
        if retronet::request(io, msg).await {
            continue;
        }
        if nhacp::request(io, msg).await {
            continue;
        }

        log::error!(
            target: "adaptor",
            "[{}] Got unexpected message 0x{:02x}.",
            io.name(),
            msg
        );
    }
}

/// Check for and process a classic NABU message.
async fn classic_request(io: &mut ConnIo, server: &Arc<Server>, msg: u8) -> bool {
    if !proto::is_classic(msg) {
        return false;
    }
    match msg {
        proto::MSG_RESET => {
            log::debug!(target: "adaptor", "[{}] Got RESET.", io.name());
            msg_reset(io).await;
        }
        proto::MSG_MYSTERY => {
            log::debug!(target: "adaptor", "[{}] Got MYSTERY.", io.name());
            msg_mystery(io).await;
        }
        proto::MSG_GET_STATUS => {
            log::debug!(target: "adaptor", "[{}] Got GET_STATUS.", io.name());
            msg_get_status(io).await;
        }
        proto::MSG_START_UP => {
            log::debug!(target: "adaptor", "[{}] Got START_UP.", io.name());
            msg_start_up(io).await;
        }
        proto::MSG_PACKET_REQUEST => {
            log::debug!(target: "adaptor", "[{}] Got PACKET_REQUEST.", io.name());
            msg_packet_request(io).await;
        }
        proto::MSG_CHANGE_CHANNEL => {
            log::debug!(target: "adaptor", "[{}] Got CHANGE_CHANNEL.", io.name());
            msg_change_channel(io, server).await;
        }
        _ => return false,
    }
    true
}

async fn expect_byte(io: &mut ConnIo, val: u8) -> bool {
    let Some(got) = io.recv_byte().await else {
        log::error!(target: "adaptor", "[{}] Receive error.", io.name());
        return false;
    };
    log::debug!(
        target: "adaptor",
        "[{}] Expected 0x{:02x}, got 0x{:02x} ({}).",
        io.name(),
        val,
        got,
        if val == got { "success" } else { "fail" }
    );
    val == got
}

async fn expect_ack(io: &mut ConnIo) -> bool {
    for &b in proto::MSGSEQ_ACK.iter() {
        if !expect_byte(io, b).await {
            return false;
        }
    }
    true
}

async fn send_ack(io: &mut ConnIo) {
    io.send(&proto::MSGSEQ_ACK).await;
}

async fn send_confirmed(io: &mut ConnIo) {
    io.send_byte(proto::STATE_CONFIRMED).await;
}

async fn send_unauthorized(io: &mut ConnIo) {
    log::debug!(target: "adaptor", "[{}] Sending UNAUTHORIZED.", io.name());
    io.send_byte(proto::SERVICE_UNAUTHORIZED).await;
    log::debug!(target: "adaptor", "[{}] Waiting for NABU to ACK.", io.name());
    if expect_ack(io).await {
        log::debug!(target: "adaptor", "[{}] Received ACK.", io.name());
    } else {
        log::error!(target: "adaptor", "[{}] NABU failed to ACK.", io.name());
    }
}

/// Escape-expand a finished packet and push it to the NABU behind the
/// AUTHORIZED / ACK handshake. A missing ACK abandons the packet; the
/// client retries at the protocol level.
async fn send_packet(io: &mut ConnIo, buf: &[u8]) {
    debug_assert!(buf.len() <= proto::MAX_PACKET_SIZE);

    let mut wire = std::mem::take(&mut io.pktbuf);
    wire.clear();
    for &b in buf {
        wire.push(b);
        if b == proto::MSG_ESCAPE {
            wire.push(b);
        }
    }

    log::debug!(target: "adaptor", "[{}] Sending AUTHORIZED.", io.name());
    io.send_byte(proto::SERVICE_AUTHORIZED).await;
    log::debug!(target: "adaptor", "[{}] Waiting for NABU to ACK.", io.name());
    if expect_ack(io).await {
        log::debug!(target: "adaptor", "[{}] Received ACK, sending packet.", io.name());
        io.send(&wire).await;
        io.send(&proto::MSGSEQ_FINISHED).await;
    } else {
        log::error!(target: "adaptor", "[{}] NABU failed to ACK.", io.name());
    }
    io.pktbuf = wire;
}

/// Wrap one payload slice in header + CRC, ready for [`send_packet`].
fn wrap_segment(
    image: u32,
    segment: u16,
    offset: u16,
    payload: &[u8],
    last: bool,
) -> Result<Vec<u8>, proto::Error> {
    let mut pkt = vec![0u8; proto::HEADER_SIZE + payload.len() + proto::FOOTER_SIZE];
    let mut i = proto::write_packet_header(&mut pkt, image, segment, offset, last)?;
    pkt[i..i + payload.len()].copy_from_slice(payload);
    i += payload.len();
    let crc = proto::crc16_genibus(&pkt[..i]);
    proto::write_crc(&mut pkt[i..], crc)?;
    Ok(pkt)
}

/// Extract the requested segment from a pre-wrapped PAK image and send
/// it. PAK segments carry a stale CRC that must be refreshed after
/// extraction.
async fn send_pak(io: &mut ConnIo, image_id: u32, segment: u16, img: &Image) -> bool {
    let mut len = proto::TOTAL_PAYLOAD_SIZE;
    let off = (segment as usize * len) + (2 * segment as usize) + 2;
    let mut last = false;

    if off >= img.data.len() {
        log::error!(
            target: "adaptor",
            "[{}] PAK {}: offset {} exceeds pak size {}",
            io.name(),
            img.name,
            off,
            img.data.len()
        );
        send_unauthorized(io).await;
        return false;
    }

    if off + len >= img.data.len() {
        len = img.data.len() - off;
        last = true;
    }

    if len < proto::HEADER_SIZE + proto::FOOTER_SIZE {
        log::error!(
            target: "adaptor",
            "[{}] PAK {}: offset {} length {} is nonsensical",
            io.name(),
            img.name,
            off,
            len
        );
        send_unauthorized(io).await;
        return last;
    }

    let mut pkt = img.data[off..off + len].to_vec();
    let crc_at = len - proto::FOOTER_SIZE;
    let crc = proto::crc16_genibus(&pkt[..crc_at]);
    if proto::write_crc(&mut pkt[crc_at..], crc).is_err() {
        send_unauthorized(io).await;
        return last;
    }

    log::debug!(
        target: "adaptor",
        "[{}] Sending segment {} of image {:06X}{}",
        io.name(),
        segment,
        image_id,
        if last { " (last segment)" } else { "" }
    );
    send_packet(io, &pkt).await;
    last
}

/// Wrap the requested slice of a raw image in a packet and send it.
/// Returns whether this was the final segment.
async fn send_image(io: &mut ConnIo, image_id: u32, segment: u16, img: &Image) -> bool {
    // PAK images are pre-wrapped and take a different path. Time packets
    // have no channel and always land here.
    if img.is_pak() {
        return send_pak(io, image_id, segment, img).await;
    }

    let off = segment as usize * proto::MAX_PAYLOAD_SIZE;
    let mut len = proto::MAX_PAYLOAD_SIZE;
    let mut last = false;

    if off >= img.data.len() {
        log::error!(
            target: "adaptor",
            "image {:06X}: segment {} offset {} exceeds image size {}",
            image_id,
            segment,
            off,
            img.data.len()
        );
        send_unauthorized(io).await;
        return false;
    }

    // '>=' on purpose: an exact fit still counts as the final segment.
    if off + len >= img.data.len() {
        len = img.data.len() - off;
        last = true;
    }

    match wrap_segment(image_id, segment, off as u16, &img.data[off..off + len], last) {
        Ok(pkt) => {
            log::debug!(
                target: "adaptor",
                "[{}] Sending segment {} of image {:06X}{}",
                io.name(),
                segment,
                image_id,
                if last { " (last segment)" } else { "" }
            );
            send_packet(io, &pkt).await;
        }
        Err(_) => {
            log::error!(
                target: "adaptor",
                "unable to build {} byte packet buffer",
                proto::HEADER_SIZE + len + proto::FOOTER_SIZE
            );
            send_unauthorized(io).await;
        }
    }
    last
}

/// Synthesize and send the clock packet.
async fn send_time(io: &mut ConnIo) {
    let now = Local::now();
    let t = proto::TimePacket {
        week_day: now.weekday().num_days_from_sunday() as u8 + 1,
        year: 84, /* as in 1984 */
        month: now.month() as u8,
        month_day: now.day() as u8,
        hour: now.hour() as u8,
        minute: now.minute() as u8,
        second: now.second() as u8,
    };

    match wrap_segment(proto::IMAGE_TIME, 0, 0, &t.encode(), true) {
        Ok(pkt) => send_packet(io, &pkt).await,
        Err(_) => {
            log::error!(target: "adaptor", "unable to build time packet buffer");
            send_unauthorized(io).await;
        }
    }
}

async fn msg_reset(io: &mut ConnIo) {
    io.conn().reboot();
    log::debug!(
        target: "adaptor",
        "[{}] Sending ACK + CONFIRMED.",
        io.name()
    );
    send_ack(io).await;
    send_confirmed(io).await;
}

async fn msg_mystery(io: &mut ConnIo) {
    log::debug!(target: "adaptor", "[{}] Sending ACK.", io.name());
    send_ack(io).await;

    log::debug!(
        target: "adaptor",
        "[{}] Expecting the NABU to send 2 bytes.",
        io.name()
    );
    let mut msg = [0u8; 2];
    if !io.recv(&mut msg).await {
        log::error!(
            target: "adaptor",
            "[{}] Those two bytes never arrived.",
            io.name()
        );
    } else {
        log::debug!(
            target: "adaptor",
            "[{}] msg[0] = 0x{:02x} msg[1] = 0x{:02x}",
            io.name(),
            msg[0],
            msg[1]
        );
    }
    send_confirmed(io).await;
}

async fn msg_channel_status(io: &mut ConnIo) {
    let status = if io.conn().channel().is_some() {
        proto::SIGNAL_STATUS_YES
    } else {
        proto::SIGNAL_STATUS_NO
    };
    log::debug!(
        target: "adaptor",
        "[{}] Sending signal status 0x{:02x}.",
        io.name(),
        status
    );
    io.send_byte(status).await;
    io.send(&proto::MSGSEQ_FINISHED).await;
}

async fn msg_transmit_status(io: &mut ConnIo) {
    log::debug!(
        target: "adaptor",
        "[{}] Sending YES + FINISHED.",
        io.name()
    );
    io.send_byte(proto::SIGNAL_STATUS_YES).await;
    io.send(&proto::MSGSEQ_FINISHED).await;
}

async fn msg_get_status(io: &mut ConnIo) {
    log::debug!(target: "adaptor", "[{}] Sending ACK.", io.name());
    send_ack(io).await;

    let Some(which) = io.recv_byte().await else {
        log::error!(
            target: "adaptor",
            "[{}] Status type never arrived.",
            io.name()
        );
        return;
    };
    match which {
        proto::STATUS_SIGNAL => {
            log::debug!(target: "adaptor", "[{}] Channel status requested.", io.name());
            msg_channel_status(io).await;
        }
        proto::STATUS_TRANSMIT => {
            log::debug!(target: "adaptor", "[{}] Transmit status requested.", io.name());
            msg_transmit_status(io).await;
        }
        other => {
            log::error!(
                target: "adaptor",
                "[{}] Unknown status type requested: 0x{:02x}.",
                io.name(),
                other
            );
        }
    }
}

async fn msg_start_up(io: &mut ConnIo) {
    log::debug!(
        target: "adaptor",
        "[{}] Sending ACK + CONFIRMED.",
        io.name()
    );
    send_ack(io).await;
    send_confirmed(io).await;
}

async fn msg_packet_request(io: &mut ConnIo) {
    log::debug!(target: "adaptor", "[{}] Sending ACK.", io.name());
    send_ack(io).await;

    let mut msg = [0u8; 4];
    if !io.recv(&mut msg).await {
        log::error!(
            target: "adaptor",
            "[{}] NABU failed to send segment/image message.",
            io.name()
        );
        io.conn().set_state(ConnState::Aborted);
        return;
    }

    let segment = msg[0] as u16;
    let image_id = proto::get_u24_le(&msg[1..]);
    log::debug!(
        target: "adaptor",
        "[{}] NABU requested segment {} of image {:06X}.",
        io.name(),
        segment,
        image_id
    );

    send_confirmed(io).await;

    if image_id == proto::IMAGE_TIME {
        if segment == 0 {
            log::debug!(target: "adaptor", "[{}] Sending time packet.", io.name());
            send_time(io).await;
            return;
        }
        log::error!(
            target: "adaptor",
            "[{}] Unexpected request for segment {} of time image.",
            io.name(),
            segment
        );
        send_unauthorized(io).await;
        return;
    }

    let Some(img) = image::load(io.conn(), image_id) else {
        log::error!(
            target: "adaptor",
            "[{}] Unable to load image {:06X}.",
            io.name(),
            image_id
        );
        send_unauthorized(io).await;
        return;
    };

    let last = send_image(io, image_id, segment, &img).await;
    image::unload(io.conn(), &img, last);
}

async fn msg_change_channel(io: &mut ConnIo, server: &Arc<Server>) {
    log::debug!(target: "adaptor", "[{}] Sending ACK.", io.name());
    send_ack(io).await;

    log::debug!(
        target: "adaptor",
        "[{}] Waiting for NABU to send channel code.",
        io.name()
    );
    let mut msg = [0u8; 2];
    if !io.recv(&mut msg).await {
        log::error!(
            target: "adaptor",
            "[{}] NABU failed to send channel code.",
            io.name()
        );
        io.conn().set_state(ConnState::Aborted);
        return;
    }

    let channel = proto::get_u16_le(&msg) as i16;
    log::info!(
        target: "adaptor",
        "[{}] NABU selected channel 0x{:04x}.",
        io.name(),
        channel as u16
    );

    image::channel_select(&server.catalogue, io.conn(), channel);

    send_confirmed(io).await;
}
