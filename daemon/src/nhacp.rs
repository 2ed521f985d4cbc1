//! NHACP session-start dispatch.
//!
//! The adaptor loop offers unclaimed request bytes here after RetroNet has
//! passed. Session starts are recognized and answered; the storage verb
//! set itself lives behind this seam and is not part of the adaptor core.

use std::time::Duration;

use nabunet_protocol as proto;

use crate::conn::Connection;
use crate::conn_io::ConnIo;

/// Original draft start message; no magic, no version negotiation.
pub const MSG_START_NHACP_0_0: u8 = 0xaf;
/// Versioned START-NHACP: "ACP" magic + version + options follow.
pub const MSG_START_NHACP: u8 = 0x8f;

pub const VERS_0_0: u16 = 0x0000;
pub const VERS_0_1: u16 = 0x0001;

/// Version advertised in NHACP-STARTED.
const SERVER_VERSION: u16 = VERS_0_1;

const RESP_NHACP_STARTED: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NhacpSession {
    pub version: u16,
    pub options: u16,
}

/// Receive and validate the rest of a versioned START-NHACP message.
async fn recv_start(io: &mut ConnIo) -> Option<(u16, u16)> {
    // The protocol wants each message transfer finished within a second.
    io.start_watchdog(Duration::from_secs(1));

    let mut msg = [0u8; 7];
    if !io.recv(&mut msg).await {
        log::debug!(
            target: "nhacp",
            "[{}] START-NHACP message never arrived.",
            io.name()
        );
        return None;
    }

    if &msg[0..3] != b"ACP" {
        log::debug!(
            target: "nhacp",
            "[{}] Invalid START-NHACP magic: 0x{:02x} 0x{:02x} 0x{:02x}",
            io.name(),
            msg[0],
            msg[1],
            msg[2]
        );
        return None;
    }

    let version = proto::get_u16_le(&msg[3..5]);
    let options = proto::get_u16_le(&msg[5..7]);
    log::debug!(
        target: "nhacp",
        "[{}] Client requested NHACP version 0x{:04x} options 0x{:04x}.",
        io.name(),
        version,
        options
    );

    match version {
        VERS_0_0 | VERS_0_1 => {}
        _ => {
            log::debug!(
                target: "nhacp",
                "[{}] Unsupported NHACP version 0x{:04x}.",
                io.name(),
                version
            );
            return None;
        }
    }

    if options != 0 {
        log::debug!(
            target: "nhacp",
            "[{}] Unsupported NHACP options 0x{:04x}.",
            io.name(),
            options
        );
        return None;
    }

    Some((version, options))
}

/// Check for and process an NHACP session start. Returns true when the
/// byte (and its follow-up) was consumed.
pub async fn request(io: &mut ConnIo, msg: u8) -> bool {
    let (version, options) = match msg {
        MSG_START_NHACP_0_0 => {
            log::debug!(target: "nhacp", "[{}] Got legacy START-NHACP.", io.name());
            (VERS_0_0, 0)
        }
        MSG_START_NHACP => match recv_start(io).await {
            Some(vo) => vo,
            None => return false,
        },
        _ => return false,
    };

    let Some(id) = session_alloc(io.conn(), version, options) else {
        // Out of session ids; act as if the message were unrecognized.
        log::error!(
            target: "nhacp",
            "[{}] Unable to allocate NHACP session.",
            io.name()
        );
        return true;
    };

    log::info!(
        target: "nhacp",
        "[{}] Entering NHACP-{}.{} mode (session {}).",
        io.name(),
        version >> 8,
        version & 0xff,
        id
    );
    send_started(io).await;
    true
}

fn session_alloc(conn: &Connection, version: u16, options: u16) -> Option<u8> {
    let mut sessions = conn.nhacp_sessions.lock().unwrap();
    let id = (0u8..=255).find(|id| !sessions.contains_key(id))?;
    sessions.insert(id, NhacpSession { version, options });
    Some(id)
}

/// Reply NHACP-STARTED: a length-framed response carrying our protocol
/// version and server identification string.
async fn send_started(io: &mut ConnIo) {
    let ident = concat!("nabunetd-", env!("CARGO_PKG_VERSION"));

    let mut reply = Vec::with_capacity(4 + ident.len());
    reply.push(RESP_NHACP_STARTED);
    reply.extend_from_slice(&SERVER_VERSION.to_le_bytes());
    reply.push(ident.len() as u8);
    reply.extend_from_slice(ident.as_bytes());

    let mut framed = Vec::with_capacity(2 + reply.len());
    framed.extend_from_slice(&(reply.len() as u16).to_le_bytes());
    framed.extend_from_slice(&reply);
    io.send(&framed).await;
}

/// Tear down every NHACP session on the connection (client reboot or
/// connection destruction).
pub fn conn_fini(conn: &Connection) {
    let mut sessions = conn.nhacp_sessions.lock().unwrap();
    if !sessions.is_empty() {
        log::info!(
            target: "nhacp",
            "[{}] Clearing previous NHACP state ({} session(s)).",
            conn.name(),
            sessions.len()
        );
        sessions.clear();
    }
}
