//! Byte-channel I/O for connection workers, plus the code that creates
//! connections in the first place (serial ports and TCP listeners).
//!
//! Reads block until the full count arrives; there are no partial reads.
//! While the watchdog is armed a read or write must finish inside the
//! deadline, and a cancelled connection unwedges any blocked I/O.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};

use nabunet_protocol as proto;

use crate::adaptor;
use crate::config::ConnectionConfig;
use crate::conn::{ConnKind, ConnRef, ConnState, Connection};
use crate::image;
use crate::Server;

/// The NABU's native rate: NTSC colorburst / 2 (on-board divider) / 16
/// (on-chip divider on the TR1863).
pub const NABU_NATIVE_BPS: u32 = (3_579_540 / 2) / 16;
pub const NABU_FALLBACK_BPS: u32 = 115_200;

/// How long a client gets to finish a request once it has started one.
pub const REQUEST_WATCHDOG: Duration = Duration::from_secs(10);

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Worker-owned I/O context for one connection.
pub struct ConnIo {
    conn: ConnRef,
    reader: BoxedReader,
    writer: BoxedWriter,
    watchdog: Option<Duration>,
    /// Watchdog the event loop arms per request; a field so tests can
    /// shrink it.
    pub request_watchdog: Duration,
    /// Escape scratch buffer, sized for worst-case doubling.
    pub pktbuf: Vec<u8>,
}

impl ConnIo {
    pub fn new(conn: ConnRef, reader: BoxedReader, writer: BoxedWriter) -> Self {
        Self {
            conn,
            reader,
            writer,
            watchdog: None,
            request_watchdog: REQUEST_WATCHDOG,
            pktbuf: Vec::with_capacity(2 * proto::MAX_PACKET_SIZE),
        }
    }

    pub fn conn(&self) -> &ConnRef {
        &self.conn
    }

    pub fn name(&self) -> &str {
        self.conn.name()
    }

    pub fn start_watchdog(&mut self, timo: Duration) {
        self.watchdog = Some(timo);
    }

    pub fn stop_watchdog(&mut self) {
        self.watchdog = None;
    }

    /// Receive exactly `buf.len()` bytes. On failure the connection state
    /// says why: a watchdog expiry leaves the state untouched so the
    /// caller can decide whether to abort.
    pub async fn recv(&mut self, buf: &mut [u8]) -> bool {
        if !self.conn.check_state() {
            return false;
        }

        let conn = self.conn.clone();
        let timo = self.watchdog;
        let read = async {
            tokio::select! {
                r = self.reader.read_exact(buf) => Some(r),
                _ = conn.cancelled() => None,
            }
        };
        let outcome = match timo {
            Some(timo) => match tokio::time::timeout(timo, read).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    log::info!(
                        target: "conn_io",
                        "[{}] Connection (recv) timed out.",
                        conn.name()
                    );
                    return false;
                }
            },
            None => read.await,
        };

        match outcome {
            Some(Ok(_)) => true,
            Some(Err(err)) if err.kind() == ErrorKind::UnexpectedEof => {
                log::debug!(target: "conn_io", "[{}] Got End-of-File.", conn.name());
                conn.set_state(ConnState::Eof);
                false
            }
            Some(Err(err)) => {
                log::error!(target: "conn_io", "[{}] read failed: {}", conn.name(), err);
                conn.set_state(ConnState::Aborted);
                false
            }
            None => {
                log::debug!(target: "conn_io", "[{}] Connection cancelled.", conn.name());
                false
            }
        }
    }

    pub async fn recv_byte(&mut self) -> Option<u8> {
        let mut buf = [0u8; 1];
        if self.recv(&mut buf).await {
            Some(buf[0])
        } else {
            None
        }
    }

    /// Send all of `buf`, honoring the watchdog and cancellation the same
    /// way `recv` does. Failures land in the connection state rather than
    /// a return value; the protocol has no way to report them anyway.
    pub async fn send(&mut self, buf: &[u8]) {
        if !self.conn.check_state() {
            return;
        }

        let conn = self.conn.clone();
        let timo = self.watchdog;
        let write = async {
            tokio::select! {
                r = async {
                    self.writer.write_all(buf).await?;
                    self.writer.flush().await
                } => Some(r),
                _ = conn.cancelled() => None,
            }
        };
        let outcome = match timo {
            Some(timo) => match tokio::time::timeout(timo, write).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    log::info!(
                        target: "conn_io",
                        "[{}] Connection (send) timed out.",
                        conn.name()
                    );
                    return;
                }
            },
            None => write.await,
        };

        match outcome {
            Some(Ok(())) => {}
            Some(Err(err)) => {
                log::error!(target: "conn_io", "[{}] write failed: {}", conn.name(), err);
                conn.set_state(ConnState::Aborted);
            }
            None => {
                log::debug!(target: "conn_io", "[{}] Connection cancelled.", conn.name());
            }
        }
    }

    pub async fn send_byte(&mut self, val: u8) {
        self.send(&[val]).await
    }
}

/// Shared connection-creation duties: apply the initial channel and file
/// selection, register, and start the adaptor worker.
pub(crate) fn create_common(
    server: &Arc<Server>,
    name: String,
    kind: ConnKind,
    channel: Option<i16>,
    selected_file: Option<String>,
    file_root: Option<PathBuf>,
    reader: BoxedReader,
    writer: BoxedWriter,
) -> ConnRef {
    let conn = Connection::new(kind, name, file_root);

    if let Some(number) = channel.filter(|&n| n != 0) {
        image::channel_select(&server.catalogue, &conn, number);
    }
    if selected_file.is_some() {
        conn.set_selected_file(selected_file);
    }
    if let Some(root) = &conn.file_root {
        log::info!(
            target: "conn_io",
            "[{}] Using '{}' for local storage.",
            conn.name(),
            root.display()
        );
    }

    server.registry.insert(&conn);

    let mut io = ConnIo::new(conn.clone(), reader, writer);
    let server = server.clone();
    let worker_conn = conn.clone();
    tokio::spawn(async move {
        adaptor::event_loop(&mut io, &server).await;
        // Dropping the I/O halves closes the byte channel.
        drop(io);
        worker_conn.destroy(&server.registry);
    });

    conn
}

fn open_serial(port: &str, baud: u32, stop_bits: u8, flow_control: bool) -> Result<SerialStream> {
    let stream = tokio_serial::new(port, baud)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(if stop_bits == 2 {
            StopBits::Two
        } else {
            StopBits::One
        })
        .flow_control(if flow_control {
            FlowControl::Hardware
        } else {
            FlowControl::None
        })
        .open_native_async()
        .with_context(|| format!("unable to open {port} at {baud} baud"))?;
    Ok(stream)
}

/// Open a serial connection for a real NABU. With no configured rate, try
/// the NABU-native 111860 bps first and fall back to 115.2K; not every
/// UART can be clocked off the colorburst.
pub fn add_serial(server: &Arc<Server>, cfg: &ConnectionConfig) -> Result<()> {
    log::info!(target: "conn_io", "Creating serial connection on {}.", cfg.port);

    let (stream, baud) = match cfg.baud {
        Some(baud) => (
            open_serial(&cfg.port, baud, cfg.stop_bits, cfg.flow_control)?,
            baud,
        ),
        None => match open_serial(&cfg.port, NABU_NATIVE_BPS, cfg.stop_bits, cfg.flow_control) {
            Ok(stream) => (stream, NABU_NATIVE_BPS),
            Err(err) => {
                log::warn!(
                    target: "conn_io",
                    "[{}] Failed to set NABU-native baud rate ({err:#}); falling back...",
                    cfg.port
                );
                (
                    open_serial(&cfg.port, NABU_FALLBACK_BPS, cfg.stop_bits, cfg.flow_control)?,
                    NABU_FALLBACK_BPS,
                )
            }
        },
    };

    log::info!(
        target: "conn_io",
        "[{}] Using 8N{}-{}{}.",
        cfg.port,
        cfg.stop_bits,
        baud,
        if cfg.flow_control { "+RTS/CTS" } else { "" }
    );

    let (reader, writer) = tokio::io::split(stream);
    create_common(
        server,
        cfg.port.clone(),
        ConnKind::Serial {
            baud,
            stop_bits: cfg.stop_bits,
            flow_control: cfg.flow_control,
        },
        cfg.channel,
        cfg.file.clone(),
        cfg.file_root.clone(),
        Box::new(reader),
        Box::new(writer),
    );
    Ok(())
}

/// Create TCP listeners for NABU emulators (like MAME), one per address
/// family that binds.
pub async fn add_tcp(server: &Arc<Server>, cfg: &ConnectionConfig) -> Result<()> {
    let port: u16 = cfg
        .port
        .parse()
        .with_context(|| format!("invalid TCP port number: {}", cfg.port))?;

    log::info!(target: "conn_io", "Creating TCP listener on port {}.", port);

    let addrs: [(&str, SocketAddr); 2] = [
        ("IPv4", SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))),
        ("IPv6", SocketAddr::from((Ipv6Addr::UNSPECIFIED, port))),
    ];

    let mut bound = 0;
    for (family, addr) in addrs {
        let name = format!("{family}-{port}");
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                let conn = Connection::new(ConnKind::Listener, name, cfg.file_root.clone());
                if let Some(number) = cfg.channel.filter(|&n| n != 0) {
                    image::channel_select(&server.catalogue, &conn, number);
                }
                if cfg.file.is_some() {
                    conn.set_selected_file(cfg.file.clone());
                }
                server.registry.insert(&conn);
                tokio::spawn(listener_loop(server.clone(), conn, listener));
                bound += 1;
            }
            Err(err) => {
                log::error!(target: "conn_io", "Unable to bind {}: {}", name, err);
            }
        }
    }

    if bound == 0 {
        anyhow::bail!("no listener sockets could be bound on port {port}");
    }
    Ok(())
}

/// Accept loop for one listener connection; every accepted socket becomes
/// a full adaptor connection that inherits the listener's selections.
async fn listener_loop(server: Arc<Server>, conn: ConnRef, listener: TcpListener) {
    loop {
        let accepted = tokio::select! {
            r = listener.accept() => r,
            _ = conn.cancelled() => {
                log::info!(target: "conn_io", "[{}] Received cancellation request.", conn.name());
                break;
            }
        };

        match accepted {
            Ok((sock, peer)) => {
                // The request/response chatter is tiny; don't let Nagle sit
                // on it.
                if let Err(err) = sock.set_nodelay(true) {
                    log::warn!(
                        target: "conn_io",
                        "[{}] set_nodelay failed: {}",
                        conn.name(),
                        err
                    );
                }

                let host = peer.ip().to_string();
                log::info!(
                    target: "conn_io",
                    "[{}] Creating TCP connection for {}.",
                    conn.name(),
                    host
                );

                let (reader, writer) = sock.into_split();
                create_common(
                    &server,
                    host,
                    ConnKind::Tcp,
                    conn.channel().map(|c| c.number),
                    conn.selected_file(),
                    conn.file_root.clone(),
                    Box::new(reader),
                    Box::new(writer),
                );
            }
            Err(err) => {
                log::error!(target: "conn_io", "[{}] accept() failed: {}", conn.name(), err);
                conn.set_state(ConnState::Aborted);
                break;
            }
        }
    }

    // Error or cancellation on the listen socket -- he's dead, Jim.
    conn.destroy(&server.registry);
}
