//! File Serving Module
//!
//! This module implements the serving side of the catalog-and-fetch
//! protocol:
//! - A per-connection [`Session`] state machine that sends the catalog and
//!   then answers fetch cycles until the peer goes away
//! - A [`ConnectionManager`] that turns accepted connections into sessions
//!   under one of two listener strategies
//!
//! ## Session Lifecycle
//!
//! ```text
//!         accept              catalog written
//! CONNECTED ────► CATALOG_SENT ────► AWAITING_REQUEST ◄────┐
//!                                          │               │
//!                                  Request │               │ Ack{ok: true}
//!                                          ▼               │
//!                                       SERVING ───────────┘
//!                                          │     ▲
//!                                          │     │ Ack{ok: false}:
//!                                          │     │ rebuild + resend
//!                                          ▼     │
//!                                       (unit) ──┘
//!                                          │
//!              transport error / EOF       ▼
//!                                       CLOSED
//! ```
//!
//! ## Listener strategies
//!
//! The historical deployment dedicates one ephemeral port to every session:
//! the manager binds the next free port in `49152..=65535`, accepts exactly
//! one connection on it, spawns the session, and moves on. A port is never
//! reused, so the range is a hard cap on sessions served per process
//! lifetime. The conventional single shared listener is available as an
//! alternative for deployments that do not need the legacy port behavior.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::catalog;
use crate::config::RetryPolicy;
use crate::protocol::{sanitize_name, Catalog, Frame, Framer, ProtocolError, TransferUnit};
use crate::tls::ServerTls;

/// Lower bound of the IANA ephemeral range, the historical base port.
pub const DEFAULT_BASE_PORT: u16 = 49152;

/// Upper bound of the port range.
pub const DEFAULT_MAX_PORT: u16 = 65535;

/// Maximum concurrent sessions on a shared listener
const MAX_SESSIONS: usize = 100;

/// How the server turns incoming connections into sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AcceptStrategy {
    /// Dedicate one port per session, walking the range and never reusing
    /// a port.
    #[default]
    Escalating,
    /// Serve every session through a single listener on the base port.
    Shared,
}

/// Server configuration
pub struct ServerConfig {
    /// Directory whose top-level files are served
    pub root_dir: PathBuf,
    /// Local address the listeners bind to
    pub bind_ip: IpAddr,
    /// First port of the range (also the shared listener port)
    pub base_port: u16,
    /// Last usable port of the escalating range
    pub max_port: u16,
    /// Listener strategy
    pub accept: AcceptStrategy,
    /// TLS identity; `None` serves plaintext
    pub tls: Option<ServerTls>,
    /// Resend behavior when a client keeps rejecting a unit
    pub resend: RetryPolicy,
}

/// Walks the listener port range exactly once, in order.
#[derive(Debug)]
pub struct PortCursor {
    // u32 so advancing past 65535 cannot wrap
    next: u32,
    max: u32,
}

impl PortCursor {
    pub fn new(base: u16, max: u16) -> Self {
        Self {
            next: base as u32,
            max: max as u32,
        }
    }

    /// The next unused port, or `None` once the range is spent.
    pub fn next_port(&mut self) -> Option<u16> {
        if self.next > self.max {
            return None;
        }
        let port = self.next as u16;
        self.next += 1;
        Some(port)
    }
}

/// Lifecycle of a session, in order. `AwaitingRequest` and `Serving`
/// alternate once per fetch cycle; every path ends in `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    CatalogSent,
    AwaitingRequest,
    Serving,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connected => "connected",
            SessionState::CatalogSent => "catalog-sent",
            SessionState::AwaitingRequest => "awaiting-request",
            SessionState::Serving => "serving",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// One client conversation over one connection.
///
/// The session owns an immutable catalog snapshot taken at accept time.
/// Requested names are deliberately not checked against that snapshot;
/// the file read at serve time decides the outcome, so the snapshot going
/// stale only affects what the client believes is available.
pub struct Session {
    id: u64,
    root: PathBuf,
    catalog: Catalog,
    resend: RetryPolicy,
    state: SessionState,
}

impl Session {
    pub fn new(id: u64, root: PathBuf, catalog: Catalog, resend: RetryPolicy) -> Self {
        Self {
            id,
            root,
            catalog,
            resend,
            state: SessionState::Connected,
        }
    }

    /// Drive the session over an established stream until the peer
    /// disconnects or a protocol violation ends it.
    pub async fn run<S>(mut self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let result = self.drive(stream).await;
        self.set_state(SessionState::Closed);
        result
    }

    async fn drive<S>(&mut self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (reader, writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let mut writer = BufWriter::new(writer);

        // The server speaks first. The snapshot goes out before any
        // request is read and is never refreshed for this session.
        Framer::write_frame(&mut writer, &Frame::Catalog(self.catalog.clone()))
            .await
            .context("failed to send catalog")?;
        self.set_state(SessionState::CatalogSent);
        self.set_state(SessionState::AwaitingRequest);

        loop {
            let frame = match Framer::read_frame(&mut reader).await {
                Ok(frame) => frame,
                Err(ProtocolError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    // The protocol has no goodbye message; end-of-stream
                    // between cycles is the normal way out.
                    debug!("session {}: peer disconnected", self.id);
                    break;
                }
                Err(e) => return Err(e).context("failed to read request"),
            };

            let name = frame.into_request()?;
            debug!("session {}: request for {name:?}", self.id);

            self.set_state(SessionState::Serving);
            self.serve(&mut reader, &mut writer, &name).await?;
            self.set_state(SessionState::AwaitingRequest);
        }

        Ok(())
    }

    /// One fetch cycle: send units for `name` until the peer acks true.
    async fn serve<R, W>(&mut self, reader: &mut R, writer: &mut W, name: &str) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            // Every attempt re-reads the file, so a resend observes
            // current disk state rather than a cached copy.
            let unit = build_unit(&self.root, name).await;
            let status = unit.status;
            Framer::write_frame(writer, &Frame::Unit(unit))
                .await
                .context("failed to send transfer unit")?;

            let ok = Framer::read_frame(reader)
                .await
                .context("connection lost awaiting ack")?
                .into_ack()?;

            if ok {
                info!(
                    "✅ session {}: delivered {name:?} after {attempt} attempt(s)",
                    self.id
                );
                return Ok(());
            }

            debug!(
                "session {}: resend requested for {name:?} (attempt {attempt}, last status {status:?})",
                self.id
            );

            if self.resend.exhausted(attempt) {
                // The protocol has no in-band way to abandon a cycle, so
                // a capped policy exits by closing the connection.
                anyhow::bail!("resend limit reached for {name:?} after {attempt} attempts");
            }

            let pause = self.resend.backoff_for(attempt);
            if !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
        }
    }

    fn set_state(&mut self, next: SessionState) {
        if self.state != next {
            debug!("session {}: {} -> {}", self.id, self.state, next);
            self.state = next;
        }
    }
}

/// Build the unit for one request against current disk state.
///
/// Any failure, an unreadable file or an unsafe name alike, degrades to an
/// `Error` unit rather than a protocol error; the peer decides whether to
/// retry. The requested name is echoed back verbatim.
async fn build_unit(root: &Path, name: &str) -> TransferUnit {
    let safe_name = match sanitize_name(name) {
        Ok(safe) => safe,
        Err(e) => {
            warn!("{e}");
            return TransferUnit::error(name);
        }
    };

    match fs::read(root.join(&safe_name)).await {
        Ok(payload) => TransferUnit::ok(name, payload),
        Err(e) => {
            warn!("failed to read {safe_name:?}: {e}");
            TransferUnit::error(name)
        }
    }
}

/// Accepts connections and spawns one [`Session`] per accepted stream.
pub struct ConnectionManager {
    config: ServerConfig,
    acceptor: Option<TlsAcceptor>,
    limiter: Arc<Semaphore>,
    next_session_id: u64,
}

impl ConnectionManager {
    pub fn new(config: ServerConfig) -> Self {
        let acceptor = config
            .tls
            .as_ref()
            .map(|tls| TlsAcceptor::from(tls.config.clone()));
        Self {
            config,
            acceptor,
            limiter: Arc::new(Semaphore::new(MAX_SESSIONS)),
            next_session_id: 0,
        }
    }

    /// Run the accept loop to completion.
    ///
    /// Under [`AcceptStrategy::Escalating`] this returns `Ok` once the port
    /// range is exhausted; the shared listener runs until the task is
    /// cancelled or the listener fails to bind.
    pub async fn run(mut self) -> Result<()> {
        if self.acceptor.is_none() {
            warn!("⚠️  TLS is not configured; transfers will be in PLAINTEXT");
        }

        match self.config.accept {
            AcceptStrategy::Escalating => self.run_escalating().await,
            AcceptStrategy::Shared => self.run_shared().await,
        }
    }

    /// One listener per session: bind the next port, take a single accept,
    /// hand the connection off, advance. Bind and accept failures skip the
    /// port and advance as well.
    async fn run_escalating(&mut self) -> Result<()> {
        let mut ports = PortCursor::new(self.config.base_port, self.config.max_port);
        info!(
            "🔒 Serving {:?} on {} (one port per session, {}..={})",
            self.config.root_dir, self.config.bind_ip, self.config.base_port, self.config.max_port
        );

        while let Some(port) = ports.next_port() {
            let listener = match TcpListener::bind((self.config.bind_ip, port)).await {
                Ok(listener) => listener,
                Err(e) => {
                    warn!("Failed to bind port {port}: {e}");
                    continue;
                }
            };
            debug!("Awaiting one connection on port {port}");

            let (tcp_stream, peer_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Failed to accept on port {port}: {e}");
                    continue;
                }
            };

            // The listener drops here: this port has served its one accept.
            self.spawn_session(tcp_stream, peer_addr, port, None);
        }

        info!("Port range exhausted; no further sessions will be accepted");
        Ok(())
    }

    /// Classic accept loop: every session comes through the base port.
    async fn run_shared(&mut self) -> Result<()> {
        let addr = SocketAddr::new(self.config.bind_ip, self.config.base_port);
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind to {addr}"))?;

        info!(
            "🔒 Serving {:?} on shared listener {addr}",
            self.config.root_dir
        );

        loop {
            let (tcp_stream, peer_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Failed to accept connection: {e}");
                    continue;
                }
            };

            let permit = match self.limiter.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    warn!("Session limit reached, rejecting {peer_addr}");
                    continue;
                }
            };

            self.spawn_session(tcp_stream, peer_addr, addr.port(), Some(permit));
        }
    }

    /// Scan, snapshot, spawn. A failed scan is a failed spawn: the
    /// connection drops without a catalog and the accept loop continues.
    fn spawn_session(
        &mut self,
        tcp_stream: TcpStream,
        peer_addr: SocketAddr,
        port: u16,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        let catalog = match catalog::scan(&self.config.root_dir) {
            Ok(catalog) => catalog,
            Err(e) => {
                error!("Dropping connection from {peer_addr}: {e}");
                return;
            }
        };

        self.next_session_id += 1;
        let id = self.next_session_id;
        info!(
            "📥 Session {id}: {peer_addr} on port {port} ({} file(s) in catalog)",
            catalog.len()
        );

        let session = Session::new(
            id,
            self.config.root_dir.clone(),
            catalog,
            self.config.resend,
        );
        let acceptor = self.acceptor.clone();

        tokio::spawn(async move {
            let _permit = permit; // Keep permit alive for the session's lifetime

            let result = match acceptor {
                Some(tls) => match tls.accept(tcp_stream).await {
                    Ok(tls_stream) => {
                        debug!("🔐 TLS handshake successful with {peer_addr}");
                        session.run(tls_stream).await
                    }
                    Err(e) => Err(anyhow::anyhow!("TLS handshake failed: {e}")),
                },
                None => session.run(tcp_stream).await,
            };

            match result {
                Ok(()) => debug!("Session {id} from {peer_addr} closed normally"),
                Err(e) => warn!("Session {id} from {peer_addr} error: {e:#}"),
            }
        });
    }
}
