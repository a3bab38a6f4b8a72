//! Fetch Client Module
//!
//! This module implements the consuming side of the catalog-and-fetch
//! protocol:
//! - Establishes the (optionally TLS-wrapped) connection
//! - Treats the server's opening catalog as the readiness signal
//! - Drives the per-file retry loop and persists verified results
//!
//! ## Session flow
//!
//! ```text
//! Client                                    Server
//!   |                                          |
//!   |-------- TCP connect ----------------->  |
//!   |======== TLS handshake (optional) =====  |
//!   |<------- Catalog{entries} ------------   |   session is now ready
//!   |                                          |
//!   |-------- Request{name} --------------->  |
//!   |<------- Unit{...} -------------------   |
//!   |  persist + verify, then:                |
//!   |-------- Ack{ok} --------------------->  |
//! ```
//!
//! A failed fetch leaves the stream in an unknown protocol position, so the
//! session drops the transport and the next fetch transparently redials.
//! The catalog taken from the replacement connection supersedes the old
//! one; server sessions never share state, so the stale snapshot has no
//! further meaning.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::config::RetryPolicy;
use crate::protocol::{sanitize_name, Catalog, Frame, Framer, TransferStatus, TransferUnit};
use crate::tls::ClientTls;

/// Object-safe alias for the underlying transport, TLS or plaintext.
trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

type BoxStream = Box<dyn AsyncStream>;

/// Client configuration
#[derive(Clone)]
pub struct ClientConfig {
    /// Server address to connect to
    pub server_addr: SocketAddr,
    /// TLS trust; `None` connects in plaintext
    pub tls: Option<ClientTls>,
    /// Directory fetched files are persisted under
    pub dest_dir: PathBuf,
    /// How to drive the per-file retry loop
    pub retry: RetryPolicy,
}

/// Fetch client
pub struct Client {
    config: ClientConfig,
}

impl Client {
    /// Create a new client instance
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Connect to the server and wait for its opening catalog.
    ///
    /// Completion of this future is the readiness signal: once the catalog
    /// is in hand the session is usable and stays usable until the
    /// transport fails. Callers wanting a bounded wait wrap this future in
    /// a timeout; there is no polling loop to tune.
    pub async fn connect(&self) -> Result<ClientSession> {
        let (conn, catalog) = dial(&self.config).await?;
        info!("📁 Session ready: {} file(s) in catalog", catalog.len());

        Ok(ClientSession {
            config: self.config.clone(),
            conn: Some(conn),
            catalog,
        })
    }
}

/// Connected fetch session
///
/// Holds the most recent catalog and, between fetches, the live transport.
pub struct ClientSession {
    config: ClientConfig,
    conn: Option<BoxStream>,
    catalog: Catalog,
}

impl ClientSession {
    /// The catalog of the current (or most recent) server session.
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Whether a live transport is currently held.
    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Fetch one file by name and persist it under the destination
    /// directory, returning the path written.
    ///
    /// If an earlier failure dropped the transport, this redials first and
    /// adopts the new session's catalog. The name is not checked against
    /// the catalog; the server's unit status is what decides the outcome.
    pub async fn fetch(&mut self, name: &str) -> Result<PathBuf> {
        let mut conn = match self.conn.take() {
            Some(conn) => conn,
            None => {
                info!("Transport is closed; reconnecting");
                let (conn, catalog) = dial(&self.config).await?;
                self.catalog = catalog;
                conn
            }
        };

        match fetch_cycle(&mut conn, name, &self.config.dest_dir, self.config.retry).await {
            Ok(path) => {
                self.conn = Some(conn);
                Ok(path)
            }
            // The stream's protocol position is unknown after a failed
            // cycle, so the transport is dropped rather than kept.
            Err(e) => Err(e),
        }
    }

    /// Close the session. There is no goodbye frame: shutting down the
    /// transport is the protocol's termination signal.
    pub async fn close(mut self) {
        if let Some(mut conn) = self.conn.take() {
            if let Err(e) = conn.shutdown().await {
                debug!("Transport shutdown failed: {e}");
            }
        }
        info!("Session closed");
    }
}

/// Establish the transport and read the opening catalog.
async fn dial(config: &ClientConfig) -> Result<(BoxStream, Catalog)> {
    info!("🔗 Connecting to {}...", config.server_addr);

    let tcp_stream = TcpStream::connect(&config.server_addr)
        .await
        .with_context(|| format!("Failed to connect to {}", config.server_addr))?;
    debug!("TCP connection established");

    let mut conn: BoxStream = match &config.tls {
        Some(tls) => {
            let connector = TlsConnector::from(tls.config.clone());
            let tls_stream = connector
                .connect(tls.server_name.clone(), tcp_stream)
                .await
                .context("TLS handshake failed")?;

            info!("🔐 TLS connection established");
            let (_, conn_info) = tls_stream.get_ref();
            if let Some(protocol) = conn_info.protocol_version() {
                info!("  Protocol: {:?}", protocol);
            }
            if let Some(cipher) = conn_info.negotiated_cipher_suite() {
                info!("  Cipher: {:?}", cipher.suite());
            }

            Box::new(tls_stream)
        }
        None => {
            warn!("⚠️  Connecting in PLAINTEXT (no TLS trust configured)");
            Box::new(tcp_stream)
        }
    };

    // The server speaks first; the catalog arriving is what makes the
    // session ready.
    let catalog = Framer::read_frame(&mut conn)
        .await
        .context("Failed to read opening catalog")?
        .into_catalog()?;

    Ok((conn, catalog))
}

/// Run one fetch cycle over an established stream: request once, then
/// consume units and ack until one persists cleanly or the policy gives
/// out.
async fn fetch_cycle<S>(
    stream: &mut S,
    name: &str,
    dest_dir: &Path,
    retry: RetryPolicy,
) -> Result<PathBuf>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    Framer::write_frame(
        stream,
        &Frame::Request {
            name: name.to_string(),
        },
    )
    .await
    .context("Failed to send request")?;

    let mut attempt: u32 = 0;
    loop {
        attempt += 1;

        let unit = Framer::read_frame(stream)
            .await
            .context("Failed to read transfer unit")?
            .into_unit()?;

        match persist_unit(&unit, dest_dir).await {
            Ok(path) => {
                Framer::write_frame(stream, &Frame::Ack { ok: true })
                    .await
                    .context("Failed to send ack")?;
                info!("✅ Fetched {name} ({} bytes, {attempt} attempt(s))", unit.size);
                return Ok(path);
            }
            Err(e) => {
                warn!("Attempt {attempt} for {name} failed: {e:#}");

                if retry.exhausted(attempt) {
                    // A true ack would assert success, so the only honest
                    // way out of the cycle is to drop the transport.
                    bail!("Giving up on {name} after {attempt} attempt(s)");
                }

                Framer::write_frame(stream, &Frame::Ack { ok: false })
                    .await
                    .context("Failed to request a resend")?;

                let pause = retry.backoff_for(attempt);
                if !pause.is_zero() {
                    tokio::time::sleep(pause).await;
                }
            }
        }
    }
}

/// Persist one unit to disk and verify what landed.
///
/// Failure here feeds the retry loop: an error-status unit, an unsafe
/// name, a short unit, a write error or a digest mismatch all count the
/// same, and nothing is kept from a failed attempt.
async fn persist_unit(unit: &TransferUnit, dest_dir: &Path) -> Result<PathBuf> {
    if unit.status == TransferStatus::Error {
        bail!("Server reported a read failure for {:?}", unit.name);
    }

    if unit.size != unit.payload.len() as u64 {
        bail!(
            "Unit for {:?} is malformed: size {} but {} payload byte(s)",
            unit.name,
            unit.size,
            unit.payload.len()
        );
    }

    let safe_name = sanitize_name(&unit.name)?;
    let path = dest_dir.join(&safe_name);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {parent:?}"))?;
    }

    fs::write(&path, &unit.payload)
        .await
        .with_context(|| format!("Failed to write {path:?}"))?;

    // Read back and compare digests; a corrupt write must not be acked
    let expected = Sha256::digest(&unit.payload);
    let written = fs::read(&path)
        .await
        .with_context(|| format!("Failed to verify {path:?}"))?;
    let actual = Sha256::digest(&written);

    if expected != actual {
        let _ = fs::remove_file(&path).await;
        bail!(
            "Digest mismatch for {path:?}: expected {}, got {}. File deleted.",
            hex::encode(expected),
            hex::encode(actual)
        );
    }

    debug!("Persisted {path:?} ({} bytes)", unit.payload.len());
    Ok(path)
}

/// Format file size for display
pub fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} B", size)
    }
}
