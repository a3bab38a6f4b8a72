//! Fileshelf CLI - Main Entry Point
//!
//! Serve a directory of files over TCP (optionally TLS) and fetch from it.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       CLI Application                        │
//! │  ┌──────────────────────────────────────────────────────────┐│
//! │  │                        Commands                          ││
//! │  │   ┌────────┐   ┌─────────┐   ┌────────┐   ┌─────────┐   ││
//! │  │   │  cert  │   │  serve  │   │   ls   │   │  fetch  │   ││
//! │  │   └────────┘   └─────────┘   └────────┘   └─────────┘   ││
//! │  └──────────────────────────────────────────────────────────┘│
//! │                              │                               │
//! │  ┌──────────────────────────────────────────────────────────┐│
//! │  │                 Protocol Layer                           ││
//! │  │  - Frame codec (catalog/request/unit/ack)                ││
//! │  │  - Filename sanitization    - Retry semantics            ││
//! │  └──────────────────────────────────────────────────────────┘│
//! │                              │                               │
//! │  ┌──────────────────────────────────────────────────────────┐│
//! │  │              Network Layer (tokio, rustls)               ││
//! │  │  - Async TCP streams        - Optional TLS wrapping      ││
//! │  │  - Escalating or shared listeners                        ││
//! │  └──────────────────────────────────────────────────────────┘│
//! └──────────────────────────────────────────────────────────────┘
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use fileshelf::catalog;
use fileshelf::client::{format_size, Client, ClientConfig, ClientSession};
use fileshelf::config::{ConfigFile, RetryPolicy, DEFAULT_BACKOFF};
use fileshelf::server::{
    AcceptStrategy, ConnectionManager, ServerConfig, DEFAULT_BASE_PORT, DEFAULT_MAX_PORT,
};
use fileshelf::tls::{generate_self_signed, save_identity, ClientTls, ServerTls};

/// Fileshelf CLI
///
/// Serves the files of one directory to fetch clients, with the catalog
/// handed out at connect time and per-file delivery acknowledged by the
/// receiver.
#[derive(Parser)]
#[command(name = "fileshelf")]
#[command(version = "0.1.0")]
#[command(about = "Directory file server with acknowledged transfers", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Certificate management commands
    Cert {
        #[command(subcommand)]
        action: CertCommands,
    },

    /// Start the file server
    Serve(ServeArgs),

    /// Show the server's catalog
    Ls {
        #[command(flatten)]
        conn: ConnectArgs,
    },

    /// Fetch files from the server
    Fetch {
        #[command(flatten)]
        conn: ConnectArgs,

        /// Directory to save fetched files under
        #[arg(short, long, default_value = ".")]
        dest: PathBuf,

        /// Fetch every file in the catalog
        #[arg(long, conflicts_with = "names")]
        all: bool,

        /// Give up on a file after this many attempts (default: retry forever)
        #[arg(long)]
        max_attempts: Option<u32>,

        /// Base milliseconds between bounded attempts
        #[arg(long, default_value = "250")]
        backoff_ms: u64,

        /// Catalog names to fetch
        #[arg(required_unless_present = "all")]
        names: Vec<String>,
    },
}

#[derive(Args)]
struct ServeArgs {
    /// Path to a TOML config file (./fileshelf.toml is picked up when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory whose top-level files are served
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Address to bind listeners to
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// First port of the listener range
    #[arg(long)]
    base_port: Option<u16>,

    /// Last usable port of the listener range
    #[arg(long)]
    max_port: Option<u16>,

    /// Listener strategy
    #[arg(long, value_enum)]
    accept: Option<AcceptStrategy>,

    /// Path to the server certificate (PEM); enables TLS together with --key
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Path to the server private key (PEM)
    #[arg(long)]
    key: Option<PathBuf>,

    /// Close a session after this many rejected resends of one file
    #[arg(long)]
    max_resends: Option<u32>,
}

/// Connection flags shared by the client commands.
#[derive(Args)]
struct ConnectArgs {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:49152")]
    server: SocketAddr,

    /// Server hostname for TLS verification
    #[arg(long, default_value = "localhost")]
    hostname: String,

    /// Path to a CA certificate; enables TLS
    #[arg(long)]
    ca: Option<PathBuf>,

    /// Use TLS but skip certificate verification (INSECURE!)
    #[arg(long)]
    insecure: bool,

    /// Seconds to wait for the session to become ready
    #[arg(long, default_value = "3")]
    timeout: u64,
}

#[derive(Subcommand)]
enum CertCommands {
    /// Generate a self-signed certificate for testing
    Generate {
        /// Output directory for certificate and key
        #[arg(short, long, default_value = "./certs")]
        output: PathBuf,

        /// Common name for the certificate
        #[arg(long, default_value = "localhost")]
        cn: String,

        /// Additional DNS names (comma-separated)
        #[arg(long)]
        dns: Option<String>,

        /// Additional IP addresses (comma-separated)
        #[arg(long)]
        ip: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install the crypto provider (required by rustls)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install crypto provider");

    let cli = Cli::parse();

    // RUST_LOG wins when set; -v only moves the default
    let default_filter = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Cert { action } => handle_cert_command(action).await,
        Commands::Serve(args) => run_serve(args).await,
        Commands::Ls { conn } => run_ls(conn).await,
        Commands::Fetch {
            conn,
            dest,
            all,
            max_attempts,
            backoff_ms,
            names,
        } => run_fetch(conn, dest, names, all, max_attempts, backoff_ms).await,
    }
}

async fn handle_cert_command(action: CertCommands) -> Result<()> {
    match action {
        CertCommands::Generate {
            output,
            cn,
            dns,
            ip,
        } => {
            info!("🔐 Generating self-signed certificate...");

            let dns_names: Vec<String> = dns
                .as_deref()
                .map(|s| s.split(',').map(|x| x.trim().to_string()).collect())
                .unwrap_or_else(|| vec![cn.clone()]);
            let dns_refs: Vec<&str> = dns_names.iter().map(|s| s.as_str()).collect();

            let ip_addrs: Vec<std::net::IpAddr> = ip
                .as_deref()
                .map(|s| {
                    s.split(',')
                        .filter_map(|ip| ip.trim().parse().ok())
                        .collect()
                })
                .unwrap_or_else(|| vec!["127.0.0.1".parse().unwrap()]);

            let identity = generate_self_signed(&cn, &dns_refs, &ip_addrs)?;

            std::fs::create_dir_all(&output)?;

            let cert_path = output.join("cert.pem");
            let key_path = output.join("key.pem");

            save_identity(&identity.cert_pem, &identity.key_pem, &cert_path, &key_path)?;

            info!("✅ Certificate generated successfully!");
            info!("   Certificate: {:?}", cert_path);
            info!("   Private key: {:?}", key_path);
            info!("");
            info!("📝 Usage:");
            info!(
                "   Server: fileshelf serve --root ./files --cert {:?} --key {:?}",
                cert_path, key_path
            );
            info!("   Client: fileshelf fetch --ca {:?} --all", cert_path);

            Ok(())
        }
    }
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    info!("🚀 Starting fileshelf server...");

    let file = ConfigFile::discover(args.config.as_deref())?;

    let root_dir = args
        .root
        .clone()
        .or_else(|| file.root_dir.clone())
        .unwrap_or_else(|| PathBuf::from("."));
    let bind_ip = args
        .bind
        .or(file.bind_addr)
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    let base_port = args.base_port.or(file.base_port).unwrap_or(DEFAULT_BASE_PORT);
    let max_port = args.max_port.or(file.max_port).unwrap_or(DEFAULT_MAX_PORT);
    let accept = args.accept.or(file.accept).unwrap_or_default();

    if base_port > max_port {
        bail!("Base port {base_port} is above max port {max_port}");
    }

    // Probe the root now so a misconfigured server fails loudly instead of
    // dropping every future connection at accept time.
    let probe = catalog::scan(&root_dir)?;
    info!(
        "📁 Serving {:?} ({} file(s) at startup)",
        root_dir,
        probe.len()
    );

    let resend = match args.max_resends {
        Some(max) => RetryPolicy::limited(max, DEFAULT_BACKOFF),
        None => file.retry_policy(),
    };

    let tls = build_server_tls(&args, &file)?;

    let config = ServerConfig {
        root_dir,
        bind_ip,
        base_port,
        max_port,
        accept,
        tls,
        resend,
    };

    ConnectionManager::new(config).run().await
}

fn build_server_tls(args: &ServeArgs, file: &ConfigFile) -> Result<Option<ServerTls>> {
    // Flag-supplied material wins over the config file
    match (&args.cert, &args.key) {
        (Some(cert), Some(key)) => {
            let suites = file.tls.as_ref().and_then(|t| t.cipher_suites.clone());
            return Ok(Some(ServerTls::load(cert, key, suites.as_deref())?));
        }
        (Some(_), None) | (None, Some(_)) => bail!("--cert and --key must be given together"),
        (None, None) => {}
    }

    match &file.tls {
        Some(section) => Ok(Some(ServerTls::load(
            &section.cert,
            &section.key,
            section.cipher_suites.as_deref(),
        )?)),
        None => Ok(None),
    }
}

fn client_tls(conn: &ConnectArgs) -> Result<Option<ClientTls>> {
    if conn.insecure {
        Ok(Some(ClientTls::insecure(&conn.hostname)?))
    } else if let Some(ca) = &conn.ca {
        Ok(Some(ClientTls::new(Some(ca), &conn.hostname)?))
    } else {
        Ok(None)
    }
}

async fn connect_session(
    conn: &ConnectArgs,
    dest_dir: PathBuf,
    retry: RetryPolicy,
) -> Result<ClientSession> {
    let config = ClientConfig {
        server_addr: conn.server,
        tls: client_tls(conn)?,
        dest_dir,
        retry,
    };

    let client = Client::new(config);

    // Readiness is the catalog arriving; the CLI bounds the wait
    match timeout(Duration::from_secs(conn.timeout), client.connect()).await {
        Ok(session) => session,
        Err(_) => bail!("Server did not become ready within {}s", conn.timeout),
    }
}

async fn run_ls(conn: ConnectArgs) -> Result<()> {
    let session = connect_session(&conn, PathBuf::from("."), RetryPolicy::unbounded()).await?;

    let mut entries = session.catalog().entries.clone();
    // Display order is the CLI's own; the wire imposes none
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    if entries.is_empty() {
        info!("📁 Catalog is empty");
    } else {
        info!("📁 Files on server:");
        println!();
        println!("{:<48} {:>12}", "Name", "Size");
        println!("{:-<61}", "");

        for entry in &entries {
            println!("{:<48} {:>12}", entry.name, format_size(entry.size));
        }
    }

    session.close().await;
    Ok(())
}

async fn run_fetch(
    conn: ConnectArgs,
    dest: PathBuf,
    names: Vec<String>,
    all: bool,
    max_attempts: Option<u32>,
    backoff_ms: u64,
) -> Result<()> {
    let retry = match max_attempts {
        Some(max) => RetryPolicy::limited(max, Duration::from_millis(backoff_ms)),
        None => RetryPolicy::unbounded(),
    };

    let mut session = connect_session(&conn, dest, retry).await?;

    let names = if all {
        let mut names: Vec<String> = session
            .catalog()
            .entries
            .iter()
            .map(|e| e.name.clone())
            .collect();
        names.sort_unstable();
        names
    } else {
        names
    };

    if names.is_empty() {
        bail!("Nothing to fetch: pass file names or --all");
    }

    let pb = create_progress_bar(names.len() as u64);
    let mut failed = 0usize;

    for name in &names {
        pb.set_message(name.clone());
        match session.fetch(name).await {
            Ok(path) => debug!("Saved {path:?}"),
            Err(e) => {
                failed += 1;
                warn!("Failed to fetch {name}: {e:#}");
            }
        }
        pb.inc(1);
    }

    pb.finish_with_message("done");
    session.close().await;

    if failed > 0 {
        bail!("{failed} of {} file(s) failed", names.len());
    }

    info!("✅ Fetched {} file(s)", names.len());
    Ok(())
}

/// Create progress bar over the fetch list
fn create_progress_bar(total_files: u64) -> ProgressBar {
    let pb = ProgressBar::new(total_files);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb
}
