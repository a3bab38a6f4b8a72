//! Fileshelf
//!
//! Serve the files of one directory over TCP (optionally TLS), with the
//! catalog handed to each client at connect time and every file delivery
//! acknowledged by the receiver.
//!
//! ## Features
//! - Per-session catalog snapshot, sent before anything else
//! - Acknowledged transfer cycles with rebuild-on-resend
//! - Escalating one-port-per-session listeners or a shared listener
//! - Optional TLS with a pinned CA or cipher suite allow-list
//!
//! ## Usage
//!
//! ```bash
//! # Generate certificates
//! fileshelf cert generate --output ./certs
//!
//! # Serve a directory
//! fileshelf serve --root ./files --cert ./certs/cert.pem --key ./certs/key.pem
//!
//! # Show the catalog
//! fileshelf ls --ca ./certs/cert.pem
//!
//! # Fetch everything into ./downloads
//! fileshelf fetch --ca ./certs/cert.pem --dest ./downloads --all
//! ```

pub mod catalog;
pub mod client;
pub mod config;
pub mod protocol;
pub mod server;
pub mod tls;

pub use catalog::CatalogError;
pub use client::{Client, ClientConfig, ClientSession};
pub use config::{ConfigFile, RetryPolicy};
pub use protocol::{Catalog, FileEntry, Frame, Framer, TransferStatus, TransferUnit};
pub use server::{AcceptStrategy, ConnectionManager, ServerConfig, Session};
pub use tls::{ClientTls, ServerTls};
