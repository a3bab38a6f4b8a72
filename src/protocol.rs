//! Protocol Definition Module
//!
//! This module defines the catalog-and-fetch protocol spoken between the
//! server and its clients:
//! - The frame schema (catalog, file request, transfer unit, acknowledge)
//! - Binary framing with a magic header and length prefix
//! - Filename sanitization shared by both endpoints
//!
//! ## Protocol Overview
//!
//! The protocol is a persistent request-response stream. The server speaks
//! first, exactly once, with the catalog of servable files. Everything after
//! that is driven by the client:
//!
//! ```text
//! Client                                 Server
//!   |                                      |
//!   |-- [transport handshake] ------------>|
//!   |<----------- Catalog{entries} --------|
//!   |                                      |
//!   |-- Request{name} -------------------->|
//!   |<-- Unit{name, size, payload, status}-|
//!   |-- Ack{ok: false} ------------------->|   (rebuild + resend)
//!   |<-- Unit{name, size, payload, status}-|
//!   |-- Ack{ok: true} -------------------->|   (cycle complete)
//!   |                                      |
//!   |-- Request{next name} --------------->|
//! ```
//!
//! A cycle for one filename ends only on `Ack { ok: true }`; a `false` ack
//! obligates the server to build and send exactly one more unit for the same
//! name. There is no bound on the number of resends unless one is configured,
//! so a permanently unreadable file loops until a peer closes the transport.
//!
//! ## Framing
//!
//! 1. Every frame is length-prefixed, so a corrupt peer cannot desynchronize
//!    the stream without detection
//! 2. The magic header rejects non-protocol traffic immediately
//! 3. A frame size ceiling prevents memory exhaustion from a hostile length

use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (256 MB). Units carry a whole file in one frame, so
/// the ceiling is generous; it exists to bound allocation, not transfers.
pub const MAX_FRAME_SIZE: u64 = 256 * 1024 * 1024;

/// Magic bytes to identify our protocol
pub const PROTOCOL_MAGIC: &[u8; 4] = b"FSHL";

/// Protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(u64, u64),

    #[error("invalid protocol magic")]
    InvalidMagic,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("expected {expected} frame, got {got}")]
    UnexpectedFrame {
        expected: &'static str,
        got: &'static str,
    },

    #[error("refusing unsafe filename {name:?}: {reason}")]
    UnsafeFilename { name: String, reason: &'static str },
}

/// One servable file as recorded by the catalog scan.
///
/// `size` is the size observed at scan time. The unit built for a later
/// request re-reads the file, so the two may legitimately diverge if the
/// file changed in between.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
}

/// The per-session snapshot of servable files, sent exactly once right
/// after connect. Entries are unordered on the wire; consumers impose
/// their own display order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    pub entries: Vec<FileEntry>,
}

impl Catalog {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Whether a transfer unit carries usable file data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Ok,
    Error,
}

/// The message carrying one file's (attempted) contents.
///
/// `payload.len() == size` holds exactly when `status` is
/// [`TransferStatus::Ok`]; an `Error` unit carries an empty payload and
/// must never be persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferUnit {
    pub name: String,
    pub size: u64,
    #[serde(with = "b64")]
    pub payload: Vec<u8>,
    pub status: TransferStatus,
}

impl TransferUnit {
    /// A unit for a successful read; `size` reflects the bytes actually read.
    pub fn ok(name: &str, payload: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            size: payload.len() as u64,
            payload,
            status: TransferStatus::Ok,
        }
    }

    /// A unit for a failed read. The payload is empty and unusable.
    pub fn error(name: &str) -> Self {
        Self {
            name: name.to_string(),
            size: 0,
            payload: Vec::new(),
            status: TransferStatus::Error,
        }
    }
}

/// Every message that can appear on the wire, in both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Server to client, once per session: the servable file snapshot.
    Catalog(Catalog),

    /// Client to server: request one file by catalog name.
    Request { name: String },

    /// Server to client: the requested file, or an error marker.
    Unit(TransferUnit),

    /// Client to server: `true` closes the cycle, `false` demands a resend.
    Ack { ok: bool },
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Catalog(_) => "catalog",
            Frame::Request { .. } => "request",
            Frame::Unit(_) => "unit",
            Frame::Ack { .. } => "ack",
        }
    }

    pub fn into_catalog(self) -> Result<Catalog, ProtocolError> {
        match self {
            Frame::Catalog(catalog) => Ok(catalog),
            other => Err(ProtocolError::UnexpectedFrame {
                expected: "catalog",
                got: other.kind(),
            }),
        }
    }

    pub fn into_request(self) -> Result<String, ProtocolError> {
        match self {
            Frame::Request { name } => Ok(name),
            other => Err(ProtocolError::UnexpectedFrame {
                expected: "request",
                got: other.kind(),
            }),
        }
    }

    pub fn into_unit(self) -> Result<TransferUnit, ProtocolError> {
        match self {
            Frame::Unit(unit) => Ok(unit),
            other => Err(ProtocolError::UnexpectedFrame {
                expected: "unit",
                got: other.kind(),
            }),
        }
    }

    pub fn into_ack(self) -> Result<bool, ProtocolError> {
        match self {
            Frame::Ack { ok } => Ok(ok),
            other => Err(ProtocolError::UnexpectedFrame {
                expected: "ack",
                got: other.kind(),
            }),
        }
    }
}

/// Frame envelope codec
///
/// Wire format:
/// ```text
/// +----------+-----------+--------------+
/// | Magic(4) | Length(4) | JSON payload |
/// +----------+-----------+--------------+
/// ```
pub struct Framer;

impl Framer {
    /// Write one frame with magic and length prefix
    pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let payload = serde_json::to_vec(frame)?;
        let len = payload.len() as u64;

        if len > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(len, MAX_FRAME_SIZE));
        }

        writer.write_all(PROTOCOL_MAGIC).await?;

        // Length as big-endian u32
        writer.write_u32(len as u32).await?;

        writer.write_all(&payload).await?;
        writer.flush().await?;

        Ok(())
    }

    /// Read one frame with magic and length prefix
    pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic).await?;

        if &magic != PROTOCOL_MAGIC {
            return Err(ProtocolError::InvalidMagic);
        }

        let len = reader.read_u32().await? as u64;

        // Checked before the allocation, not after
        if len > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(len, MAX_FRAME_SIZE));
        }

        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload).await?;

        let frame = serde_json::from_slice(&payload)?;

        Ok(frame)
    }
}

/// Payload bytes travel inside the JSON frame as base64 text.
mod b64 {
    use super::BASE64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        BASE64.decode(text).map_err(serde::de::Error::custom)
    }
}

/// Validate a filename before it touches the filesystem on either end
///
/// # Security
/// Requested names are never checked against the catalog, and persisted
/// names come verbatim from the server, so both endpoints run every name
/// through this function: the server before reading under its root, the
/// client before writing under its destination directory. Relative
/// subpaths are allowed; escaping the base directory is not.
pub fn sanitize_name(name: &str) -> Result<String, ProtocolError> {
    if name.is_empty() {
        return Err(ProtocolError::UnsafeFilename {
            name: name.to_string(),
            reason: "empty filename",
        });
    }

    // Normalize path separators before inspecting components
    let normalized = name.replace('\\', "/");

    for component in normalized.split('/') {
        match component {
            // Leading, trailing, or doubled separators all produce an
            // empty component, which also covers absolute paths.
            "" => {
                return Err(ProtocolError::UnsafeFilename {
                    name: name.to_string(),
                    reason: "empty path component",
                })
            }
            "." | ".." => {
                return Err(ProtocolError::UnsafeFilename {
                    name: name.to_string(),
                    reason: "path traversal component",
                })
            }
            _ => {}
        }
    }

    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_accepts_ordinary_names() {
        assert_eq!(sanitize_name("test.txt").unwrap(), "test.txt");
        assert_eq!(sanitize_name("folder/file.txt").unwrap(), "folder/file.txt");
        // Dot-files are servable: the catalog scan does not exclude them
        assert_eq!(sanitize_name(".config").unwrap(), ".config");
        // ".." as a substring of a component is a legal filename
        assert_eq!(sanitize_name("notes..txt").unwrap(), "notes..txt");
    }

    #[test]
    fn sanitize_rejects_traversal() {
        assert!(sanitize_name("../etc/passwd").is_err());
        assert!(sanitize_name("foo/../bar").is_err());
        assert!(sanitize_name("..").is_err());
        assert!(sanitize_name("./a.txt").is_err());
    }

    #[test]
    fn sanitize_rejects_absolute_and_malformed_paths() {
        assert!(sanitize_name("/etc/passwd").is_err());
        assert!(sanitize_name("\\windows\\system32").is_err());
        assert!(sanitize_name("a//b").is_err());
        assert!(sanitize_name("trailing/").is_err());
    }

    #[test]
    fn sanitize_rejects_empty() {
        assert!(sanitize_name("").is_err());
    }

    #[tokio::test]
    async fn frame_round_trip_catalog() {
        let frame = Frame::Catalog(Catalog {
            entries: vec![
                FileEntry {
                    name: "a.txt".to_string(),
                    size: 5,
                },
                FileEntry {
                    name: "b.bin".to_string(),
                    size: 1024,
                },
            ],
        });

        let mut buf = Vec::new();
        Framer::write_frame(&mut buf, &frame).await.unwrap();
        let decoded = Framer::read_frame(&mut buf.as_slice()).await.unwrap();
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn unit_payload_survives_binary_data() {
        let payload: Vec<u8> = (0..=255).collect();
        let frame = Frame::Unit(TransferUnit::ok("blob.bin", payload.clone()));

        let mut buf = Vec::new();
        Framer::write_frame(&mut buf, &frame).await.unwrap();
        let unit = Framer::read_frame(&mut buf.as_slice())
            .await
            .unwrap()
            .into_unit()
            .unwrap();

        assert_eq!(unit.payload, payload);
        assert_eq!(unit.size, 256);
        assert_eq!(unit.status, TransferStatus::Ok);
    }

    #[test]
    fn error_unit_carries_no_payload() {
        let unit = TransferUnit::error("gone.txt");
        assert_eq!(unit.status, TransferStatus::Error);
        assert!(unit.payload.is_empty());
        assert_eq!(unit.size, 0);
    }

    #[tokio::test]
    async fn rejects_bad_magic() {
        let mut buf = Vec::new();
        Framer::write_frame(&mut buf, &Frame::Ack { ok: true })
            .await
            .unwrap();
        buf[0] = b'X';

        let err = Framer::read_frame(&mut buf.as_slice()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidMagic));
    }

    #[tokio::test]
    async fn rejects_oversized_frame_before_allocating() {
        let mut buf = Vec::new();
        buf.extend_from_slice(PROTOCOL_MAGIC);
        buf.extend_from_slice(&u32::MAX.to_be_bytes());

        let err = Framer::read_frame(&mut buf.as_slice()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge(_, _)));
    }

    #[test]
    fn frame_kind_mismatch_is_reported() {
        let err = Frame::Ack { ok: true }.into_request().unwrap_err();
        match err {
            ProtocolError::UnexpectedFrame { expected, got } => {
                assert_eq!(expected, "request");
                assert_eq!(got, "ack");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
