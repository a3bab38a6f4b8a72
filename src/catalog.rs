//! Catalog construction: a one-shot, non-recursive scan of the served
//! directory.
//!
//! The scan runs once per session, at accept time, and the resulting
//! [`Catalog`] is never refreshed for the lifetime of that session. Only
//! regular files directly under the root are included; subdirectories,
//! symlinks and other special entries are skipped without descending.

use crate::protocol::{Catalog, FileEntry};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Catalog errors
#[derive(Error, Debug)]
pub enum CatalogError {
    /// The root is missing, not a directory, or unreadable.
    #[error("cannot scan directory {path:?}: {source}")]
    DirectoryUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Scan `root` and build the servable snapshot.
///
/// A failure to open the root is an error; a failure to stat an individual
/// entry only drops that entry from the snapshot.
pub fn scan(root: &Path) -> Result<Catalog, CatalogError> {
    // read_dir itself reports a missing root and a root that is a plain
    // file, so both collapse into DirectoryUnavailable.
    let dir = std::fs::read_dir(root).map_err(|source| CatalogError::DirectoryUnavailable {
        path: root.to_path_buf(),
        source,
    })?;

    let mut entries = Vec::new();
    for entry in dir {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("skipping unreadable directory entry under {root:?}: {e}");
                continue;
            }
        };

        // file_type on a directory entry does not follow symlinks, so a
        // symlink to a file is excluded rather than resolved.
        let is_file = match entry.file_type() {
            Ok(file_type) => file_type.is_file(),
            Err(e) => {
                warn!("skipping {:?}: {e}", entry.path());
                continue;
            }
        };
        if !is_file {
            continue;
        }

        let size = match entry.metadata() {
            Ok(metadata) => metadata.len(),
            Err(e) => {
                warn!("skipping {:?}: {e}", entry.path());
                continue;
            }
        };

        entries.push(FileEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            size,
        });
    }

    debug!("cataloged {} file(s) under {root:?}", entries.len());
    Ok(Catalog { entries })
}
