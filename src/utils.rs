//! File helpers shared by the persisted model and the reconcilers
//!
//! Every generated file (model, ruleset, dnsmasq config, sysctl drop-in) is
//! replaced with the same atomic pattern:
//!
//! 1. write a sibling `<path>.tmp` with the final permissions set at creation
//! 2. fsync it
//! 3. rename it over the canonical path
//!
//! A crash at any point leaves either the old file or the new one, never a
//! truncated mix.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Sibling temp path used by [`write_atomic`]
pub fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Atomically replaces `path` with `contents`.
///
/// The temp file is removed if the rename fails, so a failed write never
/// leaves debris next to the canonical file.
///
/// # Errors
///
/// Returns `Err` if the temp file cannot be created, written, synced or
/// renamed.
pub async fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> std::io::Result<()> {
    let temp_path = temp_path_for(path);

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(mode) // Set permissions BEFORE any data is written
        .open(&temp_path)
        .await?;

    file.write_all(contents).await?;
    file.sync_all().await?;
    drop(file);

    if let Err(e) = tokio::fs::rename(&temp_path, path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        if e.kind() == std::io::ErrorKind::StorageFull {
            return Err(std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                format!("Disk full: cannot write {}", path.display()),
            ));
        }
        return Err(e);
    }
    Ok(())
}

/// Creates `dir` and its parents with the given mode if missing.
///
/// # Errors
///
/// Returns `Err` if the directory cannot be created.
pub async fn ensure_dir(dir: &Path, mode: u32) -> std::io::Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true).mode(mode);
    builder.create(dir).await
}

/// Hex SHA-256 of generated text, recorded in the audit log
pub fn sha256_hex(contents: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(contents.as_bytes());
    format!("{:x}", hasher.finalize())
}
