//! Filesystem fingerprinting for cache-validity checks.
//!
//! A fingerprint is a SHA-256 digest over the change-relevant state of a
//! file (`path:size:mtime`) or a folder tree (the sorted list of such lines).
//! Content is never read: size + mtime is the staleness signal, which keeps
//! fingerprinting cheap on large document trees.
//!
//! # Contract
//!
//! - Pure function of current on-disk state; idempotent; no caching.
//! - A missing file or folder yields the fixed [`EMPTY_SENTINEL`] digest,
//!   never an error — absence is normalized here so upper layers never
//!   special-case "missing" vs "empty".
//! - Folder fingerprints sort their file list lexicographically before
//!   hashing, so filesystem enumeration order never affects the result.

use sha2::{Digest, Sha256};
use std::path::Path;
use walkdir::WalkDir;

/// Seed text hashed when the target path does not exist.
const EMPTY_SENTINEL: &str = "empty";

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// The digest returned for any missing path.
pub fn empty_fingerprint() -> String {
    sha256_hex(EMPTY_SENTINEL)
}

fn stat_line(path: &Path) -> Option<String> {
    let metadata = std::fs::metadata(path).ok()?;
    let mtime = metadata
        .modified()
        .ok()?
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    Some(format!("{}:{}:{}", path.display(), metadata.len(), mtime))
}

/// Fingerprint a single file from its path, size, and mtime.
///
/// A nonexistent path yields the sentinel digest without touching the error
/// path.
pub fn file_fingerprint(path: &Path) -> String {
    match stat_line(path) {
        Some(line) => sha256_hex(&line),
        None => empty_fingerprint(),
    }
}

/// Fingerprint a folder tree.
///
/// Directories whose name appears in `exclude_dirs` are skipped entirely,
/// descendants included. Files are listed as `path:size:mtime`, sorted
/// lexicographically, joined, and hashed once.
pub fn folder_fingerprint(path: &Path, exclude_dirs: &[&str]) -> String {
    if !path.is_dir() {
        return empty_fingerprint();
    }

    let mut lines: Vec<String> = Vec::new();

    let walker = WalkDir::new(path).into_iter().filter_entry(|entry| {
        if entry.file_type().is_dir() && entry.depth() > 0 {
            let name = entry.file_name().to_string_lossy();
            return !exclude_dirs.iter().any(|ex| *ex == name);
        }
        true
    });

    for entry in walker.flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(line) = stat_line(entry.path()) {
            lines.push(line);
        }
    }

    if lines.is_empty() {
        return empty_fingerprint();
    }

    // Sort so enumeration order never leaks into the digest
    lines.sort();
    sha256_hex(&lines.join("\n"))
}

/// Combine labeled sub-fingerprints into one digest.
///
/// Labels keep the parts unambiguous: `[("a", "xy"), ("b", "z")]` and
/// `[("a", "x"), ("yb", "z")]` hash differently.
pub fn combined_fingerprint(parts: &[(&str, String)]) -> String {
    let joined = parts
        .iter()
        .map(|(label, fp)| format!("{}={}", label, fp))
        .collect::<Vec<_>>()
        .join("|");
    sha256_hex(&joined)
}
