//! SHA-256 content fingerprinting.
//!
//! Used for job-input identity, per-output-file hashes and the signed
//! result form. Files are read in fixed-size chunks so arbitrarily large
//! outputs hash without loading into memory.

use crate::filetype;
use sandrun_protocol::{FileMetadata, OutputSet};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Component, Path};
use tracing::warn;

const READ_BUF_SIZE: usize = 64 * 1024;

/// Compute the SHA-256 hash of a byte slice, hex-encoded.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compute the SHA-256 hash of a file's contents, hex-encoded.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// One-star glob match over a whole relative path.
///
/// Supported shapes: `*`, `*suffix`, `prefix*`, `prefix*suffix`, and exact
/// match. Patterns contain at most one `*`; anything with more falls back
/// to exact comparison. Matching covers the full relative path string, not
/// the basename.
pub fn matches_pattern(path: &str, pattern: &str) -> bool {
    let mut parts = pattern.splitn(2, '*');
    let prefix = parts.next().unwrap_or("");
    match parts.next() {
        // No star: exact match.
        None => path == pattern,
        Some(suffix) if suffix.contains('*') => path == pattern,
        Some(suffix) => {
            path.len() >= prefix.len() + suffix.len()
                && path.starts_with(prefix)
                && path.ends_with(suffix)
        }
    }
}

fn matches_any(path: &str, patterns: &[String]) -> bool {
    patterns.is_empty() || patterns.iter().any(|p| matches_pattern(path, p))
}

/// Hash every regular file under `root` whose relative path matches one of
/// `patterns` (all files when `patterns` is empty).
///
/// Keys are POSIX-relative paths: forward slashes, no leading separator.
/// Symlinks are not followed and not recorded. A missing root yields an
/// empty set, not an error. A file that cannot be read yields a metadata
/// record with an empty hash and the walk continues; partial output sets
/// from failed jobs are still useful.
pub fn hash_directory(root: &Path, patterns: &[String]) -> OutputSet {
    let mut outputs = OutputSet::new();
    if !root.is_dir() {
        return outputs;
    }

    for entry in walkdir::WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let Some(key) = posix_relative(relative) else {
            continue;
        };
        if !matches_any(&key, patterns) {
            continue;
        }

        let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
        let sha256 = match hash_file(entry.path()) {
            Ok(hash) => hash,
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "unreadable file in output walk");
                String::new()
            }
        };
        outputs.insert(
            key.clone(),
            FileMetadata {
                size_bytes,
                sha256,
                kind: filetype::classify(&key),
                mime: filetype::mime_for(&key).to_string(),
            },
        );
    }

    outputs
}

/// Render a relative path with forward slashes. Returns None for paths with
/// non-UTF8 or non-normal components.
fn posix_relative(path: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            _ => return None,
        }
    }
    Some(parts.join("/"))
}
