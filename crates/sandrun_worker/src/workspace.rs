//! Per-job work directories on RAM-backed storage.
//!
//! A submission archive (tar+gz) is unpacked into `<work_root>/<job_id>/work`;
//! the sibling `env` directory is the mount point for the environment clone.
//! The whole job root is destroyed when the [`WorkDir`] guard drops, so every
//! exit path, including panics, cleans up.

use flate2::read::GzDecoder;
use sandrun_protocol::JobId;
use std::collections::BTreeSet;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use tar::{Archive, EntryType};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StageError {
    #[error("archive is not a valid tar.gz: {0}")]
    InvalidArchive(String),
    #[error("archive entry escapes the work dir: {0}")]
    UnsafePath(String),
    #[error("unpacked archive exceeds {limit_bytes} bytes")]
    TooLarge { limit_bytes: u64 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Exclusive handle on one job's directory tree. Dropping it removes the
/// tree; [`WorkDir::persist`] hands ownership to the retention janitor.
#[derive(Debug)]
pub struct WorkDir {
    root: PathBuf,
    staged: BTreeSet<String>,
    destroy_on_drop: bool,
}

impl WorkDir {
    /// The job root: holds `work/`, `env/` and supervisor control files.
    pub fn job_root(&self) -> &Path {
        &self.root
    }

    /// The only writable surface the job sees.
    pub fn work_path(&self) -> PathBuf {
        self.root.join("work")
    }

    /// Mount point for the read-only environment clone.
    pub fn env_path(&self) -> PathBuf {
        self.root.join("env")
    }

    /// Relative paths that came in with the archive. Files the job merely
    /// brought along are not outputs.
    pub fn staged_paths(&self) -> &BTreeSet<String> {
        &self.staged
    }

    /// Keep the tree on disk past this guard; the caller now owns deletion.
    pub fn persist(mut self) -> PathBuf {
        self.destroy_on_drop = false;
        self.root.clone()
    }

    pub fn destroy(self) {
        // Drop does the work.
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if !self.destroy_on_drop {
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.root) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(root = %self.root.display(), error = %e, "failed to remove work dir");
            }
        }
    }
}

/// Unpack a submission archive into a fresh job root under `work_root`.
///
/// Entries with absolute paths or `..` components are rejected outright;
/// link entries are skipped (a job has no business shipping symlinks into a
/// sandbox). Unpacked size is capped before any byte is written.
pub fn stage_archive(
    work_root: &Path,
    job_id: &JobId,
    archive_gz: &[u8],
    max_unpacked_bytes: u64,
) -> Result<WorkDir, StageError> {
    let root = work_root.join(job_id.as_str());
    let work = root.join("work");
    fs::create_dir_all(&work)?;
    fs::create_dir_all(root.join("env"))?;

    // Guard first: if unpack fails the partial tree is removed on drop.
    let mut guard = WorkDir {
        root,
        staged: BTreeSet::new(),
        destroy_on_drop: true,
    };
    guard.staged = unpack_into(&work, archive_gz, max_unpacked_bytes)?;
    debug!(job_id = %job_id, files = guard.staged.len(), "archive staged");
    Ok(guard)
}

fn unpack_into(
    work: &Path,
    archive_gz: &[u8],
    max_unpacked_bytes: u64,
) -> Result<BTreeSet<String>, StageError> {
    let mut archive = Archive::new(GzDecoder::new(archive_gz));
    let mut staged = BTreeSet::new();
    let mut total: u64 = 0;

    let entries = archive
        .entries()
        .map_err(|e| StageError::InvalidArchive(e.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| StageError::InvalidArchive(e.to_string()))?;
        let path = entry
            .path()
            .map_err(|e| StageError::InvalidArchive(e.to_string()))?
            .into_owned();

        let Some(relative) = sanitize_entry_path(&path) else {
            return Err(StageError::UnsafePath(path.display().to_string()));
        };
        if relative.is_empty() {
            continue;
        }

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(work.join(&relative))?;
            }
            EntryType::Regular => {
                total = total.saturating_add(entry.header().size().unwrap_or(0));
                if total > max_unpacked_bytes {
                    return Err(StageError::TooLarge {
                        limit_bytes: max_unpacked_bytes,
                    });
                }
                if let Some(parent) = work.join(&relative).parent() {
                    fs::create_dir_all(parent)?;
                }
                entry
                    .unpack(work.join(&relative))
                    .map_err(|e| StageError::InvalidArchive(e.to_string()))?;
                staged.insert(relative);
            }
            other => {
                warn!(path = %path.display(), kind = ?other, "skipping non-regular archive entry");
            }
        }
    }

    Ok(staged)
}

/// Read a single entry's bytes from an in-memory archive without touching
/// disk. Used to compute the job-input hash before admission.
pub fn read_archive_entry(archive_gz: &[u8], wanted: &str) -> Option<Vec<u8>> {
    let mut archive = Archive::new(GzDecoder::new(archive_gz));
    for entry in archive.entries().ok()? {
        let Ok(mut entry) = entry else {
            return None;
        };
        let Ok(path) = entry.path() else {
            continue;
        };
        let Some(relative) = sanitize_entry_path(&path) else {
            continue;
        };
        if relative == wanted {
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes).ok()?;
            return Some(bytes);
        }
    }
    None
}

/// Normalize a tar entry path to a forward-slash relative string, or None
/// when it is absolute or climbs out.
fn sanitize_entry_path(path: &Path) -> Option<String> {
    use std::path::Component;
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(parts.join("/"))
}

#[cfg(test)]
pub mod test_archive {
    //! Helpers for building in-memory tar.gz archives in tests.

    use flate2::write::GzEncoder;
    use flate2::Compression;

    pub fn build(files: &[(&str, &[u8])]) -> Vec<u8> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (path, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *contents).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }
}
