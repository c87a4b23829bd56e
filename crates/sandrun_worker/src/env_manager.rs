//! Environment manager: cached, reusable interpreter+package trees.
//!
//! A content-addressed cache keyed by template name. Builds are expensive
//! and coalesce: any number of concurrent `prepare_environment` calls for
//! one template perform at most one build, with the losers parked on a
//! condvar until the winner publishes. Jobs never share a writable view:
//! each gets its own hardlink clone of the ready base tree, released
//! through an RAII lease.

use sandrun_protocol::JobId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("environment template not found: {0}")]
    TemplateNotFound(String),
    #[error("environment build failed: {0}")]
    BuildFailed(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A named, cacheable recipe for a base environment tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentTemplate {
    pub name: String,
    /// Interpreter stack the packages install against; resolved on PATH
    #[serde(default)]
    pub base_image: String,
    #[serde(default)]
    pub packages: Vec<String>,
    /// Script run with `sh` inside the fresh tree; non-zero exit fails the build
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_script: Option<PathBuf>,
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: u64,
    #[serde(default)]
    pub gpu_enabled: bool,
}

fn default_max_age_hours() -> u64 {
    24
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvStats {
    pub total_templates: usize,
    pub cached_environments: usize,
    pub total_uses: u64,
    pub disk_usage_mb: u64,
}

#[derive(Debug)]
struct CacheEntry {
    built_at: Instant,
    last_used: Instant,
    use_count: u64,
    disk_bytes: u64,
    active_refs: usize,
    stale: bool,
    fs_root: PathBuf,
}

#[derive(Debug)]
enum SlotState {
    /// No usable build (never built, evicted, or last build failed)
    Idle,
    /// One caller is building; everyone else waits on the condvar
    Building,
    Ready(CacheEntry),
}

#[derive(Debug)]
struct CacheSlot {
    state: Mutex<SlotState>,
    cond: Condvar,
}

impl CacheSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Idle),
            cond: Condvar::new(),
        }
    }
}

struct Inner {
    templates: HashMap<String, EnvironmentTemplate>,
    slots: HashMap<String, Arc<CacheSlot>>,
}

/// Process-wide environment cache. Constructed once and shared via `Arc`;
/// the table lock covers bookkeeping only, never a build or a clone.
pub struct EnvironmentManager {
    cache_root: PathBuf,
    inner: Mutex<Inner>,
}

/// A job's hold on one cloned environment. Dropping it removes the clone
/// and releases the base entry for eviction.
#[derive(Debug)]
pub struct EnvLease {
    clone_root: PathBuf,
    gpu_enabled: bool,
    slot: Arc<CacheSlot>,
}

impl EnvLease {
    /// Root of this job's private clone.
    pub fn fs_root(&self) -> &Path {
        &self.clone_root
    }

    pub fn gpu_enabled(&self) -> bool {
        self.gpu_enabled
    }
}

impl Drop for EnvLease {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.clone_root) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(root = %self.clone_root.display(), error = %e, "failed to remove env clone");
            }
        }
        let mut state = match self.slot.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let SlotState::Ready(entry) = &mut *state {
            entry.active_refs = entry.active_refs.saturating_sub(1);
        }
    }
}

impl EnvironmentManager {
    pub fn new(cache_root: PathBuf) -> io::Result<Self> {
        fs::create_dir_all(cache_root.join("jobs"))?;
        Ok(Self {
            cache_root,
            inner: Mutex::new(Inner {
                templates: HashMap::new(),
                slots: HashMap::new(),
            }),
        })
    }

    /// Idempotent. Re-registering a name overwrites the definition but does
    /// not invalidate an existing cached build; use [`rebuild_template`]
    /// for that.
    ///
    /// [`rebuild_template`]: EnvironmentManager::rebuild_template
    pub fn register_template(&self, template: EnvironmentTemplate) {
        let mut inner = self.lock_inner();
        debug!(name = %template.name, "template registered");
        inner.templates.insert(template.name.clone(), template);
    }

    pub fn has_template(&self, name: &str) -> bool {
        self.lock_inner().templates.contains_key(name)
    }

    pub fn list_templates(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock_inner().templates.keys().cloned().collect();
        names.sort();
        names
    }

    /// Mark any cached build stale; the next `prepare_environment` rebuilds.
    pub fn rebuild_template(&self, name: &str) -> Result<(), EnvError> {
        let slot = {
            let inner = self.lock_inner();
            if !inner.templates.contains_key(name) {
                return Err(EnvError::TemplateNotFound(name.to_string()));
            }
            inner.slots.get(name).cloned()
        };
        if let Some(slot) = slot {
            let mut state = lock_slot(&slot);
            if let SlotState::Ready(entry) = &mut *state {
                entry.stale = true;
            }
        }
        Ok(())
    }

    /// The hot path: reuse a fresh ready entry, or build exactly once, then
    /// hand the job a private clone.
    pub fn prepare_environment(&self, name: &str, job_id: &JobId) -> Result<EnvLease, EnvError> {
        let (template, slot) = {
            let mut inner = self.lock_inner();
            let template = inner
                .templates
                .get(name)
                .cloned()
                .ok_or_else(|| EnvError::TemplateNotFound(name.to_string()))?;
            let slot = inner
                .slots
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(CacheSlot::new()))
                .clone();
            (template, slot)
        };

        let base_root = loop {
            let mut state = lock_slot(&slot);
            match &mut *state {
                SlotState::Ready(entry) if !is_expired(entry, &template) => {
                    entry.use_count += 1;
                    entry.active_refs += 1;
                    entry.last_used = Instant::now();
                    break entry.fs_root.clone();
                }
                SlotState::Building => {
                    let _parked = slot
                        .cond
                        .wait(state)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    continue;
                }
                other => {
                    // Absent or stale: take over the build. The previous
                    // base (if any) can go now; live clones hold hardlinks
                    // to its file contents.
                    let old_root = match other {
                        SlotState::Ready(entry) => Some(entry.fs_root.clone()),
                        _ => None,
                    };
                    *other = SlotState::Building;
                    drop(state);

                    match self.build(&template, old_root) {
                        Ok(entry) => {
                            let root = entry.fs_root.clone();
                            *lock_slot(&slot) = SlotState::Ready(entry);
                            slot.cond.notify_all();
                            break root;
                        }
                        Err(e) => {
                            // Never poison the cache: the next caller retries.
                            *lock_slot(&slot) = SlotState::Idle;
                            slot.cond.notify_all();
                            return Err(e);
                        }
                    }
                }
            }
        };

        let clone_root = self.cache_root.join("jobs").join(job_id.as_str());
        if let Err(e) = clone_tree(&base_root, &clone_root) {
            let mut state = lock_slot(&slot);
            if let SlotState::Ready(entry) = &mut *state {
                entry.active_refs = entry.active_refs.saturating_sub(1);
            }
            let _ = fs::remove_dir_all(&clone_root);
            return Err(EnvError::Io(e));
        }

        Ok(EnvLease {
            clone_root,
            gpu_enabled: template.gpu_enabled,
            slot,
        })
    }

    /// Install a job's own dependency manifest into its clone, layered on
    /// top of the shared base.
    pub fn install_requirements(
        &self,
        lease: &EnvLease,
        requirements: &Path,
    ) -> Result<(), EnvError> {
        let target = lease.fs_root().join("packages");
        fs::create_dir_all(&target)?;
        let output = Command::new("python3")
            .args(["-m", "pip", "install", "--quiet", "--no-input"])
            .arg("--requirement")
            .arg(requirements)
            .arg("--target")
            .arg(&target)
            .output()
            .map_err(|e| EnvError::BuildFailed(format!("pip unavailable: {e}")))?;
        if !output.status.success() {
            return Err(EnvError::BuildFailed(format!(
                "pip install failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    /// Evict ready entries older than their template's `max_age_hours`.
    /// Entries referenced by a running job are skipped. Returns how many
    /// were evicted.
    pub fn cleanup_old_environments(&self) -> usize {
        let slots: Vec<(String, Arc<CacheSlot>, Option<EnvironmentTemplate>)> = {
            let inner = self.lock_inner();
            inner
                .slots
                .iter()
                .map(|(name, slot)| {
                    (name.clone(), slot.clone(), inner.templates.get(name).cloned())
                })
                .collect()
        };

        let mut evicted = 0;
        for (name, slot, template) in slots {
            let Some(template) = template else { continue };
            let mut state = lock_slot(&slot);
            if let SlotState::Ready(entry) = &mut *state {
                if entry.active_refs == 0 && is_expired(entry, &template) {
                    info!(template = %name, root = %entry.fs_root.display(), "evicting environment");
                    let _ = fs::remove_dir_all(&entry.fs_root);
                    *state = SlotState::Idle;
                    evicted += 1;
                }
            }
        }
        evicted
    }

    pub fn stats(&self) -> EnvStats {
        let (total_templates, slots): (usize, Vec<Arc<CacheSlot>>) = {
            let inner = self.lock_inner();
            (
                inner.templates.len(),
                inner.slots.values().cloned().collect(),
            )
        };

        let mut cached = 0;
        let mut uses = 0;
        let mut disk_bytes = 0;
        for slot in slots {
            if let SlotState::Ready(entry) = &*lock_slot(&slot) {
                cached += 1;
                uses += entry.use_count;
                disk_bytes += entry.disk_bytes;
            }
        }
        EnvStats {
            total_templates,
            cached_environments: cached,
            total_uses: uses,
            disk_usage_mb: disk_bytes / (1024 * 1024),
        }
    }

    fn build(
        &self,
        template: &EnvironmentTemplate,
        old_root: Option<PathBuf>,
    ) -> Result<CacheEntry, EnvError> {
        if let Some(old) = old_root {
            let _ = fs::remove_dir_all(old);
        }

        let fs_root = self
            .cache_root
            .join(&template.name)
            .join(build_tag());
        fs::create_dir_all(&fs_root)?;
        info!(template = %template.name, root = %fs_root.display(), "building environment");

        let result = self.populate(template, &fs_root);
        if let Err(e) = result {
            // A failed partial must not survive on disk.
            let _ = fs::remove_dir_all(&fs_root);
            return Err(e);
        }

        let now = Instant::now();
        Ok(CacheEntry {
            built_at: now,
            last_used: now,
            use_count: 1,
            disk_bytes: dir_size(&fs_root),
            active_refs: 1,
            stale: false,
            fs_root,
        })
    }

    fn populate(&self, template: &EnvironmentTemplate, fs_root: &Path) -> Result<(), EnvError> {
        let manifest = serde_json::json!({
            "name": template.name,
            "base_image": template.base_image,
            "packages": template.packages,
            "built_at": chrono::Utc::now().to_rfc3339(),
        });
        fs::write(
            fs_root.join("env-manifest.json"),
            serde_json::to_vec_pretty(&manifest).expect("manifest serializes"),
        )?;

        if !template.packages.is_empty() {
            let interpreter = if template.base_image.is_empty() {
                "python3".to_string()
            } else {
                template.base_image.clone()
            };
            let target = fs_root.join("packages");
            fs::create_dir_all(&target)?;
            let output = Command::new(&interpreter)
                .args(["-m", "pip", "install", "--quiet", "--no-input"])
                .args(&template.packages)
                .arg("--target")
                .arg(&target)
                .output()
                .map_err(|e| {
                    EnvError::BuildFailed(format!("installer {interpreter} unavailable: {e}"))
                })?;
            if !output.status.success() {
                return Err(EnvError::BuildFailed(format!(
                    "package install failed: {}",
                    String::from_utf8_lossy(&output.stderr)
                )));
            }
        }

        if let Some(script) = &template.setup_script {
            let output = Command::new("sh")
                .arg(script)
                .current_dir(fs_root)
                .output()
                .map_err(|e| EnvError::BuildFailed(format!("setup script spawn: {e}")))?;
            if !output.status.success() {
                return Err(EnvError::BuildFailed(format!(
                    "setup script exited {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr)
                )));
            }
        }

        Ok(())
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn lock_slot(slot: &CacheSlot) -> std::sync::MutexGuard<'_, SlotState> {
    slot.state
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn is_expired(entry: &CacheEntry, template: &EnvironmentTemplate) -> bool {
    entry.stale
        || entry.built_at.elapsed() > Duration::from_secs(template.max_age_hours * 3600)
}

fn build_tag() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    format!(
        "build-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Cheap per-job clone: hardlink every file (contents shared with the
/// base), copy where hardlinks are unsupported. Directories are recreated;
/// symlinks in a base tree are skipped.
fn clone_tree(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in walkdir::WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        let Ok(relative) = entry.path().strip_prefix(src) else {
            continue;
        };
        if relative.as_os_str().is_empty() {
            continue;
        }
        let target = dst.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_file() {
            if fs::hard_link(entry.path(), &target).is_err() {
                fs::copy(entry.path(), &target)?;
            }
        } else {
            warn!(path = %entry.path().display(), "skipping non-regular file in env clone");
        }
    }
    Ok(())
}

fn dir_size(path: &Path) -> u64 {
    walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}
