//! The lease store: one JSON file per in-flight task under the lease
//! directory, plus the staleness classification the reconciler acts on.
//!
//! Coordination between the reconciler and supervisors is entirely by
//! filename uniqueness and atomic rename; nothing here takes a lock.

use crate::error::CoreError;
use crate::fs as tfs;
use crate::ident;
use crate::models::Lease;
use std::path::{Path, PathBuf};
use std::time::Duration;
use time::OffsetDateTime;
use tracing::warn;

const LEASE_PREFIX: &str = "task_";
const LEASE_SUFFIX: &str = ".json";

/// Minimum staleness cutoff, regardless of how short the heartbeat interval
/// is configured.
const MIN_STALE_CUTOFF_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseHealth {
    Healthy,
    DeadProcess,
    StaleHeartbeat,
    OverMaxRuntime,
}

impl LeaseHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::DeadProcess => "dead_process",
            Self::StaleHeartbeat => "stale_heartbeat",
            Self::OverMaxRuntime => "over_max_runtime",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LeaseStore {
    dir: PathBuf,
}

impl LeaseStore {
    /// Open the store, creating the lease directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let dir = dir.into();
        tfs::ensure_dir(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Validated, symlink-checked path for a task's lease file. The file name
    /// is derived from the already-validated id, so traversal can only come
    /// from symlinks inside the lease directory itself.
    fn lease_path(&self, task_id: &str) -> Result<PathBuf, CoreError> {
        ident::validate_ident("task_id", task_id)?;
        let dir = self.dir.canonicalize()?;
        let path = dir.join(format!("{LEASE_PREFIX}{task_id}{LEASE_SUFFIX}"));
        if path.exists() {
            let resolved = path.canonicalize()?;
            if !resolved.starts_with(&dir) {
                return Err(CoreError::PathEscape {
                    base: dir,
                    path: resolved,
                });
            }
        }
        Ok(path)
    }

    /// Write a new lease. Fails with [`CoreError::LeaseConflict`] when a
    /// lease for this task already exists.
    pub fn create(&self, lease: &Lease) -> Result<(), CoreError> {
        let path = self.lease_path(&lease.task_id)?;
        match tfs::atomic_create_json(&path, lease) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(CoreError::LeaseConflict(lease.task_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Overwrite an existing lease (heartbeats, terminal-state transitions).
    pub fn update(&self, lease: &Lease) -> Result<(), CoreError> {
        let path = self.lease_path(&lease.task_id)?;
        tfs::atomic_write_json(&path, lease)?;
        Ok(())
    }

    /// Remove a lease file, tolerating "already absent".
    pub fn delete(&self, task_id: &str) -> Result<(), CoreError> {
        let path = self.lease_path(task_id)?;
        tfs::remove_file_if_exists(&path)?;
        Ok(())
    }

    pub fn get(&self, task_id: &str) -> Result<Option<Lease>, CoreError> {
        let path = self.lease_path(task_id)?;
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&raw) {
            Ok(lease) => Ok(Some(lease)),
            Err(source) => Err(CoreError::MalformedLease { path, source }),
        }
    }

    /// Enumerate all leases. Malformed files and files whose stem does not
    /// match their `task_id` are skipped with a warning.
    pub fn list(&self) -> Result<Vec<Lease>, CoreError> {
        let mut leases = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(task_id) = task_id_from_path(&path) else {
                continue;
            };
            match tfs::read_json::<Lease, _>(&path) {
                Ok(lease) if lease.task_id == task_id => leases.push(lease),
                Ok(lease) => {
                    warn!(
                        path = %path.display(),
                        task_id = %lease.task_id,
                        "lease task_id does not match filename, skipping"
                    );
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping malformed lease file");
                }
            }
        }
        leases.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        Ok(leases)
    }

    pub fn count_by_agent(&self, agent: &str) -> Result<usize, CoreError> {
        Ok(self.list()?.iter().filter(|l| l.agent == agent).count())
    }
}

fn task_id_from_path(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let task_id = name.strip_prefix(LEASE_PREFIX)?.strip_suffix(LEASE_SUFFIX)?;
    if ident::is_valid_ident(task_id) {
        Some(task_id.to_string())
    } else {
        None
    }
}

/// `kill(pid, 0)` liveness probe. EPERM means the process exists but belongs
/// to another user, which still counts as alive.
pub fn process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        if unsafe { libc::kill(pid as libc::pid_t, 0) } == 0 {
            return true;
        }
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

/// Classify a lease against the host at `now`. When several conditions hold
/// the most severe wins: a dead supervisor beats an overrun which beats a
/// stale heartbeat.
pub fn classify(
    lease: &Lease,
    now: OffsetDateTime,
    heartbeat_interval: Duration,
    max_runtime: Duration,
    local_host: &str,
) -> LeaseHealth {
    if lease.host == local_host && !process_alive(lease.pid) {
        return LeaseHealth::DeadProcess;
    }

    if (now - lease.started_at).whole_seconds() > max_runtime.as_secs() as i64 {
        return LeaseHealth::OverMaxRuntime;
    }

    let cutoff = (3 * heartbeat_interval.as_secs() as i64).max(MIN_STALE_CUTOFF_SECS);
    if (now - lease.heartbeat).whole_seconds() > cutoff {
        return LeaseHealth::StaleHeartbeat;
    }

    LeaseHealth::Healthy
}
