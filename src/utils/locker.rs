//! Run-wide exclusion lock
//!
//! One backup run at a time may hold `<backup-root>/locks/run.lock`. The file
//! carries a JSON record (pid, hostname, acquisition time) and is created with
//! exclusive-create semantics. While held, the process also keeps an advisory
//! write lock on it, so a crashed holder is recognisable even when its pid
//! has been reused.
//!
//! Creating, reclaiming and removing the lock file all happen under an
//! advisory lock on `run.gate`, so a stale record is only ever removed by
//! the process that judged it stale.

use chrono::{DateTime, Utc};
use fd_lock::{RwLock, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use sysinfo::{Pid, System};
use tracing::{debug, info, warn};

const LOCK_FILE: &str = "run.lock";
const GATE_FILE: &str = "run.gate";

/// Contents of the lock file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockRecord {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            hostname: local_hostname(),
            acquired_at: Utc::now(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Another backup run is in progress (pid {} on {}, since {})", .0.pid, .0.hostname, .0.acquired_at)]
    AlreadyRunning(LockRecord),

    #[error("Another backup run is starting")]
    Contended,

    #[error("Failed to access lock file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Observed state of an existing lock file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockStatus {
    pub record: Option<LockRecord>,
    /// Why the lock may be reclaimed, if it may
    pub stale_reason: Option<String>,
}

impl LockStatus {
    pub fn is_stale(&self) -> bool {
        self.stale_reason.is_some()
    }
}

/// Guard for the run lock, released on drop
pub struct RunLock {
    // Borrows from `_lock`; taken in `Drop` before `_lock` is dropped.
    guard: Option<RwLockWriteGuard<'static, File>>,
    _lock: Box<RwLock<File>>,
    path: PathBuf,
    gate: PathBuf,
    record: LockRecord,
}

fn open_gate(path: &Path) -> Result<RwLock<File>, LockError> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map(RwLock::new)
        .map_err(|source| LockError::Io {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(unix)]
fn same_file(a: &fs::Metadata, b: &fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    a.dev() == b.dev() && a.ino() == b.ino()
}

#[cfg(not(unix))]
fn same_file(_: &fs::Metadata, _: &fs::Metadata) -> bool {
    true
}

impl RunLock {
    /// Acquire the run lock in `lock_dir`.
    ///
    /// A lock older than `stale_after`, or whose holder is gone, is removed
    /// and acquisition retried once.
    pub fn acquire(lock_dir: &Path, stale_after: Duration) -> Result<Self, LockError> {
        fs::create_dir_all(lock_dir).map_err(|source| LockError::Io {
            path: lock_dir.to_path_buf(),
            source,
        })?;
        let path = lock_dir.join(LOCK_FILE);
        let gate_path = lock_dir.join(GATE_FILE);

        let mut gate = open_gate(&gate_path)?;
        let _entered = gate.write().map_err(|source| LockError::Io {
            path: gate_path.clone(),
            source,
        })?;

        for _ in 0..2 {
            match OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(file) => return Self::take(file, path, gate_path),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let Some(status) = Self::inspect(lock_dir, stale_after)? else {
                        continue;
                    };
                    match status.stale_reason {
                        Some(reason) => {
                            warn!("Reclaiming stale run lock {:?}: {}", path, reason);
                            if let Err(e) = fs::remove_file(&path) {
                                if e.kind() != ErrorKind::NotFound {
                                    return Err(LockError::Io { path, source: e });
                                }
                            }
                        }
                        None => {
                            return Err(match status.record {
                                Some(record) => LockError::AlreadyRunning(record),
                                None => LockError::Contended,
                            })
                        }
                    }
                }
                Err(source) => return Err(LockError::Io { path, source }),
            }
        }

        Err(LockError::Contended)
    }

    fn take(file: File, path: PathBuf, gate: PathBuf) -> Result<Self, LockError> {
        let mut lock = Box::new(RwLock::new(file));

        // SAFETY: the guard borrows the boxed RwLock, whose address is stable
        // for the lifetime of `RunLock`. `Drop` releases the guard before the
        // box is dropped, so the borrow never outlives its referent.
        let lock_ptr = &mut *lock as *mut RwLock<File>;
        let mut guard = unsafe { (*lock_ptr).try_write() }.map_err(|_| LockError::Contended)?;

        let record = LockRecord::current();
        let write_result = serde_json::to_vec_pretty(&record)
            .map_err(std::io::Error::from)
            .and_then(|bytes| {
                guard.write_all(&bytes)?;
                guard.sync_all()
            });
        if let Err(source) = write_result {
            drop(guard);
            let _ = fs::remove_file(&path);
            return Err(LockError::Io { path, source });
        }

        let guard: RwLockWriteGuard<'static, File> = unsafe { std::mem::transmute(guard) };

        info!("Acquired run lock: {:?} (pid {})", path, record.pid);

        Ok(Self {
            guard: Some(guard),
            _lock: lock,
            path,
            gate,
            record,
        })
    }

    /// Inspect the lock in `lock_dir` without taking it. `None` if no lock exists.
    pub fn inspect(lock_dir: &Path, stale_after: Duration) -> Result<Option<LockStatus>, LockError> {
        let path = lock_dir.join(LOCK_FILE);
        let mut file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(LockError::Io { path, source }),
        };

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|source| LockError::Io { path: path.clone(), source })?;
        let record: Option<LockRecord> = serde_json::from_str(&contents).ok();

        let mut existing = RwLock::new(file);
        let held = existing.try_write().is_err();

        let stale_reason = match &record {
            None if held => None,
            None => Some("lock record is unreadable and not held".to_string()),
            Some(record) => staleness(record, held, stale_after),
        };
        debug!("Run lock {:?}: held={}, stale={:?}", path, held, stale_reason);

        Ok(Some(LockStatus { record, stale_reason }))
    }

    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    /// Get the lock file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn staleness(record: &LockRecord, held: bool, stale_after: Duration) -> Option<String> {
    let age = Utc::now().signed_duration_since(record.acquired_at);
    if age.to_std().map(|age| age > stale_after).unwrap_or(false) {
        return Some(format!(
            "acquired {} ago, older than {}",
            humantime::format_duration(Duration::from_secs(age.num_seconds().max(0) as u64)),
            humantime::format_duration(stale_after)
        ));
    }

    // Liveness can only be judged for holders on this host.
    if record.hostname != local_hostname() {
        return None;
    }
    if !process_alive(record.pid) {
        return Some(format!("holder process {} is not alive", record.pid));
    }
    if !held {
        return Some(format!("holder process {} no longer holds the lock", record.pid));
    }
    None
}

/// Whether a process with `pid` exists on this host
pub fn process_alive(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_process(Pid::from_u32(pid))
}

/// This machine's hostname, as recorded in lock files
pub fn local_hostname() -> String {
    System::host_name().unwrap_or_else(|| "localhost".to_string())
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let ours = self.guard.as_ref().and_then(|guard| guard.metadata().ok());

        match open_gate(&self.gate) {
            Ok(mut gate) => {
                let _entered = gate.write();
                match (ours, fs::metadata(&self.path)) {
                    (Some(ours), Ok(current)) if !same_file(&ours, &current) => {
                        warn!("Run lock {:?} was reclaimed by another run, leaving it in place", self.path);
                    }
                    _ => {
                        if let Err(e) = fs::remove_file(&self.path) {
                            debug!("Failed to remove lock file: {}", e);
                        }
                    }
                }
            }
            Err(e) => warn!("Leaving run lock {:?} in place: {}", self.path, e),
        }

        drop(self.guard.take());
        info!("Released run lock: {:?}", self.path);
    }
}
