//! Cross-process, file-locked, crash-safe node-membership journal (C6).

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::{CoreError, CoreResult};

/// How long to sleep between polls of a contended advisory lock. `fs2`'s `try_lock_*` calls are
/// non-blocking with no timeout parameter, so waiting on a deadline means polling.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeRecord {
    pub node_id: String,
    pub api_port: u16,
    pub p2p_port: u16,
    pub registration_time: String,
    pub last_seen: f64,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionFile {
    session_id: String,
    created_at: String,
    nodes: Vec<NodeRecord>,
}

fn now_unix_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

/// Persists a JSON journal of [`NodeRecord`]s to `<session_dir>/session.json`, guarded by an
/// advisory lock file at `<session_dir>/session.json.lock`.
pub struct SessionStore {
    path: PathBuf,
    lock_path: PathBuf,
    session_id: String,
    active_threshold_secs: f64,
}

/// Holds an OS-level advisory lock (via `fs2`) on `file` for the guard's lifetime. The lock is
/// released automatically on drop, and by the OS if the holding process dies, so there is no
/// staleness heuristic and no TOCTOU window between checking and taking the lock.
struct FileLockGuard {
    file: File,
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl SessionStore {
    pub fn new(session_dir: impl Into<PathBuf>, session_id: impl Into<String>, active_threshold_secs: f64) -> CoreResult<Self> {
        let session_dir = session_dir.into();
        fs::create_dir_all(&session_dir).map_err(|e| CoreError::InvalidArgument { reason: format!("cannot create session dir: {}", e) })?;
        Ok(SessionStore {
            path: session_dir.join("session.json"),
            lock_path: session_dir.join("session.json.lock"),
            session_id: session_id.into(),
            active_threshold_secs,
        })
    }

    /// Acquires the session's advisory lock file in `mode`, polling against `deadline`. Per §6,
    /// reads take the lock in shared mode and mutations take it exclusive.
    fn acquire_file_lock(&self, mode: LockMode, deadline: Instant) -> CoreResult<FileLockGuard> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.lock_path)
            .map_err(|e| CoreError::InvalidArgument { reason: format!("failed to open lock file: {}", e) })?;

        let started = Instant::now();
        loop {
            let attempt = match mode {
                LockMode::Shared => file.try_lock_shared(),
                LockMode::Exclusive => file.try_lock_exclusive(),
            };
            match attempt {
                Ok(()) => return Ok(FileLockGuard { file }),
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(CoreError::LockTimeout {
                            lock: self.lock_path.display().to_string(),
                            waited_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                    std::thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(e) => return Err(CoreError::InvalidArgument { reason: format!("failed to lock session file: {}", e) }),
            }
        }
    }

    /// Reads and parses the journal. A missing file parses as empty; this never writes.
    fn read(&self) -> CoreResult<SessionFile> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => serde_json::from_str(&contents).map_err(|e| {
                log::error!("session file at {} is corrupt: {}", self.path.display(), e);
                CoreError::CorruptSessionFile { reason: e.to_string() }
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Ok(SessionFile { session_id: self.session_id.clone(), created_at: Utc::now().to_rfc3339(), nodes: Vec::new() })
            }
            Err(e) => Err(CoreError::CorruptSessionFile { reason: e.to_string() }),
        }
    }

    /// Writes `file` to a temp file in the same directory, then renames it over the target —
    /// the commit point. On any failure before the rename the temp file is removed.
    fn write_atomic(&self, file: &SessionFile) -> CoreResult<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| CoreError::InvalidArgument { reason: format!("cannot create temp file: {}", e) })?;

        let write_result: io::Result<()> = (|| {
            let json = serde_json::to_string_pretty(file).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            tmp.write_all(json.as_bytes())?;
            tmp.write_all(b"\n")?;
            tmp.flush()
        })();
        if let Err(e) = write_result {
            return Err(CoreError::InvalidArgument { reason: format!("failed to write session file: {}", e) });
        }

        tmp.persist(&self.path).map_err(|e| CoreError::InvalidArgument { reason: format!("failed to commit session file: {}", e) })?;
        Ok(())
    }

    fn mutate<F>(&self, deadline: Instant, f: F) -> CoreResult<()>
    where
        F: FnOnce(&mut SessionFile) -> CoreResult<()>,
    {
        let _lock = self.acquire_file_lock(LockMode::Exclusive, deadline)?;
        let mut file = self.read()?;
        f(&mut file)?;
        self.write_atomic(&file)
    }

    pub fn register(&self, node_id: &str, api_port: u16, p2p_port: u16, deadline: Instant) -> CoreResult<()> {
        if api_port == 0 || p2p_port == 0 {
            return Err(CoreError::InvalidArgument { reason: "ports must be in [1,65535]".into() });
        }
        self.mutate(deadline, |file| {
            let now = now_unix_secs();
            if let Some(existing) = file.nodes.iter_mut().find(|n| n.node_id == node_id) {
                existing.api_port = api_port;
                existing.p2p_port = p2p_port;
                existing.last_seen = now;
                existing.is_active = true;
            } else {
                file.nodes.push(NodeRecord {
                    node_id: node_id.to_string(),
                    api_port,
                    p2p_port,
                    registration_time: Utc::now().to_rfc3339(),
                    last_seen: now,
                    is_active: true,
                });
            }
            Ok(())
        })
    }

    pub fn heartbeat(&self, node_id: &str, deadline: Instant) -> CoreResult<()> {
        self.mutate(deadline, |file| {
            if let Some(existing) = file.nodes.iter_mut().find(|n| n.node_id == node_id) {
                existing.last_seen = now_unix_secs();
            }
            Ok(())
        })
    }

    pub fn deregister(&self, node_id: &str, deadline: Instant) -> CoreResult<()> {
        self.mutate(deadline, |file| {
            if let Some(existing) = file.nodes.iter_mut().find(|n| n.node_id == node_id) {
                existing.is_active = false;
            }
            Ok(())
        })
    }

    /// Active node records: `is_active` and within `active_threshold_secs` of `last_seen`.
    pub fn active_nodes(&self, deadline: Instant) -> CoreResult<Vec<NodeRecord>> {
        let _lock = self.acquire_file_lock(LockMode::Shared, deadline)?;
        let file = self.read()?;
        let now = now_unix_secs();
        Ok(file
            .nodes
            .into_iter()
            .filter(|n| n.is_active && (now - n.last_seen) < self.active_threshold_secs)
            .collect())
    }

    #[cfg(test)]
    fn path_for_test(&self) -> &Path {
        &self.path
    }

    #[cfg(test)]
    fn lock_path_for_test(&self) -> &Path {
        &self.lock_path
    }
}
