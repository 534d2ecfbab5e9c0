//! Versioned key/value storage behind the persona registry.
//!
//! Every record carries a revision number. Writers read a record, compute a
//! replacement and hand it back through [`RegistryStore::compare_and_swap`]
//! together with the revision they read; the write is refused when another
//! writer got there first.
//!
//! [`FileRegistryStore`] keeps one JSON file per key and replaces it through
//! a temp file plus atomic rename. The read-compare-rename window is guarded
//! by a sidecar lock file created exclusively, so cooperating processes on
//! one machine do not interleave their writes. This is best-effort: a lock
//! older than [`STALE_LOCK_AGE`] is assumed to belong to a crashed writer
//! and is broken by renaming it aside, so of several writers that find the
//! same stale lock only one removes it.
//!
//! [`MemoryRegistryStore`] implements the same contract in memory for tests
//! and single-process embedding.

use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

/// How long a writer waits for the lock file before giving up.
const LOCK_WAIT: Duration = Duration::from_secs(5);

/// Poll interval while waiting for the lock file.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Lock files older than this are considered abandoned.
pub const STALE_LOCK_AGE: Duration = Duration::from_secs(10);

static TOMBSTONE_SEQ: AtomicU64 = AtomicU64::new(0);

/// A stored value and the revision it was written at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned {
    pub revision: u64,
    pub data: Value,
}

/// Durable key/value store with optimistic concurrency.
pub trait RegistryStore: Send + Sync + std::fmt::Debug {
    /// Returns the current value of `key`, if any.
    fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError>;

    /// Writes `data` under `key` if its current revision equals `expected`
    /// (`None` meaning the key must not exist). Returns the new revision.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::RevisionMismatch` when the revision moved.
    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        data: Value,
    ) -> Result<u64, StoreError>;

    /// Removes `key`. Returns whether a value was present.
    fn delete(&self, key: &str) -> Result<bool, StoreError>;
}

fn check_revision(key: &str, expected: Option<u64>, actual: Option<u64>) -> Result<(), StoreError> {
    if expected == actual {
        Ok(())
    } else {
        Err(StoreError::RevisionMismatch {
            key: key.to_string(),
            expected,
            actual,
        })
    }
}

// ── File store ───────────────────────────────────────────────────────

/// Filesystem-backed store rooted at a state directory.
///
/// Key `a/b` maps to `<root>/a/b.json`.
#[derive(Debug)]
pub struct FileRegistryStore {
    root: PathBuf,
    // Serialises writers inside this process; the lock file covers the rest.
    local: Mutex<()>,
}

impl FileRegistryStore {
    /// Creates a store rooted at `root`, creating the directory if needed.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            local: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let mut path = self.root.clone();
        let mut segments = 0;
        for segment in key.split('/') {
            let valid = !segment.is_empty()
                && segment != "."
                && segment != ".."
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
            if !valid {
                return Err(StoreError::InvalidKey(key.to_string()));
            }
            path.push(segment);
            segments += 1;
        }
        if segments == 0 {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        path.set_extension("json");
        Ok(path)
    }

    fn read(path: &Path) -> Result<Option<Versioned>, StoreError> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_atomic(path: &Path, record: &Versioned) -> Result<(), StoreError> {
        let dir = path
            .parent()
            .ok_or_else(|| StoreError::InvalidKey(path.display().to_string()))?;
        fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, record)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|source| StoreError::Persist {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    fn with_lock<T>(
        &self,
        path: &Path,
        f: impl FnOnce() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _local = self.local.lock().unwrap_or_else(|e| e.into_inner());
        let _guard = LockFile::acquire(path)?;
        f()
    }
}

impl RegistryStore for FileRegistryStore {
    fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        let path = self.path_for(key)?;
        Self::read(&path)
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        data: Value,
    ) -> Result<u64, StoreError> {
        let path = self.path_for(key)?;
        self.with_lock(&path, || {
            let actual = Self::read(&path)?.map(|v| v.revision);
            check_revision(key, expected, actual)?;
            let revision = actual.map_or(1, |r| r + 1);
            Self::write_atomic(&path, &Versioned { revision, data })?;
            tracing::trace!(key, revision, "store write");
            Ok(revision)
        })
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.path_for(key)?;
        self.with_lock(&path, || match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        })
    }
}

/// Exclusive sidecar lock, removed on drop.
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    fn acquire(target: &Path) -> Result<Self, StoreError> {
        let mut path = target.as_os_str().to_owned();
        path.push(".lock");
        let path = PathBuf::from(path);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let deadline = Instant::now() + LOCK_WAIT;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    if let Err(e) = writeln!(file, "{}", std::process::id()) {
                        tracing::debug!(path = %path.display(), error = %e, "could not record lock owner");
                    }
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if Self::is_stale(&path) && Self::break_stale(&path) {
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(StoreError::LockTimeout(path.display().to_string()));
                    }
                    std::thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Moves the lock at `path` to a unique tombstone and deletes it.
    ///
    /// Rename is atomic, so only one breaker gets a given lock file. If the
    /// file it got is fresh, another writer re-created the lock after the
    /// staleness check; it is linked back in place and `false` is returned.
    fn break_stale(path: &Path) -> bool {
        let mut tombstone = path.as_os_str().to_owned();
        tombstone.push(format!(
            ".stale.{}.{}",
            std::process::id(),
            TOMBSTONE_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        let tombstone = PathBuf::from(tombstone);

        if let Err(e) = fs::rename(path, &tombstone) {
            tracing::debug!(path = %path.display(), error = %e, "stale lock already gone");
            return false;
        }
        if !Self::is_stale(&tombstone) {
            if let Err(e) = fs::hard_link(&tombstone, path) {
                tracing::warn!(path = %path.display(), error = %e, "could not restore live registry lock");
            }
            if let Err(e) = fs::remove_file(&tombstone) {
                tracing::debug!(path = %tombstone.display(), error = %e, "could not remove lock tombstone");
            }
            return false;
        }

        tracing::warn!(path = %path.display(), "breaking stale registry lock");
        if let Err(e) = fs::remove_file(&tombstone) {
            tracing::debug!(path = %tombstone.display(), error = %e, "could not remove lock tombstone");
        }
        true
    }

    fn is_stale(path: &Path) -> bool {
        fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .is_some_and(|age| age > STALE_LOCK_AGE)
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

// ── Memory store ─────────────────────────────────────────────────────

/// In-memory store with the same revision semantics as the file store.
#[derive(Debug, Default)]
pub struct MemoryRegistryStore {
    entries: Mutex<HashMap<String, Versioned>>,
}

impl MemoryRegistryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RegistryStore for MemoryRegistryStore {
    fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).cloned())
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        data: Value,
    ) -> Result<u64, StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let actual = entries.get(key).map(|v| v.revision);
        check_revision(key, expected, actual)?;
        let revision = actual.map_or(1, |r| r + 1);
        entries.insert(key.to_string(), Versioned { revision, data });
        Ok(revision)
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.remove(key).is_some())
    }
}
