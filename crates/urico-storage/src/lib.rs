//! Output locations, advisory per-target locks, and atomic target-file writes for URICO.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use urico_core::{Axis, DataKind, Location, Target};
use uuid::Uuid;

pub const CRATE_NAME: &str = "urico-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("timed out waiting for lock on {path} after {polls} polls")]
    LockTimeout { path: PathBuf, polls: u32 },
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing target records: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StorageError {
    fn io<'a>(action: &'static str, path: &'a Path) -> impl FnOnce(std::io::Error) -> Self + 'a {
        move |source| StorageError::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Escape characters that would split or escape a path segment.
pub fn sanitize_segment(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            other => other,
        })
        .collect();
    if cleaned.chars().all(|c| c == '.') {
        "_".repeat(cleaned.len().max(1))
    } else {
        cleaned
    }
}

/// Resolve `path` against the working directory so every spelling of the
/// same location yields the same lock key. Symlinks are resolved when the
/// path already exists.
pub fn absolute_path(path: &Path) -> PathBuf {
    std::fs::canonicalize(path)
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Deterministic `(kind, target) -> path` mapping under an absolute data root.
#[derive(Debug, Clone)]
pub struct OutputLocator {
    root: PathBuf,
}

impl OutputLocator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root: PathBuf = root.into();
        Self {
            root: absolute_path(&root),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn axis_dir(&self, kind: DataKind, axis: Axis) -> PathBuf {
        self.root.join(kind.as_str()).join(axis.as_str())
    }

    pub fn path_for(&self, target: &Target) -> PathBuf {
        let base = self.axis_dir(target.kind, target.axis());
        match &target.location {
            Location::Area { prefecture, city } => base
                .join(sanitize_segment(prefecture))
                .join(format!("{}.json", sanitize_segment(city))),
            Location::Station {
                rail_company,
                line,
                station,
            } => base
                .join(sanitize_segment(rail_company))
                .join(sanitize_segment(line))
                .join(format!("{}.json", sanitize_segment(station))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LockPolicy {
    pub poll_interval: Duration,
    pub max_polls: u32,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_polls: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome<T> {
    Completed(T),
    /// The output appeared while waiting; the body was not run.
    AlreadyDone,
}

/// Lock file holder. Removing the file on drop covers every exit path of the
/// critical section, including panics.
#[derive(Debug)]
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(lock = %self.path.display(), "lock released"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(lock = %self.path.display(), %err, "failed to remove lock file"),
        }
    }
}

/// Advisory locks keyed by a hash of the guarded output path.
#[derive(Debug, Clone)]
pub struct LockManager {
    lock_dir: PathBuf,
    policy: LockPolicy,
}

impl LockManager {
    pub fn new(lock_dir: impl Into<PathBuf>, policy: LockPolicy) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            policy,
        }
    }

    pub fn lock_path_for(&self, output: &Path) -> PathBuf {
        let output = if output.is_absolute() {
            output.to_path_buf()
        } else {
            std::path::absolute(output).unwrap_or_else(|_| output.to_path_buf())
        };
        let key = sha256_hex(output.to_string_lossy().as_bytes());
        self.lock_dir.join(format!("{key}.lock"))
    }

    async fn acquire(&self, output: &Path) -> Result<LockGuard, StorageError> {
        fs::create_dir_all(&self.lock_dir)
            .await
            .map_err(StorageError::io("creating lock directory", &self.lock_dir))?;
        let lock_path = self.lock_path_for(output);
        let mut polls = 0u32;

        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
                .await
            {
                Ok(mut file) => {
                    let guard = LockGuard {
                        path: lock_path.clone(),
                    };
                    file.write_all(std::process::id().to_string().as_bytes())
                        .await
                        .map_err(StorageError::io("writing lock file", &lock_path))?;
                    return Ok(guard);
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if polls >= self.policy.max_polls {
                        return Err(StorageError::LockTimeout {
                            path: output.to_path_buf(),
                            polls,
                        });
                    }
                    polls += 1;
                    tokio::time::sleep(self.policy.poll_interval).await;
                }
                Err(err) => return Err(StorageError::io("creating lock file", &lock_path)(err)),
            }
        }
    }

    /// Run `body` while holding the lock for `output`. If `output` already
    /// exists once the lock is held, `body` is skipped.
    pub async fn with_lock<T, E, F, Fut>(&self, output: &Path, body: F) -> Result<LockOutcome<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<StorageError>,
    {
        let _guard = self.acquire(output).await?;

        let exists = fs::try_exists(output)
            .await
            .map_err(StorageError::io("checking output", output))?;
        if exists {
            debug!(output = %output.display(), "output appeared while waiting for lock");
            return Ok(LockOutcome::AlreadyDone);
        }

        body().await.map(LockOutcome::Completed)
    }
}

/// Write bytes through a temp file in the destination directory and rename into place.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .map_err(StorageError::io("creating output directory", parent))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(StorageError::io("opening temp file", &temp_path))?;
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await
    }
    .await;
    drop(file);
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StorageError::io("writing temp file", &temp_path)(err));
    }

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StorageError::io("renaming temp file into", path)(err));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Written { path: PathBuf, records: usize },
    /// Another invocation finished the same target first.
    AlreadyDone { path: PathBuf },
}

/// Persisted target files: written once under lock, never updated in place.
#[derive(Debug, Clone)]
pub struct TargetStore {
    locator: OutputLocator,
    locks: LockManager,
}

impl TargetStore {
    pub fn new(locator: OutputLocator, locks: LockManager) -> Self {
        Self { locator, locks }
    }

    pub fn locator(&self) -> &OutputLocator {
        &self.locator
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn path_for(&self, target: &Target) -> PathBuf {
        self.locator.path_for(target)
    }

    pub async fn is_generated(&self, target: &Target) -> Result<bool, StorageError> {
        let path = self.path_for(target);
        fs::try_exists(&path)
            .await
            .map_err(StorageError::io("checking output", &path))
    }

    /// Delete a target's output ahead of a forced regeneration.
    pub async fn remove(&self, target: &Target) -> Result<bool, StorageError> {
        let path = self.path_for(target);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StorageError::io("removing output", &path)(err)),
        }
    }

    pub async fn commit(
        &self,
        target: &Target,
        records: &[JsonValue],
    ) -> Result<CommitOutcome, StorageError> {
        let path = self.path_for(target);
        let bytes = serde_json::to_vec_pretty(records)?;
        let outcome = self
            .locks
            .with_lock(&path, || write_atomic(&path, &bytes))
            .await?;
        Ok(match outcome {
            LockOutcome::Completed(()) => CommitOutcome::Written {
                path,
                records: records.len(),
            },
            LockOutcome::AlreadyDone => CommitOutcome::AlreadyDone { path },
        })
    }
}
