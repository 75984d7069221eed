//! File-backed metadata store.
//!
//! Layout: the key `jobs/<id>` lives at `<data_dir>/jobs/<id>.json` as an
//! envelope `{"version": N, "value": ...}`. Writes go to a temp file and are
//! renamed into place, so readers never see a torn document. Conditional
//! writes hold a `<file>.lock` created with `create_new`, which makes the
//! version check and the rename atomic across processes sharing the
//! directory.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use super::{conflict, MetadataStore, Versioned, ABSENT};
use crate::error::{CubeForgeError, Result};

const DOC_EXT: &str = "json";
const LOCK_EXT: &str = "lock";
const TMP_EXT: &str = "tmp";

/// A lock file older than this belongs to a crashed writer.
const STALE_LOCK_AFTER: Duration = Duration::from_secs(10);
const LOCK_RETRY: Duration = Duration::from_millis(2);
const MAX_LOCK_ATTEMPTS: u32 = 5_000;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u64,
    value: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        tracing::debug!(root = %root.display(), "Opened file metadata store");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn doc_path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty()
            || key
                .split('/')
                .any(|part| part.is_empty() || part == "." || part == "..")
        {
            return Err(CubeForgeError::Validation(format!(
                "invalid metadata key '{}'",
                key
            )));
        }
        Ok(with_suffix(&self.root.join(key), DOC_EXT))
    }

    async fn read_envelope(path: &Path) -> Result<Option<Envelope>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn lock(path: &Path) -> Result<LockGuard> {
        let lock_path = with_suffix(path, LOCK_EXT);
        if let Some(parent) = lock_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        for _ in 0..MAX_LOCK_ATTEMPTS {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
                .await
            {
                Ok(_) => return Ok(LockGuard { path: lock_path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Self::is_stale(&lock_path).await {
                        tracing::warn!(lock = %lock_path.display(), "Breaking stale lock");
                        let _ = tokio::fs::remove_file(&lock_path).await;
                        continue;
                    }
                    tokio::time::sleep(LOCK_RETRY).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(CubeForgeError::Internal(format!(
            "could not lock {}",
            lock_path.display()
        )))
    }

    async fn is_stale(lock_path: &Path) -> bool {
        let Ok(meta) = tokio::fs::metadata(lock_path).await else {
            return false;
        };
        meta.modified()
            .ok()
            .and_then(|m| SystemTime::now().duration_since(m).ok())
            .map(|age| age > STALE_LOCK_AFTER)
            .unwrap_or(false)
    }

    async fn write_atomic(path: &Path, envelope: &Envelope) -> Result<()> {
        let tmp = with_suffix(
            path,
            &format!("{}.{}", uuid::Uuid::new_v4().simple(), TMP_EXT),
        );
        let bytes = serde_json::to_vec_pretty(envelope)?;
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<&str> = rel
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()?;
        let key = parts.join("/");
        key.strip_suffix(&format!(".{}", DOC_EXT)).map(str::to_string)
    }
}

/// `a/b.c` + `json` -> `a/b.c.json`; unlike `with_extension` this keeps dots
/// that are part of the key.
fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".");
    os.push(suffix);
    PathBuf::from(os)
}

/// Removes the lock file when the write finishes, successfully or not.
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[async_trait]
impl MetadataStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        let path = self.doc_path(key)?;
        Ok(Self::read_envelope(&path).await?.map(|e| Versioned {
            value: e.value,
            version: e.version,
        }))
    }

    async fn put(&self, key: &str, value: serde_json::Value, expected_version: u64) -> Result<u64> {
        let path = self.doc_path(key)?;
        let _guard = Self::lock(&path).await?;

        let current = Self::read_envelope(&path)
            .await?
            .map(|e| e.version)
            .unwrap_or(ABSENT);
        if current != expected_version {
            return Err(conflict(key, expected_version, current));
        }

        let version = expected_version + 1;
        Self::write_atomic(&path, &Envelope { version, value }).await?;
        Ok(version)
    }

    async fn delete(&self, key: &str, expected_version: u64) -> Result<()> {
        let path = self.doc_path(key)?;
        let _guard = Self::lock(&path).await?;

        let current = Self::read_envelope(&path)
            .await?
            .map(|e| e.version)
            .unwrap_or(ABSENT);
        if current != expected_version {
            return Err(conflict(key, expected_version, current));
        }
        if current != ABSENT {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut dirs = vec![self.root.clone()];

        while let Some(dir) = dirs.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    dirs.push(path);
                    continue;
                }
                // Only finished documents; skips .lock and in-flight .tmp files.
                if path.extension().and_then(|e| e.to_str()) != Some(DOC_EXT) {
                    continue;
                }
                if let Some(key) = self.key_for(&path) {
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}
