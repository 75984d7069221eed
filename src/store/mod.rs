//! Versioned document store backing jobs, cubes and leases.
//!
//! Every key carries a monotonically increasing version. Writers pass the
//! version they read; a mismatch is reported as
//! [`CubeForgeError::ConcurrencyConflict`] and nothing is written. This is the
//! only primitive the registry, the segment manager and the lease need to
//! get per-key linearizable read-modify-write.
//!
//! - [`MemoryStore`]: process-local, for tests and embedded use
//! - [`FileStore`]: one JSON file per key, shareable between processes

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::StoreConfig;
use crate::error::{CubeForgeError, Result};

/// Version passed to [`MetadataStore::put`] when the key must not exist yet.
pub const ABSENT: u64 = 0;

const MAX_CAS_RETRIES: u32 = 8;
const BASE_BACKOFF_MS: u64 = 5;

/// A stored document together with its version token.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned {
    pub value: serde_json::Value,
    pub version: u64,
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Read a document and its current version.
    async fn get(&self, key: &str) -> Result<Option<Versioned>>;

    /// Write `value` if the stored version equals `expected_version`
    /// ([`ABSENT`] for create). Returns the new version.
    async fn put(&self, key: &str, value: serde_json::Value, expected_version: u64) -> Result<u64>;

    /// Remove a document if the stored version equals `expected_version`.
    async fn delete(&self, key: &str, expected_version: u64) -> Result<()>;

    /// All keys starting with `prefix`, sorted.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Build the store described by `config`.
pub async fn open(config: &StoreConfig) -> Result<Arc<dyn MetadataStore>> {
    match &config.data_dir {
        Some(dir) => Ok(Arc::new(FileStore::open(dir).await?)),
        None => Ok(Arc::new(MemoryStore::new())),
    }
}

pub(crate) fn conflict(key: &str, expected: u64, actual: u64) -> CubeForgeError {
    CubeForgeError::ConcurrencyConflict {
        key: key.to_string(),
        expected,
        actual,
    }
}

/// Read and decode a typed document.
pub async fn get_typed<T: DeserializeOwned>(
    store: &dyn MetadataStore,
    key: &str,
) -> Result<Option<(T, u64)>> {
    match store.get(key).await? {
        Some(v) => Ok(Some((serde_json::from_value(v.value)?, v.version))),
        None => Ok(None),
    }
}

/// Encode and conditionally write a typed document.
pub async fn put_typed<T: Serialize>(
    store: &dyn MetadataStore,
    key: &str,
    value: &T,
    expected_version: u64,
) -> Result<u64> {
    store
        .put(key, serde_json::to_value(value)?, expected_version)
        .await
}

/// Run one read-modify-write cycle until it commits without a version
/// conflict, backing off exponentially (with jitter) between attempts.
///
/// Any error other than a conflict aborts immediately.
pub async fn retry_on_conflict<T, F, Fut>(context: &str, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    for n in 0..MAX_CAS_RETRIES {
        match attempt().await {
            Err(e) if e.is_conflict() => {
                let base = BASE_BACKOFF_MS * 2_u64.pow(n);
                let jitter = rand::thread_rng().gen_range(0..=base);
                tracing::debug!(
                    context,
                    attempt = n + 1,
                    backoff_ms = base + jitter,
                    "Version conflict, retrying"
                );
                tokio::time::sleep(Duration::from_millis(base + jitter)).await;
            }
            other => return other,
        }
    }
    tracing::warn!(context, attempts = MAX_CAS_RETRIES, "Giving up after repeated conflicts");
    Err(CubeForgeError::TooManyRetries(MAX_CAS_RETRIES))
}
