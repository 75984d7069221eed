use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use super::Lease;
use crate::error::{CubeForgeError, Result};
use crate::store::{self, MetadataStore, ABSENT};

const LEASE_PREFIX: &str = "leases/";

/// Persisted lease document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub holder: String,
    /// Fresh per acquisition, so a holder that lost and re-took the lease
    /// cannot renew with a stale grant.
    pub token: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LeaseRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone)]
struct Grant {
    token: Uuid,
    ttl: Duration,
    expires_at: DateTime<Utc>,
}

/// [`Lease`] kept as a versioned document in the metadata store. Every
/// acquire and renew is a conditional write, so two contenders can never
/// both succeed against the same record version.
pub struct StoreLease {
    store: Arc<dyn MetadataStore>,
    key: String,
    holder: String,
    grant: Mutex<Option<Grant>>,
    held: watch::Sender<bool>,
}

impl StoreLease {
    pub fn new(store: Arc<dyn MetadataStore>, name: &str, holder: impl Into<String>) -> Self {
        let (held, _) = watch::channel(false);
        Self {
            store,
            key: format!("{}{}", LEASE_PREFIX, name),
            holder: holder.into(),
            grant: Mutex::new(None),
            held,
        }
    }

    /// Current lease document, whoever holds it.
    pub async fn current(&self) -> Result<Option<LeaseRecord>> {
        Ok(store::get_typed::<LeaseRecord>(self.store.as_ref(), &self.key)
            .await?
            .map(|(record, _)| record))
    }

    fn to_chrono(ttl: Duration) -> Result<chrono::Duration> {
        chrono::Duration::from_std(ttl)
            .map_err(|e| CubeForgeError::Validation(format!("lease ttl out of range: {}", e)))
    }

    fn lose(&self, grant: &mut Option<Grant>, reason: &str) -> CubeForgeError {
        if grant.take().is_some() {
            tracing::warn!(lease = %self.key, holder = %self.holder, reason, "Lease lost");
        }
        self.held.send_replace(false);
        CubeForgeError::LeaseLost(self.key.clone())
    }
}

#[async_trait]
impl Lease for StoreLease {
    fn holder(&self) -> &str {
        &self.holder
    }

    async fn acquire(&self, ttl: Duration) -> Result<bool> {
        let mut grant = self.grant.lock().await;
        let now = Utc::now();
        let existing = store::get_typed::<LeaseRecord>(self.store.as_ref(), &self.key).await?;

        let expected = match &existing {
            None => ABSENT,
            Some((record, version)) => {
                let ours = grant.as_ref().map(|g| g.token) == Some(record.token);
                if !ours && !record.is_expired(now) {
                    return Ok(false);
                }
                if !ours {
                    tracing::info!(
                        lease = %self.key,
                        previous = %record.holder,
                        expired_at = %record.expires_at,
                        "Taking over expired lease"
                    );
                }
                *version
            }
        };

        let record = LeaseRecord {
            holder: self.holder.clone(),
            token: Uuid::new_v4(),
            acquired_at: now,
            expires_at: now + Self::to_chrono(ttl)?,
        };
        match store::put_typed(self.store.as_ref(), &self.key, &record, expected).await {
            Ok(_) => {}
            // Another contender wrote first.
            Err(e) if e.is_conflict() => return Ok(false),
            Err(e) => return Err(e),
        }

        *grant = Some(Grant {
            token: record.token,
            ttl,
            expires_at: record.expires_at,
        });
        self.held.send_replace(true);
        tracing::info!(lease = %self.key, holder = %self.holder, ttl_ms = ttl.as_millis() as u64, "Lease acquired");
        Ok(true)
    }

    async fn renew(&self) -> Result<()> {
        let mut grant = self.grant.lock().await;
        let Some(current) = grant.clone() else {
            return Err(CubeForgeError::LeaseLost(self.key.clone()));
        };

        let now = Utc::now();
        let Some((record, version)) =
            store::get_typed::<LeaseRecord>(self.store.as_ref(), &self.key).await?
        else {
            return Err(self.lose(&mut grant, "record deleted"));
        };
        if record.token != current.token {
            return Err(self.lose(&mut grant, "taken over"));
        }
        if record.is_expired(now) {
            return Err(self.lose(&mut grant, "expired before renewal"));
        }

        let renewed = LeaseRecord {
            expires_at: now + Self::to_chrono(current.ttl)?,
            ..record
        };
        match store::put_typed(self.store.as_ref(), &self.key, &renewed, version).await {
            Ok(_) => {}
            Err(e) if e.is_conflict() => return Err(self.lose(&mut grant, "concurrent write")),
            Err(e) => return Err(e),
        }

        if let Some(g) = grant.as_mut() {
            g.expires_at = renewed.expires_at;
        }
        tracing::debug!(lease = %self.key, expires_at = %renewed.expires_at, "Lease renewed");
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        let mut grant = self.grant.lock().await;
        let Some(current) = grant.take() else {
            self.held.send_replace(false);
            return Ok(());
        };
        self.held.send_replace(false);

        if let Some((record, version)) =
            store::get_typed::<LeaseRecord>(self.store.as_ref(), &self.key).await?
        {
            if record.token == current.token {
                match self.store.delete(&self.key, version).await {
                    Ok(()) => {}
                    // Changed hands in the meantime; nothing of ours to remove.
                    Err(e) if e.is_conflict() => {}
                    Err(e) => return Err(e),
                }
            }
        }
        tracing::info!(lease = %self.key, holder = %self.holder, "Lease released");
        Ok(())
    }

    async fn is_held(&self) -> bool {
        let grant = self.grant.lock().await;
        grant
            .as_ref()
            .map(|g| g.expires_at > Utc::now())
            .unwrap_or(false)
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.held.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    const TTL: Duration = Duration::from_millis(200);

    fn pair() -> (StoreLease, StoreLease) {
        let store: Arc<dyn MetadataStore> = Arc::new(MemoryStore::new());
        (
            StoreLease::new(store.clone(), "scheduler", "node-a"),
            StoreLease::new(store, "scheduler", "node-b"),
        )
    }

    #[tokio::test]
    async fn test_only_one_holder() {
        let (a, b) = pair();
        assert!(a.acquire(TTL).await.unwrap());
        assert!(!b.acquire(TTL).await.unwrap());
        assert!(a.is_held().await);
        assert!(!b.is_held().await);
        assert_eq!(a.current().await.unwrap().unwrap().holder, "node-a");
    }

    #[tokio::test]
    async fn test_release_lets_other_acquire() {
        let (a, b) = pair();
        let mut rx = a.subscribe();
        assert!(a.acquire(TTL).await.unwrap());
        assert!(*rx.borrow_and_update());

        a.release().await.unwrap();
        assert!(!*rx.borrow_and_update());
        assert!(b.acquire(TTL).await.unwrap());
        assert!(a.renew().await.is_err());
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over_and_old_holder_cannot_renew() {
        let (a, b) = pair();
        let mut rx = a.subscribe();
        assert!(a.acquire(Duration::from_millis(30)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!a.is_held().await);

        assert!(b.acquire(TTL).await.unwrap());
        assert!(matches!(a.renew().await, Err(CubeForgeError::LeaseLost(_))));
        rx.changed().await.unwrap();
        assert!(!*rx.borrow());
        assert!(b.renew().await.is_ok());
    }

    #[tokio::test]
    async fn test_renew_extends_expiry() {
        let (a, _) = pair();
        assert!(a.acquire(TTL).await.unwrap());
        let before = a.current().await.unwrap().unwrap().expires_at;
        tokio::time::sleep(Duration::from_millis(10)).await;
        a.renew().await.unwrap();
        let after = a.current().await.unwrap().unwrap().expires_at;
        assert!(after > before);
    }

    #[tokio::test]
    async fn test_reacquire_by_holder_refreshes_token() {
        let (a, b) = pair();
        assert!(a.acquire(TTL).await.unwrap());
        let first = a.current().await.unwrap().unwrap().token;
        assert!(a.acquire(TTL).await.unwrap());
        let second = a.current().await.unwrap().unwrap().token;
        assert_ne!(first, second);
        assert!(!b.acquire(TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_without_grant_is_noop() {
        let (a, b) = pair();
        assert!(b.acquire(TTL).await.unwrap());
        a.release().await.unwrap();
        assert!(b.is_held().await);
        assert!(b.current().await.unwrap().is_some());
    }
}
