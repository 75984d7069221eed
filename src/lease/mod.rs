//! Cluster-wide exclusive lease that decides which scheduler instance may
//! dispatch work.

mod store_lease;

pub use store_lease::{LeaseRecord, StoreLease};

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::watch;

use crate::error::Result;

/// A renewable, time-bounded mutual-exclusion right.
///
/// Holding is never assumed: once the TTL passes without a successful
/// [`renew`](Lease::renew), any other contender may take the lease over.
#[async_trait]
pub trait Lease: Send + Sync {
    /// Identity this instance writes into the lease.
    fn holder(&self) -> &str;

    /// Try to take the lease for `ttl`. `Ok(false)` means someone else
    /// holds it.
    async fn acquire(&self, ttl: Duration) -> Result<bool>;

    /// Extend the lease by its TTL. Fails with `LeaseLost` if it expired or
    /// was taken over.
    async fn renew(&self) -> Result<()>;

    /// Give the lease up so another instance can take it immediately.
    async fn release(&self) -> Result<()>;

    /// Held and not past its local expiry.
    async fn is_held(&self) -> bool;

    /// Flips to `false` when the lease is lost or released.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// `base` plus up to 50% random extra, so contenders do not retry in step.
pub fn jittered(base: Duration) -> Duration {
    let base_ms = base.as_millis() as u64;
    let extra = rand::thread_rng().gen_range(0..=base_ms / 2);
    Duration::from_millis(base_ms + extra)
}
