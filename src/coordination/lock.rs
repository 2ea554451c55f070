use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::Result;

/// Store with atomic "set if absent, with expiry" semantics.
///
/// Any external store offering that primitive can back the execution lock;
/// the coordinator only sees these two calls.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LockStore: Send + Sync {
    /// `Ok(false)` when the key is held and not yet expired
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn release(&self, key: &str) -> Result<()>;
}

pub fn lock_key(owner: &str) -> String {
    format!("lock:owner:{}:trade", owner)
}

/// Single-process lock store with TTL expiry
#[derive(Debug, Default)]
pub struct InMemoryLockStore {
    locks: DashMap<String, Instant>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.locks
            .get(key)
            .map(|expiry| *expiry > Instant::now())
            .unwrap_or(false)
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        match self.locks.entry(key.to_string()) {
            Entry::Occupied(mut held) => {
                if *held.get() > now {
                    return Ok(false);
                }
                debug!(key, "Taking over expired lock");
                held.insert(now + ttl);
                Ok(true)
            }
            Entry::Vacant(slot) => {
                slot.insert(now + ttl);
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str) -> Result<()> {
        self.locks.remove_if(key, |_, expiry| *expiry > Instant::now());
        Ok(())
    }
}

/// Held execution lock. Release explicitly with [`LockGuard::release`];
/// dropping an unreleased guard schedules the release on the runtime.
///
/// Once its lease has run out the guard no longer owns the key, so release
/// becomes a no-op instead of freeing whoever took the lock over.
pub struct LockGuard {
    store: Arc<dyn LockStore>,
    key: String,
    deadline: Instant,
    released: bool,
}

impl LockGuard {
    /// Try once, waiting at most `wait` for the store to answer.
    /// `Ok(None)` means the lock is held elsewhere or the store was too slow.
    pub async fn acquire(
        store: Arc<dyn LockStore>,
        key: String,
        ttl: Duration,
        wait: Duration,
    ) -> Result<Option<LockGuard>> {
        // Taken before asking so the guard never outlives the store's expiry
        let deadline = Instant::now() + ttl;
        match tokio::time::timeout(wait, store.try_acquire(&key, ttl)).await {
            Ok(Ok(true)) => Ok(Some(LockGuard {
                store,
                key,
                deadline,
                released: false,
            })),
            Ok(Ok(false)) => Ok(None),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(key = %key, "Lock store did not answer within {:?}", wait);
                Ok(None)
            }
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        if self.is_expired() {
            warn!(key = %self.key, "Lease expired before release, leaving the key to its current holder");
            return Ok(());
        }
        self.store.release(&self.key).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if self.is_expired() {
            warn!(key = %self.key, "Dropped guard outlived its lease");
            return;
        }
        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = store.release(&key).await {
                        warn!(key = %key, "Deferred lock release failed: {}", e);
                    }
                });
            }
            // TTL expiry frees it
            Err(_) => warn!(key = %key, "Lock dropped outside a runtime"),
        }
    }
}
