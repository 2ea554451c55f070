//! Cross-request coordination: the per-owner execution lock

mod lock;

pub use lock::{lock_key, InMemoryLockStore, LockGuard, LockStore};

#[cfg(test)]
pub use lock::MockLockStore;
