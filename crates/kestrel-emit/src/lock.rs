//! Per-account serialization of counter resolution.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Held while a counter block is being resolved for one account.
/// Dropping it lets the next resolution for the same account proceed.
#[must_use = "the account is only serialized while the guard is held"]
pub struct AccountGuard {
    _guard: Option<OwnedMutexGuard<()>>,
}

impl AccountGuard {
    /// A guard that serializes nothing.
    pub fn unlocked() -> Self {
        Self { _guard: None }
    }
}

/// Mutual exclusion keyed by account address.
#[async_trait]
pub trait AccountLock: Send + Sync {
    async fn acquire(&self, account: &str) -> AccountGuard;
}

/// One async mutex per account. Unrelated accounts never wait on each other.
/// Entries nobody holds or waits on are dropped on the next acquire.
#[derive(Default)]
pub struct PerAccountLock {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PerAccountLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of accounts in the lock table.
    pub async fn tracked_accounts(&self) -> usize {
        self.locks.lock().await.len()
    }
}

#[async_trait]
impl AccountLock for PerAccountLock {
    async fn acquire(&self, account: &str) -> AccountGuard {
        let lock = {
            let mut locks = self.locks.lock().await;
            // A guard or a waiter holds its own clone of the mutex.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry(account.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        AccountGuard {
            _guard: Some(lock.lock_owned().await),
        }
    }
}

/// No serialization. Concurrent builds for one account may collide.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unserialized;

#[async_trait]
impl AccountLock for Unserialized {
    async fn acquire(&self, _account: &str) -> AccountGuard {
        AccountGuard::unlocked()
    }
}
