//! Per-key single-writer locks
//!
//! Writers to the same account (or account + contest, or submission) queue
//! behind one async mutex; writers to different keys never contend.
//!
//! Lock order, always: account → contest → submission. Multi-account
//! operations lock accounts in sorted order.
//!
//! A key's mutex lives only while someone holds or waits on it: the last
//! [`KeyGuard`] to drop removes the entry.

use crate::types::AccountId;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Lock scope
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockKey {
    /// Balance, entitlements and ledger of one account
    Account(AccountId),
    /// Contest activity of one account
    Contest(AccountId, String),
    /// Tally of one submission
    Submission(String),
}

type LockMap = DashMap<LockKey, Arc<Mutex<()>>>;

/// Registry of per-key async mutexes
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: Arc<LockMap>,
}

/// Exclusive access to one key; releases the key's entry when last out
#[derive(Debug)]
pub struct KeyGuard {
    guard: Option<OwnedMutexGuard<()>>,
    key: LockKey,
    locks: Arc<LockMap>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        // Unlock first so our own reference no longer counts
        drop(self.guard.take());
        // Waiters clone the Arc under the shard lock, so a count of one
        // (the map's) means nobody else can be holding or queued
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

impl KeyedLocks {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: LockKey) -> KeyGuard {
        // Clone the Arc out so the shard guard is released before awaiting
        let mutex = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        KeyGuard {
            guard: Some(mutex.lock_owned().await),
            key,
            locks: self.locks.clone(),
        }
    }

    /// Lock several accounts in sorted order
    pub async fn lock_accounts(&self, ids: &[AccountId]) -> Vec<KeyGuard> {
        let mut sorted = ids.to_vec();
        sorted.sort();
        sorted.dedup();

        let mut guards = Vec::with_capacity(sorted.len());
        for id in sorted {
            guards.push(self.lock(LockKey::Account(id)).await);
        }
        guards
    }

    /// Drop mutexes nobody holds or waits on.
    ///
    /// Guards clean up after themselves; this catches entries stranded by a
    /// lock future dropped while queued.
    pub fn prune(&self) {
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no keys are tracked
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
