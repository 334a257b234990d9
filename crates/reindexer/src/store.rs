use crate::{Reindexing, ReindexerError, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Proof of holding a store's reindexing lock. Give it back through [`ReindexingStore::unlock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    owner: String,
}

impl LockHandle {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
        }
    }

    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }
}

/// Durable home of a cluster's [`Reindexing`] snapshot, and the lock serializing reindexing
/// passes over it.
///
/// Methods may block, and are called both from the reindexing task and from visit session
/// callbacks.
pub trait ReindexingStore: Send + Sync {
    /// Reads the current snapshot; a store that was never written reads as empty.
    fn read(&self) -> Result<Reindexing>;

    /// Overwrites the stored snapshot with `reindexing`.
    fn write(&self, reindexing: &Reindexing) -> Result<()>;

    /// Blocks for at most `timeout` to take the lock, failing with
    /// [`ReindexerError::LockContention`] if it is held elsewhere.
    fn lock(&self, timeout: Duration) -> Result<LockHandle>;

    fn unlock(&self, handle: LockHandle) -> Result<()>;

    /// Extends the lease behind `handle`, for stores whose locks expire.
    fn renew(&self, _handle: &LockHandle) -> Result<()> {
        Ok(())
    }

    /// How often a holder must [`renew`](ReindexingStore::renew) to keep the lock, or `None` if
    /// the lock is held until unlocked.
    fn renewal_interval(&self) -> Option<Duration> {
        None
    }
}

/// Process-local store. The lock excludes other holders of the same instance only.
#[derive(Debug)]
pub struct InMemoryReindexingStore {
    cluster: String,
    state: Mutex<MemoryState>,
    unlocked: Condvar,
    next_owner: AtomicU64,
}

#[derive(Debug, Default)]
struct MemoryState {
    reindexing: Reindexing,
    owner: Option<String>,
}

impl InMemoryReindexingStore {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            state: Mutex::new(MemoryState::default()),
            unlocked: Condvar::new(),
            next_owner: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .owner
            .is_some()
    }
}

impl ReindexingStore for InMemoryReindexingStore {
    fn read(&self) -> Result<Reindexing> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(state.reindexing.clone())
    }

    fn write(&self, reindexing: &Reindexing) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.reindexing = reindexing.clone();
        Ok(())
    }

    fn lock(&self, timeout: Duration) -> Result<LockHandle> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        while state.owner.is_some() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ReindexerError::LockContention {
                    cluster: self.cluster.clone(),
                    timeout,
                });
            }
            state = self
                .unlocked
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        let owner = format!(
            "{}-{}",
            self.cluster,
            self.next_owner.fetch_add(1, Ordering::Relaxed)
        );
        state.owner = Some(owner.clone());
        Ok(LockHandle::new(owner))
    }

    fn unlock(&self, handle: LockHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.owner.as_deref() != Some(handle.owner()) {
            return Err(ReindexerError::Other(format!(
                "reindexing lock for cluster '{}' is not held by {}",
                self.cluster,
                handle.owner()
            )));
        }
        state.owner = None;
        drop(state);
        self.unlocked.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DocumentType, Status};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::UNIX_EPOCH;

    #[test]
    fn unwritten_store_reads_empty() {
        let store = InMemoryReindexingStore::new("cluster");
        assert_eq!(store.read().unwrap(), Reindexing::empty());
    }

    #[test]
    fn write_replaces_snapshot() {
        let store = InMemoryReindexingStore::new("cluster");
        let reindexing = Reindexing::empty().with(
            DocumentType::new("music"),
            Status::ready(UNIX_EPOCH).running().successful(UNIX_EPOCH),
        );
        store.write(&reindexing).unwrap();
        assert_eq!(store.read().unwrap(), reindexing);

        store.write(&Reindexing::empty()).unwrap();
        assert_eq!(store.read().unwrap(), Reindexing::empty());
    }

    #[test]
    fn lock_times_out_while_held() {
        let store = InMemoryReindexingStore::new("cluster");
        let handle = store.lock(Duration::ZERO).unwrap();
        assert!(store.is_locked());

        let err = store.lock(Duration::from_millis(5)).unwrap_err();
        assert!(err.is_lock_contention());

        store.unlock(handle).unwrap();
        assert!(!store.is_locked());
        let again = store.lock(Duration::ZERO).unwrap();
        store.unlock(again).unwrap();
    }

    #[test]
    fn waiter_takes_lock_once_released() {
        let store = Arc::new(InMemoryReindexingStore::new("cluster"));
        let handle = store.lock(Duration::ZERO).unwrap();

        let waiter = {
            let store = store.clone();
            std::thread::spawn(move || store.lock(Duration::from_secs(10)))
        };
        std::thread::sleep(Duration::from_millis(20));
        store.unlock(handle).unwrap();

        let taken = waiter.join().unwrap().unwrap();
        assert!(store.is_locked());
        store.unlock(taken).unwrap();
    }

    #[test]
    fn unlock_rejects_foreign_handle() {
        let store = InMemoryReindexingStore::new("cluster");
        let handle = store.lock(Duration::ZERO).unwrap();
        assert!(store.unlock(LockHandle::new("someone-else")).is_err());
        store.unlock(handle).unwrap();
    }
}
