use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::record::{Account, RecordId};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JobTarget {
    Folder(String),
    File(RecordId),
}

/// De-duplication key for in-flight reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SyncJobKey {
    pub account: Account,
    pub target: JobTarget,
}

impl SyncJobKey {
    pub fn folder(account: &Account, path: impl Into<String>) -> Self {
        Self {
            account: account.clone(),
            target: JobTarget::Folder(path.into()),
        }
    }

    pub fn file(account: &Account, id: &RecordId) -> Self {
        Self {
            account: account.clone(),
            target: JobTarget::File(id.clone()),
        }
    }
}

impl fmt::Display for SyncJobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            JobTarget::Folder(path) => write!(f, "{}:folder:{path}", self.account),
            JobTarget::File(id) => write!(f, "{}:file:{id}", self.account),
        }
    }
}

/// Set of keys currently being reconciled. A key is either absent (idle) or
/// present (in progress); failures return it to idle.
#[derive(Debug, Default)]
pub struct JobTracker {
    in_flight: Mutex<HashSet<SyncJobKey>>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomic test-and-set. Returns false if `key` is already in progress.
    pub fn try_acquire(&self, key: &SyncJobKey) -> bool {
        self.lock().insert(key.clone())
    }

    /// Clears the marker for `key`. Releasing an idle key is a no-op.
    pub fn release(&self, key: &SyncJobKey) {
        self.lock().remove(key);
    }

    pub fn is_in_flight(&self, key: &SyncJobKey) -> bool {
        self.lock().contains(key)
    }

    pub fn in_flight(&self) -> Vec<SyncJobKey> {
        self.lock().iter().cloned().collect()
    }

    /// Like `try_acquire`, but the returned guard releases the key on drop,
    /// whichever way the holder exits.
    pub fn acquire(self: &Arc<Self>, key: SyncJobKey) -> Option<JobGuard> {
        if !self.try_acquire(&key) {
            return None;
        }
        Some(JobGuard {
            tracker: Arc::clone(self),
            key,
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<SyncJobKey>> {
        // The set stays consistent even if a holder panicked mid-insert.
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
pub struct JobGuard {
    tracker: Arc<JobTracker>,
    key: SyncJobKey,
}

impl JobGuard {
    pub fn key(&self) -> &SyncJobKey {
        &self.key
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.tracker.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Account {
        Account::new("alice")
    }

    #[test]
    fn second_acquire_fails_until_release() {
        let tracker = JobTracker::new();
        let key = SyncJobKey::folder(&alice(), "/Photos");

        assert!(tracker.try_acquire(&key));
        assert!(!tracker.try_acquire(&key));
        tracker.release(&key);
        assert!(tracker.try_acquire(&key));
    }

    #[test]
    fn release_of_idle_key_is_noop() {
        let tracker = JobTracker::new();
        let key = SyncJobKey::folder(&alice(), "/Photos");

        tracker.release(&key);
        tracker.release(&key);
        assert!(!tracker.is_in_flight(&key));
        assert!(tracker.try_acquire(&key));
    }

    #[test]
    fn keys_are_scoped_by_account_and_target() {
        let tracker = JobTracker::new();
        let folder = SyncJobKey::folder(&alice(), "/Photos");
        let other_account = SyncJobKey::folder(&Account::new("bob"), "/Photos");
        let file = SyncJobKey::file(&alice(), &RecordId::new("/Photos"));

        assert!(tracker.try_acquire(&folder));
        assert!(tracker.try_acquire(&other_account));
        assert!(tracker.try_acquire(&file));
        assert_eq!(tracker.in_flight().len(), 3);
    }

    #[test]
    fn guard_releases_on_drop() {
        let tracker = Arc::new(JobTracker::new());
        let key = SyncJobKey::folder(&alice(), "/Docs");

        let guard = tracker.acquire(key.clone()).unwrap();
        assert_eq!(guard.key(), &key);
        assert!(tracker.acquire(key.clone()).is_none());
        drop(guard);
        assert!(!tracker.is_in_flight(&key));
        assert!(tracker.acquire(key).is_some());
    }

    #[test]
    fn concurrent_acquire_has_single_winner() {
        let tracker = Arc::new(JobTracker::new());
        let key = SyncJobKey::folder(&alice(), "/Shared");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                let key = key.clone();
                std::thread::spawn(move || tracker.try_acquire(&key))
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
    }
}
