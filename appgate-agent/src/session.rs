//! The per-identity session cache.
//!
//! Requests of the same application session share one forwarder (one signed
//! JWT, one upstream client) through a refcounted cache entry. Idle entries
//! are evicted by a background sweeper; shutdown drains everything.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use appgate_common::errors::Result;

/// How long an unreferenced session lingers before eviction.
pub const SESSION_IDLE_TTL: Duration = Duration::from_secs(5 * 60);

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// One cached session.
#[derive(Debug)]
pub struct SessionEntry<T> {
    /// The session payload (the HTTP forwarder).
    pub value: T,
    refs: AtomicUsize,
    last_release_millis: AtomicU64,
}

impl<T> SessionEntry<T> {
    fn new(value: T, epoch: Instant) -> Self {
        let entry = Self {
            value,
            refs: AtomicUsize::new(0),
            last_release_millis: AtomicU64::new(0),
        };
        entry
            .last_release_millis
            .store(epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
        entry
    }
}

/// A refcounted cache keyed by session id.
pub struct SessionCache<T> {
    entries: Arc<Mutex<HashMap<String, Arc<SessionEntry<T>>>>>,
    epoch: Instant,
    idle_ttl: Duration,
    sweeper: JoinHandle<()>,
}

impl<T: Send + Sync + 'static> SessionCache<T> {
    /// A cache with the default idle TTL.
    pub fn new() -> Self {
        Self::with_idle_ttl(SESSION_IDLE_TTL)
    }

    /// A cache with a custom idle TTL.
    pub fn with_idle_ttl(idle_ttl: Duration) -> Self {
        let entries: Arc<Mutex<HashMap<String, Arc<SessionEntry<T>>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let epoch = Instant::now();

        let sweeper = {
            let entries = entries.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(SWEEP_INTERVAL).await;
                    let now = epoch.elapsed();
                    entries.lock().unwrap().retain(|_, entry| {
                        if entry.refs.load(Ordering::Acquire) > 0 {
                            return true;
                        }
                        let last = Duration::from_millis(
                            entry.last_release_millis.load(Ordering::Relaxed),
                        );
                        now.saturating_sub(last) < idle_ttl
                    });
                }
            })
        };

        Self {
            entries,
            epoch,
            idle_ttl,
            sweeper,
        }
    }

    /// Fetch the session, creating it with `make` on a miss. The entry's
    /// refcount is incremented; pair with [`SessionCache::release`].
    pub fn acquire<F>(&self, session_id: &str, make: F) -> Result<Arc<SessionEntry<T>>>
    where
        F: FnOnce() -> Result<T>,
    {
        let mut entries = self.entries.lock().unwrap();
        let entry = match entries.get(session_id) {
            Some(entry) => entry.clone(),
            None => {
                let entry = Arc::new(SessionEntry::new(make()?, self.epoch));
                entries.insert(session_id.to_string(), entry.clone());
                entry
            }
        };
        entry.refs.fetch_add(1, Ordering::AcqRel);
        Ok(entry)
    }

    /// Release one reference taken by [`SessionCache::acquire`].
    pub fn release(&self, session_id: &str) {
        let entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get(session_id) {
            entry.refs.fetch_sub(1, Ordering::AcqRel);
            entry
                .last_release_millis
                .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
        }
    }

    /// The number of cached sessions.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// True when no sessions are cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every session; used on shutdown.
    pub fn close_all_sessions(&self) {
        self.entries.lock().unwrap().clear();
    }

    #[cfg(test)]
    fn sweep_now(&self) {
        let now = self.epoch.elapsed();
        let idle_ttl = self.idle_ttl;
        self.entries.lock().unwrap().retain(|_, entry| {
            if entry.refs.load(Ordering::Acquire) > 0 {
                return true;
            }
            let last = Duration::from_millis(entry.last_release_millis.load(Ordering::Relaxed));
            now.saturating_sub(last) < idle_ttl
        });
    }
}

impl<T: Send + Sync + 'static> Default for SessionCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for SessionCache<T> {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn entries_are_shared_per_session() {
        let cache: SessionCache<u32> = SessionCache::new();
        let mut built = 0;
        let first = cache
            .acquire("s1", || {
                built += 1;
                Ok(7)
            })
            .unwrap();
        let second = cache
            .acquire("s1", || {
                built += 1;
                Ok(8)
            })
            .unwrap();
        assert_eq!(built, 1);
        assert_eq!(first.value, 7);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn referenced_entries_survive_sweeps() {
        let cache: SessionCache<u32> = SessionCache::with_idle_ttl(Duration::ZERO);
        let _held = cache.acquire("s1", || Ok(1)).unwrap();
        cache.sweep_now();
        assert_eq!(cache.len(), 1);

        cache.release("s1");
        cache.sweep_now();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn idle_entries_expire_after_ttl() {
        let cache: SessionCache<u32> = SessionCache::with_idle_ttl(Duration::from_millis(10));
        cache.acquire("s1", || Ok(1)).unwrap();
        cache.release("s1");

        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.sweep_now();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn close_all_drains() {
        let cache: SessionCache<u32> = SessionCache::new();
        cache.acquire("s1", || Ok(1)).unwrap();
        cache.acquire("s2", || Ok(2)).unwrap();
        cache.close_all_sessions();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn make_failure_is_propagated_and_not_cached() {
        let cache: SessionCache<u32> = SessionCache::new();
        let err = cache
            .acquire("s1", || {
                Err(appgate_common::errors::Error::access_denied("nope"))
            })
            .unwrap_err();
        assert!(err.is_access_denied());
        assert!(cache.is_empty());
    }
}
