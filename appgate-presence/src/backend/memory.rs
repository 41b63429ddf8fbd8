//! In-memory backend: the system of record for tests and single-process
//! runs. External storage drivers implement the same [`Backend`] contract.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

use async_trait::async_trait;

use appgate_common::errors::{Error, Result};

use super::{Backend, Item, Key, Lease};

#[derive(Debug, Clone)]
struct Stored {
    value: Vec<u8>,
    expires: Option<SystemTime>,
    resource_id: i64,
}

impl Stored {
    fn live(&self, now: SystemTime) -> bool {
        match self.expires {
            Some(expires) => expires > now,
            None => true,
        }
    }
}

/// A `BTreeMap`-backed [`Backend`] with lazy expiry.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<BTreeMap<Vec<u8>, Stored>>,
    next_id: AtomicI64,
}

impl MemoryBackend {
    /// A fresh, empty backend.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BTreeMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    fn allocate_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn item(key: &[u8], stored: &Stored) -> Item {
        Item {
            key: Key::from_bytes(key.to_vec()),
            value: stored.value.clone(),
            expires: stored.expires,
            resource_id: stored.resource_id,
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get(&self, key: &Key) -> Result<Item> {
        let now = SystemTime::now();
        let mut state = self.state.lock().unwrap();
        match state.get(key.as_bytes()) {
            Some(stored) if stored.live(now) => Ok(Self::item(key.as_bytes(), stored)),
            Some(_) => {
                state.remove(key.as_bytes());
                Err(Error::not_found(format!("key {key} is not found")))
            }
            None => Err(Error::not_found(format!("key {key} is not found"))),
        }
    }

    async fn put(&self, item: Item) -> Result<Lease> {
        let id = self.allocate_id();
        let mut state = self.state.lock().unwrap();
        state.insert(
            item.key.as_bytes().to_vec(),
            Stored {
                value: item.value,
                expires: item.expires,
                resource_id: id,
            },
        );
        Ok(Lease { id, key: item.key })
    }

    async fn create(&self, item: Item) -> Result<Lease> {
        let now = SystemTime::now();
        let mut state = self.state.lock().unwrap();
        if let Some(stored) = state.get(item.key.as_bytes()) {
            if stored.live(now) {
                return Err(Error::already_exists(format!(
                    "key {} already exists",
                    item.key
                )));
            }
        }
        let id = self.allocate_id();
        state.insert(
            item.key.as_bytes().to_vec(),
            Stored {
                value: item.value,
                expires: item.expires,
                resource_id: id,
            },
        );
        Ok(Lease { id, key: item.key })
    }

    async fn update(&self, item: Item) -> Result<Lease> {
        let now = SystemTime::now();
        let mut state = self.state.lock().unwrap();
        match state.get(item.key.as_bytes()) {
            Some(stored) if stored.live(now) => {
                let id = self.allocate_id();
                state.insert(
                    item.key.as_bytes().to_vec(),
                    Stored {
                        value: item.value,
                        expires: item.expires,
                        resource_id: id,
                    },
                );
                Ok(Lease { id, key: item.key })
            }
            _ => Err(Error::not_found(format!("key {} is not found", item.key))),
        }
    }

    async fn compare_and_swap(&self, expected: Item, replace: Item) -> Result<Lease> {
        if expected.key != replace.key {
            return Err(Error::bad_parameter("compare-and-swap keys differ"));
        }
        let now = SystemTime::now();
        let mut state = self.state.lock().unwrap();
        let stored = match state.get(expected.key.as_bytes()) {
            Some(stored) if stored.live(now) => stored,
            _ => {
                return Err(Error::not_found(format!(
                    "key {} is not found",
                    expected.key
                )))
            }
        };
        if stored.value != expected.value {
            return Err(Error::compare_failed(format!(
                "key {} was concurrently modified",
                expected.key
            )));
        }
        let id = self.allocate_id();
        state.insert(
            replace.key.as_bytes().to_vec(),
            Stored {
                value: replace.value,
                expires: replace.expires,
                resource_id: id,
            },
        );
        Ok(Lease {
            id,
            key: replace.key,
        })
    }

    async fn delete(&self, key: &Key) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.remove(key.as_bytes()) {
            Some(_) => Ok(()),
            None => Err(Error::not_found(format!("key {key} is not found"))),
        }
    }

    async fn delete_range(&self, start: &Key, end: &Key) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let doomed: Vec<Vec<u8>> = state
            .range::<[u8], _>((
                Bound::Included(start.as_bytes()),
                Bound::Included(end.as_bytes()),
            ))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            state.remove(&key);
        }
        Ok(())
    }

    async fn get_range(&self, start: &Key, end: &Key, limit: usize) -> Result<Vec<Item>> {
        let now = SystemTime::now();
        let state = self.state.lock().unwrap();
        let mut items = Vec::new();
        for (key, stored) in state.range::<[u8], _>((
            Bound::Included(start.as_bytes()),
            Bound::Included(end.as_bytes()),
        )) {
            if !stored.live(now) {
                continue;
            }
            items.push(Self::item(key, stored));
            if limit != 0 && items.len() == limit {
                break;
            }
        }
        Ok(items)
    }

    async fn keep_alive(&self, lease: &Lease, expires: SystemTime) -> Result<()> {
        let now = SystemTime::now();
        let mut state = self.state.lock().unwrap();
        match state.get_mut(lease.key.as_bytes()) {
            Some(stored) if stored.live(now) && stored.resource_id == lease.id => {
                stored.expires = Some(expires);
                Ok(())
            }
            _ => Err(Error::not_found(format!(
                "lease {} on key {} is not found",
                lease.id, lease.key
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn item(key: &Key, value: &str) -> Item {
        Item::new(key.clone(), value.as_bytes().to_vec(), None)
    }

    #[tokio::test]
    async fn put_get_delete() {
        let backend = MemoryBackend::new();
        let key = Key::new(&["nodes", "default", "a"]);

        backend.put(item(&key, "one")).await.unwrap();
        assert_eq!(backend.get(&key).await.unwrap().value, b"one");

        backend.delete(&key).await.unwrap();
        assert!(backend.get(&key).await.unwrap_err().is_not_found());
        assert!(backend.delete(&key).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn create_respects_existing() {
        let backend = MemoryBackend::new();
        let key = Key::new(&["nodes", "default", "a"]);

        backend.create(item(&key, "one")).await.unwrap();
        let err = backend.create(item(&key, "two")).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn expired_items_are_invisible() {
        let backend = MemoryBackend::new();
        let key = Key::new(&["nodes", "default", "a"]);
        let expired = Item::new(
            key.clone(),
            b"stale".to_vec(),
            Some(SystemTime::now() - Duration::from_secs(1)),
        );
        backend.put(expired).await.unwrap();

        assert!(backend.get(&key).await.unwrap_err().is_not_found());
        // A create over an expired item succeeds.
        backend.create(item(&key, "fresh")).await.unwrap();
    }

    #[tokio::test]
    async fn cas_detects_divergence() {
        let backend = MemoryBackend::new();
        let key = Key::new(&["semaphores", "connection", "alice"]);
        backend.put(item(&key, "v1")).await.unwrap();

        let stored = backend.get(&key).await.unwrap();
        backend
            .compare_and_swap(stored.clone(), item(&key, "v2"))
            .await
            .unwrap();

        // The old snapshot no longer matches.
        let err = backend
            .compare_and_swap(stored, item(&key, "v3"))
            .await
            .unwrap_err();
        assert!(err.is_compare_failed());
    }

    #[tokio::test]
    async fn range_is_ascending_and_bounded() {
        let backend = MemoryBackend::new();
        let prefix = Key::new(&["nodes", "default"]);
        for name in ["c", "a", "b", "d"] {
            backend.put(item(&prefix.child(name), name)).await.unwrap();
        }

        let items = backend
            .get_range(&prefix, &prefix.range_end(), 0)
            .await
            .unwrap();
        let names: Vec<_> = items.iter().map(|i| i.value.clone()).collect();
        assert_eq!(names, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);

        let limited = backend
            .get_range(&prefix, &prefix.range_end(), 2)
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn keep_alive_moves_expiry() {
        let backend = MemoryBackend::new();
        let key = Key::new(&["appServers", "default", "h1", "web"]);
        let lease = backend
            .put(Item::new(
                key.clone(),
                b"x".to_vec(),
                Some(SystemTime::now() + Duration::from_secs(1)),
            ))
            .await
            .unwrap();

        let later = SystemTime::now() + Duration::from_secs(600);
        backend.keep_alive(&lease, later).await.unwrap();
        assert_eq!(backend.get(&key).await.unwrap().expires, Some(later));

        // A lease from a previous write no longer refreshes after overwrite.
        backend.put(item(&key, "y")).await.unwrap();
        assert!(backend.keep_alive(&lease, later).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn iterate_range_pages_through_everything() {
        let backend = MemoryBackend::new();
        let prefix = Key::new(&["nodes", "default"]);
        for i in 0..25 {
            let name = format!("node-{i:02}");
            backend.put(item(&prefix.child(&name), &name)).await.unwrap();
        }

        let mut seen = Vec::new();
        super::super::iterate_range(&backend, &prefix, &prefix.range_end(), 10, |it| {
            seen.push(String::from_utf8_lossy(&it.value).to_string());
            Ok(true)
        })
        .await
        .unwrap();
        assert_eq!(seen.len(), 25);
        assert_eq!(seen[0], "node-00");
        assert_eq!(seen[24], "node-24");
    }
}
