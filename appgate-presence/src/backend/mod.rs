//! The key/value backend contract the presence service runs against.
//!
//! Keys are byte paths joined from segments. Items carry a value, an
//! optional expiry and the backend-assigned monotonic resource id. A `put`
//! returns a lease whose id later identifies the item to `keep_alive`.
//! `get_range` returns items in ascending key order; that ordering is the
//! foundation of pagination.

pub mod memory;

use std::fmt;
use std::time::SystemTime;

use async_trait::async_trait;

use appgate_common::errors::Result;

/// The key path separator.
pub const SEPARATOR: u8 = b'/';

/// A backend key: a byte path like `/appServers/default/h1/web`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(Vec<u8>);

impl Key {
    /// Join path segments into a key.
    pub fn new<S: AsRef<str>>(segments: &[S]) -> Self {
        let mut bytes = Vec::new();
        for segment in segments {
            bytes.push(SEPARATOR);
            bytes.extend_from_slice(segment.as_ref().as_bytes());
        }
        Self(bytes)
    }

    /// A key from raw bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Append one more segment.
    pub fn child(&self, segment: &str) -> Self {
        let mut bytes = self.0.clone();
        bytes.push(SEPARATOR);
        bytes.extend_from_slice(segment.as_bytes());
        Self(bytes)
    }

    /// Append raw bytes without a separator.
    pub fn with_suffix(&self, suffix: &[u8]) -> Self {
        let mut bytes = self.0.clone();
        bytes.extend_from_slice(suffix);
        Self(bytes)
    }

    /// The exclusive upper bound for ranging over every key under this
    /// prefix.
    pub fn range_end(&self) -> Self {
        let mut bytes = self.0.clone();
        bytes.push(0xff);
        Self(bytes)
    }

    /// The smallest key strictly greater than this one.
    pub fn next(&self) -> Self {
        let mut bytes = self.0.clone();
        bytes.push(0x00);
        Self(bytes)
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// True if `other` starts with this key.
    pub fn is_prefix_of(&self, other: &Key) -> bool {
        other.0.starts_with(&self.0)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

/// A stored item.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    /// Full backend key.
    pub key: Key,
    /// Opaque value; the presence service stores JSON records.
    pub value: Vec<u8>,
    /// When the backend forgets the item; `None` means never.
    pub expires: Option<SystemTime>,
    /// Monotonic id assigned by the backend on write.
    pub resource_id: i64,
}

impl Item {
    /// Build an item.
    pub fn new(key: Key, value: Vec<u8>, expires: Option<SystemTime>) -> Self {
        Self {
            key,
            value,
            expires,
            resource_id: 0,
        }
    }
}

/// A lease handed out by `put`/`create`, used to refresh the item's TTL.
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    /// Lease id; equals the resource id assigned at write time.
    pub id: i64,
    /// Key of the leased item.
    pub key: Key,
}

/// The backend contract.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Fetch a single item.
    ///
    /// Expired items are invisible: `NotFound`.
    async fn get(&self, key: &Key) -> Result<Item>;

    /// Write an item unconditionally.
    async fn put(&self, item: Item) -> Result<Lease>;

    /// Write an item; fails with `AlreadyExists` if the key is live.
    async fn create(&self, item: Item) -> Result<Lease>;

    /// Write an item; fails with `NotFound` if the key is not live.
    async fn update(&self, item: Item) -> Result<Lease>;

    /// Replace `expected` with `replace` atomically; fails with
    /// `CompareFailed` when the stored value diverged from `expected` and
    /// `NotFound` when the key is gone.
    async fn compare_and_swap(&self, expected: Item, replace: Item) -> Result<Lease>;

    /// Delete a single item; `NotFound` when absent.
    async fn delete(&self, key: &Key) -> Result<()>;

    /// Delete every item in `[start, end]`.
    async fn delete_range(&self, start: &Key, end: &Key) -> Result<()>;

    /// Fetch up to `limit` items from `[start, end]` in ascending key order;
    /// `limit == 0` means no limit.
    async fn get_range(&self, start: &Key, end: &Key, limit: usize) -> Result<Vec<Item>>;

    /// Move the expiry of a leased item; `NotFound` when the lease no longer
    /// matches a live item.
    async fn keep_alive(&self, lease: &Lease, expires: SystemTime) -> Result<()>;
}

/// Page size used by [`iterate_range`].
pub const ITERATE_PAGE_SIZE: usize = 100;

/// Drive `consumer` over every item in `[start, end]` in key order, fetching
/// pages of `page_size`. The consumer returns `false` to stop early.
pub async fn iterate_range<F>(
    backend: &dyn Backend,
    start: &Key,
    end: &Key,
    page_size: usize,
    mut consumer: F,
) -> Result<()>
where
    F: FnMut(&Item) -> Result<bool>,
{
    let page_size = if page_size == 0 {
        ITERATE_PAGE_SIZE
    } else {
        page_size
    };
    let mut cursor = start.clone();
    loop {
        let page = backend.get_range(&cursor, end, page_size).await?;
        let full_page = page.len() == page_size;
        for item in &page {
            if !consumer(item)? {
                return Ok(());
            }
        }
        if !full_page {
            return Ok(());
        }
        cursor = page
            .last()
            .map(|item| item.key.next())
            .unwrap_or_else(|| end.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_join_and_display() {
        let key = Key::new(&["appServers", "default", "h1", "web"]);
        assert_eq!(key.to_string(), "/appServers/default/h1/web");
    }

    #[test]
    fn key_ordering_and_prefixes() {
        let prefix = Key::new(&["nodes", "default"]);
        let a = prefix.child("a");
        let b = prefix.child("b");
        assert!(a < b);
        assert!(prefix.is_prefix_of(&a));
        assert!(a < prefix.range_end());
        assert!(b < prefix.range_end());
        assert!(a.next() > a);
        assert!(a.next() < b);
    }
}
