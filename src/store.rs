use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Shared mutable relay state: session affinity records, rate-limit flags,
/// concurrency counters. Keys are namespaced strings; values are strings.
/// Entries race with overlapping requests, so callers re-derive on stale
/// reads instead of assuming check-then-act is atomic.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration);
    async fn del(&self, key: &str);
    /// Remaining TTL; `None` when the key is missing or has no expiry.
    async fn ttl(&self, key: &str) -> Option<Duration>;
    async fn expire(&self, key: &str, ttl: Duration);
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.is_none_or(|at| at > Instant::now())
    }
}

/// In-process store backed by a concurrent map. Expired entries are reaped
/// lazily on access.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: DashMap<String, Entry>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Option<String> {
        let entry = self.entries.get(key)?;
        if entry.live() {
            Some(entry.value.clone())
        } else {
            drop(entry);
            self.entries.remove(key);
            None
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
    }

    async fn del(&self, key: &str) {
        self.entries.remove(key);
    }

    async fn ttl(&self, key: &str) -> Option<Duration> {
        let entry = self.entries.get(key)?;
        let expires_at = entry.expires_at?;
        expires_at.checked_duration_since(Instant::now())
    }

    async fn expire(&self, key: &str, ttl: Duration) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_del_roundtrip() {
        let store = MemoryKvStore::new();
        store.set_ex("k", "v", Duration::from_secs(10)).await;
        assert_eq!(store.get("k").await.as_deref(), Some("v"));
        assert!(store.ttl("k").await.unwrap() <= Duration::from_secs(10));
        store.del("k").await;
        assert_eq!(store.get("k").await, None);
    }

    #[tokio::test]
    async fn expired_entry_is_gone() {
        let store = MemoryKvStore::new();
        store.set_ex("k", "v", Duration::from_millis(1)).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(store.get("k").await, None);
        assert_eq!(store.ttl("k").await, None);
    }

    #[tokio::test]
    async fn expire_rearms_ttl() {
        let store = MemoryKvStore::new();
        store.set_ex("k", "v", Duration::from_millis(1)).await;
        store.expire("k", Duration::from_secs(60)).await;
        assert!(store.ttl("k").await.unwrap() > Duration::from_secs(30));
    }
}
