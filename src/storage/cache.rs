use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Clone)]
pub struct CacheEntry<T> {
    pub data: T,
    pub expires_at: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// 带过期时间的内存缓存，标注预留用
///
/// 克隆后共享同一份存储。
#[derive(Clone)]
pub struct Cache<T: Clone> {
    store: Arc<RwLock<HashMap<String, CacheEntry<T>>>>,
}

impl<T: Clone> Default for Cache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Cache<T> {
    pub fn new() -> Self {
        Self {
            store: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn insert(&self, key: impl Into<String>, data: T, ttl: Duration) {
        let mut store = self.store.write().unwrap_or_else(PoisonError::into_inner);
        store.insert(
            key.into(),
            CacheEntry {
                data,
                expires_at: Utc::now() + ttl,
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<T> {
        let store = self.store.read().unwrap_or_else(PoisonError::into_inner);
        store
            .get(key)
            .filter(|entry| entry.is_live(Utc::now()))
            .map(|entry| entry.data.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// 取出并移除条目；已过期的条目同样移除，但返回 `None`
    pub fn take(&self, key: &str) -> Option<T> {
        let mut store = self.store.write().unwrap_or_else(PoisonError::into_inner);
        store
            .remove(key)
            .filter(|entry| entry.is_live(Utc::now()))
            .map(|entry| entry.data)
    }

    pub fn clear_expired(&self) -> usize {
        let mut store = self.store.write().unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now();
        let before = store.len();
        store.retain(|_, entry| entry.is_live(now));
        before - store.len()
    }

    pub fn live_keys(&self) -> Vec<String> {
        let store = self.store.read().unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now();
        store
            .iter()
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_entries_are_invisible() {
        let cache = Cache::new();
        cache.insert("live", 1, Duration::minutes(5));
        cache.insert("stale", 2, Duration::seconds(-1));

        assert_eq!(cache.get("live"), Some(1));
        assert!(!cache.contains("stale"));
        assert_eq!(cache.live_keys(), vec!["live".to_string()]);
        assert_eq!(cache.clear_expired(), 1);
    }

    #[test]
    fn take_removes_the_entry() {
        let cache = Cache::new();
        cache.insert("k", "v".to_string(), Duration::minutes(1));

        assert_eq!(cache.take("k").as_deref(), Some("v"));
        assert_eq!(cache.take("k"), None);
    }

    #[test]
    fn take_of_expired_entry_returns_none() {
        let cache = Cache::new();
        cache.insert("k", 7, Duration::seconds(-1));
        assert_eq!(cache.take("k"), None);
        assert!(cache.live_keys().is_empty());
    }
}
