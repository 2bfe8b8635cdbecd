//! In-process store backend.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::Store;
use crate::{Error, Result};

#[derive(Debug, Clone)]
struct Value {
    data: String,
    expires_at: Option<Instant>,
}

impl Value {
    fn new(data: &str, ttl: Option<Duration>) -> Self {
        Self {
            data: data.to_string(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Default)]
struct Inner {
    values: DashMap<String, Value>,
    sorted_sets: DashMap<String, HashMap<String, i64>>,
    lists: DashMap<String, VecDeque<String>>,
    pushed: Notify,
    injected_failures: AtomicU32,
}

/// Store backend that keeps everything in process memory.
///
/// Clones share state. TTLs are measured on the tokio clock so paused-time
/// tests can advance them.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` operations fail with a connection error.
    pub fn inject_failures(&self, count: u32) {
        self.inner.injected_failures.store(count, Ordering::SeqCst);
    }

    fn check_fault(&self) -> Result<()> {
        let injected = self
            .inner
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(Error::StoreConnection("injected connection failure".into()));
        }
        Ok(())
    }

    fn try_pop(&self, list: &str) -> Option<String> {
        let mut entry = self.inner.lists.get_mut(list)?;
        let value = entry.pop_front();
        let empty = entry.is_empty();
        drop(entry);
        if empty {
            self.inner.lists.remove_if(list, |_, items| items.is_empty());
        }
        value
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_fault()?;
        let now = Instant::now();
        if let Some(value) = self.inner.values.get(key) {
            if value.is_live(now) {
                return Ok(Some(value.data.clone()));
            }
        } else {
            return Ok(None);
        }
        self.inner.values.remove_if(key, |_, v| !v.is_live(now));
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.check_fault()?;
        self.inner
            .values
            .insert(key.to_string(), Value::new(value, ttl));
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.check_fault()?;
        let now = Instant::now();
        match self.inner.values.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    Ok(false)
                } else {
                    occupied.insert(Value::new(value, Some(ttl)));
                    Ok(true)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Value::new(value, Some(ttl)));
                Ok(true)
            }
        }
    }

    async fn expire_if_eq(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.check_fault()?;
        let now = Instant::now();
        let Some(mut current) = self.inner.values.get_mut(key) else {
            return Ok(false);
        };
        if !current.is_live(now) || current.data != value {
            return Ok(false);
        }
        current.expires_at = Some(now + ttl);
        Ok(true)
    }

    async fn delete_if_eq(&self, key: &str, value: &str) -> Result<bool> {
        self.check_fault()?;
        let now = Instant::now();
        let removed = self
            .inner
            .values
            .remove_if(key, |_, current| current.is_live(now) && current.data == value);
        Ok(removed.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check_fault()?;
        let value = self.inner.values.remove(key).is_some();
        let set = self.inner.sorted_sets.remove(key).is_some();
        let list = self.inner.lists.remove(key).is_some();
        Ok(value || set || list)
    }

    async fn zadd(&self, set: &str, score: i64, member: &str) -> Result<()> {
        self.check_fault()?;
        self.inner
            .sorted_sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrem(&self, set: &str, member: &str) -> Result<bool> {
        self.check_fault()?;
        let Some(mut members) = self.inner.sorted_sets.get_mut(set) else {
            return Ok(false);
        };
        Ok(members.remove(member).is_some())
    }

    async fn zscore(&self, set: &str, member: &str) -> Result<Option<i64>> {
        self.check_fault()?;
        Ok(self
            .inner
            .sorted_sets
            .get(set)
            .and_then(|members| members.get(member).copied()))
    }

    async fn zrange_by_score(&self, set: &str, min: i64, max: i64) -> Result<Vec<String>> {
        self.check_fault()?;
        let Some(members) = self.inner.sorted_sets.get(set) else {
            return Ok(Vec::new());
        };
        let mut matched: Vec<(i64, String)> = members
            .iter()
            .filter(|(_, score)| (min..=max).contains(*score))
            .map(|(member, score)| (*score, member.clone()))
            .collect();
        drop(members);
        matched.sort();
        Ok(matched.into_iter().map(|(_, member)| member).collect())
    }

    async fn rpush(&self, list: &str, value: &str) -> Result<u64> {
        self.check_fault()?;
        let len = {
            let mut items = self.inner.lists.entry(list.to_string()).or_default();
            items.push_back(value.to_string());
            items.len() as u64
        };
        self.inner.pushed.notify_waiters();
        Ok(len)
    }

    async fn blocking_pop(&self, list: &str, timeout: Duration) -> Result<Option<String>> {
        self.check_fault()?;
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.inner.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.try_pop(list) {
                return Ok(Some(value));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(self.try_pop(list));
            }
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.check_fault()?;
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .inner
            .values
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && entry.value().is_live(now))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn dedicated(&self) -> Result<Arc<dyn Store>> {
        Ok(Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_set_nx_respects_ttl() {
        let store = MemoryStore::new();
        assert!(store.set_nx("lock", "a", Duration::from_secs(1)).await.unwrap());
        assert!(!store.set_nx("lock", "b", Duration::from_secs(1)).await.unwrap());

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert_eq!(store.get("lock").await.unwrap(), None);
        assert!(store.set_nx("lock", "b", Duration::from_secs(1)).await.unwrap());
        assert_eq!(store.get("lock").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_conditional_ops_check_value() {
        let store = MemoryStore::new();
        store.set_nx("lock", "a", Duration::from_secs(5)).await.unwrap();

        assert!(!store.expire_if_eq("lock", "b", Duration::from_secs(5)).await.unwrap());
        assert!(store.expire_if_eq("lock", "a", Duration::from_secs(5)).await.unwrap());
        assert!(!store.delete_if_eq("lock", "b").await.unwrap());
        assert!(store.delete_if_eq("lock", "a").await.unwrap());
        assert!(!store.delete_if_eq("lock", "a").await.unwrap());
    }

    #[tokio::test]
    async fn test_zrange_inclusive_and_ordered() {
        let store = MemoryStore::new();
        store.zadd("hb", 30, "c").await.unwrap();
        store.zadd("hb", 10, "a").await.unwrap();
        store.zadd("hb", 20, "b").await.unwrap();

        let members = store.zrange_by_score("hb", i64::MIN, 20).await.unwrap();
        assert_eq!(members, vec!["a".to_string(), "b".to_string()]);

        store.zadd("hb", 40, "a").await.unwrap();
        assert_eq!(store.zscore("hb", "a").await.unwrap(), Some(40));
        assert!(store.zrem("hb", "a").await.unwrap());
        assert!(!store.zrem("hb", "a").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_pop_wakes_on_push() {
        let store = MemoryStore::new();
        let popper = {
            let store = store.clone();
            tokio::spawn(async move { store.blocking_pop("ctrl", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        store.rpush("ctrl", "1").await.unwrap();

        let value = popper.await.unwrap().unwrap();
        assert_eq!(value.as_deref(), Some("1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_pop_times_out() {
        let store = MemoryStore::new();
        let value = store
            .blocking_pop("ctrl", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn test_list_fifo_order() {
        let store = MemoryStore::new();
        assert_eq!(store.rpush("ctrl", "1").await.unwrap(), 1);
        assert_eq!(store.rpush("ctrl", "3").await.unwrap(), 2);
        let first = store.blocking_pop("ctrl", Duration::ZERO).await.unwrap();
        let second = store.blocking_pop("ctrl", Duration::ZERO).await.unwrap();
        assert_eq!(first.as_deref(), Some("1"));
        assert_eq!(second.as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn test_scan_prefix_and_injected_failures() {
        let store = MemoryStore::new();
        store.set("tasks:a", "{}", None).await.unwrap();
        store.set("tasks:b", "{}", None).await.unwrap();
        store.set("other", "{}", None).await.unwrap();
        assert_eq!(
            store.scan_prefix("tasks:").await.unwrap(),
            vec!["tasks:a".to_string(), "tasks:b".to_string()]
        );

        store.inject_failures(1);
        assert!(store.get("tasks:a").await.unwrap_err().is_transient());
        assert!(store.get("tasks:a").await.unwrap().is_some());
    }
}
