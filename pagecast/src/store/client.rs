//! Retrying store façade.

use std::sync::Arc;
use std::time::Duration;

use super::Store;
use super::retry::retry_transient;
use crate::Result;
use crate::domain::RetryPolicy;

/// Shared access to the coordination store.
///
/// Every operation except [`StoreClient::blocking_pop`] is retried on
/// transient errors. Blocking pops run on a dedicated connection so a waiting
/// listener never starves the other operations, and are not retried.
#[derive(Clone)]
pub struct StoreClient {
    store: Arc<dyn Store>,
    blocking: Arc<dyn Store>,
    retry: RetryPolicy,
}

impl StoreClient {
    /// Wrap a backend, opening the dedicated connection for blocking pops.
    pub async fn connect(store: Arc<dyn Store>, retry: RetryPolicy) -> Result<Self> {
        let blocking = retry_transient("dedicated", &retry, || store.dedicated()).await?;
        Ok(Self {
            store,
            blocking,
            retry,
        })
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        retry_transient("get", &self.retry, || self.store.get(key)).await
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        retry_transient("set", &self.retry, || self.store.set(key, value, ttl)).await
    }

    pub async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        retry_transient("set_nx", &self.retry, || self.store.set_nx(key, value, ttl)).await
    }

    pub async fn expire_if_eq(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        retry_transient("expire_if_eq", &self.retry, || {
            self.store.expire_if_eq(key, value, ttl)
        })
        .await
    }

    pub async fn delete_if_eq(&self, key: &str, value: &str) -> Result<bool> {
        retry_transient("delete_if_eq", &self.retry, || {
            self.store.delete_if_eq(key, value)
        })
        .await
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        retry_transient("delete", &self.retry, || self.store.delete(key)).await
    }

    pub async fn zadd(&self, set: &str, score: i64, member: &str) -> Result<()> {
        retry_transient("zadd", &self.retry, || self.store.zadd(set, score, member)).await
    }

    pub async fn zrem(&self, set: &str, member: &str) -> Result<bool> {
        retry_transient("zrem", &self.retry, || self.store.zrem(set, member)).await
    }

    pub async fn zscore(&self, set: &str, member: &str) -> Result<Option<i64>> {
        retry_transient("zscore", &self.retry, || self.store.zscore(set, member)).await
    }

    pub async fn zrange_by_score(&self, set: &str, min: i64, max: i64) -> Result<Vec<String>> {
        retry_transient("zrange_by_score", &self.retry, || {
            self.store.zrange_by_score(set, min, max)
        })
        .await
    }

    pub async fn rpush(&self, list: &str, value: &str) -> Result<u64> {
        retry_transient("rpush", &self.retry, || self.store.rpush(list, value)).await
    }

    /// Pop the head of `list`, waiting up to `timeout`. `Ok(None)` is a timeout.
    pub async fn blocking_pop(&self, list: &str, timeout: Duration) -> Result<Option<String>> {
        self.blocking.blocking_pop(list, timeout).await
    }

    pub async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        retry_transient("scan_prefix", &self.retry, || self.store.scan_prefix(prefix)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::store::MemoryStore;

    #[tokio::test(start_paused = true)]
    async fn test_retries_through_transient_failures() {
        let backend = MemoryStore::new();
        let client = StoreClient::connect(Arc::new(backend.clone()), RetryPolicy::default())
            .await
            .unwrap();

        backend.inject_failures(3);
        client.set("k", "v", None).await.unwrap();
        assert_eq!(client.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_failure_is_store_unavailable() {
        let backend = MemoryStore::new();
        let client = StoreClient::connect(Arc::new(backend.clone()), RetryPolicy::fast(2))
            .await
            .unwrap();

        backend.inject_failures(10);
        let err = client.get("k").await.unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable { attempts: 3, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_pop_is_not_retried() {
        let backend = MemoryStore::new();
        let client = StoreClient::connect(Arc::new(backend.clone()), RetryPolicy::default())
            .await
            .unwrap();

        backend.inject_failures(1);
        let err = client
            .blocking_pop("ctrl:x", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StoreConnection(_)));
    }
}
