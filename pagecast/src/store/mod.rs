//! Shared coordination store.
//!
//! The coordinator keeps all state in an external key/value store that also
//! offers sorted sets and lists. [`Store`] is the backend contract;
//! [`StoreClient`] is the retrying façade the rest of the crate talks to.

pub mod client;
pub mod memory;
pub mod retry;
pub mod sqlite;

pub use client::StoreClient;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::Result;

/// Backend contract for the coordination store.
///
/// Every method is a single atomic operation on one key. Conditional writes
/// (`set_nx`, `expire_if_eq`, `delete_if_eq`) are what the lease lock is
/// built on. Expired keys behave as absent.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Set `key` only if it is absent. Returns whether the value was written.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Reset the TTL of `key` if it currently holds `value`.
    async fn expire_if_eq(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Delete `key` if it currently holds `value`.
    async fn delete_if_eq(&self, key: &str, value: &str) -> Result<bool>;

    /// Delete a key of any kind. Returns whether anything was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn zadd(&self, set: &str, score: i64, member: &str) -> Result<()>;

    async fn zrem(&self, set: &str, member: &str) -> Result<bool>;

    async fn zscore(&self, set: &str, member: &str) -> Result<Option<i64>>;

    /// Members with `min <= score <= max`, ordered by score.
    async fn zrange_by_score(&self, set: &str, min: i64, max: i64) -> Result<Vec<String>>;

    /// Append to a list. Returns the new length.
    async fn rpush(&self, list: &str, value: &str) -> Result<u64>;

    /// Pop the head of a list, waiting up to `timeout` for a value.
    async fn blocking_pop(&self, list: &str, timeout: Duration) -> Result<Option<String>>;

    /// Live keys starting with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// A handle backed by its own connection, for blocking operations.
    async fn dedicated(&self) -> Result<Arc<dyn Store>>;
}
