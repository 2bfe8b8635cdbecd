//! Shared fixtures for the coordination integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use pagecast::config::CoordinatorConfig;
use pagecast::domain::{RetryPolicy, Stage};
use pagecast::invoker::StageInvoker;
use pagecast::services::ServiceContainer;
use pagecast::store::{MemoryStore, Store};
use pagecast::{Error, Result};

/// Stage invoker that records calls and hands out sequential invocation ids.
#[derive(Default)]
pub struct RecordingInvoker {
    next_id: AtomicU32,
    fail_invoke: AtomicBool,
    invoked: Mutex<Vec<(Stage, String, String)>>,
    terminated: Mutex<Vec<(Stage, String)>>,
    store_outage: Mutex<Option<(Arc<MemoryStore>, u32)>>,
}

impl RecordingInvoker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make subsequent `invoke` calls fail.
    pub fn fail_invokes(&self, fail: bool) {
        self.fail_invoke.store(fail, Ordering::SeqCst);
    }

    /// `(stage, job_id, invocation_id)` of every successful invoke.
    pub fn invoked(&self) -> Vec<(Stage, String, String)> {
        self.invoked.lock().clone()
    }

    pub fn invoked_count(&self) -> usize {
        self.invoked.lock().len()
    }

    pub fn terminated(&self) -> Vec<(Stage, String)> {
        self.terminated.lock().clone()
    }

    /// Make the next successful `invoke` break `store` for `failures`
    /// operations, as if the store went away right after the dispatch.
    pub fn break_store_after_next_invoke(&self, store: Arc<MemoryStore>, failures: u32) {
        *self.store_outage.lock() = Some((store, failures));
    }
}

#[async_trait]
impl StageInvoker for RecordingInvoker {
    async fn invoke(&self, stage: Stage, job_id: &str) -> Result<String> {
        if self.fail_invoke.load(Ordering::SeqCst) {
            return Err(Error::invocation("platform rejected the invocation"));
        }
        let id = format!("{}-inv-{}", stage, self.next_id.fetch_add(1, Ordering::SeqCst));
        self.invoked
            .lock()
            .push((stage, job_id.to_string(), id.clone()));
        if let Some((store, failures)) = self.store_outage.lock().take() {
            store.inject_failures(failures);
        }
        Ok(id)
    }

    async fn terminate(&self, stage: Stage, invocation_id: &str) -> Result<()> {
        self.terminated
            .lock()
            .push((stage, invocation_id.to_string()));
        Ok(())
    }
}

/// Configuration with fast store retries and no sweep jitter.
pub fn test_config() -> CoordinatorConfig {
    let mut config = CoordinatorConfig::default();
    config.store.retry = RetryPolicy::fast(2);
    config.diagnose.jitter_max_ms = 0;
    config.lease.acquire_retry_count = 0;
    config
}

pub async fn services_with(
    backend: Arc<dyn Store>,
    invoker: Arc<RecordingInvoker>,
    config: CoordinatorConfig,
) -> ServiceContainer {
    ServiceContainer::new(backend, invoker, config)
        .await
        .expect("service container")
}

/// Services over a fresh in-memory store.
pub async fn memory_services(invoker: Arc<RecordingInvoker>) -> ServiceContainer {
    services_with(Arc::new(MemoryStore::new()), invoker, test_config()).await
}
