//! Task registry: persisted task records and their guarded updates.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::domain::{Task, TaskParam, TaskStatus, TaskUpdate, keys};
use crate::lease::{Lease, LeaseLock};
use crate::store::StoreClient;
use crate::{Error, Result};

/// Settings for the internal lease that serialises task updates.
#[derive(Debug, Clone, Copy)]
pub struct UpdateLockSettings {
    pub ttl: Duration,
    pub retry_count: u32,
    pub retry_delay: Duration,
}

impl Default for UpdateLockSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_millis(15_000),
            retry_count: 3,
            retry_delay: Duration::from_millis(200),
        }
    }
}

/// Which tasks a listing should include.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListScope {
    #[default]
    All,
    /// Tasks that have not finished yet.
    Running,
    Finished,
}

impl ListScope {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "all" => Some(Self::All),
            "running" => Some(Self::Running),
            "finished" => Some(Self::Finished),
            _ => None,
        }
    }

    fn matches(&self, status: TaskStatus) -> bool {
        match self {
            Self::All => true,
            Self::Running => !status.is_terminal(),
            Self::Finished => status.is_terminal(),
        }
    }
}

/// Filter for [`TaskRegistry::list_tasks`].
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub scope: ListScope,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl TaskFilter {
    fn matches(&self, task: &Task) -> bool {
        self.scope.matches(task.status)
            && self.created_after.is_none_or(|after| task.create_time >= after)
            && self.created_before.is_none_or(|before| task.create_time <= before)
    }
}

/// Reads and writes task records.
///
/// Every update runs under a short-lived per-task lease so concurrent
/// read-modify-write cycles from different processes never interleave.
#[derive(Clone)]
pub struct TaskRegistry {
    store: Arc<StoreClient>,
    lock: LeaseLock,
    update_lock: UpdateLockSettings,
    record_ttl: Option<Duration>,
}

impl TaskRegistry {
    pub fn new(store: Arc<StoreClient>, lock: LeaseLock) -> Self {
        Self {
            store,
            lock,
            update_lock: UpdateLockSettings::default(),
            record_ttl: None,
        }
    }

    pub fn with_update_lock(mut self, settings: UpdateLockSettings) -> Self {
        self.update_lock = settings;
        self
    }

    /// Expire task records this long after their last write.
    pub fn with_record_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.record_ttl = ttl;
        self
    }

    /// Create a task in status `normal`.
    pub async fn create_task(&self, job_id: &str, param: TaskParam) -> Result<Task> {
        let task = Task::new(job_id, param, Utc::now());
        self.write(&task).await?;
        debug!(job_id, "Task created");
        Ok(task)
    }

    pub async fn get_task(&self, job_id: &str) -> Result<Task> {
        self.find_task(job_id)
            .await?
            .ok_or_else(|| Error::not_found("task", job_id))
    }

    /// Like [`TaskRegistry::get_task`], but a missing task is `Ok(None)`.
    pub async fn find_task(&self, job_id: &str) -> Result<Option<Task>> {
        match self.store.get(&keys::task(job_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Apply a partial update under the task's update lease.
    ///
    /// Fails with `IllegalTransition` if the update would lower the status
    /// rank, `Superseded` if an `expect_invocation` precondition does not
    /// hold, `NotFound` if the task does not exist and `LeaseExpired` if the
    /// lease lapsed before the write. None of these are retried. The lease
    /// is released on every path.
    pub async fn update_task(&self, job_id: &str, update: TaskUpdate) -> Result<Task> {
        let lease = self
            .lock
            .acquire(
                &keys::task_update_lock(job_id),
                self.update_lock.ttl,
                self.update_lock.retry_count,
                self.update_lock.retry_delay,
            )
            .await?;

        let result = self.apply_update(job_id, &update, &lease).await;
        self.lock.release_quietly(&lease).await;

        match &result {
            Ok(task) => debug!(job_id, status = %task.status, "Task updated"),
            Err(e @ (Error::IllegalTransition { .. } | Error::Superseded { .. })) => {
                debug!(job_id, error = %e, "Task update rejected")
            }
            Err(e) => warn!(job_id, error = %e, "Task update failed"),
        }
        result
    }

    async fn apply_update(
        &self,
        job_id: &str,
        update: &TaskUpdate,
        lease: &Lease,
    ) -> Result<Task> {
        let mut task = self.get_task(job_id).await?;
        task.apply(update)?;
        // Nothing is written unless the lease is still ours after the read.
        self.lock.renew(lease, self.update_lock.ttl).await?;
        self.write(&task).await?;
        Ok(task)
    }

    /// Remove a task record together with its control list.
    pub async fn delete_task(&self, job_id: &str) -> Result<bool> {
        let removed = self.store.delete(&keys::task(job_id)).await?;
        self.store.delete(&keys::control(job_id)).await?;
        Ok(removed)
    }

    /// All tasks matching `filter`, newest first.
    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();
        for key in self.store.scan_prefix(keys::TASK_PREFIX).await? {
            let Some(job_id) = keys::job_id_from_task_key(&key) else {
                continue;
            };
            // A record can vanish between the scan and the read.
            let task = match self.find_task(job_id).await {
                Ok(Some(task)) => task,
                Ok(None) => continue,
                Err(Error::Serialization(e)) => {
                    warn!(job_id, error = %e, "Skipping unreadable task record");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if filter.matches(&task) {
                tasks.push(task);
            }
        }
        tasks.sort_by(|a, b| b.create_time.cmp(&a.create_time));
        Ok(tasks)
    }

    async fn write(&self, task: &Task) -> Result<()> {
        let raw = serde_json::to_string(task)?;
        self.store
            .set(&keys::task(&task.task_id), &raw, self.record_ttl)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RetryPolicy, TaskResult};
    use crate::store::MemoryStore;

    async fn registry() -> TaskRegistry {
        let store = Arc::new(
            StoreClient::connect(Arc::new(MemoryStore::new()), RetryPolicy::fast(1))
                .await
                .unwrap(),
        );
        TaskRegistry::new(store.clone(), LeaseLock::new(store))
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let registry = registry().await;
        let created = registry
            .create_task("j1", TaskParam::new("https://example.com"))
            .await
            .unwrap();
        assert_eq!(created.status, TaskStatus::Normal);
        assert_eq!(created.retry_num, 0);

        let loaded = registry.get_task("j1").await.unwrap();
        assert_eq!(loaded, created);
        assert!(matches!(
            registry.get_task("missing").await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_update_rejects_rank_decrease() {
        let registry = registry().await;
        registry.create_task("j1", TaskParam::new("u")).await.unwrap();
        registry
            .update_task("j1", TaskUpdate::new().status(TaskStatus::Upload))
            .await
            .unwrap();

        let err = registry
            .update_task("j1", TaskUpdate::new().status(TaskStatus::Recording))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IllegalTransition { .. }));
        assert_eq!(registry.get_task("j1").await.unwrap().status, TaskStatus::Upload);

        // The update lease was released on the error path.
        registry
            .update_task("j1", TaskUpdate::new().status(TaskStatus::Callback))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_update_missing_task() {
        let registry = registry().await;
        let err = registry
            .update_task("nope", TaskUpdate::new().status(TaskStatus::Recording))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lapsed_update_lease_blocks_write() {
        let registry = registry().await;
        registry.create_task("j1", TaskParam::new("u")).await.unwrap();

        let key = keys::task_update_lock("j1");
        let lease = registry
            .lock
            .acquire(&key, Duration::from_millis(50), 0, Duration::ZERO)
            .await
            .unwrap();
        tokio::time::advance(Duration::from_millis(100)).await;
        let rival = registry
            .lock
            .acquire(&key, Duration::from_secs(1), 0, Duration::ZERO)
            .await
            .unwrap();

        let err = registry
            .apply_update("j1", &TaskUpdate::new().increment_retry(), &lease)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LeaseExpired { .. }));
        assert_eq!(registry.get_task("j1").await.unwrap().retry_num, 0);
        registry.lock.release(&rival).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_updates_do_not_lose_increments() {
        let registry = registry().await.with_update_lock(UpdateLockSettings {
            ttl: Duration::from_secs(2),
            retry_count: 200,
            retry_delay: Duration::from_millis(1),
        });
        registry.create_task("j1", TaskParam::new("u")).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .update_task("j1", TaskUpdate::new().increment_retry())
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(registry.get_task("j1").await.unwrap().retry_num, 8);
    }

    #[tokio::test]
    async fn test_list_filters_and_sorts() {
        let registry = registry().await;
        registry.create_task("a", TaskParam::new("u")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        registry.create_task("b", TaskParam::new("u")).await.unwrap();
        registry
            .update_task(
                "a",
                TaskUpdate::new()
                    .status(TaskStatus::Finished)
                    .result(TaskResult::success(vec!["out.mp4".into()])),
            )
            .await
            .unwrap();

        let all = registry.list_tasks(&TaskFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].create_time >= all[1].create_time);

        let running = registry
            .list_tasks(&TaskFilter {
                scope: ListScope::Running,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].task_id, "b");

        assert!(registry.delete_task("a").await.unwrap());
        assert!(registry.find_task("a").await.unwrap().is_none());
    }
}
