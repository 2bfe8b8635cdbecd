//! SQLite store semantics across independent connections to one file.

mod common;

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use common::{RecordingInvoker, services_with, test_config};
use pagecast::diagnose::DiagnoseSweep;
use pagecast::dispatch::Dispatcher;
use pagecast::domain::{TaskParam, TaskStatus};
use pagecast::heartbeat::now_ms;
use pagecast::store::{SqliteStore, Store};

fn database_url(dir: &TempDir) -> String {
    format!("sqlite:{}", dir.path().join("coordination.db").display())
}

/// Two stores over the same file, as two coordinator processes would have.
async fn two_processes() -> (TempDir, SqliteStore, SqliteStore) {
    let dir = TempDir::new().unwrap();
    let url = database_url(&dir);
    let first = SqliteStore::connect(&url).await.unwrap();
    // Migrations already applied; reconnecting must be a no-op.
    let second = SqliteStore::connect(&url).await.unwrap();
    (dir, first, second)
}

#[tokio::test]
async fn test_set_nx_is_exclusive_across_connections() {
    let (_dir, first, second) = two_processes().await;
    let ttl = Duration::from_secs(10);

    assert!(first.set_nx("recordlock:j", "a", ttl).await.unwrap());
    assert!(!second.set_nx("recordlock:j", "b", ttl).await.unwrap());
    assert_eq!(
        second.get("recordlock:j").await.unwrap().as_deref(),
        Some("a")
    );

    // Only the owner may release.
    assert!(!second.delete_if_eq("recordlock:j", "b").await.unwrap());
    assert!(first.delete_if_eq("recordlock:j", "a").await.unwrap());
    assert!(second.set_nx("recordlock:j", "b", ttl).await.unwrap());
}

#[tokio::test]
async fn test_expired_lease_can_be_taken_over() {
    let (_dir, first, second) = two_processes().await;

    assert!(
        first
            .set_nx("uploadlock:j", "a", Duration::from_millis(50))
            .await
            .unwrap()
    );
    tokio::time::sleep(Duration::from_millis(120)).await;

    assert!(
        second
            .set_nx("uploadlock:j", "b", Duration::from_secs(10))
            .await
            .unwrap()
    );
    assert!(
        !first
            .expire_if_eq("uploadlock:j", "a", Duration::from_secs(10))
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_blocking_pop_sees_push_from_other_connection() {
    let (_dir, first, second) = two_processes().await;

    let waiter = tokio::spawn(async move {
        first
            .blocking_pop("ctrl:j", Duration::from_secs(5))
            .await
            .unwrap()
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    second.rpush("ctrl:j", "3").await.unwrap();

    assert_eq!(waiter.await.unwrap().as_deref(), Some("3"));
    assert_eq!(
        second
            .blocking_pop("ctrl:j", Duration::from_millis(60))
            .await
            .unwrap(),
        None
    );
}

#[tokio::test]
async fn test_sorted_set_range_is_inclusive_and_ordered() {
    let (_dir, store, _) = two_processes().await;
    store.zadd("heartbeats", 30, "c:1").await.unwrap();
    store.zadd("heartbeats", 10, "a:1").await.unwrap();
    store.zadd("heartbeats", 20, "b:1").await.unwrap();
    store.zadd("heartbeats", 40, "d:1").await.unwrap();

    assert_eq!(
        store.zrange_by_score("heartbeats", 10, 30).await.unwrap(),
        vec!["a:1", "b:1", "c:1"]
    );
    assert_eq!(store.zscore("heartbeats", "d:1").await.unwrap(), Some(40));
}

#[tokio::test]
async fn test_recovery_over_sqlite() {
    let (_dir, coordinator, sweeper) = two_processes().await;
    let invoker = RecordingInvoker::new();

    let services = services_with(Arc::new(coordinator), invoker.clone(), test_config()).await;
    let job_id = Dispatcher::new(services.clone())
        .start(TaskParam::new("https://example.com"), None)
        .await
        .unwrap();
    let stale = services
        .tasks
        .get_task(&job_id)
        .await
        .unwrap()
        .invoked_request_id
        .unwrap();
    services.heartbeats.beat_at(&job_id, &stale, 0).await.unwrap();

    // The sweep runs in a different process.
    let sweep_services = services_with(Arc::new(sweeper), invoker.clone(), test_config()).await;
    let report = DiagnoseSweep::new(sweep_services)
        .run(Duration::from_secs(120))
        .await
        .unwrap();
    assert_eq!(report.restarted, 1);

    let task = services.tasks.get_task(&job_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Recording);
    assert_eq!(task.retry_num, 1);
    assert_ne!(task.invoked_request_id.as_deref(), Some(stale.as_str()));
    assert!(
        services
            .heartbeats
            .stale_members(now_ms())
            .await
            .unwrap()
            .is_empty()
    );
}
