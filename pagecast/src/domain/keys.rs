//! Persisted key layout.

use super::Stage;

pub const TASK_PREFIX: &str = "tasks:";
pub const HEARTBEAT_SET: &str = "heartbeats";
pub const CONTROL_PREFIX: &str = "ctrl:";
pub const DIAGNOSE_LOCK: &str = "diagnoselock:0";

pub fn task(job_id: &str) -> String {
    format!("{TASK_PREFIX}{job_id}")
}

/// Extract the job id from a `tasks:<jobID>` key.
pub fn job_id_from_task_key(key: &str) -> Option<&str> {
    key.strip_prefix(TASK_PREFIX).filter(|id| !id.is_empty())
}

pub fn control(job_id: &str) -> String {
    format!("{CONTROL_PREFIX}{job_id}")
}

/// Lease guarding a single stage worker of a job.
pub fn stage_lock(stage: Stage, job_id: &str) -> String {
    format!("{}lock:{job_id}", stage.as_str())
}

/// Internal lease serialising read-modify-write updates of a task record.
pub fn task_update_lock(job_id: &str) -> String {
    format!("taskInfoLock:{}", task(job_id))
}

/// Heartbeat sorted-set member for one invocation.
pub fn heartbeat_member(job_id: &str, invocation_id: &str) -> String {
    format!("{job_id}:{invocation_id}")
}

/// Split a heartbeat member into `(job_id, invocation_id)`.
///
/// Members with anything other than exactly one separator are malformed.
pub fn parse_heartbeat_member(member: &str) -> Option<(&str, &str)> {
    let (job_id, invocation_id) = member.split_once(':')?;
    if job_id.is_empty() || invocation_id.is_empty() || invocation_id.contains(':') {
        return None;
    }
    Some((job_id, invocation_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(task("j1"), "tasks:j1");
        assert_eq!(control("j1"), "ctrl:j1");
        assert_eq!(stage_lock(Stage::Record, "j1"), "recordlock:j1");
        assert_eq!(task_update_lock("j1"), "taskInfoLock:tasks:j1");
        assert_eq!(job_id_from_task_key("tasks:j1"), Some("j1"));
        assert_eq!(job_id_from_task_key("tasks:"), None);
    }

    #[test]
    fn test_heartbeat_member() {
        let member = heartbeat_member("job", "inv");
        assert_eq!(parse_heartbeat_member(&member), Some(("job", "inv")));
        assert_eq!(parse_heartbeat_member("job"), None);
        assert_eq!(parse_heartbeat_member("a:b:c"), None);
        assert_eq!(parse_heartbeat_member(":inv"), None);
    }
}
