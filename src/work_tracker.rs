//! Task lifecycle tracking with workload statistics.
//!
//! The tracker holds every task the orchestrator has accepted, drives the
//! status state machine, and keeps three secondary indices consistent with
//! the primary map on every mutation: agent → tasks, workflow plan → tasks,
//! and workflow step → task (one-to-one, used to correlate incoming
//! `task.result` / `task.progress` payloads).
//!
//! All state lives behind a single lock so an index can never be observed
//! out of step with the task map.

use crate::constants;
use crate::protocol::TaskOutcome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Task status; see the transition table on [`WorkTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl TaskStatus {
    /// Completed, failed, timeout, and cancelled tasks are terminal for
    /// retention purposes; failed and timeout may still be retried.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Timeout | TaskStatus::Cancelled
        )
    }
}

/// Final outcome recorded against a completed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResultRecord {
    pub status: TaskOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// A task known to the tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedTask {
    pub task_id: String,
    pub correlation_id: String,
    pub task: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_step_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_plan_id: Option<String>,
    pub priority: u8,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_line: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResultRecord>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub tags: Vec<String>,
}

/// Inputs for [`WorkTracker::create_task`].
#[derive(Debug, Clone, Default)]
pub struct CreateTaskOptions {
    pub task: String,
    pub correlation_id: Option<String>,
    pub requested_by: Option<String>,
    pub workflow_step_id: Option<String>,
    pub workflow_plan_id: Option<String>,
    pub priority: Option<u8>,
    pub deadline: Option<DateTime<Utc>>,
    pub max_retries: Option<u32>,
    pub tags: Vec<String>,
}

/// Predicates for [`WorkTracker::list_tasks`]; omitted fields match all.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub assigned_to: Option<String>,
    pub workflow_plan_id: Option<String>,
    pub tag: Option<String>,
    pub since: Option<DateTime<Utc>>,
}

/// Aggregate counts over the tracked tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkSummary {
    pub total: usize,
    pub pending: usize,
    pub assigned: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub timeout: usize,
    pub cancelled: usize,
    /// Mean wall time of completed tasks with both start and completion
    /// timestamps, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_completion_ms: Option<f64>,
    /// Non-terminal tasks whose remaining deadline budget is below 20%.
    pub at_risk: usize,
}

/// Per-agent task statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentWorkload {
    pub agent_instance_id: String,
    pub active_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_duration_ms: Option<f64>,
}

/// Filtered snapshot plus aggregates, stamped at generation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkReport {
    pub generated_at: DateTime<Utc>,
    pub tasks: Vec<TrackedTask>,
    pub summary: WorkSummary,
    pub workloads: Vec<AgentWorkload>,
}

/// Inputs for [`WorkTracker::generate_report`].
#[derive(Debug, Clone, Default)]
pub struct ReportOptions {
    pub workflow_plan_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct TrackerInner {
    tasks: HashMap<String, TrackedTask>,
    by_agent: HashMap<String, HashSet<String>>,
    by_plan: HashMap<String, HashSet<String>>,
    by_step: HashMap<String, String>,
}

impl TrackerInner {
    fn unlink_agent(&mut self, task_id: &str, agent: &str) {
        if let Some(set) = self.by_agent.get_mut(agent) {
            set.remove(task_id);
            if set.is_empty() {
                self.by_agent.remove(agent);
            }
        }
    }
}

/// Task state machine:
///
/// ```text
/// pending → assigned → in-progress → completed
///                                  → failed  ⇄ pending (retry)
///                                  → timeout ⇄ pending (retry)
/// pending|assigned|in-progress → cancelled
/// ```
pub struct WorkTracker {
    inner: Mutex<TrackerInner>,
}

impl WorkTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TrackerInner::default()),
        }
    }

    /// Creates a task in `pending` and registers workflow indices.
    pub async fn create_task(&self, opts: CreateTaskOptions) -> TrackedTask {
        let task = TrackedTask {
            task_id: Uuid::new_v4().to_string(),
            correlation_id: opts
                .correlation_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            task: opts.task,
            status: TaskStatus::Pending,
            assigned_to: None,
            requested_by: opts.requested_by,
            workflow_step_id: opts.workflow_step_id,
            workflow_plan_id: opts.workflow_plan_id,
            priority: opts.priority.unwrap_or(constants::DEFAULT_TASK_PRIORITY),
            created_at: Utc::now(),
            assigned_at: None,
            started_at: None,
            completed_at: None,
            deadline: opts.deadline,
            progress_percent: None,
            status_line: None,
            result: None,
            retry_count: 0,
            max_retries: opts.max_retries.unwrap_or(constants::DEFAULT_MAX_RETRIES),
            tags: opts.tags,
        };

        let mut inner = self.inner.lock().await;
        if let Some(plan_id) = &task.workflow_plan_id {
            inner
                .by_plan
                .entry(plan_id.clone())
                .or_default()
                .insert(task.task_id.clone());
        }
        if let Some(step_id) = &task.workflow_step_id {
            inner.by_step.insert(step_id.clone(), task.task_id.clone());
        }
        inner.tasks.insert(task.task_id.clone(), task.clone());
        debug!("Created task {} (priority {})", task.task_id, task.priority);
        task
    }

    pub async fn get_task(&self, task_id: &str) -> Option<TrackedTask> {
        self.inner.lock().await.tasks.get(task_id).cloned()
    }

    /// Looks up the task correlated with a workflow step.
    pub async fn task_for_step(&self, workflow_step_id: &str) -> Option<String> {
        self.inner.lock().await.by_step.get(workflow_step_id).cloned()
    }

    /// `pending | failed → assigned`. Updates the agent index.
    pub async fn assign_task(&self, task_id: &str, agent_instance_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let previous_agent = match inner.tasks.get(task_id) {
            Some(task) if matches!(task.status, TaskStatus::Pending | TaskStatus::Failed) => {
                task.assigned_to.clone()
            }
            _ => return false,
        };

        if let Some(prev) = previous_agent {
            inner.unlink_agent(task_id, &prev);
        }
        inner
            .by_agent
            .entry(agent_instance_id.to_string())
            .or_default()
            .insert(task_id.to_string());

        let task = inner.tasks.get_mut(task_id).expect("task checked above");
        task.status = TaskStatus::Assigned;
        task.assigned_to = Some(agent_instance_id.to_string());
        task.assigned_at = Some(Utc::now());
        debug!("Assigned task {} to {}", task_id, agent_instance_id);
        true
    }

    /// `assigned → in-progress`.
    pub async fn start_task(&self, task_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.tasks.get_mut(task_id) {
            Some(task) if task.status == TaskStatus::Assigned => {
                task.status = TaskStatus::InProgress;
                task.started_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    /// Progress updates are idempotent and legal in any non-terminal state.
    pub async fn update_progress(
        &self,
        task_id: &str,
        percent: Option<f64>,
        status_line: Option<String>,
    ) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.tasks.get_mut(task_id) {
            Some(task) if !task.status.is_terminal() => {
                if let Some(p) = percent {
                    task.progress_percent = Some(p.clamp(0.0, 100.0));
                }
                if let Some(line) = status_line {
                    task.status_line = Some(line);
                }
                true
            }
            _ => false,
        }
    }

    /// Records a result. The outcome maps onto task status: success and
    /// partial complete the task, timeout marks it timed out, anything
    /// else fails it.
    pub async fn complete_task(&self, task_id: &str, result: TaskResultRecord) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.tasks.get_mut(task_id) {
            Some(task) if !task.status.is_terminal() => {
                task.status = match result.status {
                    TaskOutcome::Success | TaskOutcome::Partial => TaskStatus::Completed,
                    TaskOutcome::Timeout => TaskStatus::Timeout,
                    TaskOutcome::Failure => TaskStatus::Failed,
                };
                task.completed_at = Some(Utc::now());
                task.progress_percent = Some(100.0);
                task.result = Some(result);
                info!("Task {} finished as {:?}", task_id, task.status);
                true
            }
            _ => false,
        }
    }

    /// Cancels unless already completed or cancelled. The task leaves its
    /// agent's index; the `assigned_to` field stays for the record.
    pub async fn cancel_task(&self, task_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let assigned = match inner.tasks.get(task_id) {
            Some(task)
                if !matches!(task.status, TaskStatus::Completed | TaskStatus::Cancelled) =>
            {
                task.assigned_to.clone()
            }
            _ => return false,
        };

        if let Some(agent) = assigned {
            inner.unlink_agent(task_id, &agent);
        }
        let task = inner.tasks.get_mut(task_id).expect("task checked above");
        task.status = TaskStatus::Cancelled;
        task.completed_at = Some(Utc::now());
        info!("Task {} cancelled", task_id);
        true
    }

    /// `failed | timeout → pending` while retries remain. Transient fields
    /// are cleared and the retry counter incremented.
    pub async fn retry_task(&self, task_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let previous_agent = match inner.tasks.get(task_id) {
            Some(task)
                if matches!(task.status, TaskStatus::Failed | TaskStatus::Timeout)
                    && task.retry_count < task.max_retries =>
            {
                task.assigned_to.clone()
            }
            _ => return false,
        };

        if let Some(prev) = previous_agent {
            inner.unlink_agent(task_id, &prev);
        }

        let task = inner.tasks.get_mut(task_id).expect("task checked above");
        task.status = TaskStatus::Pending;
        task.retry_count += 1;
        task.assigned_to = None;
        task.assigned_at = None;
        task.started_at = None;
        task.completed_at = None;
        task.progress_percent = None;
        task.status_line = None;
        task.result = None;
        info!(
            "Task {} back to pending (retry {}/{})",
            task_id, task.retry_count, task.max_retries
        );
        true
    }

    /// Filtered listing sorted by priority descending. Agent and plan
    /// filters use their indices for O(match) access.
    pub async fn list_tasks(&self, filter: TaskFilter) -> Vec<TrackedTask> {
        let inner = self.inner.lock().await;

        let candidate_ids: Option<Vec<String>> = if let Some(agent) = &filter.assigned_to {
            Some(
                inner
                    .by_agent
                    .get(agent)
                    .map(|set| set.iter().cloned().collect())
                    .unwrap_or_default(),
            )
        } else if let Some(plan) = &filter.workflow_plan_id {
            Some(
                inner
                    .by_plan
                    .get(plan)
                    .map(|set| set.iter().cloned().collect())
                    .unwrap_or_default(),
            )
        } else {
            None
        };

        let mut tasks: Vec<TrackedTask> = match candidate_ids {
            Some(ids) => ids
                .iter()
                .filter_map(|id| inner.tasks.get(id))
                .cloned()
                .collect(),
            None => inner.tasks.values().cloned().collect(),
        };

        tasks.retain(|task| {
            if let Some(status) = filter.status {
                if task.status != status {
                    return false;
                }
            }
            if let Some(agent) = &filter.assigned_to {
                if task.assigned_to.as_deref() != Some(agent.as_str()) {
                    return false;
                }
            }
            if let Some(plan) = &filter.workflow_plan_id {
                if task.workflow_plan_id.as_deref() != Some(plan.as_str()) {
                    return false;
                }
            }
            if let Some(tag) = &filter.tag {
                if !task.tags.iter().any(|t| t == tag) {
                    return false;
                }
            }
            if let Some(since) = filter.since {
                if task.created_at < since {
                    return false;
                }
            }
            true
        });

        tasks.sort_by(|a, b| b.priority.cmp(&a.priority));
        tasks
    }

    pub async fn get_summary(&self) -> WorkSummary {
        let inner = self.inner.lock().await;
        Self::summarize(inner.tasks.values(), Utc::now())
    }

    fn summarize<'a>(
        tasks: impl Iterator<Item = &'a TrackedTask>,
        now: DateTime<Utc>,
    ) -> WorkSummary {
        let mut summary = WorkSummary {
            total: 0,
            pending: 0,
            assigned: 0,
            in_progress: 0,
            completed: 0,
            failed: 0,
            timeout: 0,
            cancelled: 0,
            average_completion_ms: None,
            at_risk: 0,
        };
        let mut duration_sum_ms = 0.0;
        let mut duration_count = 0usize;

        for task in tasks {
            summary.total += 1;
            match task.status {
                TaskStatus::Pending => summary.pending += 1,
                TaskStatus::Assigned => summary.assigned += 1,
                TaskStatus::InProgress => summary.in_progress += 1,
                TaskStatus::Completed => summary.completed += 1,
                TaskStatus::Failed => summary.failed += 1,
                TaskStatus::Timeout => summary.timeout += 1,
                TaskStatus::Cancelled => summary.cancelled += 1,
            }

            if task.status == TaskStatus::Completed {
                if let (Some(started), Some(completed)) = (task.started_at, task.completed_at) {
                    duration_sum_ms += (completed - started).num_milliseconds() as f64;
                    duration_count += 1;
                }
            }

            if !task.status.is_terminal() {
                if let Some(deadline) = task.deadline {
                    let budget_ms = (deadline - task.created_at).num_milliseconds();
                    let remaining_ms = (deadline - now).num_milliseconds();
                    if deadline > now
                        && budget_ms > 0
                        && (remaining_ms as f64 / budget_ms as f64) < constants::AT_RISK_RATIO
                    {
                        summary.at_risk += 1;
                    }
                }
            }
        }

        if duration_count > 0 {
            summary.average_completion_ms = Some(duration_sum_ms / duration_count as f64);
        }
        summary
    }

    /// Statistics for every agent that owns at least one task.
    pub async fn get_agent_workloads(&self) -> Vec<AgentWorkload> {
        let inner = self.inner.lock().await;
        let mut workloads = Vec::with_capacity(inner.by_agent.len());

        for (agent, task_ids) in &inner.by_agent {
            let mut active = 0;
            let mut completed = 0;
            let mut failed = 0;
            let mut duration_sum_ms = 0.0;
            let mut duration_count = 0usize;

            for task in task_ids.iter().filter_map(|id| inner.tasks.get(id)) {
                match task.status {
                    TaskStatus::Assigned | TaskStatus::InProgress => active += 1,
                    TaskStatus::Completed => {
                        completed += 1;
                        if let (Some(started), Some(done)) = (task.started_at, task.completed_at) {
                            duration_sum_ms += (done - started).num_milliseconds() as f64;
                            duration_count += 1;
                        }
                    }
                    TaskStatus::Failed | TaskStatus::Timeout => failed += 1,
                    TaskStatus::Pending | TaskStatus::Cancelled => {}
                }
            }

            workloads.push(AgentWorkload {
                agent_instance_id: agent.clone(),
                active_tasks: active,
                completed_tasks: completed,
                failed_tasks: failed,
                average_duration_ms: (duration_count > 0)
                    .then(|| duration_sum_ms / duration_count as f64),
            });
        }

        workloads.sort_by(|a, b| a.agent_instance_id.cmp(&b.agent_instance_id));
        workloads
    }

    pub async fn generate_report(&self, opts: ReportOptions) -> WorkReport {
        let filter = TaskFilter {
            workflow_plan_id: opts.workflow_plan_id,
            since: opts.since,
            ..Default::default()
        };
        let tasks = self.list_tasks(filter).await;
        let summary = Self::summarize(tasks.iter(), Utc::now());
        WorkReport {
            generated_at: Utc::now(),
            tasks,
            summary,
            workloads: self.get_agent_workloads().await,
        }
    }

    /// Removes terminal tasks older than `max_age_ms` (by completion time,
    /// falling back to creation time) and purges their index entries.
    /// Returns the number removed.
    pub async fn cleanup(&self, max_age_ms: i64) -> usize {
        let cutoff = Utc::now() - chrono::Duration::milliseconds(max_age_ms);
        let mut inner = self.inner.lock().await;

        let expired: Vec<String> = inner
            .tasks
            .values()
            .filter(|task| {
                task.status.is_terminal() && task.completed_at.unwrap_or(task.created_at) < cutoff
            })
            .map(|task| task.task_id.clone())
            .collect();

        for task_id in &expired {
            if let Some(task) = inner.tasks.remove(task_id) {
                if let Some(agent) = &task.assigned_to {
                    let agent = agent.clone();
                    inner.unlink_agent(task_id, &agent);
                }
                if let Some(plan_id) = &task.workflow_plan_id {
                    if let Some(set) = inner.by_plan.get_mut(plan_id) {
                        set.remove(task_id);
                        if set.is_empty() {
                            let plan_id = plan_id.clone();
                            inner.by_plan.remove(&plan_id);
                        }
                    }
                }
                if let Some(step_id) = &task.workflow_step_id {
                    inner.by_step.remove(step_id);
                }
            }
        }

        if !expired.is_empty() {
            info!("Cleaned up {} terminal tasks", expired.len());
        }
        expired.len()
    }

    pub async fn task_count(&self) -> usize {
        self.inner.lock().await.tasks.len()
    }
}

impl Default for WorkTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(task: &str) -> CreateTaskOptions {
        CreateTaskOptions {
            task: task.to_string(),
            ..Default::default()
        }
    }

    fn success() -> TaskResultRecord {
        TaskResultRecord {
            status: TaskOutcome::Success,
            result: Some("ok".to_string()),
            error: None,
            duration_ms: None,
        }
    }

    fn failure() -> TaskResultRecord {
        TaskResultRecord {
            status: TaskOutcome::Failure,
            result: None,
            error: Some("boom".to_string()),
            duration_ms: None,
        }
    }

    #[tokio::test]
    async fn test_create_task_defaults() {
        let tracker = WorkTracker::new();
        let task = tracker.create_task(opts("build the parser")).await;

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, 50);
        assert_eq!(task.max_retries, 2);
        assert_eq!(task.retry_count, 0);
        assert!(task.assigned_to.is_none());
    }

    #[tokio::test]
    async fn test_happy_path_lifecycle() {
        let tracker = WorkTracker::new();
        let task = tracker.create_task(opts("work")).await;

        assert!(tracker.assign_task(&task.task_id, "agent-1").await);
        assert!(tracker.start_task(&task.task_id).await);
        assert!(tracker.update_progress(&task.task_id, Some(50.0), None).await);
        assert!(tracker.complete_task(&task.task_id, success()).await);

        let done = tracker.get_task(&task.task_id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.progress_percent, Some(100.0));
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_illegal_transitions_rejected() {
        let tracker = WorkTracker::new();
        let task = tracker.create_task(opts("work")).await;

        // cannot start before assignment
        assert!(!tracker.start_task(&task.task_id).await);

        tracker.assign_task(&task.task_id, "agent-1").await;
        tracker.start_task(&task.task_id).await;
        // in-progress tasks cannot be re-assigned
        assert!(!tracker.assign_task(&task.task_id, "agent-2").await);

        tracker.complete_task(&task.task_id, success()).await;
        // terminal: no further mutation
        assert!(!tracker.complete_task(&task.task_id, success()).await);
        assert!(!tracker.update_progress(&task.task_id, Some(10.0), None).await);
        assert!(!tracker.cancel_task(&task.task_id).await);
    }

    #[tokio::test]
    async fn test_unknown_task_operations_return_false() {
        let tracker = WorkTracker::new();
        assert!(!tracker.assign_task("missing", "agent-1").await);
        assert!(!tracker.start_task("missing").await);
        assert!(!tracker.cancel_task("missing").await);
        assert!(!tracker.retry_task("missing").await);
    }

    #[tokio::test]
    async fn test_outcome_maps_to_status() {
        let tracker = WorkTracker::new();

        for (outcome, expected) in [
            (TaskOutcome::Success, TaskStatus::Completed),
            (TaskOutcome::Partial, TaskStatus::Completed),
            (TaskOutcome::Timeout, TaskStatus::Timeout),
            (TaskOutcome::Failure, TaskStatus::Failed),
        ] {
            let task = tracker.create_task(opts("work")).await;
            tracker.assign_task(&task.task_id, "agent-1").await;
            tracker.start_task(&task.task_id).await;
            tracker
                .complete_task(
                    &task.task_id,
                    TaskResultRecord {
                        status: outcome,
                        result: None,
                        error: None,
                        duration_ms: None,
                    },
                )
                .await;
            assert_eq!(
                tracker.get_task(&task.task_id).await.unwrap().status,
                expected
            );
        }
    }

    #[tokio::test]
    async fn test_retry_resets_transient_fields() {
        let tracker = WorkTracker::new();
        let task = tracker.create_task(opts("flaky work")).await;

        tracker.assign_task(&task.task_id, "agent-1").await;
        tracker.start_task(&task.task_id).await;
        tracker
            .update_progress(&task.task_id, Some(80.0), Some("almost".to_string()))
            .await;
        tracker.complete_task(&task.task_id, failure()).await;

        assert!(tracker.retry_task(&task.task_id).await);
        let retried = tracker.get_task(&task.task_id).await.unwrap();
        assert_eq!(retried.status, TaskStatus::Pending);
        assert_eq!(retried.retry_count, 1);
        assert!(retried.assigned_to.is_none());
        assert!(retried.started_at.is_none());
        assert!(retried.completed_at.is_none());
        assert!(retried.progress_percent.is_none());
        assert!(retried.result.is_none());

        // agent index no longer references the task
        let for_agent = tracker
            .list_tasks(TaskFilter {
                assigned_to: Some("agent-1".to_string()),
                ..Default::default()
            })
            .await;
        assert!(for_agent.is_empty());
    }

    #[tokio::test]
    async fn test_retry_respects_max_retries() {
        let tracker = WorkTracker::new();
        let task = tracker
            .create_task(CreateTaskOptions {
                task: "one shot".to_string(),
                max_retries: Some(0),
                ..Default::default()
            })
            .await;

        tracker.assign_task(&task.task_id, "agent-1").await;
        tracker.start_task(&task.task_id).await;
        tracker.complete_task(&task.task_id, failure()).await;

        assert!(!tracker.retry_task(&task.task_id).await);
        assert_eq!(
            tracker.get_task(&task.task_id).await.unwrap().status,
            TaskStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_cancel_rejected_after_completion() {
        let tracker = WorkTracker::new();
        let task = tracker.create_task(opts("work")).await;
        tracker.assign_task(&task.task_id, "agent-1").await;
        tracker.start_task(&task.task_id).await;
        tracker.complete_task(&task.task_id, success()).await;

        assert!(!tracker.cancel_task(&task.task_id).await);
    }

    #[tokio::test]
    async fn test_cancel_from_any_active_state() {
        let tracker = WorkTracker::new();

        let pending = tracker.create_task(opts("a")).await;
        assert!(tracker.cancel_task(&pending.task_id).await);

        let assigned = tracker.create_task(opts("b")).await;
        tracker.assign_task(&assigned.task_id, "agent-1").await;
        assert!(tracker.cancel_task(&assigned.task_id).await);

        let in_progress = tracker.create_task(opts("c")).await;
        tracker.assign_task(&in_progress.task_id, "agent-1").await;
        tracker.start_task(&in_progress.task_id).await;
        assert!(tracker.cancel_task(&in_progress.task_id).await);

        // cancelled tasks leave the agent index
        let for_agent = tracker
            .list_tasks(TaskFilter {
                assigned_to: Some("agent-1".to_string()),
                ..Default::default()
            })
            .await;
        assert!(for_agent.is_empty());
    }

    #[tokio::test]
    async fn test_step_index_correlation() {
        let tracker = WorkTracker::new();
        let task = tracker
            .create_task(CreateTaskOptions {
                task: "step work".to_string(),
                workflow_step_id: Some("step-7".to_string()),
                workflow_plan_id: Some("plan-1".to_string()),
                ..Default::default()
            })
            .await;

        assert_eq!(tracker.task_for_step("step-7").await, Some(task.task_id.clone()));
        assert_eq!(tracker.task_for_step("step-8").await, None);
    }

    #[tokio::test]
    async fn test_list_tasks_sorted_by_priority() {
        let tracker = WorkTracker::new();
        for priority in [10u8, 90, 50] {
            tracker
                .create_task(CreateTaskOptions {
                    task: format!("p{priority}"),
                    priority: Some(priority),
                    ..Default::default()
                })
                .await;
        }

        let tasks = tracker.list_tasks(TaskFilter::default()).await;
        let priorities: Vec<u8> = tasks.iter().map(|t| t.priority).collect();
        assert_eq!(priorities, vec![90, 50, 10]);
    }

    #[tokio::test]
    async fn test_list_tasks_by_plan_and_tag() {
        let tracker = WorkTracker::new();
        tracker
            .create_task(CreateTaskOptions {
                task: "in plan".to_string(),
                workflow_plan_id: Some("plan-1".to_string()),
                tags: vec!["urgent".to_string()],
                ..Default::default()
            })
            .await;
        tracker.create_task(opts("outside plan")).await;

        let in_plan = tracker
            .list_tasks(TaskFilter {
                workflow_plan_id: Some("plan-1".to_string()),
                ..Default::default()
            })
            .await;
        assert_eq!(in_plan.len(), 1);

        let tagged = tracker
            .list_tasks(TaskFilter {
                tag: Some("urgent".to_string()),
                ..Default::default()
            })
            .await;
        assert_eq!(tagged.len(), 1);

        let missing_plan = tracker
            .list_tasks(TaskFilter {
                workflow_plan_id: Some("plan-404".to_string()),
                ..Default::default()
            })
            .await;
        assert!(missing_plan.is_empty());
    }

    #[tokio::test]
    async fn test_summary_counts_and_at_risk() {
        let tracker = WorkTracker::new();

        let done = tracker.create_task(opts("done")).await;
        tracker.assign_task(&done.task_id, "agent-1").await;
        tracker.start_task(&done.task_id).await;
        tracker.complete_task(&done.task_id, success()).await;

        // 500ms budget, ~90% spent by the time the summary runs
        tracker
            .create_task(CreateTaskOptions {
                task: "at risk".to_string(),
                deadline: Some(Utc::now() + chrono::Duration::milliseconds(500)),
                ..Default::default()
            })
            .await;
        tokio::time::sleep(std::time::Duration::from_millis(450)).await;

        // plenty of budget left
        tracker
            .create_task(CreateTaskOptions {
                task: "comfortable".to_string(),
                deadline: Some(Utc::now() + chrono::Duration::hours(4)),
                ..Default::default()
            })
            .await;

        let summary = tracker.get_summary().await;
        assert_eq!(summary.total, 3);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.pending, 2);
        assert_eq!(summary.at_risk, 1);
        assert!(summary.average_completion_ms.is_some());
    }

    #[tokio::test]
    async fn test_expired_deadline_not_at_risk() {
        let tracker = WorkTracker::new();
        tracker
            .create_task(CreateTaskOptions {
                task: "already late".to_string(),
                deadline: Some(Utc::now() - chrono::Duration::seconds(10)),
                ..Default::default()
            })
            .await;

        let summary = tracker.get_summary().await;
        assert_eq!(summary.at_risk, 0);
    }

    #[tokio::test]
    async fn test_agent_workloads() {
        let tracker = WorkTracker::new();

        let t1 = tracker.create_task(opts("a")).await;
        tracker.assign_task(&t1.task_id, "agent-1").await;
        tracker.start_task(&t1.task_id).await;
        tracker.complete_task(&t1.task_id, success()).await;

        let t2 = tracker.create_task(opts("b")).await;
        tracker.assign_task(&t2.task_id, "agent-1").await;
        tracker.start_task(&t2.task_id).await;

        let t3 = tracker.create_task(opts("c")).await;
        tracker.assign_task(&t3.task_id, "agent-2").await;
        tracker.start_task(&t3.task_id).await;
        tracker.complete_task(&t3.task_id, failure()).await;

        let workloads = tracker.get_agent_workloads().await;
        assert_eq!(workloads.len(), 2);

        let agent1 = workloads
            .iter()
            .find(|w| w.agent_instance_id == "agent-1")
            .unwrap();
        assert_eq!(agent1.active_tasks, 1);
        assert_eq!(agent1.completed_tasks, 1);
        assert_eq!(agent1.failed_tasks, 0);
        assert!(agent1.average_duration_ms.is_some());

        let agent2 = workloads
            .iter()
            .find(|w| w.agent_instance_id == "agent-2")
            .unwrap();
        assert_eq!(agent2.failed_tasks, 1);
        assert!(agent2.average_duration_ms.is_none());
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_old_terminal_tasks() {
        let tracker = WorkTracker::new();

        let old_done = tracker
            .create_task(CreateTaskOptions {
                task: "old done".to_string(),
                workflow_step_id: Some("step-old".to_string()),
                workflow_plan_id: Some("plan-old".to_string()),
                ..Default::default()
            })
            .await;
        tracker.assign_task(&old_done.task_id, "agent-1").await;
        tracker.start_task(&old_done.task_id).await;
        tracker.complete_task(&old_done.task_id, success()).await;

        let old_failed = tracker.create_task(opts("old failed")).await;
        tracker.assign_task(&old_failed.task_id, "agent-1").await;
        tracker.start_task(&old_failed.task_id).await;
        tracker.complete_task(&old_failed.task_id, failure()).await;

        let active = tracker.create_task(opts("active")).await;

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        let removed = tracker.cleanup(20).await;
        assert_eq!(removed, 2);

        assert!(tracker.get_task(&old_done.task_id).await.is_none());
        assert!(tracker.get_task(&old_failed.task_id).await.is_none());
        assert!(tracker.get_task(&active.task_id).await.is_some());
        // index entries purged with the task
        assert_eq!(tracker.task_for_step("step-old").await, None);
        let in_plan = tracker
            .list_tasks(TaskFilter {
                workflow_plan_id: Some("plan-old".to_string()),
                ..Default::default()
            })
            .await;
        assert!(in_plan.is_empty());
        // non-terminal task untouched regardless of age
        assert_eq!(tracker.task_count().await, 1);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_recent_terminal_tasks() {
        let tracker = WorkTracker::new();
        let task = tracker.create_task(opts("just finished")).await;
        tracker.assign_task(&task.task_id, "agent-1").await;
        tracker.start_task(&task.task_id).await;
        tracker.complete_task(&task.task_id, success()).await;

        let removed = tracker.cleanup(60_000).await;
        assert_eq!(removed, 0);
        assert!(tracker.get_task(&task.task_id).await.is_some());
    }
}
