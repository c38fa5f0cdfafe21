use chrono::{DateTime, Utc};
use dirigent_core::Priority;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Aggregate status of a directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectiveStatus {
    /// Created, sub-tasks not yet planned.
    Planning,
    /// Sub-tasks planned, delegation waves not yet started or incomplete.
    Delegating,
    /// At least one sub-task delegated; work ongoing.
    InProgress,
    /// Mean progress crossed the escalation threshold; attention requested.
    /// Not terminal.
    Reviewing,
    /// Every sub-task completed.
    Completed,
    /// All progress exhausted with at least one failed sub-task.
    Failed,
    /// Canceled by the caller.
    Canceled,
}

impl DirectiveStatus {
    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DirectiveStatus::Completed | DirectiveStatus::Failed | DirectiveStatus::Canceled
        )
    }
}

impl std::fmt::Display for DirectiveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DirectiveStatus::Planning => "planning",
            DirectiveStatus::Delegating => "delegating",
            DirectiveStatus::InProgress => "in_progress",
            DirectiveStatus::Reviewing => "reviewing",
            DirectiveStatus::Completed => "completed",
            DirectiveStatus::Failed => "failed",
            DirectiveStatus::Canceled => "canceled",
        };
        write!(f, "{name}")
    }
}

/// Status of a single sub-task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubTaskStatus {
    /// Created, not yet delegated.
    Pending,
    /// Sent to its worker, no reaction yet.
    Delegated,
    /// Worker confirmed it took the task.
    Accepted,
    /// Worker reported progress.
    InProgress,
    /// Terminal success.
    Completed,
    /// Terminal failure; blocks dependents permanently.
    Failed,
}

impl SubTaskStatus {
    /// Whether the sub-task is finished, successfully or not.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubTaskStatus::Completed | SubTaskStatus::Failed)
    }
}

impl std::fmt::Display for SubTaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SubTaskStatus::Pending => "pending",
            SubTaskStatus::Delegated => "delegated",
            SubTaskStatus::Accepted => "accepted",
            SubTaskStatus::InProgress => "in_progress",
            SubTaskStatus::Completed => "completed",
            SubTaskStatus::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// A high-level unit of work, decomposed into sub-tasks at planning time.
/// Immutable once its status is terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Directive {
    /// Unique directive id.
    pub id: Uuid,
    /// Directive type tag.
    pub kind: String,
    /// Human-readable description.
    pub description: String,
    /// Delegation priority inherited by every envelope sent for it.
    pub priority: Priority,
    /// Workers the caller wants involved, if any.
    pub targets: Vec<String>,
    /// Ids of the sub-tasks planned under this directive, in plan order.
    pub sub_tasks: Vec<Uuid>,
    /// Aggregate status.
    pub status: DirectiveStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Set when the directive reaches a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Directive {
    /// Create a directive in `planning` state.
    pub fn new(
        kind: impl Into<String>,
        description: impl Into<String>,
        priority: Priority,
        targets: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            description: description.into(),
            priority,
            targets,
            sub_tasks: Vec::new(),
            status: DirectiveStatus::Planning,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// An atomic unit of delegated work with one assigned worker and explicit
/// dependencies on sibling sub-tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTask {
    /// Unique sub-task id.
    pub id: Uuid,
    /// Owning directive.
    pub directive_id: Uuid,
    /// Worker this sub-task was assigned to.
    pub worker: String,
    /// Task type tag.
    pub kind: String,
    /// Human-readable description.
    pub description: String,
    /// Parameter payload handed to the worker.
    pub params: serde_json::Value,
    /// Sibling sub-tasks that must complete first.
    pub dependencies: Vec<Uuid>,
    /// Current status.
    pub status: SubTaskStatus,
    /// Progress, 0–100.
    pub progress: u8,
    /// Result payload, set by the final status update.
    pub result: Option<serde_json::Value>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Set on the terminal status update.
    pub completed_at: Option<DateTime<Utc>>,
}

impl SubTask {
    /// Create a pending sub-task.
    pub fn new(
        directive_id: Uuid,
        worker: impl Into<String>,
        kind: impl Into<String>,
        description: impl Into<String>,
        params: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            directive_id,
            worker: worker.into(),
            kind: kind.into(),
            description: description.into(),
            params,
            dependencies: Vec::new(),
            status: SubTaskStatus::Pending,
            progress: 0,
            result: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Set dependency sub-task ids.
    pub fn with_dependencies(mut self, deps: Vec<Uuid>) -> Self {
        self.dependencies = deps;
        self
    }
}

/// One candidate sub-task handed to the planner.
///
/// Dependencies reference other specs in the same list by index; the planner
/// resolves them to real sub-task ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Task type tag.
    pub kind: String,
    /// Human-readable description.
    pub description: String,
    /// Parameter payload.
    #[serde(default)]
    pub params: serde_json::Value,
    /// Capability tags the assigned worker should cover.
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    /// Pin a specific worker instead of asking the registry.
    #[serde(default)]
    pub worker: Option<String>,
    /// Indices of specs in this list that must complete first.
    #[serde(default)]
    pub depends_on: Vec<usize>,
}

impl TaskSpec {
    /// Create a spec with no capabilities, params, or dependencies.
    pub fn new(kind: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            description: description.into(),
            params: serde_json::Value::Null,
            required_capabilities: Vec::new(),
            worker: None,
            depends_on: Vec::new(),
        }
    }

    /// Require capability tags.
    pub fn with_capabilities(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.required_capabilities = tags.into_iter().collect();
        self
    }

    /// Set the parameter payload.
    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    /// Pin a specific worker.
    pub fn with_worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = Some(worker.into());
        self
    }

    /// Add dependencies by spec-list index.
    pub fn depends_on(mut self, indices: impl IntoIterator<Item = usize>) -> Self {
        self.depends_on.extend(indices);
        self
    }
}

/// The kind of progress report a worker sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    /// Worker took the task.
    Accepted,
    /// Work underway.
    InProgress,
    /// Terminal success.
    Completed,
    /// Terminal failure.
    Failed,
}

impl std::fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            UpdateKind::Accepted => "accepted",
            UpdateKind::InProgress => "in_progress",
            UpdateKind::Completed => "completed",
            UpdateKind::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// One progress report, appended to its delegation's status stream and
/// folded into the owning sub-task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    /// Owning directive.
    pub directive_id: Uuid,
    /// Reported sub-task.
    pub sub_task_id: Uuid,
    /// Reporting worker.
    pub worker_id: String,
    /// When the report was received.
    pub timestamp: DateTime<Utc>,
    /// Report kind.
    pub kind: UpdateKind,
    /// Progress, 0–100.
    pub progress: u8,
    /// Free-form message.
    pub message: Option<String>,
    /// Structured payload (the result, for terminal reports).
    pub data: Option<serde_json::Value>,
}

/// Compact view of one sub-task inside a progress snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTaskSnapshot {
    /// Sub-task id.
    pub id: Uuid,
    /// Assigned worker.
    pub worker: String,
    /// Current status.
    pub status: SubTaskStatus,
    /// Progress, 0–100.
    pub progress: u8,
}

/// Point-in-time progress of a directive and its sub-tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectiveProgress {
    /// Directive id.
    pub directive_id: Uuid,
    /// Aggregate status.
    pub status: DirectiveStatus,
    /// Sub-task count.
    pub total: usize,
    /// Sub-tasks completed.
    pub completed: usize,
    /// Sub-tasks failed.
    pub failed: usize,
    /// Sub-tasks delegated, accepted, or in progress.
    pub active: usize,
    /// Sub-tasks not yet delegated.
    pub pending: usize,
    /// Mean progress across all sub-tasks.
    pub average_progress: f64,
    /// Per-sub-task detail.
    pub sub_tasks: Vec<SubTaskSnapshot>,
}

/// One successful delegation inside a wave.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegatedSubTask {
    /// The delegated sub-task.
    pub sub_task: Uuid,
    /// The delegation envelope id; status updates key on it.
    pub delegation: Uuid,
    /// The worker it went to.
    pub worker: String,
}

/// Outcome of one `delegate_all_sub_tasks` pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationWave {
    /// The directive the wave ran for.
    pub directive_id: Uuid,
    /// Sub-tasks delegated this pass, in topological order.
    pub delegated: Vec<DelegatedSubTask>,
    /// Sub-tasks skipped because dependencies are still open.
    pub skipped: Vec<Uuid>,
}

/// Outcome of a cancel call. `changed` is false when the directive was
/// already terminal and the call was a no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelOutcome {
    /// The directive after the call.
    pub directive: Directive,
    /// Whether this call changed anything.
    pub changed: bool,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_directive_creation() {
        let d = Directive::new("research", "Survey the zone", Priority::High, vec![]);
        assert_eq!(d.status, DirectiveStatus::Planning);
        assert!(d.sub_tasks.is_empty());
        assert!(d.completed_at.is_none());
    }

    #[test]
    fn test_sub_task_creation() {
        let d = Uuid::new_v4();
        let t = SubTask::new(d, "scout", "survey", "Survey sector 4", serde_json::json!({}));
        assert_eq!(t.status, SubTaskStatus::Pending);
        assert_eq!(t.progress, 0);
        assert_eq!(t.directive_id, d);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(DirectiveStatus::Completed.is_terminal());
        assert!(DirectiveStatus::Failed.is_terminal());
        assert!(DirectiveStatus::Canceled.is_terminal());
        assert!(!DirectiveStatus::Reviewing.is_terminal());
        assert!(SubTaskStatus::Failed.is_terminal());
        assert!(!SubTaskStatus::Delegated.is_terminal());
    }

    #[test]
    fn test_task_spec_builder() {
        let spec = TaskSpec::new("analysis", "Analyze samples")
            .with_capabilities(vec!["analysis".to_string()])
            .depends_on([0, 1]);
        assert_eq!(spec.required_capabilities.len(), 1);
        assert_eq!(spec.depends_on, vec![0, 1]);
        assert!(spec.worker.is_none());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&DirectiveStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        let parsed: SubTaskStatus = serde_json::from_str("\"delegated\"").unwrap();
        assert_eq!(parsed, SubTaskStatus::Delegated);
    }
}
