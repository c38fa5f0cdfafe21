use chrono::{DateTime, Utc};
use dirigent_core::{DirigentError, DirigentResult, EntityKind};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// How a step executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Runs out of process; the executor creates an external task record
    /// and waits for the reconciliation pass to observe its outcome.
    ExternalTask,
    /// Nothing to execute; completes the moment it becomes ready.
    NoOp,
    /// Runs inside the embedding process, which reports the outcome via
    /// `complete_step`/`fail_step`.
    Inline,
}

/// One step of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique step id.
    pub id: Uuid,
    /// Position in the definition; orders the sequential fallback.
    pub index: usize,
    /// Step name; doubles as the external task type.
    pub name: String,
    /// Execution kind.
    pub kind: StepKind,
    /// Worker the external task record is created for.
    #[serde(default = "default_worker")]
    pub worker: String,
    /// Step configuration, merged over the run context into the payload.
    #[serde(default)]
    pub config: serde_json::Value,
}

fn default_worker() -> String {
    "external".to_string()
}

impl StepDefinition {
    /// Create a step with an empty config and the default worker.
    pub fn new(index: usize, name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            index,
            name: name.into(),
            kind,
            worker: default_worker(),
            config: serde_json::Value::Null,
        }
    }

    /// Set the step configuration.
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    /// Set the worker external tasks are created for.
    pub fn with_worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = worker.into();
        self
    }
}

/// A dependency edge: `to_step` may only start once `from_step` is
/// completed or skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepEdge {
    /// Predecessor step.
    pub from_step: Uuid,
    /// Dependent step.
    pub to_step: Uuid,
}

/// A stored workflow template: ordered steps plus dependency edges.
/// Read-only at run time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Unique workflow id.
    pub id: Uuid,
    /// Stable lookup key.
    pub key: String,
    /// Steps, ordered by index.
    pub steps: Vec<StepDefinition>,
    /// Dependency edges; empty means strictly sequential execution.
    pub edges: Vec<StepEdge>,
}

impl WorkflowDefinition {
    /// Create a definition from steps and edges.
    pub fn new(key: impl Into<String>, steps: Vec<StepDefinition>, edges: Vec<StepEdge>) -> Self {
        Self {
            id: Uuid::new_v4(),
            key: key.into(),
            steps,
            edges,
        }
    }

    /// The predecessors of each step, from the edge list.
    pub fn predecessors(&self) -> HashMap<Uuid, Vec<Uuid>> {
        let mut map: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for edge in &self.edges {
            map.entry(edge.to_step).or_default().push(edge.from_step);
        }
        map
    }

    /// Reject definitions whose edges reference unknown steps or form a
    /// cycle.
    pub fn validate(&self) -> DirigentResult<()> {
        let known: HashSet<Uuid> = self.steps.iter().map(|s| s.id).collect();
        for edge in &self.edges {
            for id in [edge.from_step, edge.to_step] {
                if !known.contains(&id) {
                    return Err(DirigentError::UnknownEntity {
                        kind: EntityKind::Step,
                        id: id.to_string(),
                    });
                }
            }
        }
        if self.has_cycle() {
            return Err(DirigentError::CycleDetected(format!("workflow {}", self.key)));
        }
        Ok(())
    }

    fn has_cycle(&self) -> bool {
        let preds = self.predecessors();
        let mut visited: HashMap<Uuid, u8> = HashMap::new();

        fn visit(id: Uuid, preds: &HashMap<Uuid, Vec<Uuid>>, visited: &mut HashMap<Uuid, u8>) -> bool {
            match visited.get(&id) {
                Some(1) => return true,
                Some(2) => return false,
                _ => {}
            }
            visited.insert(id, 1);
            for pred in preds.get(&id).map(Vec::as_slice).unwrap_or_default() {
                if visit(*pred, preds, visited) {
                    return true;
                }
            }
            visited.insert(id, 2);
            false
        }

        self.steps.iter().any(|s| visit(s.id, &preds, &mut visited))
    }
}

/// Status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, nothing started.
    Pending,
    /// At least one step started.
    Running,
    /// Every step terminal, none failed.
    Completed,
    /// Progress exhausted with at least one failed step.
    Failed,
    /// Canceled by the caller.
    Canceled,
}

impl RunStatus {
    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Canceled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
        };
        write!(f, "{name}")
    }
}

/// Status of a single step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStepStatus {
    /// Not started; predecessors still open.
    Pending,
    /// An external task record exists; awaiting reconciliation.
    WaitingForExternalTask,
    /// Executing in process.
    Running,
    /// Terminal success.
    Completed,
    /// Terminal failure; blocks dependents permanently.
    Failed,
    /// Skipped by cancellation; counts as terminal success for gating.
    Skipped,
}

impl RunStepStatus {
    /// Whether the step is finished, in any way.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStepStatus::Completed | RunStepStatus::Failed | RunStepStatus::Skipped
        )
    }

    /// Whether the step satisfies its dependents.
    pub fn is_success(&self) -> bool {
        matches!(self, RunStepStatus::Completed | RunStepStatus::Skipped)
    }
}

impl std::fmt::Display for RunStepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunStepStatus::Pending => "pending",
            RunStepStatus::WaitingForExternalTask => "waiting_for_external_task",
            RunStepStatus::Running => "running",
            RunStepStatus::Completed => "completed",
            RunStepStatus::Failed => "failed",
            RunStepStatus::Skipped => "skipped",
        };
        write!(f, "{name}")
    }
}

/// One execution of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Unique run id.
    pub id: Uuid,
    /// The definition being executed.
    pub workflow_id: Uuid,
    /// Current status.
    pub status: RunStatus,
    /// Caller-supplied context merged into every step payload.
    pub context: serde_json::Value,
    /// Collected step outputs, set when the run completes.
    pub result: Option<serde_json::Value>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Set when the run reaches a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    /// Create a pending run.
    pub fn new(workflow_id: Uuid, context: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            status: RunStatus::Pending,
            context,
            result: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// Authoritative state of one (run, step) pair; what the reconciliation
/// pass updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRunStep {
    /// Owning run.
    pub run_id: Uuid,
    /// Definition step this record tracks.
    pub step_id: Uuid,
    /// Current status.
    pub status: RunStepStatus,
    /// Reference to the external task record, when one exists.
    pub external_task_id: Option<String>,
    /// Payload the step started with.
    pub input: serde_json::Value,
    /// Output copied from the external task or the in-process completion.
    pub output: serde_json::Value,
    /// Error copied on failure.
    pub error: Option<String>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRunStep {
    /// Create a pending step record.
    pub fn new(run_id: Uuid, step_id: Uuid) -> Self {
        Self {
            run_id,
            step_id,
            status: RunStepStatus::Pending,
            external_task_id: None,
            input: serde_json::Value::Null,
            output: serde_json::Value::Null,
            error: None,
            updated_at: Utc::now(),
        }
    }
}

/// Status of a task on the external queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalTaskStatus {
    /// Queued, not picked up.
    Pending,
    /// Being executed.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
}

/// Snapshot returned when polling an external task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalTaskSnapshot {
    /// Queue-side status.
    pub status: ExternalTaskStatus,
    /// Result payload, present on completion.
    pub result: Option<serde_json::Value>,
    /// Error description, present on failure.
    pub error: Option<String>,
}

/// Outcome of one `advance` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvanceOutcome {
    /// The run after the call.
    pub run: WorkflowRun,
    /// Every step record, in definition order.
    pub steps: Vec<WorkflowRunStep>,
    /// Steps that left `pending` during this call.
    pub started: usize,
}

/// Outcome of a run cancel call. `changed` is false when the run was
/// already terminal and the call was a no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCancelOutcome {
    /// The run after the call.
    pub run: WorkflowRun,
    /// Every step record, in definition order.
    pub steps: Vec<WorkflowRunStep>,
    /// Whether this call changed anything.
    pub changed: bool,
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SyncOutcome {
    /// Steps moved to a terminal status by this pass.
    pub updated: usize,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn three_steps() -> Vec<StepDefinition> {
        vec![
            StepDefinition::new(0, "extract", StepKind::ExternalTask),
            StepDefinition::new(1, "transform", StepKind::ExternalTask),
            StepDefinition::new(2, "load", StepKind::ExternalTask),
        ]
    }

    #[test]
    fn test_validate_accepts_linear_edges() {
        let steps = three_steps();
        let edges = vec![
            StepEdge { from_step: steps[0].id, to_step: steps[1].id },
            StepEdge { from_step: steps[1].id, to_step: steps[2].id },
        ];
        let def = WorkflowDefinition::new("etl", steps, edges);
        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unknown_step() {
        let steps = three_steps();
        let edges = vec![StepEdge {
            from_step: Uuid::new_v4(),
            to_step: steps[0].id,
        }];
        let def = WorkflowDefinition::new("etl", steps, edges);
        assert!(matches!(
            def.validate(),
            Err(DirigentError::UnknownEntity { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_cycle() {
        let steps = three_steps();
        let edges = vec![
            StepEdge { from_step: steps[0].id, to_step: steps[1].id },
            StepEdge { from_step: steps[1].id, to_step: steps[0].id },
        ];
        let def = WorkflowDefinition::new("etl", steps, edges);
        assert!(matches!(
            def.validate(),
            Err(DirigentError::CycleDetected(_))
        ));
    }

    #[test]
    fn test_predecessor_map() {
        let steps = three_steps();
        let edges = vec![
            StepEdge { from_step: steps[0].id, to_step: steps[2].id },
            StepEdge { from_step: steps[1].id, to_step: steps[2].id },
        ];
        let def = WorkflowDefinition::new("fanin", steps.clone(), edges);
        let preds = def.predecessors();
        assert_eq!(preds[&steps[2].id].len(), 2);
        assert!(!preds.contains_key(&steps[0].id));
    }

    #[test]
    fn test_step_status_classification() {
        assert!(RunStepStatus::Skipped.is_terminal());
        assert!(RunStepStatus::Skipped.is_success());
        assert!(RunStepStatus::Failed.is_terminal());
        assert!(!RunStepStatus::Failed.is_success());
        assert!(!RunStepStatus::WaitingForExternalTask.is_terminal());
    }

    #[test]
    fn test_run_creation() {
        let run = WorkflowRun::new(Uuid::new_v4(), serde_json::json!({"tenant": "acme"}));
        assert_eq!(run.status, RunStatus::Pending);
        assert!(run.result.is_none());
        assert!(!run.status.is_terminal());
    }
}
