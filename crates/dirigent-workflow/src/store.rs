use crate::types::{
    ExternalTaskSnapshot, ExternalTaskStatus, WorkflowDefinition, WorkflowRun, WorkflowRunStep,
};
use async_trait::async_trait;
use dirigent_core::{DirigentError, DirigentResult, EntityKind};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Persistence for workflow definitions, runs, and run steps.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Store a definition.
    async fn put_workflow(&self, definition: &WorkflowDefinition) -> DirigentResult<()>;
    /// Fetch a definition by id.
    async fn get_workflow(&self, id: Uuid) -> DirigentResult<Option<WorkflowDefinition>>;
    /// Create or replace a run.
    async fn upsert_run(&self, run: &WorkflowRun) -> DirigentResult<()>;
    /// Fetch a run by id.
    async fn get_run(&self, id: Uuid) -> DirigentResult<Option<WorkflowRun>>;
    /// Every stored run.
    async fn list_runs(&self) -> DirigentResult<Vec<WorkflowRun>>;
    /// Create or replace one (run, step) record.
    async fn upsert_run_step(&self, step: &WorkflowRunStep) -> DirigentResult<()>;
    /// Every step record of a run.
    async fn list_run_steps(&self, run_id: Uuid) -> DirigentResult<Vec<WorkflowRunStep>>;
}

/// The external task runner the executor delegates real work to.
#[async_trait]
pub trait ExternalTaskQueue: Send + Sync {
    /// Create a task record; returns its queue-side id.
    async fn create_task(
        &self,
        worker_id: &str,
        task_type: &str,
        payload: serde_json::Value,
    ) -> DirigentResult<String>;
    /// Poll a task's status.
    async fn get_task_status(&self, task_id: &str) -> DirigentResult<ExternalTaskSnapshot>;
}

// --- In-memory implementations ---

/// In-memory workflow store. The default for tests and single-process
/// embeddings.
pub struct InMemoryWorkflowStore {
    workflows: RwLock<HashMap<Uuid, WorkflowDefinition>>,
    runs: RwLock<HashMap<Uuid, WorkflowRun>>,
    steps: RwLock<HashMap<Uuid, Vec<WorkflowRunStep>>>,
}

impl InMemoryWorkflowStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
            runs: RwLock::new(HashMap::new()),
            steps: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryWorkflowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn put_workflow(&self, definition: &WorkflowDefinition) -> DirigentResult<()> {
        self.workflows
            .write()
            .await
            .insert(definition.id, definition.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: Uuid) -> DirigentResult<Option<WorkflowDefinition>> {
        Ok(self.workflows.read().await.get(&id).cloned())
    }

    async fn upsert_run(&self, run: &WorkflowRun) -> DirigentResult<()> {
        self.runs.write().await.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> DirigentResult<Option<WorkflowRun>> {
        Ok(self.runs.read().await.get(&id).cloned())
    }

    async fn list_runs(&self) -> DirigentResult<Vec<WorkflowRun>> {
        let mut runs: Vec<WorkflowRun> = self.runs.read().await.values().cloned().collect();
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }

    async fn upsert_run_step(&self, step: &WorkflowRunStep) -> DirigentResult<()> {
        let mut steps = self.steps.write().await;
        let records = steps.entry(step.run_id).or_default();
        match records.iter_mut().find(|s| s.step_id == step.step_id) {
            Some(existing) => *existing = step.clone(),
            None => records.push(step.clone()),
        }
        Ok(())
    }

    async fn list_run_steps(&self, run_id: Uuid) -> DirigentResult<Vec<WorkflowRunStep>> {
        Ok(self
            .steps
            .read()
            .await
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// File-based workflow store (JSON documents on disk).
///
/// One file per workflow and per run; a run's step records live together in
/// one document keyed by the run id.
pub struct FileWorkflowStore {
    dir: PathBuf,
}

impl FileWorkflowStore {
    /// Create the store, making its directory layout as needed.
    pub async fn new(dir: PathBuf) -> DirigentResult<Self> {
        for sub in ["workflows", "runs", "steps"] {
            tokio::fs::create_dir_all(dir.join(sub)).await?;
        }
        Ok(Self { dir })
    }

    fn workflow_path(&self, id: Uuid) -> PathBuf {
        self.dir.join("workflows").join(format!("{id}.json"))
    }

    fn run_path(&self, id: Uuid) -> PathBuf {
        self.dir.join("runs").join(format!("{id}.json"))
    }

    fn steps_path(&self, run_id: Uuid) -> PathBuf {
        self.dir.join("steps").join(format!("{run_id}.json"))
    }
}

#[async_trait]
impl WorkflowStore for FileWorkflowStore {
    async fn put_workflow(&self, definition: &WorkflowDefinition) -> DirigentResult<()> {
        let json = serde_json::to_string_pretty(definition)?;
        tokio::fs::write(self.workflow_path(definition.id), json).await?;
        Ok(())
    }

    async fn get_workflow(&self, id: Uuid) -> DirigentResult<Option<WorkflowDefinition>> {
        let path = self.workflow_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(path).await?;
        let definition = serde_json::from_str(&data)
            .map_err(|e| DirigentError::Store(format!("failed to parse workflow {id}: {e}")))?;
        Ok(Some(definition))
    }

    async fn upsert_run(&self, run: &WorkflowRun) -> DirigentResult<()> {
        let json = serde_json::to_string_pretty(run)?;
        tokio::fs::write(self.run_path(run.id), json).await?;
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> DirigentResult<Option<WorkflowRun>> {
        let path = self.run_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(path).await?;
        let run = serde_json::from_str(&data)
            .map_err(|e| DirigentError::Store(format!("failed to parse run {id}: {e}")))?;
        Ok(Some(run))
    }

    async fn list_runs(&self) -> DirigentResult<Vec<WorkflowRun>> {
        let mut entries = tokio::fs::read_dir(self.dir.join("runs")).await?;
        let mut runs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(stem) = name.strip_suffix(".json") {
                    if let Ok(id) = Uuid::parse_str(stem) {
                        if let Some(run) = self.get_run(id).await? {
                            runs.push(run);
                        }
                    }
                }
            }
        }
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }

    async fn upsert_run_step(&self, step: &WorkflowRunStep) -> DirigentResult<()> {
        let mut records = self.list_run_steps(step.run_id).await?;
        match records.iter_mut().find(|s| s.step_id == step.step_id) {
            Some(existing) => *existing = step.clone(),
            None => records.push(step.clone()),
        }
        let json = serde_json::to_string_pretty(&records)?;
        tokio::fs::write(self.steps_path(step.run_id), json).await?;
        Ok(())
    }

    async fn list_run_steps(&self, run_id: Uuid) -> DirigentResult<Vec<WorkflowRunStep>> {
        let path = self.steps_path(run_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = tokio::fs::read_to_string(path).await?;
        let records = serde_json::from_str(&data).map_err(|e| {
            DirigentError::Store(format!("failed to parse steps for run {run_id}: {e}"))
        })?;
        Ok(records)
    }
}

/// In-memory external task queue with test hooks to drive task outcomes.
pub struct InMemoryTaskQueue {
    tasks: RwLock<HashMap<String, TaskRecord>>,
    counter: AtomicU64,
}

struct TaskRecord {
    worker_id: String,
    task_type: String,
    payload: serde_json::Value,
    snapshot: ExternalTaskSnapshot,
}

/// Queue-side view of a created task record.
#[derive(Debug, Clone)]
pub struct CreatedTask {
    /// Worker the record was created for.
    pub worker_id: String,
    /// Task type tag.
    pub task_type: String,
    /// Payload handed to the runner.
    pub payload: serde_json::Value,
}

impl InMemoryTaskQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            counter: AtomicU64::new(0),
        }
    }

    /// Number of task records ever created.
    pub fn created_count(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    /// Inspect a created task record.
    pub async fn created_task(&self, task_id: &str) -> Option<CreatedTask> {
        self.tasks.read().await.get(task_id).map(|r| CreatedTask {
            worker_id: r.worker_id.clone(),
            task_type: r.task_type.clone(),
            payload: r.payload.clone(),
        })
    }

    /// Mark a task in progress, as a picked-up runner would.
    pub async fn start_task(&self, task_id: &str) -> DirigentResult<()> {
        self.transition(task_id, ExternalTaskStatus::InProgress, None, None)
            .await
    }

    /// Complete a task with a result, as the external runner would.
    pub async fn complete_task(
        &self,
        task_id: &str,
        result: serde_json::Value,
    ) -> DirigentResult<()> {
        self.transition(task_id, ExternalTaskStatus::Completed, Some(result), None)
            .await
    }

    /// Fail a task with an error, as the external runner would.
    pub async fn fail_task(&self, task_id: &str, error: &str) -> DirigentResult<()> {
        self.transition(
            task_id,
            ExternalTaskStatus::Failed,
            None,
            Some(error.to_string()),
        )
        .await
    }

    async fn transition(
        &self,
        task_id: &str,
        status: ExternalTaskStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> DirigentResult<()> {
        let mut tasks = self.tasks.write().await;
        let record = tasks
            .get_mut(task_id)
            .ok_or_else(|| DirigentError::UnknownEntity {
                kind: EntityKind::ExternalTask,
                id: task_id.to_string(),
            })?;
        record.snapshot = ExternalTaskSnapshot {
            status,
            result,
            error,
        };
        Ok(())
    }
}

impl Default for InMemoryTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExternalTaskQueue for InMemoryTaskQueue {
    async fn create_task(
        &self,
        worker_id: &str,
        task_type: &str,
        payload: serde_json::Value,
    ) -> DirigentResult<String> {
        let id = format!("task-{}", self.counter.fetch_add(1, Ordering::SeqCst) + 1);
        self.tasks.write().await.insert(
            id.clone(),
            TaskRecord {
                worker_id: worker_id.to_string(),
                task_type: task_type.to_string(),
                payload,
                snapshot: ExternalTaskSnapshot {
                    status: ExternalTaskStatus::Pending,
                    result: None,
                    error: None,
                },
            },
        );
        Ok(id)
    }

    async fn get_task_status(&self, task_id: &str) -> DirigentResult<ExternalTaskSnapshot> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .map(|r| r.snapshot.clone())
            .ok_or_else(|| DirigentError::UnknownEntity {
                kind: EntityKind::ExternalTask,
                id: task_id.to_string(),
            })
    }
}
