use crate::store::{ExternalTaskQueue, WorkflowStore};
use crate::types::{
    AdvanceOutcome, ExternalTaskStatus, RunCancelOutcome, RunStatus, RunStepStatus, StepKind,
    SyncOutcome, WorkflowDefinition, WorkflowRun, WorkflowRunStep,
};
use chrono::Utc;
use dirigent_core::{DirigentError, DirigentResult, EntityKind};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Executes persisted workflow runs against an external task queue.
///
/// The same dependency-gating logic as directive delegation, but over
/// stored state: `advance` computes the ready set and starts it,
/// `sync_from_external_tasks` pulls externally-observed outcomes back into
/// step status, and the run converges to a terminal status once nothing can
/// move any more.
pub struct RunExecutor {
    store: Arc<dyn WorkflowStore>,
    queue: Arc<dyn ExternalTaskQueue>,
}

impl RunExecutor {
    /// Create an executor over the given store and queue.
    pub fn new(store: Arc<dyn WorkflowStore>, queue: Arc<dyn ExternalTaskQueue>) -> Self {
        Self { store, queue }
    }

    /// Create a pending run of a workflow, with one pending step record per
    /// definition step.
    pub async fn start_run(
        &self,
        workflow_id: Uuid,
        context: serde_json::Value,
    ) -> DirigentResult<(WorkflowRun, Vec<WorkflowRunStep>)> {
        let definition = self.definition(workflow_id).await?;
        definition.validate()?;

        let run = WorkflowRun::new(workflow_id, context);
        self.store.upsert_run(&run).await?;
        let mut steps = Vec::with_capacity(definition.steps.len());
        for step in &definition.steps {
            let record = WorkflowRunStep::new(run.id, step.id);
            self.store.upsert_run_step(&record).await?;
            steps.push(record);
        }
        info!(run = %run.id, workflow = %definition.key, steps = steps.len(), "run created");
        Ok((run, steps))
    }

    /// Advance a run: start every ready step, then converge the run status.
    ///
    /// Ready means pending with every predecessor completed or skipped.
    /// With no edges the definition is strictly sequential: at most the
    /// single next pending step starts, and only once every earlier step is
    /// completed or skipped. External steps get a task record and move to
    /// `waiting_for_external_task`; no-op steps complete immediately;
    /// inline steps move to `running`.
    pub async fn advance(&self, run_id: Uuid) -> DirigentResult<AdvanceOutcome> {
        let mut run = self.run(run_id).await?;
        if run.status.is_terminal() {
            return Err(DirigentError::InvalidTransition {
                entity: EntityKind::Run,
                from: run.status.to_string(),
                to: RunStatus::Running.to_string(),
            });
        }
        let definition = self.definition(run.workflow_id).await?;
        definition.validate()?;
        let mut records = self.records_in_order(&definition, run_id).await?;
        let by_id: HashMap<Uuid, usize> = records
            .iter()
            .enumerate()
            .map(|(idx, r)| (r.step_id, idx))
            .collect();

        let ready: Vec<Uuid> = if definition.edges.is_empty() {
            sequential_ready(&definition, &records)
        } else {
            let preds = definition.predecessors();
            records
                .iter()
                .filter(|r| r.status == RunStepStatus::Pending)
                .filter(|r| {
                    preds
                        .get(&r.step_id)
                        .map(Vec::as_slice)
                        .unwrap_or_default()
                        .iter()
                        .all(|pred| {
                            by_id
                                .get(pred)
                                .map(|idx| records[*idx].status.is_success())
                                .unwrap_or(false)
                        })
                })
                .map(|r| r.step_id)
                .collect()
        };

        let mut started = 0;
        for step_id in ready {
            let Some(step_def) = definition.steps.iter().find(|s| s.id == step_id) else {
                continue;
            };
            let idx = by_id[&step_id];
            let record = &mut records[idx];
            let payload = merge_payload(&run.context, &step_def.config);
            match step_def.kind {
                StepKind::ExternalTask => {
                    let task_id = self
                        .queue
                        .create_task(&step_def.worker, &step_def.name, payload.clone())
                        .await?;
                    record.status = RunStepStatus::WaitingForExternalTask;
                    record.external_task_id = Some(task_id.clone());
                    record.input = payload;
                    debug!(run = %run_id, step = %step_def.name, task = %task_id,
                        "external task created");
                }
                StepKind::NoOp => {
                    record.status = RunStepStatus::Completed;
                    record.input = payload;
                    debug!(run = %run_id, step = %step_def.name, "no-op step completed");
                }
                StepKind::Inline => {
                    record.status = RunStepStatus::Running;
                    record.input = payload;
                    debug!(run = %run_id, step = %step_def.name, "inline step running");
                }
            }
            record.updated_at = Utc::now();
            self.store.upsert_run_step(record).await?;
            started += 1;
        }

        if run.status == RunStatus::Pending && started > 0 {
            run.status = RunStatus::Running;
            run.updated_at = Utc::now();
        }
        self.converge(&definition, &mut run, &records, started).await?;

        info!(run = %run_id, started, status = %run.status, "run advanced");
        Ok(AdvanceOutcome { run, steps: records, started })
    }

    /// Complete an in-process step with its output, then leave convergence
    /// to the next `advance`.
    pub async fn complete_step(
        &self,
        run_id: Uuid,
        step_id: Uuid,
        output: serde_json::Value,
    ) -> DirigentResult<WorkflowRunStep> {
        self.finish_step(run_id, step_id, RunStepStatus::Completed, output, None)
            .await
    }

    /// Fail an in-process step with an error description.
    pub async fn fail_step(
        &self,
        run_id: Uuid,
        step_id: Uuid,
        error: &str,
    ) -> DirigentResult<WorkflowRunStep> {
        self.finish_step(
            run_id,
            step_id,
            RunStepStatus::Failed,
            serde_json::Value::Null,
            Some(error.to_string()),
        )
        .await
    }

    async fn finish_step(
        &self,
        run_id: Uuid,
        step_id: Uuid,
        status: RunStepStatus,
        output: serde_json::Value,
        error: Option<String>,
    ) -> DirigentResult<WorkflowRunStep> {
        let records = self.store.list_run_steps(run_id).await?;
        let mut record = records
            .into_iter()
            .find(|r| r.step_id == step_id)
            .ok_or_else(|| DirigentError::UnknownEntity {
                kind: EntityKind::Step,
                id: step_id.to_string(),
            })?;
        if !matches!(
            record.status,
            RunStepStatus::Running | RunStepStatus::WaitingForExternalTask
        ) {
            return Err(DirigentError::InvalidTransition {
                entity: EntityKind::Step,
                from: record.status.to_string(),
                to: status.to_string(),
            });
        }
        record.status = status;
        record.output = output;
        record.error = error;
        record.updated_at = Utc::now();
        self.store.upsert_run_step(&record).await?;
        Ok(record)
    }

    /// Cancel a run.
    ///
    /// Idempotent: an already-terminal run is a reported no-op
    /// (`changed = false`). Otherwise the run is canceled and every
    /// still-pending step is skipped.
    pub async fn cancel(&self, run_id: Uuid) -> DirigentResult<RunCancelOutcome> {
        let mut run = self.run(run_id).await?;
        let mut records = self.store.list_run_steps(run_id).await?;
        if run.status.is_terminal() {
            return Ok(RunCancelOutcome {
                run,
                steps: records,
                changed: false,
            });
        }

        for record in &mut records {
            if record.status == RunStepStatus::Pending {
                record.status = RunStepStatus::Skipped;
                record.updated_at = Utc::now();
                self.store.upsert_run_step(record).await?;
            }
        }
        run.status = RunStatus::Canceled;
        let now = Utc::now();
        run.updated_at = now;
        run.completed_at = Some(now);
        self.store.upsert_run(&run).await?;

        info!(run = %run_id, "run canceled");
        Ok(RunCancelOutcome {
            run,
            steps: records,
            changed: true,
        })
    }

    /// Reconciliation pass: poll every waiting step's external task and
    /// fold observed outcomes back into step status.
    ///
    /// This is the bridge that lets the DAG converge even though the actual
    /// work runs out of process and is discovered only by polling. Run
    /// status convergence happens on the next `advance`.
    pub async fn sync_from_external_tasks(&self) -> DirigentResult<SyncOutcome> {
        let mut updated = 0;
        for run in self.store.list_runs().await? {
            if run.status.is_terminal() {
                continue;
            }
            for mut record in self.store.list_run_steps(run.id).await? {
                if record.status != RunStepStatus::WaitingForExternalTask {
                    continue;
                }
                let Some(task_id) = record.external_task_id.clone() else {
                    warn!(run = %run.id, step = %record.step_id,
                        "waiting step has no external task reference");
                    continue;
                };
                let snapshot = match self.queue.get_task_status(&task_id).await {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        warn!(run = %run.id, task = %task_id, error = %e,
                            "external task poll failed, will retry next pass");
                        continue;
                    }
                };
                match snapshot.status {
                    ExternalTaskStatus::Completed => {
                        record.status = RunStepStatus::Completed;
                        record.output = snapshot.result.unwrap_or(serde_json::Value::Null);
                        record.updated_at = Utc::now();
                        self.store.upsert_run_step(&record).await?;
                        updated += 1;
                        debug!(run = %run.id, task = %task_id, "external task completed");
                    }
                    ExternalTaskStatus::Failed => {
                        record.status = RunStepStatus::Failed;
                        record.error = snapshot.error;
                        record.updated_at = Utc::now();
                        self.store.upsert_run_step(&record).await?;
                        updated += 1;
                        debug!(run = %run.id, task = %task_id, "external task failed");
                    }
                    ExternalTaskStatus::Pending | ExternalTaskStatus::InProgress => {}
                }
            }
        }
        if updated > 0 {
            info!(updated, "reconciliation pass folded external outcomes");
        }
        Ok(SyncOutcome { updated })
    }

    // --- helpers ---

    async fn run(&self, run_id: Uuid) -> DirigentResult<WorkflowRun> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or_else(|| DirigentError::UnknownEntity {
                kind: EntityKind::Run,
                id: run_id.to_string(),
            })
    }

    async fn definition(&self, workflow_id: Uuid) -> DirigentResult<WorkflowDefinition> {
        self.store
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| DirigentError::UnknownEntity {
                kind: EntityKind::Workflow,
                id: workflow_id.to_string(),
            })
    }

    /// Step records in definition order, creating pending records for any
    /// definition step that has none yet.
    async fn records_in_order(
        &self,
        definition: &WorkflowDefinition,
        run_id: Uuid,
    ) -> DirigentResult<Vec<WorkflowRunStep>> {
        let existing = self.store.list_run_steps(run_id).await?;
        let mut ordered = Vec::with_capacity(definition.steps.len());
        for step in &definition.steps {
            match existing.iter().find(|r| r.step_id == step.id) {
                Some(record) => ordered.push(record.clone()),
                None => {
                    let record = WorkflowRunStep::new(run_id, step.id);
                    self.store.upsert_run_step(&record).await?;
                    ordered.push(record);
                }
            }
        }
        Ok(ordered)
    }

    /// Converge the run status after an advance pass.
    async fn converge(
        &self,
        definition: &WorkflowDefinition,
        run: &mut WorkflowRun,
        records: &[WorkflowRunStep],
        started: usize,
    ) -> DirigentResult<()> {
        let all_terminal = records.iter().all(|r| r.status.is_terminal());
        let any_failed = records.iter().any(|r| r.status == RunStepStatus::Failed);
        let any_active = records.iter().any(|r| {
            matches!(
                r.status,
                RunStepStatus::Running | RunStepStatus::WaitingForExternalTask
            )
        });

        if all_terminal {
            run.status = if any_failed {
                RunStatus::Failed
            } else {
                RunStatus::Completed
            };
            if run.status == RunStatus::Completed {
                run.result = Some(collect_result(definition, records));
            }
            let now = Utc::now();
            run.updated_at = now;
            run.completed_at = Some(now);
        } else if any_failed && !any_active && started == 0 {
            // Blocked forever: the failed step's dependents stay pending,
            // and nothing else can become ready.
            run.status = RunStatus::Failed;
            let now = Utc::now();
            run.updated_at = now;
            run.completed_at = Some(now);
        }

        self.store.upsert_run(run).await?;
        Ok(())
    }
}

/// Ready set for an edge-less definition: the single next pending step, and
/// only once every earlier step is completed or skipped.
fn sequential_ready(definition: &WorkflowDefinition, records: &[WorkflowRunStep]) -> Vec<Uuid> {
    for (idx, step) in definition.steps.iter().enumerate() {
        let record = records.iter().find(|r| r.step_id == step.id);
        let status = record.map_or(RunStepStatus::Pending, |r| r.status);
        if status == RunStepStatus::Pending {
            let earlier_done = definition.steps[..idx].iter().all(|earlier| {
                records
                    .iter()
                    .find(|r| r.step_id == earlier.id)
                    .map(|r| r.status.is_success())
                    .unwrap_or(false)
            });
            return if earlier_done { vec![step.id] } else { Vec::new() };
        }
        if !status.is_terminal() {
            // Something earlier is still in flight; nothing new starts.
            return Vec::new();
        }
    }
    Vec::new()
}

/// Merge the run context with a step config; the config wins on key
/// collisions. Non-object values fall back to whichever side is non-null.
fn merge_payload(context: &serde_json::Value, config: &serde_json::Value) -> serde_json::Value {
    match (context, config) {
        (serde_json::Value::Object(base), serde_json::Value::Object(over)) => {
            let mut merged = base.clone();
            for (key, value) in over {
                merged.insert(key.clone(), value.clone());
            }
            serde_json::Value::Object(merged)
        }
        (_, serde_json::Value::Null) => context.clone(),
        _ => config.clone(),
    }
}

/// Collected outputs keyed by step name, stored as the run result.
fn collect_result(
    definition: &WorkflowDefinition,
    records: &[WorkflowRunStep],
) -> serde_json::Value {
    let mut outputs = serde_json::Map::new();
    for step in &definition.steps {
        if let Some(record) = records.iter().find(|r| r.step_id == step.id) {
            if record.status == RunStepStatus::Completed {
                outputs.insert(step.name.clone(), record.output.clone());
            }
        }
    }
    serde_json::Value::Object(outputs)
}
