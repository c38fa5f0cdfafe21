use crate::aggregator::StatusAggregator;
use crate::board::DirectiveBoard;
use crate::types::{
    CancelOutcome, DelegatedSubTask, DelegationWave, Directive, DirectiveProgress, DirectiveStatus,
    SubTask, SubTaskStatus, TaskSpec,
};
use chrono::Utc;
use dirigent_core::{DirigentError, DirigentResult, EntityKind, Priority};
use dirigent_registry::CapabilityRegistry;
use dirigent_router::{MessageRouter, Recipient, SendOptions};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default TTL for delegation envelopes.
const DELEGATION_TTL_MS: u64 = 30_000;
/// Mean-progress threshold at which a directive is flagged for review.
const ESCALATION_THRESHOLD: f64 = 80.0;

/// The directive orchestration engine.
///
/// Plans directives into dependency-ordered sub-tasks, matches each to a
/// worker through the capability registry, and delegates ready sub-tasks
/// over the message router in topological waves.
pub struct Orchestrator {
    board: Arc<RwLock<DirectiveBoard>>,
    registry: Arc<RwLock<CapabilityRegistry>>,
    router: Arc<MessageRouter>,
    escalation_threshold: f64,
    delegation_ttl_ms: u64,
}

impl Orchestrator {
    /// Create an engine over the given registry and router.
    pub fn new(registry: Arc<RwLock<CapabilityRegistry>>, router: Arc<MessageRouter>) -> Self {
        Self {
            board: Arc::new(RwLock::new(DirectiveBoard::new())),
            registry,
            router,
            escalation_threshold: ESCALATION_THRESHOLD,
            delegation_ttl_ms: DELEGATION_TTL_MS,
        }
    }

    /// Override the review escalation threshold (mean progress, 0–100).
    pub fn with_escalation_threshold(mut self, threshold: f64) -> Self {
        self.escalation_threshold = threshold;
        self
    }

    /// Override the delegation envelope TTL.
    pub fn with_delegation_ttl(mut self, ttl_ms: u64) -> Self {
        self.delegation_ttl_ms = ttl_ms;
        self
    }

    /// Shared handle to the directive board.
    pub fn board(&self) -> &Arc<RwLock<DirectiveBoard>> {
        &self.board
    }

    /// Shared handle to the capability registry.
    pub fn registry(&self) -> &Arc<RwLock<CapabilityRegistry>> {
        &self.registry
    }

    /// Shared handle to the message router.
    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    /// The status aggregator that folds worker reports back into this
    /// engine's state.
    pub fn aggregator(&self) -> StatusAggregator {
        StatusAggregator::new(
            Arc::clone(&self.board),
            Arc::clone(&self.registry),
            self.escalation_threshold,
        )
    }

    /// Create a directive in `planning` state.
    pub async fn create_directive(
        &self,
        kind: &str,
        description: &str,
        priority: Priority,
        targets: Vec<String>,
    ) -> Directive {
        let directive = Directive::new(kind, description, priority, targets);
        info!(directive = %directive.id, kind, %priority, "directive created");
        self.board.write().await.insert_directive(directive.clone());
        directive
    }

    /// Decompose a directive into sub-tasks.
    ///
    /// Resolves a worker per spec (pinned, or the registry's best match for
    /// the required capabilities), validates dependency indices and
    /// acyclicity before touching any state, and moves the directive to
    /// `delegating`. Unknown directives and malformed specs leave the board
    /// unchanged.
    pub async fn plan_sub_tasks(
        &self,
        directive_id: Uuid,
        specs: Vec<TaskSpec>,
    ) -> DirigentResult<Vec<SubTask>> {
        // Validate the index graph before any allocation or mutation.
        for (idx, spec) in specs.iter().enumerate() {
            for dep in &spec.depends_on {
                if *dep >= specs.len() {
                    return Err(DirigentError::UnknownEntity {
                        kind: EntityKind::SubTask,
                        id: format!("spec[{idx}] dependency index {dep}"),
                    });
                }
            }
        }
        if specs_form_cycle(&specs) {
            return Err(DirigentError::CycleDetected(format!(
                "task specs for directive {directive_id}"
            )));
        }

        // Read phase: existence and state checks, worker resolution.
        {
            let board = self.board.read().await;
            let directive =
                board
                    .directive(directive_id)
                    .ok_or_else(|| DirigentError::UnknownEntity {
                        kind: EntityKind::Directive,
                        id: directive_id.to_string(),
                    })?;
            if directive.status.is_terminal() {
                return Err(DirigentError::InvalidTransition {
                    entity: EntityKind::Directive,
                    from: directive.status.to_string(),
                    to: DirectiveStatus::Delegating.to_string(),
                });
            }
        }

        let workers: Vec<String> = {
            let registry = self.registry.read().await;
            specs
                .iter()
                .map(|spec| {
                    spec.worker
                        .clone()
                        .unwrap_or_else(|| registry.select_best(&spec.required_capabilities))
                })
                .collect()
        };

        // Build sub-tasks, resolving index dependencies to real ids.
        let mut sub_tasks: Vec<SubTask> = specs
            .iter()
            .zip(&workers)
            .map(|(spec, worker)| {
                SubTask::new(
                    directive_id,
                    worker,
                    &spec.kind,
                    &spec.description,
                    spec.params.clone(),
                )
            })
            .collect();
        let ids: Vec<Uuid> = sub_tasks.iter().map(|t| t.id).collect();
        for (task, spec) in sub_tasks.iter_mut().zip(&specs) {
            task.dependencies = spec.depends_on.iter().map(|idx| ids[*idx]).collect();
        }

        // Write phase.
        {
            let mut board = self.board.write().await;
            for task in &sub_tasks {
                debug!(directive = %directive_id, sub_task = %task.id, worker = %task.worker,
                    "sub-task planned");
                board.insert_sub_task(task.clone());
            }
            if let Some(directive) = board.directive_mut(directive_id) {
                directive.status = DirectiveStatus::Delegating;
                directive.updated_at = Utc::now();
            }
        }

        info!(directive = %directive_id, sub_tasks = sub_tasks.len(), "planning complete");
        Ok(sub_tasks)
    }

    /// Delegate one sub-task to its assigned worker.
    ///
    /// Every dependency must already be completed, otherwise the call fails
    /// with `DependencyNotSatisfied` and performs no side effect. On
    /// success the sub-task is `delegated`, the worker's load counter is
    /// incremented, and a status stream keyed by the returned delegation id
    /// is open.
    pub async fn delegate_sub_task(&self, sub_task_id: Uuid) -> DirigentResult<Uuid> {
        // Read phase: gate checks and payload assembly.
        let (worker, priority, payload) = {
            let board = self.board.read().await;
            let task = board
                .sub_task(sub_task_id)
                .ok_or_else(|| DirigentError::UnknownEntity {
                    kind: EntityKind::SubTask,
                    id: sub_task_id.to_string(),
                })?;
            let directive =
                board
                    .directive(task.directive_id)
                    .ok_or_else(|| DirigentError::UnknownEntity {
                        kind: EntityKind::Directive,
                        id: task.directive_id.to_string(),
                    })?;
            if directive.status.is_terminal() {
                return Err(DirigentError::InvalidTransition {
                    entity: EntityKind::Directive,
                    from: directive.status.to_string(),
                    to: DirectiveStatus::InProgress.to_string(),
                });
            }
            if task.status != SubTaskStatus::Pending {
                return Err(DirigentError::InvalidTransition {
                    entity: EntityKind::SubTask,
                    from: task.status.to_string(),
                    to: SubTaskStatus::Delegated.to_string(),
                });
            }
            let missing = board.unmet_dependencies(task);
            if !missing.is_empty() {
                return Err(DirigentError::DependencyNotSatisfied {
                    sub_task: sub_task_id,
                    missing,
                });
            }
            let payload = serde_json::json!({
                "directive_id": task.directive_id,
                "sub_task_id": task.id,
                "kind": task.kind,
                "description": task.description,
                "params": task.params,
            });
            (task.worker.clone(), directive.priority, payload)
        };

        // Reserve the worker before sending; roll back if delivery fails.
        let load_tracked = {
            let mut registry = self.registry.write().await;
            if registry.get(&worker).is_some() {
                registry.increment_load(&worker)?;
                true
            } else {
                // Untracked recipient (e.g. the orchestrator fallback):
                // deliverable, but not load-accounted.
                debug!(%worker, "delegating to unregistered worker, load not tracked");
                false
            }
        };

        let envelope = match self
            .router
            .send(
                dirigent_core::ORCHESTRATOR_ID,
                Recipient::Worker(worker.clone()),
                "delegation",
                payload,
                SendOptions {
                    priority,
                    ttl_ms: self.delegation_ttl_ms,
                    require_ack: true,
                },
            )
            .await
        {
            Ok(envelope) => envelope,
            Err(e) => {
                if load_tracked {
                    let mut registry = self.registry.write().await;
                    let _ = registry.decrement_load(&worker);
                }
                return Err(e);
            }
        };

        // Write phase: commit the transition.
        {
            let mut board = self.board.write().await;
            if let Some(task) = board.sub_task_mut(sub_task_id) {
                task.status = SubTaskStatus::Delegated;
            }
            board.open_delegation(envelope.id, sub_task_id);
            let directive_id = board
                .sub_task(sub_task_id)
                .map(|t| t.directive_id)
                .unwrap_or_default();
            if let Some(directive) = board.directive_mut(directive_id) {
                if !directive.status.is_terminal() {
                    directive.status = DirectiveStatus::InProgress;
                    directive.updated_at = Utc::now();
                }
            }
        }

        info!(sub_task = %sub_task_id, %worker, delegation = %envelope.id, "sub-task delegated");
        Ok(envelope.id)
    }

    /// Delegate every ready sub-task of a directive, in topological order.
    ///
    /// Sub-tasks whose dependencies are still open are skipped with a log
    /// line, not an error; callers re-invoke once earlier waves complete.
    pub async fn delegate_all_sub_tasks(
        &self,
        directive_id: Uuid,
    ) -> DirigentResult<DelegationWave> {
        let order = {
            let board = self.board.read().await;
            let directive =
                board
                    .directive(directive_id)
                    .ok_or_else(|| DirigentError::UnknownEntity {
                        kind: EntityKind::Directive,
                        id: directive_id.to_string(),
                    })?;
            if directive.status.is_terminal() {
                return Err(DirigentError::InvalidTransition {
                    entity: EntityKind::Directive,
                    from: directive.status.to_string(),
                    to: DirectiveStatus::InProgress.to_string(),
                });
            }
            board.topo_order(directive_id)?
        };

        let mut wave = DelegationWave {
            directive_id,
            delegated: Vec::new(),
            skipped: Vec::new(),
        };
        for sub_task_id in order {
            match self.delegate_sub_task(sub_task_id).await {
                Ok(delegation) => {
                    let worker = {
                        let board = self.board.read().await;
                        board
                            .sub_task(sub_task_id)
                            .map(|t| t.worker.clone())
                            .unwrap_or_default()
                    };
                    wave.delegated.push(DelegatedSubTask {
                        sub_task: sub_task_id,
                        delegation,
                        worker,
                    });
                }
                Err(DirigentError::DependencyNotSatisfied { missing, .. }) => {
                    debug!(sub_task = %sub_task_id, open = missing.len(),
                        "skipped, dependencies still open");
                    wave.skipped.push(sub_task_id);
                }
                Err(DirigentError::WorkerSaturated(worker)) => {
                    warn!(sub_task = %sub_task_id, %worker, "skipped, worker at capacity");
                    wave.skipped.push(sub_task_id);
                }
                Err(e) => return Err(e),
            }
        }

        info!(directive = %directive_id, delegated = wave.delegated.len(),
            skipped = wave.skipped.len(), "delegation wave complete");
        Ok(wave)
    }

    /// Cancel a directive.
    ///
    /// Idempotent: an already-terminal directive is a reported no-op
    /// (`changed = false`), never an error. Pending sub-tasks of a canceled
    /// directive can no longer be delegated.
    pub async fn cancel_directive(&self, directive_id: Uuid) -> DirigentResult<CancelOutcome> {
        let mut board = self.board.write().await;
        let directive =
            board
                .directive_mut(directive_id)
                .ok_or_else(|| DirigentError::UnknownEntity {
                    kind: EntityKind::Directive,
                    id: directive_id.to_string(),
                })?;
        if directive.status.is_terminal() {
            return Ok(CancelOutcome {
                directive: directive.clone(),
                changed: false,
            });
        }
        directive.status = DirectiveStatus::Canceled;
        let now = Utc::now();
        directive.updated_at = now;
        directive.completed_at = Some(now);
        info!(directive = %directive_id, "directive canceled");
        Ok(CancelOutcome {
            directive: directive.clone(),
            changed: true,
        })
    }

    /// Point-in-time progress of a directive.
    pub async fn directive_progress(&self, directive_id: Uuid) -> DirigentResult<DirectiveProgress> {
        self.board.read().await.progress_snapshot(directive_id)
    }
}

/// Tri-color DFS over the spec index graph.
fn specs_form_cycle(specs: &[TaskSpec]) -> bool {
    fn visit(idx: usize, specs: &[TaskSpec], state: &mut HashMap<usize, u8>) -> bool {
        match state.get(&idx) {
            Some(1) => return true,
            Some(2) => return false,
            _ => {}
        }
        state.insert(idx, 1);
        for dep in &specs[idx].depends_on {
            if visit(*dep, specs, state) {
                return true;
            }
        }
        state.insert(idx, 2);
        false
    }

    let mut state = HashMap::new();
    (0..specs.len()).any(|idx| visit(idx, specs, &mut state))
}
