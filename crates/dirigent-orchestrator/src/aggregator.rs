use crate::board::DirectiveBoard;
use crate::types::{DirectiveStatus, StatusUpdate, SubTaskStatus, UpdateKind};
use chrono::Utc;
use dirigent_core::{DirigentError, DirigentResult, EntityKind};
use dirigent_registry::CapabilityRegistry;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Folds worker progress reports into sub-task state and recomputes the
/// owning directive's aggregate status.
///
/// Obtained from [`Orchestrator::aggregator`](crate::Orchestrator::aggregator);
/// shares the engine's board and registry.
pub struct StatusAggregator {
    board: Arc<RwLock<DirectiveBoard>>,
    registry: Arc<RwLock<CapabilityRegistry>>,
    escalation_threshold: f64,
}

impl StatusAggregator {
    pub(crate) fn new(
        board: Arc<RwLock<DirectiveBoard>>,
        registry: Arc<RwLock<CapabilityRegistry>>,
        escalation_threshold: f64,
    ) -> Self {
        Self {
            board,
            registry,
            escalation_threshold,
        }
    }

    /// Apply one progress report, keyed by its delegation id.
    ///
    /// Appends to the delegation's status stream, folds status, progress,
    /// and result into the sub-task, releases the worker's load on a
    /// terminal report, and returns the directive's recomputed aggregate
    /// status. A report against an already-terminal sub-task is an
    /// `InvalidTransition`; terminal directives are never resurrected.
    pub async fn handle_status_update(
        &self,
        delegation_id: Uuid,
        worker_id: &str,
        kind: UpdateKind,
        progress: u8,
        message: Option<String>,
        data: Option<serde_json::Value>,
    ) -> DirigentResult<DirectiveStatus> {
        let (worker, release_load, directive_status) = {
            let mut board = self.board.write().await;
            let sub_task_id = board.sub_task_for_delegation(delegation_id).ok_or_else(|| {
                DirigentError::UnknownEntity {
                    kind: EntityKind::Envelope,
                    id: delegation_id.to_string(),
                }
            })?;
            let task = board
                .sub_task(sub_task_id)
                .ok_or_else(|| DirigentError::UnknownEntity {
                    kind: EntityKind::SubTask,
                    id: sub_task_id.to_string(),
                })?;
            if task.status.is_terminal() {
                return Err(DirigentError::InvalidTransition {
                    entity: EntityKind::SubTask,
                    from: task.status.to_string(),
                    to: kind.to_string(),
                });
            }
            let directive_id = task.directive_id;
            let assigned = task.worker.clone();
            if assigned != worker_id {
                warn!(sub_task = %sub_task_id, expected = %assigned, got = %worker_id,
                    "status update from unexpected worker");
            }

            board.append_update(
                delegation_id,
                StatusUpdate {
                    directive_id,
                    sub_task_id,
                    worker_id: worker_id.to_string(),
                    timestamp: Utc::now(),
                    kind,
                    progress,
                    message,
                    data: data.clone(),
                },
            );

            let release_load = if let Some(task) = board.sub_task_mut(sub_task_id) {
                task.progress = progress.min(100);
                match kind {
                    UpdateKind::Accepted => {
                        task.status = SubTaskStatus::Accepted;
                        false
                    }
                    UpdateKind::InProgress => {
                        task.status = SubTaskStatus::InProgress;
                        false
                    }
                    UpdateKind::Completed => {
                        task.status = SubTaskStatus::Completed;
                        task.progress = 100;
                        task.result = data;
                        task.completed_at = Some(Utc::now());
                        true
                    }
                    UpdateKind::Failed => {
                        task.status = SubTaskStatus::Failed;
                        task.result = data;
                        task.completed_at = Some(Utc::now());
                        true
                    }
                }
            } else {
                false
            };

            let directive_status = {
                let current = board
                    .directive(directive_id)
                    .map(|d| d.status)
                    .unwrap_or(DirectiveStatus::Planning);
                if current.is_terminal() {
                    current
                } else {
                    let next = board.aggregate_status(directive_id, self.escalation_threshold);
                    if let Some(directive) = board.directive_mut(directive_id) {
                        directive.status = next;
                        directive.updated_at = Utc::now();
                        if next.is_terminal() {
                            directive.completed_at = Some(Utc::now());
                        }
                    }
                    next
                }
            };

            debug!(delegation = %delegation_id, sub_task = %sub_task_id, update = %kind,
                progress, directive = %directive_id, aggregate = %directive_status,
                "status update applied");
            (assigned, release_load, directive_status)
        };

        if release_load {
            let mut registry = self.registry.write().await;
            match registry.decrement_load(&worker) {
                Ok(_) => {}
                Err(DirigentError::UnknownEntity { .. }) => {
                    // Untracked recipient; delegation never incremented it.
                    debug!(%worker, "terminal update for unregistered worker, load untouched");
                }
                Err(e) => return Err(e),
            }
        }

        if directive_status.is_terminal() {
            info!(%directive_status, "directive reached terminal status");
        }
        Ok(directive_status)
    }
}
