use crate::types::{
    Directive, DirectiveProgress, DirectiveStatus, StatusUpdate, SubTask, SubTaskSnapshot,
    SubTaskStatus,
};
use dirigent_core::{DirigentError, DirigentResult, EntityKind};
use std::collections::HashMap;
use uuid::Uuid;

/// In-memory state of all directives, sub-tasks, delegations, and status
/// streams, plus the graph queries the planner and delegator run on them.
///
/// Plain mutable state; the engine owns it behind an `Arc<RwLock<_>>`.
pub struct DirectiveBoard {
    directives: HashMap<Uuid, Directive>,
    sub_tasks: HashMap<Uuid, SubTask>,
    /// Delegation envelope id → sub-task id.
    delegations: HashMap<Uuid, Uuid>,
    /// Delegation envelope id → append-only status stream.
    streams: HashMap<Uuid, Vec<StatusUpdate>>,
}

impl DirectiveBoard {
    /// Create an empty board.
    pub fn new() -> Self {
        Self {
            directives: HashMap::new(),
            sub_tasks: HashMap::new(),
            delegations: HashMap::new(),
            streams: HashMap::new(),
        }
    }

    /// Insert a directive.
    pub fn insert_directive(&mut self, directive: Directive) -> Uuid {
        let id = directive.id;
        self.directives.insert(id, directive);
        id
    }

    /// Get a directive by id.
    pub fn directive(&self, id: Uuid) -> Option<&Directive> {
        self.directives.get(&id)
    }

    /// Get a mutable directive by id.
    pub fn directive_mut(&mut self, id: Uuid) -> Option<&mut Directive> {
        self.directives.get_mut(&id)
    }

    /// Insert a sub-task and append it to its directive's plan order.
    pub fn insert_sub_task(&mut self, sub_task: SubTask) -> Uuid {
        let id = sub_task.id;
        if let Some(directive) = self.directives.get_mut(&sub_task.directive_id) {
            directive.sub_tasks.push(id);
        }
        self.sub_tasks.insert(id, sub_task);
        id
    }

    /// Get a sub-task by id.
    pub fn sub_task(&self, id: Uuid) -> Option<&SubTask> {
        self.sub_tasks.get(&id)
    }

    /// Get a mutable sub-task by id.
    pub fn sub_task_mut(&mut self, id: Uuid) -> Option<&mut SubTask> {
        self.sub_tasks.get_mut(&id)
    }

    /// All sub-tasks of a directive, in plan order.
    pub fn sub_tasks_of(&self, directive_id: Uuid) -> Vec<&SubTask> {
        self.directives
            .get(&directive_id)
            .map(|d| {
                d.sub_tasks
                    .iter()
                    .filter_map(|id| self.sub_tasks.get(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Record a delegation and open its status stream.
    pub fn open_delegation(&mut self, delegation_id: Uuid, sub_task_id: Uuid) {
        self.delegations.insert(delegation_id, sub_task_id);
        self.streams.insert(delegation_id, Vec::new());
    }

    /// The sub-task a delegation id refers to.
    pub fn sub_task_for_delegation(&self, delegation_id: Uuid) -> Option<Uuid> {
        self.delegations.get(&delegation_id).copied()
    }

    /// Append an update to a delegation's status stream.
    pub fn append_update(&mut self, delegation_id: Uuid, update: StatusUpdate) {
        self.streams.entry(delegation_id).or_default().push(update);
    }

    /// The status stream of a delegation.
    pub fn stream(&self, delegation_id: Uuid) -> Option<&[StatusUpdate]> {
        self.streams.get(&delegation_id).map(Vec::as_slice)
    }

    /// Dependencies of a sub-task not yet in terminal-success state.
    pub fn unmet_dependencies(&self, sub_task: &SubTask) -> Vec<Uuid> {
        sub_task
            .dependencies
            .iter()
            .filter(|dep| {
                self.sub_tasks
                    .get(dep)
                    .map_or(true, |d| d.status != SubTaskStatus::Completed)
            })
            .copied()
            .collect()
    }

    /// Check a directive's dependency graph for cycles.
    pub fn has_cycle(&self, directive_id: Uuid) -> bool {
        let mut visited: HashMap<Uuid, u8> = HashMap::new();
        for sub_task in self.sub_tasks_of(directive_id) {
            if self.dfs_cycle(sub_task.id, &mut visited) {
                return true;
            }
        }
        false
    }

    fn dfs_cycle(&self, id: Uuid, visited: &mut HashMap<Uuid, u8>) -> bool {
        match visited.get(&id) {
            Some(1) => return true,  // back edge = cycle
            Some(2) => return false, // already processed
            _ => {}
        }
        visited.insert(id, 1);
        if let Some(sub_task) = self.sub_tasks.get(&id) {
            for dep in &sub_task.dependencies {
                if self.dfs_cycle(*dep, visited) {
                    return true;
                }
            }
        }
        visited.insert(id, 2);
        false
    }

    /// Dependency-respecting order over a directive's pending sub-tasks
    /// (Kahn's algorithm, edges restricted to the pending set; dependencies
    /// already terminal count as satisfied edges). Ties resolve in plan
    /// order so waves are deterministic.
    pub fn topo_order(&self, directive_id: Uuid) -> DirigentResult<Vec<Uuid>> {
        let pending: Vec<&SubTask> = self
            .sub_tasks_of(directive_id)
            .into_iter()
            .filter(|t| t.status == SubTaskStatus::Pending)
            .collect();
        let in_set: HashMap<Uuid, usize> = pending
            .iter()
            .enumerate()
            .map(|(idx, t)| (t.id, idx))
            .collect();

        let mut in_degree: HashMap<Uuid, usize> = HashMap::new();
        let mut dependents: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for task in &pending {
            let degree = task
                .dependencies
                .iter()
                .filter(|dep| in_set.contains_key(dep))
                .count();
            in_degree.insert(task.id, degree);
            for dep in &task.dependencies {
                if in_set.contains_key(dep) {
                    dependents.entry(*dep).or_default().push(task.id);
                }
            }
        }

        let mut queue: Vec<Uuid> = pending
            .iter()
            .filter(|t| in_degree[&t.id] == 0)
            .map(|t| t.id)
            .collect();
        let mut order = Vec::with_capacity(pending.len());
        while let Some(id) = queue.first().copied() {
            queue.remove(0);
            order.push(id);
            for dependent in dependents.get(&id).cloned().unwrap_or_default() {
                let degree = in_degree.get_mut(&dependent).map(|d| {
                    *d -= 1;
                    *d
                });
                if degree == Some(0) {
                    // Keep plan order among newly-ready tasks.
                    let pos = queue
                        .iter()
                        .position(|q| in_set[q] > in_set[&dependent])
                        .unwrap_or(queue.len());
                    queue.insert(pos, dependent);
                }
            }
        }

        if order.len() != pending.len() {
            return Err(DirigentError::CycleDetected(format!(
                "directive {directive_id}"
            )));
        }
        Ok(order)
    }

    /// Whether a sub-task can never run because a failed dependency sits
    /// somewhere beneath it.
    pub fn blocked_by_failure(&self, sub_task_id: Uuid) -> bool {
        let mut memo: HashMap<Uuid, bool> = HashMap::new();
        self.blocked_inner(sub_task_id, &mut memo)
    }

    fn blocked_inner(&self, id: Uuid, memo: &mut HashMap<Uuid, bool>) -> bool {
        if let Some(&known) = memo.get(&id) {
            return known;
        }
        // Breaks dependency cycles defensively; acyclicity is enforced at
        // planning time.
        memo.insert(id, false);
        let blocked = self.sub_tasks.get(&id).is_some_and(|task| {
            task.dependencies.iter().any(|dep| {
                self.sub_tasks.get(dep).is_some_and(|d| {
                    d.status == SubTaskStatus::Failed
                        || (d.status == SubTaskStatus::Pending && self.blocked_inner(d.id, memo))
                })
            })
        });
        memo.insert(id, blocked);
        blocked
    }

    /// Recompute a directive's aggregate status from its sub-tasks.
    ///
    /// Completed iff all terminal and none failed; failed iff something
    /// failed, nothing is active, and every remaining pending sub-task is
    /// permanently blocked; reviewing when mean progress crosses the
    /// escalation threshold; otherwise in progress.
    pub fn aggregate_status(
        &self,
        directive_id: Uuid,
        escalation_threshold: f64,
    ) -> DirectiveStatus {
        let current = self
            .directives
            .get(&directive_id)
            .map_or(DirectiveStatus::Planning, |d| d.status);
        let subs = self.sub_tasks_of(directive_id);
        if subs.is_empty() {
            return current;
        }

        let all_terminal = subs.iter().all(|t| t.status.is_terminal());
        let any_failed = subs.iter().any(|t| t.status == SubTaskStatus::Failed);
        if all_terminal {
            return if any_failed {
                DirectiveStatus::Failed
            } else {
                DirectiveStatus::Completed
            };
        }

        let any_active = subs.iter().any(|t| {
            matches!(
                t.status,
                SubTaskStatus::Delegated | SubTaskStatus::Accepted | SubTaskStatus::InProgress
            )
        });
        if any_failed && !any_active {
            let all_pending_blocked = subs
                .iter()
                .filter(|t| t.status == SubTaskStatus::Pending)
                .all(|t| self.blocked_by_failure(t.id));
            if all_pending_blocked {
                return DirectiveStatus::Failed;
            }
        }

        let mean: f64 = subs.iter().map(|t| f64::from(t.progress)).sum::<f64>() / subs.len() as f64;
        if mean >= escalation_threshold {
            DirectiveStatus::Reviewing
        } else {
            DirectiveStatus::InProgress
        }
    }

    /// Build a progress snapshot for a directive.
    pub fn progress_snapshot(&self, directive_id: Uuid) -> DirigentResult<DirectiveProgress> {
        let directive =
            self.directives
                .get(&directive_id)
                .ok_or_else(|| DirigentError::UnknownEntity {
                    kind: EntityKind::Directive,
                    id: directive_id.to_string(),
                })?;
        let subs = self.sub_tasks_of(directive_id);
        let total = subs.len();
        let completed = subs
            .iter()
            .filter(|t| t.status == SubTaskStatus::Completed)
            .count();
        let failed = subs
            .iter()
            .filter(|t| t.status == SubTaskStatus::Failed)
            .count();
        let pending = subs
            .iter()
            .filter(|t| t.status == SubTaskStatus::Pending)
            .count();
        let active = total - completed - failed - pending;
        let average_progress = if total == 0 {
            0.0
        } else {
            subs.iter().map(|t| f64::from(t.progress)).sum::<f64>() / total as f64
        };
        Ok(DirectiveProgress {
            directive_id,
            status: directive.status,
            total,
            completed,
            failed,
            active,
            pending,
            average_progress,
            sub_tasks: subs
                .iter()
                .map(|t| SubTaskSnapshot {
                    id: t.id,
                    worker: t.worker.clone(),
                    status: t.status,
                    progress: t.progress,
                })
                .collect(),
        })
    }
}

impl Default for DirectiveBoard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use dirigent_core::Priority;

    fn board_with_directive() -> (DirectiveBoard, Uuid) {
        let mut board = DirectiveBoard::new();
        let id = board.insert_directive(Directive::new(
            "research",
            "Survey the zone",
            Priority::Normal,
            vec![],
        ));
        (board, id)
    }

    fn add_task(board: &mut DirectiveBoard, directive: Uuid, deps: Vec<Uuid>) -> Uuid {
        board.insert_sub_task(
            SubTask::new(directive, "scout", "survey", "step", serde_json::json!({}))
                .with_dependencies(deps),
        )
    }

    #[test]
    fn test_insert_links_sub_task_to_directive() {
        let (mut board, d) = board_with_directive();
        let t = add_task(&mut board, d, vec![]);
        assert_eq!(board.directive(d).unwrap().sub_tasks, vec![t]);
        assert_eq!(board.sub_tasks_of(d).len(), 1);
    }

    #[test]
    fn test_no_cycle_in_chain() {
        let (mut board, d) = board_with_directive();
        let a = add_task(&mut board, d, vec![]);
        let b = add_task(&mut board, d, vec![a]);
        let _c = add_task(&mut board, d, vec![b]);
        assert!(!board.has_cycle(d));
    }

    #[test]
    fn test_cycle_detection() {
        let (mut board, d) = board_with_directive();
        let a_id = Uuid::new_v4();
        let b_id = Uuid::new_v4();
        let mut a = SubTask::new(d, "scout", "survey", "a", serde_json::json!({}));
        a.id = a_id;
        a.dependencies = vec![b_id];
        let mut b = SubTask::new(d, "scout", "survey", "b", serde_json::json!({}));
        b.id = b_id;
        b.dependencies = vec![a_id];
        board.insert_sub_task(a);
        board.insert_sub_task(b);
        assert!(board.has_cycle(d));
        assert!(board.topo_order(d).is_err());
    }

    #[test]
    fn test_topo_order_respects_dependencies() {
        let (mut board, d) = board_with_directive();
        let a = add_task(&mut board, d, vec![]);
        let b = add_task(&mut board, d, vec![a]);
        let c = add_task(&mut board, d, vec![a, b]);

        let order = board.topo_order(d).unwrap();
        assert_eq!(order, vec![a, b, c]);
    }

    #[test]
    fn test_topo_order_diamond_keeps_plan_order() {
        let (mut board, d) = board_with_directive();
        let a = add_task(&mut board, d, vec![]);
        let b = add_task(&mut board, d, vec![a]);
        let c = add_task(&mut board, d, vec![a]);
        let e = add_task(&mut board, d, vec![b, c]);

        let order = board.topo_order(d).unwrap();
        assert_eq!(order, vec![a, b, c, e]);
    }

    #[test]
    fn test_topo_order_ignores_non_pending() {
        let (mut board, d) = board_with_directive();
        let a = add_task(&mut board, d, vec![]);
        let b = add_task(&mut board, d, vec![a]);
        board.sub_task_mut(a).unwrap().status = SubTaskStatus::Completed;

        let order = board.topo_order(d).unwrap();
        assert_eq!(order, vec![b]);
    }

    #[test]
    fn test_unmet_dependencies() {
        let (mut board, d) = board_with_directive();
        let a = add_task(&mut board, d, vec![]);
        let b = add_task(&mut board, d, vec![a]);

        let task_b = board.sub_task(b).unwrap().clone();
        assert_eq!(board.unmet_dependencies(&task_b), vec![a]);

        board.sub_task_mut(a).unwrap().status = SubTaskStatus::Completed;
        assert!(board.unmet_dependencies(&task_b).is_empty());
    }

    #[test]
    fn test_blocked_by_failure_is_transitive() {
        let (mut board, d) = board_with_directive();
        let a = add_task(&mut board, d, vec![]);
        let b = add_task(&mut board, d, vec![a]);
        let c = add_task(&mut board, d, vec![b]);
        board.sub_task_mut(a).unwrap().status = SubTaskStatus::Failed;

        assert!(board.blocked_by_failure(b));
        assert!(board.blocked_by_failure(c));
    }

    #[test]
    fn test_aggregate_completed() {
        let (mut board, d) = board_with_directive();
        let a = add_task(&mut board, d, vec![]);
        board.sub_task_mut(a).unwrap().status = SubTaskStatus::Completed;
        board.sub_task_mut(a).unwrap().progress = 100;
        assert_eq!(board.aggregate_status(d, 80.0), DirectiveStatus::Completed);
    }

    #[test]
    fn test_aggregate_failed_when_blocked() {
        let (mut board, d) = board_with_directive();
        let a = add_task(&mut board, d, vec![]);
        let _b = add_task(&mut board, d, vec![a]);
        board.sub_task_mut(a).unwrap().status = SubTaskStatus::Failed;
        assert_eq!(board.aggregate_status(d, 80.0), DirectiveStatus::Failed);
    }

    #[test]
    fn test_aggregate_in_progress_while_active() {
        let (mut board, d) = board_with_directive();
        let a = add_task(&mut board, d, vec![]);
        let b = add_task(&mut board, d, vec![]);
        board.sub_task_mut(a).unwrap().status = SubTaskStatus::Failed;
        board.sub_task_mut(b).unwrap().status = SubTaskStatus::InProgress;
        assert_eq!(board.aggregate_status(d, 80.0), DirectiveStatus::InProgress);
    }

    #[test]
    fn test_aggregate_reviewing_on_high_progress() {
        let (mut board, d) = board_with_directive();
        let a = add_task(&mut board, d, vec![]);
        let b = add_task(&mut board, d, vec![]);
        board.sub_task_mut(a).unwrap().status = SubTaskStatus::Completed;
        board.sub_task_mut(a).unwrap().progress = 100;
        board.sub_task_mut(b).unwrap().status = SubTaskStatus::InProgress;
        board.sub_task_mut(b).unwrap().progress = 80;
        assert_eq!(board.aggregate_status(d, 80.0), DirectiveStatus::Reviewing);
    }

    #[test]
    fn test_progress_snapshot_counts() {
        let (mut board, d) = board_with_directive();
        let a = add_task(&mut board, d, vec![]);
        let _b = add_task(&mut board, d, vec![a]);
        board.sub_task_mut(a).unwrap().status = SubTaskStatus::Completed;
        board.sub_task_mut(a).unwrap().progress = 100;

        let snap = board.progress_snapshot(d).unwrap();
        assert_eq!(snap.total, 2);
        assert_eq!(snap.completed, 1);
        assert_eq!(snap.pending, 1);
        assert_eq!(snap.active, 0);
        assert!((snap.average_progress - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_progress_snapshot_unknown_directive() {
        let board = DirectiveBoard::new();
        assert!(board.progress_snapshot(Uuid::new_v4()).is_err());
    }
}
