//! Core types and error definitions for the Dirigent orchestration core.
//!
//! This crate provides the foundational types shared across all Dirigent
//! crates: the unified error enum, the result alias, and the small set of
//! values (priority, entity kinds) that every other crate speaks.
//!
//! # Main types
//!
//! - [`DirigentError`] — Unified error enum for all Dirigent subsystems.
//! - [`DirigentResult`] — Convenience alias for `Result<T, DirigentError>`.
//! - [`Priority`] — Delegation priority carried by directives and envelopes.
//! - [`EntityKind`] — Names the entity class in lookup and transition errors.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Well-known worker id of the orchestrator itself.
///
/// Worker selection falls back to this id when no registered worker is
/// eligible, so delegation always resolves to an addressable recipient.
pub const ORCHESTRATOR_ID: &str = "orchestrator";

// --- Error types ---

/// The class of entity an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// A high-level directive.
    Directive,
    /// A single delegated sub-task.
    SubTask,
    /// A registered worker.
    Worker,
    /// A routed message envelope.
    Envelope,
    /// A stored workflow definition.
    Workflow,
    /// A workflow run.
    Run,
    /// A single step of a workflow run.
    Step,
    /// A task record on the external queue.
    ExternalTask,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EntityKind::Directive => "directive",
            EntityKind::SubTask => "sub-task",
            EntityKind::Worker => "worker",
            EntityKind::Envelope => "envelope",
            EntityKind::Workflow => "workflow",
            EntityKind::Run => "run",
            EntityKind::Step => "step",
            EntityKind::ExternalTask => "external task",
        };
        write!(f, "{name}")
    }
}

/// Top-level error type for the Dirigent orchestration core.
///
/// Aggregate failure (a directive or run ending up failed) is a status
/// value, never an error: these variants cover malformed or unknown input,
/// refused state transitions, and transport-level trouble only.
#[derive(Debug, thiserror::Error)]
pub enum DirigentError {
    /// A lookup named a directive, sub-task, worker, run, or step that
    /// does not exist.
    #[error("unknown {kind} '{id}'")]
    UnknownEntity {
        /// The entity class that was looked up.
        kind: EntityKind,
        /// The identifier that failed to resolve.
        id: String,
    },

    /// Delegation was attempted before every dependency reached a
    /// terminal-success state. Recoverable: retry after the listed
    /// dependencies complete.
    #[error("sub-task {sub_task} has unmet dependencies {missing:?}")]
    DependencyNotSatisfied {
        /// The sub-task whose delegation was refused.
        sub_task: Uuid,
        /// Dependencies not yet in a terminal-success state.
        missing: Vec<Uuid>,
    },

    /// A require-ack envelope or correlated request went unanswered
    /// within its time-to-live.
    #[error("no acknowledgement for envelope {envelope} within {ttl_ms}ms")]
    AcknowledgementTimeout {
        /// The envelope that expired.
        envelope: Uuid,
        /// The TTL that elapsed, in milliseconds.
        ttl_ms: u64,
    },

    /// An operation would move an entity out of a state that does not
    /// permit it (e.g. advancing a terminal run).
    #[error("invalid {entity} transition from '{from}' to '{to}'")]
    InvalidTransition {
        /// The entity class being transitioned.
        entity: EntityKind,
        /// The state the entity is in.
        from: String,
        /// The state the operation asked for.
        to: String,
    },

    /// A single recipient's handler failed during delivery. Isolated per
    /// target; never aborts delivery to siblings.
    #[error("delivery to '{recipient}' failed: {reason}")]
    Delivery {
        /// The recipient whose handler failed.
        recipient: String,
        /// The handler's error, stringified.
        reason: String,
    },

    /// A dependency graph contained a cycle and was rejected before
    /// scheduling.
    #[error("dependency cycle detected in {0}")]
    CycleDetected(String),

    /// A worker's load counter is already at its maximum. Load never
    /// exceeds `max_load`, so the delegation is refused instead.
    #[error("worker '{0}' is at capacity")]
    WorkerSaturated(String),

    /// An error from the workflow store or external task queue.
    #[error("store error: {0}")]
    Store(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`DirigentError`].
pub type DirigentResult<T> = Result<T, DirigentError>;

// --- Priority ---

/// Delegation priority, set on a directive and inherited by every envelope
/// sent on its behalf.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background work.
    Low,
    /// The default.
    #[default]
    Normal,
    /// Ahead of normal traffic.
    High,
    /// Preempts everything else.
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
        assert!(Priority::High < Priority::Critical);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_priority_serialization() {
        let json = serde_json::to_string(&Priority::High).unwrap();
        assert_eq!(json, "\"high\"");
        let parsed: Priority = serde_json::from_str("\"critical\"").unwrap();
        assert_eq!(parsed, Priority::Critical);
    }

    #[test]
    fn test_error_display() {
        let err = DirigentError::UnknownEntity {
            kind: EntityKind::Directive,
            id: "d-1".to_string(),
        };
        assert_eq!(err.to_string(), "unknown directive 'd-1'");

        let err = DirigentError::InvalidTransition {
            entity: EntityKind::Run,
            from: "completed".to_string(),
            to: "running".to_string(),
        };
        assert!(err.to_string().contains("invalid run transition"));
    }

    #[test]
    fn test_dependency_error_lists_missing() {
        let missing = vec![Uuid::new_v4()];
        let err = DirigentError::DependencyNotSatisfied {
            sub_task: Uuid::new_v4(),
            missing: missing.clone(),
        };
        assert!(err.to_string().contains(&missing[0].to_string()));
    }
}
