//! Directive planning, dependency-gated delegation, and status aggregation.
//!
//! Implements the orchestrator-workers pattern for decomposing a high-level
//! directive into dependency-ordered sub-tasks, assigning each to a
//! capability-matched worker, delegating ready sub-tasks over the message
//! router in topological waves, and folding asynchronous worker progress
//! reports back into an aggregate directive status.
//!
//! # Main types
//!
//! - [`Orchestrator`] — Planning, delegation waves, cancellation, progress.
//! - [`StatusAggregator`] — Applies worker progress reports.
//! - [`DirectiveBoard`] — Shared in-memory directive/sub-task state.
//! - [`Directive`], [`SubTask`], [`TaskSpec`] — The planning data model.

/// Worker progress report handling and aggregate recompute.
pub mod aggregator;
/// Shared directive/sub-task state and graph queries.
pub mod board;
/// The orchestration engine: planning, delegation, cancellation.
pub mod engine;
/// Shared orchestration types (Directive, SubTask, TaskSpec, etc.).
pub mod types;

pub use aggregator::StatusAggregator;
pub use board::DirectiveBoard;
pub use engine::Orchestrator;
pub use types::{
    CancelOutcome, DelegatedSubTask, DelegationWave, Directive, DirectiveProgress, DirectiveStatus,
    StatusUpdate, SubTask, SubTaskSnapshot, SubTaskStatus, TaskSpec, UpdateKind,
};
