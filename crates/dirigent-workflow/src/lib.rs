//! Persisted workflow runs with external task reconciliation.
//!
//! A persistence-backed variant of the directive delegation cycle: a stored
//! workflow definition (ordered steps plus dependency edges) is executed
//! step by step against an external task queue, and a polling
//! reconciliation pass folds externally-observed outcomes back into run
//! state instead of push callbacks.
//!
//! # Main types
//!
//! - [`RunExecutor`] — advance / cancel / sync over stored runs.
//! - [`WorkflowStore`], [`ExternalTaskQueue`] — the consumed interfaces.
//! - [`InMemoryWorkflowStore`], [`FileWorkflowStore`], [`InMemoryTaskQueue`]
//!   — ready-made implementations.
//! - [`WorkflowDefinition`], [`WorkflowRun`], [`WorkflowRunStep`] — the
//!   stored data model.

/// The run executor state machine.
pub mod executor;
/// Store and queue traits plus in-memory and file-backed implementations.
pub mod store;
/// Stored workflow types.
pub mod types;

pub use executor::RunExecutor;
pub use store::{
    CreatedTask, ExternalTaskQueue, FileWorkflowStore, InMemoryTaskQueue, InMemoryWorkflowStore,
    WorkflowStore,
};
pub use types::{
    AdvanceOutcome, ExternalTaskSnapshot, ExternalTaskStatus, RunCancelOutcome, RunStatus,
    RunStepStatus, StepDefinition, StepEdge, StepKind, SyncOutcome, WorkflowDefinition,
    WorkflowRun, WorkflowRunStep,
};
