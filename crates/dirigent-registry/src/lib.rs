//! Worker capability registry and load-aware selection.
//!
//! Tracks every known worker, its declared capabilities and specializations,
//! its current load, and its availability, and scores workers against a set
//! of required capabilities so the planner can pick the best match.
//!
//! # Main types
//!
//! - [`CapabilityRegistry`] — The in-memory lookup table and selection logic.
//! - [`WorkerRecord`] — One worker's capabilities, load counter, and availability.
//! - [`Availability`] — Whether a worker can currently accept work.

/// Registry map and scored worker selection.
pub mod registry;
/// Per-worker capability and load records.
pub mod worker;

pub use registry::CapabilityRegistry;
pub use worker::{Availability, WorkerRecord};
