use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Whether a worker can currently accept delegations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    /// Accepting work.
    Available,
    /// At capacity; selection skips it until load drops.
    Busy,
    /// Unreachable; never selected.
    Offline,
}

/// One worker's registration: identity, declared capabilities, and the load
/// counter the scheduler maintains.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    /// Addressable worker id.
    pub worker_id: String,
    /// General capability tags.
    pub capabilities: HashSet<String>,
    /// Specialization tags; count the same as capabilities when scoring.
    pub specializations: HashSet<String>,
    /// Delegations currently in flight.
    pub load: u32,
    /// Hard ceiling on concurrent delegations.
    pub max_load: u32,
    /// Current availability.
    pub availability: Availability,
}

impl WorkerRecord {
    /// Create a record with the given id, capability tags, and load ceiling.
    pub fn new(
        worker_id: impl Into<String>,
        capabilities: impl IntoIterator<Item = String>,
        max_load: u32,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            capabilities: capabilities.into_iter().collect(),
            specializations: HashSet::new(),
            load: 0,
            // A zero ceiling would make the worker permanently ineligible.
            max_load: max_load.max(1),
            availability: Availability::Available,
        }
    }

    /// Add specialization tags.
    pub fn with_specializations(mut self, specs: impl IntoIterator<Item = String>) -> Self {
        self.specializations = specs.into_iter().collect();
        self
    }

    /// Whether the tag appears in either the capability or specialization set.
    pub fn covers(&self, tag: &str) -> bool {
        self.capabilities.contains(tag) || self.specializations.contains(tag)
    }

    /// Whether the scheduler may pick this worker right now.
    pub fn is_eligible(&self) -> bool {
        self.availability != Availability::Offline && self.load < self.max_load
    }
}
