use crate::worker::{Availability, WorkerRecord};
use dirigent_core::{DirigentError, DirigentResult, EntityKind, ORCHESTRATOR_ID};
use std::collections::HashMap;
use tracing::warn;

/// In-memory lookup table of known workers with scored selection.
///
/// The registry itself is plain mutable state; the engine owns it behind an
/// `Arc<RwLock<_>>` so load counter updates are never lost under
/// concurrent delegation and completion.
pub struct CapabilityRegistry {
    workers: HashMap<String, WorkerRecord>,
}

impl CapabilityRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            workers: HashMap::new(),
        }
    }

    /// Register a worker, replacing any previous record under the same id.
    pub fn register(&mut self, record: WorkerRecord) {
        self.workers.insert(record.worker_id.clone(), record);
    }

    /// Remove a worker. Returns the removed record, if any.
    pub fn deregister(&mut self, worker_id: &str) -> Option<WorkerRecord> {
        self.workers.remove(worker_id)
    }

    /// Get a worker record by id.
    pub fn get(&self, worker_id: &str) -> Option<&WorkerRecord> {
        self.workers.get(worker_id)
    }

    /// Number of registered workers.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// All registered worker ids, ascending.
    pub fn worker_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Pick the best worker for the given required capability tags.
    ///
    /// Score is `2 × (required tags covered) + (1 − load/max_load)`.
    /// Offline and saturated workers are skipped. Ties break by lowest
    /// worker id so selection is deterministic regardless of map order.
    /// Falls back to [`ORCHESTRATOR_ID`] when no worker is eligible.
    pub fn select_best(&self, required: &[String]) -> String {
        let mut candidates: Vec<&WorkerRecord> = self.workers.values().collect();
        candidates.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));

        let mut best: Option<(&WorkerRecord, f64)> = None;
        for worker in candidates {
            if !worker.is_eligible() {
                continue;
            }
            let matched = required.iter().filter(|tag| worker.covers(tag)).count();
            let headroom = 1.0 - f64::from(worker.load) / f64::from(worker.max_load);
            let score = 2.0 * matched as f64 + headroom;
            match best {
                Some((_, top)) if score <= top => {}
                _ => best = Some((worker, score)),
            }
        }

        best.map_or_else(
            || ORCHESTRATOR_ID.to_string(),
            |(worker, _)| worker.worker_id.clone(),
        )
    }

    /// Increment a worker's load counter after a delegation.
    ///
    /// Refuses to push the counter past `max_load`. Marks the worker busy
    /// when it reaches the ceiling. Returns the new load.
    pub fn increment_load(&mut self, worker_id: &str) -> DirigentResult<u32> {
        let worker = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| DirigentError::UnknownEntity {
                kind: EntityKind::Worker,
                id: worker_id.to_string(),
            })?;
        if worker.load >= worker.max_load {
            return Err(DirigentError::WorkerSaturated(worker_id.to_string()));
        }
        worker.load += 1;
        if worker.load == worker.max_load && worker.availability == Availability::Available {
            worker.availability = Availability::Busy;
        }
        Ok(worker.load)
    }

    /// Decrement a worker's load counter after a terminal status update.
    ///
    /// Saturates at zero; a decrement with no matching increment is a bug
    /// upstream and is logged rather than panicking. Returns the new load.
    pub fn decrement_load(&mut self, worker_id: &str) -> DirigentResult<u32> {
        let worker = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| DirigentError::UnknownEntity {
                kind: EntityKind::Worker,
                id: worker_id.to_string(),
            })?;
        if worker.load == 0 {
            warn!(worker = %worker_id, "load decrement below zero ignored");
        } else {
            worker.load -= 1;
        }
        if worker.load < worker.max_load && worker.availability == Availability::Busy {
            worker.availability = Availability::Available;
        }
        Ok(worker.load)
    }

    /// Set a worker's availability.
    pub fn set_availability(
        &mut self,
        worker_id: &str,
        availability: Availability,
    ) -> DirigentResult<()> {
        let worker = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| DirigentError::UnknownEntity {
                kind: EntityKind::Worker,
                id: worker_id.to_string(),
            })?;
        worker.availability = availability;
        Ok(())
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn tagged(id: &str, tags: &[&str], max_load: u32) -> WorkerRecord {
        WorkerRecord::new(id, tags.iter().map(|t| (*t).to_string()), max_load)
    }

    #[test]
    fn test_register_and_get() {
        let mut reg = CapabilityRegistry::new();
        reg.register(tagged("scout", &["search"], 3));
        assert_eq!(reg.worker_count(), 1);
        assert!(reg.get("scout").is_some());
        assert!(reg.get("ghost").is_none());
    }

    #[test]
    fn test_select_best_prefers_capability_match() {
        let mut reg = CapabilityRegistry::new();
        reg.register(tagged("scout", &["search"], 3));
        reg.register(tagged("analyst", &["analysis"], 3));

        assert_eq!(reg.select_best(&["analysis".to_string()]), "analyst");
        assert_eq!(reg.select_best(&["search".to_string()]), "scout");
    }

    #[test]
    fn test_specializations_count_toward_score() {
        let mut reg = CapabilityRegistry::new();
        reg.register(tagged("generalist", &[], 3));
        reg.register(
            WorkerRecord::new("specialist", vec![], 3)
                .with_specializations(vec!["forecasting".to_string()]),
        );

        assert_eq!(reg.select_best(&["forecasting".to_string()]), "specialist");
    }

    #[test]
    fn test_lighter_load_wins_on_equal_match() {
        let mut reg = CapabilityRegistry::new();
        let mut loaded = tagged("alpha", &["search"], 4);
        loaded.load = 3;
        reg.register(loaded);
        reg.register(tagged("beta", &["search"], 4));

        // Same capability match; beta has more headroom.
        assert_eq!(reg.select_best(&["search".to_string()]), "beta");
    }

    #[test]
    fn test_tie_breaks_by_lowest_worker_id() {
        let mut reg = CapabilityRegistry::new();
        reg.register(tagged("bravo", &["search"], 2));
        reg.register(tagged("alpha", &["search"], 2));

        assert_eq!(reg.select_best(&["search".to_string()]), "alpha");
    }

    #[test]
    fn test_offline_and_saturated_workers_skipped() {
        let mut reg = CapabilityRegistry::new();
        let mut offline = tagged("offline", &["search"], 2);
        offline.availability = Availability::Offline;
        reg.register(offline);
        let mut full = tagged("full", &["search"], 1);
        full.load = 1;
        reg.register(full);
        reg.register(tagged("idle", &[], 2));

        // Neither tagged worker is eligible; the untagged one still wins.
        assert_eq!(reg.select_best(&["search".to_string()]), "idle");
    }

    #[test]
    fn test_fallback_to_orchestrator() {
        let reg = CapabilityRegistry::new();
        assert_eq!(reg.select_best(&["anything".to_string()]), ORCHESTRATOR_ID);
    }

    #[test]
    fn test_increment_load_until_saturated() {
        let mut reg = CapabilityRegistry::new();
        reg.register(tagged("scout", &[], 2));

        assert_eq!(reg.increment_load("scout").unwrap(), 1);
        assert_eq!(reg.increment_load("scout").unwrap(), 2);
        assert_eq!(reg.get("scout").unwrap().availability, Availability::Busy);

        let err = reg.increment_load("scout").unwrap_err();
        assert!(matches!(err, DirigentError::WorkerSaturated(_)));
        assert_eq!(reg.get("scout").unwrap().load, 2);
    }

    #[test]
    fn test_decrement_restores_availability() {
        let mut reg = CapabilityRegistry::new();
        reg.register(tagged("scout", &[], 1));
        reg.increment_load("scout").unwrap();
        assert_eq!(reg.get("scout").unwrap().availability, Availability::Busy);

        assert_eq!(reg.decrement_load("scout").unwrap(), 0);
        assert_eq!(
            reg.get("scout").unwrap().availability,
            Availability::Available
        );
    }

    #[test]
    fn test_decrement_saturates_at_zero() {
        let mut reg = CapabilityRegistry::new();
        reg.register(tagged("scout", &[], 2));
        assert_eq!(reg.decrement_load("scout").unwrap(), 0);
    }

    #[test]
    fn test_unknown_worker_errors() {
        let mut reg = CapabilityRegistry::new();
        assert!(matches!(
            reg.increment_load("ghost"),
            Err(DirigentError::UnknownEntity { .. })
        ));
        assert!(matches!(
            reg.decrement_load("ghost"),
            Err(DirigentError::UnknownEntity { .. })
        ));
        assert!(reg.set_availability("ghost", Availability::Offline).is_err());
    }
}
