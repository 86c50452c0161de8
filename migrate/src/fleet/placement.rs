//! Worker selection for migrations
//!
//! Two steps, as in shard placement:
//! 1. Filter workers by hard constraints (ready, not deleting, spare capacity)
//! 2. Pick the least-loaded survivor, breaking ties by name

use super::WorkerNode;
use thiserror::Error;

/// Why no worker could be selected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlacementError {
    #[error("No ready workers available")]
    NoReadyWorkers,

    #[error("All {ready} ready workers are at capacity")]
    AtCapacity { ready: usize },

    #[error("Worker {0} not found")]
    WorkerNotFound(String),

    #[error("Worker {worker} is at capacity ({active}/{capacity})")]
    WorkerFull {
        worker: String,
        active: usize,
        capacity: u32,
    },
}

/// Choose the least-loaded ready worker with a free slot
pub fn select_worker<'a>(
    workers: &'a [WorkerNode],
    default_capacity: u32,
) -> Result<&'a WorkerNode, PlacementError> {
    let ready: Vec<&WorkerNode> = workers.iter().filter(|w| w.is_schedulable()).collect();
    if ready.is_empty() {
        return Err(PlacementError::NoReadyWorkers);
    }

    ready
        .iter()
        .copied()
        .filter(|w| w.has_capacity(default_capacity))
        .min_by(|a, b| {
            load_factor(a, default_capacity)
                .total_cmp(&load_factor(b, default_capacity))
                .then_with(|| a.name().cmp(b.name()))
        })
        .ok_or(PlacementError::AtCapacity { ready: ready.len() })
}

/// Check that `worker` may take one more migration
pub fn check_capacity(worker: &WorkerNode, default_capacity: u32) -> Result<(), PlacementError> {
    if worker.has_capacity(default_capacity) {
        Ok(())
    } else {
        Err(PlacementError::WorkerFull {
            worker: worker.name().to_string(),
            active: worker.active_count(),
            capacity: worker.capacity(default_capacity),
        })
    }
}

/// Fraction of capacity in use
fn load_factor(worker: &WorkerNode, default_capacity: u32) -> f64 {
    let capacity = worker.capacity(default_capacity).max(1) as f64;
    worker.active_count() as f64 / capacity
}
