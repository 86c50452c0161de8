//! Capacity accounting and scale-up for the worker fleet
//!
//! Every change to a worker's active-migration list goes through
//! [`FleetManager`], which serializes those decisions so two migrations can
//! never both take the last slot on a worker.

use super::placement::{self, PlacementError};
use super::{NodeRole, WorkerNode, WorkerNodeSpec, WorkerPhase};
use crate::config::FleetConfig;
use crate::error::{MigrateError, Result};
use crate::metrics;
use crate::migration::Migration;
use crate::store::ObjectStore;
use crate::types::{Object, ObjectKey};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Answer to a capacity request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignment {
    /// A slot on this worker is reserved for the migration
    Assigned { worker: String },
    /// Nothing free right now
    Unavailable {
        reason: String,
        /// A worker is being provisioned that may take the migration
        scaling: bool,
    },
}

/// Hands out, tracks, and reclaims worker capacity
pub struct FleetManager {
    workers: Arc<ObjectStore<WorkerNode>>,
    namespace: String,
    config: FleetConfig,
    capacity_lock: Mutex<()>,
}

impl FleetManager {
    pub fn new(workers: Arc<ObjectStore<WorkerNode>>, namespace: &str, config: FleetConfig) -> Self {
        Self {
            workers,
            namespace: namespace.to_string(),
            config,
            capacity_lock: Mutex::new(()),
        }
    }

    pub fn workers(&self) -> &Arc<ObjectStore<WorkerNode>> {
        &self.workers
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn default_capacity(&self) -> u32 {
        self.config.worker_capacity
    }

    pub fn worker(&self, name: &str) -> Option<WorkerNode> {
        self.workers.get(&ObjectKey::new(&self.namespace, name))
    }

    pub fn list(&self) -> Vec<WorkerNode> {
        self.workers.list_namespace(&self.namespace)
    }

    /// Reserve a slot on the least-loaded ready worker.
    ///
    /// Asking again for a migration that already holds a slot returns the
    /// same worker.
    pub async fn acquire_worker(&self, migration: &str) -> Result<Assignment> {
        let _guard = self.capacity_lock.lock().await;
        let workers = self.list();

        if let Some(held) = workers
            .iter()
            .find(|w| w.owns(migration) && w.is_schedulable())
        {
            return Ok(Assignment::Assigned {
                worker: held.name().to_string(),
            });
        }

        let capacity = self.default_capacity();
        let (key, worker) = match placement::select_worker(&workers, capacity) {
            Ok(w) => (w.key(), w.name().to_string()),
            Err(e) => {
                let scaling = self.scale_up(&workers)?;
                return Ok(Assignment::Unavailable {
                    reason: format!("Waiting for a worker: {}", e),
                    scaling,
                });
            }
        };

        let mut rejected: Option<PlacementError> = None;
        self.workers.patch(&key, |node| {
            if node.owns(migration) {
                return;
            }
            if let Err(e) = placement::check_capacity(node, capacity) {
                rejected = Some(e);
                return;
            }
            node.status.active_migrations.push(migration.to_string());
            node.status.active_migrations.sort();
        })?;

        if let Some(e) = rejected {
            return Ok(Assignment::Unavailable {
                reason: e.to_string(),
                scaling: false,
            });
        }

        info!("Reserved worker {} for migration {}", worker, migration);
        metrics::record_worker_event("assigned");
        Ok(Assignment::Assigned { worker })
    }

    /// Return a migration's slot. Missing workers have nothing to release.
    pub async fn release_worker(&self, worker: &str, migration: &str) -> Result<()> {
        let _guard = self.capacity_lock.lock().await;
        let key = ObjectKey::new(&self.namespace, worker);
        match self.workers.patch(&key, |node| {
            node.status.active_migrations.retain(|m| m != migration);
        }) {
            Ok(_) | Err(MigrateError::NotFound(_)) => {
                debug!("Released worker {} from migration {}", worker, migration);
                metrics::record_worker_event("released");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Recompute a worker's active-migration list from the migrations that
    /// reference it. A reservation not yet recorded on its migration is kept
    /// while that migration is live and unassigned.
    ///
    /// Migrations are read under the capacity lock, so a reservation or
    /// release that completes first is always seen. Only the active-migration
    /// list is written. Returns true if it changed.
    pub async fn refresh_active_migrations(
        &self,
        worker: &str,
        migrations: &ObjectStore<Migration>,
    ) -> Result<bool> {
        let _guard = self.capacity_lock.lock().await;
        let key = ObjectKey::new(&self.namespace, worker);
        let Some(node) = self.workers.get(&key) else {
            return Ok(false);
        };
        let migrations = migrations.list_namespace(&self.namespace);
        let live = |m: &Migration| !m.phase().is_terminal() && !m.metadata.is_deleting();

        let mut active: Vec<String> = migrations
            .iter()
            .filter(|m| live(m) && m.status.assigned_worker.as_deref() == Some(worker))
            .map(|m| m.name().to_string())
            .collect();

        for reserved in &node.status.active_migrations {
            let pending = migrations
                .iter()
                .any(|m| m.name() == reserved && live(m) && m.status.assigned_worker.is_none());
            if pending && !active.contains(reserved) {
                active.push(reserved.clone());
            }
        }
        active.sort();

        if active == node.status.active_migrations {
            return Ok(false);
        }

        debug!(
            "Worker {} active migrations {:?} -> {:?}",
            worker, node.status.active_migrations, active
        );
        self.workers.patch(&key, |node| {
            node.status.active_migrations = active;
        })?;
        Ok(true)
    }

    /// Template for an automatically provisioned worker
    pub fn worker_template(&self, name: &str) -> WorkerNode {
        WorkerNode::new(
            &self.namespace,
            name,
            WorkerNodeSpec {
                role: NodeRole::Worker,
                flavor_id: self.config.flavor_id.clone(),
                image_id: self.config.image_id.clone(),
                credentials_ref: self.config.credentials_ref.clone(),
                capacity: None,
            },
        )
    }

    /// Add a worker when the fleet is below its bound and nothing is already
    /// on the way. Returns true if a worker is being provisioned.
    fn scale_up(&self, workers: &[WorkerNode]) -> Result<bool> {
        let fleet: Vec<&WorkerNode> = workers
            .iter()
            .filter(|w| !w.is_controller() && !w.metadata.is_deleting())
            .collect();

        if fleet
            .iter()
            .any(|w| matches!(w.phase(), WorkerPhase::Provisioning | WorkerPhase::VMCreated))
        {
            return Ok(true);
        }
        if !self.config.auto_scale || fleet.len() >= self.config.max_workers {
            return Ok(false);
        }

        let name = next_worker_name(&self.config.worker_name_prefix, workers);
        match self.workers.create(self.worker_template(&name)) {
            Ok(_) => {
                info!(
                    "Scaling up worker fleet: created {} ({} of at most {})",
                    name,
                    fleet.len() + 1,
                    self.config.max_workers
                );
                metrics::record_worker_event("scale_up");
                Ok(true)
            }
            Err(MigrateError::AlreadyExists(_)) => Ok(true),
            Err(e) => Err(e),
        }
    }
}

/// Lowest free `{prefix}-{n}` name
fn next_worker_name(prefix: &str, workers: &[WorkerNode]) -> String {
    (1..)
        .map(|n| format!("{}-{}", prefix, n))
        .find(|candidate| workers.iter().all(|w| w.name() != candidate))
        .unwrap_or_else(|| format!("{}-{}", prefix, uuid::Uuid::new_v4()))
}
