//! Engine wiring and admin surface
//!
//! [`Engine`] owns the two record stores, the fleet manager, and both
//! reconcilers. [`Engine::start`] spawns one [`ControlLoop`] per reconciler;
//! everything else here is the operator-facing API, which only ever writes
//! desired state and leaves the rest to the loops.

use crate::config::EngineConfig;
use crate::error::{MigrateError, Result};
use crate::external::Collaborators;
use crate::fleet::{FleetController, FleetManager, WorkerNode, WorkerNodeSpec, WORKER_FINALIZER};
use crate::metrics;
use crate::migration::{
    CutoverSignal, Migration, MigrationController, MigrationPhase, MigrationSpec, PhaseChangeEvent,
    PhasePolicy, MIGRATION_FINALIZER, PAUSE_LABEL,
};
use crate::reconcile::{Action, ControlLoop, Reconciler, Trigger};
use crate::settings::{ConfigStore, FileConfigStore, MemoryConfigStore, SettingsProvider};
use crate::store::ObjectStore;
use crate::types::{Clock, Object, ObjectKey, SystemClock};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Optimistic updates retried this many times on a version conflict
const UPDATE_ATTEMPTS: usize = 5;

/// Point-in-time counts for logging and dashboards
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineSummary {
    pub migrations: BTreeMap<String, usize>,
    pub workers: BTreeMap<String, usize>,
    pub busy_workers: usize,
}

/// The orchestration engine
pub struct Engine {
    config: EngineConfig,
    migrations: Arc<ObjectStore<Migration>>,
    fleet: Arc<FleetManager>,
    fleet_controller: Arc<FleetController>,
    migration_controller: Arc<MigrationController>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Build an engine on the wall clock. Settings come from
    /// `settings_path` when configured, otherwise from an empty in-memory
    /// store that yields the defaults.
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Result<Self> {
        let config_store: Arc<dyn ConfigStore> = match &config.settings_path {
            Some(path) => Arc::new(FileConfigStore::new(path)),
            None => Arc::new(MemoryConfigStore::new()),
        };
        Self::with_parts(config, collaborators, config_store, Arc::new(SystemClock))
    }

    pub fn with_parts(
        config: EngineConfig,
        collaborators: Collaborators,
        config_store: Arc<dyn ConfigStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let migrations = Arc::new(match config.migrations_state_path() {
            Some(path) => ObjectStore::open(&path)?,
            None => ObjectStore::new(),
        });
        let workers = Arc::new(match config.workers_state_path() {
            Some(path) => ObjectStore::open(&path)?,
            None => ObjectStore::new(),
        });

        let settings = SettingsProvider::new(config_store);
        let fleet = Arc::new(FleetManager::new(workers, &config.namespace, config.fleet.clone()));
        let fleet_controller = Arc::new(FleetController::new(
            fleet.clone(),
            migrations.clone(),
            collaborators.clone(),
            settings.clone(),
            config.requeue.clone(),
            config.external_call_timeout(),
        ));
        let migration_controller = Arc::new(MigrationController::new(
            migrations.clone(),
            fleet.clone(),
            collaborators,
            settings,
            PhasePolicy::from_config(&config),
            clock,
            config.external_call_timeout(),
        ));

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            migrations,
            fleet,
            fleet_controller,
            migration_controller,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    /// Spawn both control loops. Calling again while running does nothing.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        self.shutdown_tx.send_replace(false);

        let concurrency = self.config.concurrency;
        let fleet_loop = ControlLoop::new(
            self.fleet_controller.clone(),
            concurrency,
            self.shutdown_tx.subscribe(),
        );
        let migration_loop = ControlLoop::new(
            self.migration_controller.clone(),
            concurrency,
            self.shutdown_tx.subscribe(),
        );

        let bridge = WorkerEventBridge {
            migrations: self.migrations.clone(),
            trigger: migration_loop.trigger(),
        };
        let worker_events = self.fleet.workers().subscribe();

        tasks.push(tokio::spawn(
            fleet_loop.run(self.fleet.workers().subscribe()),
        ));
        tasks.push(tokio::spawn(
            migration_loop.run(self.migrations.subscribe()),
        ));
        tasks.push(tokio::spawn(
            bridge.run(worker_events, self.shutdown_tx.subscribe()),
        ));

        info!(
            "Migration engine started (namespace: {}, concurrency: {})",
            self.config.namespace, concurrency
        );
    }

    /// Stop the loops and wait for in-flight passes to finish
    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        if tasks.is_empty() {
            return;
        }
        self.shutdown_tx.send_replace(true);
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                warn!("Control loop task ended abnormally: {}", e);
            }
        }
        info!("Migration engine stopped");
    }

    fn key(&self, name: &str) -> ObjectKey {
        ObjectKey::new(&self.config.namespace, name)
    }

    // Migrations

    /// Register a new migration request
    pub fn submit_migration(&self, name: &str, spec: MigrationSpec) -> Result<Migration> {
        let mut migration = Migration::new(&self.config.namespace, name, spec);
        migration.metadata.add_finalizer(MIGRATION_FINALIZER);
        let created = self.migrations.create(migration)?;
        info!("Submitted migration {} for source VM {}", name, created.spec.source_vm);
        Ok(created)
    }

    pub fn migration(&self, name: &str) -> Option<Migration> {
        self.migrations.get(&self.key(name))
    }

    pub fn list_migrations(&self) -> Vec<Migration> {
        self.migrations.list_namespace(&self.config.namespace)
    }

    /// Answer the admin cutover gate
    pub fn trigger_cutover(&self, name: &str, signal: CutoverSignal) -> Result<Migration> {
        let updated = self.update_migration(name, |m| {
            m.spec.start_cutover = Some(signal);
            Ok(())
        })?;
        info!("Cutover signal {:?} recorded for {}", signal, name);
        Ok(updated)
    }

    /// Request a fresh attempt of a failed migration
    pub fn retry_migration(&self, name: &str) -> Result<Migration> {
        let updated = self.update_migration(name, |m| {
            if m.phase() != MigrationPhase::Failed {
                return Err(MigrateError::Validation(format!(
                    "migration {} is {}, only failed migrations can be retried",
                    m.name(),
                    m.phase()
                )));
            }
            m.spec.retry_generation =
                m.spec.retry_generation.max(m.status.observed_retry_generation) + 1;
            Ok(())
        })?;
        info!(
            "Retry {} requested for migration {}",
            updated.spec.retry_generation, name
        );
        Ok(updated)
    }

    /// Hold or release a migration where it stands
    pub fn set_paused(&self, name: &str, paused: bool) -> Result<Migration> {
        self.update_migration(name, |m| {
            if paused {
                m.metadata
                    .labels
                    .insert(PAUSE_LABEL.to_string(), "true".to_string());
            } else {
                m.metadata.labels.remove(PAUSE_LABEL);
            }
            Ok(())
        })
    }

    /// Returns true if the record is already gone, false while the
    /// migration's worker slot is being released.
    pub fn delete_migration(&self, name: &str) -> Result<bool> {
        self.migrations.request_delete(&self.key(name))
    }

    fn update_migration<F>(&self, name: &str, mut change: F) -> Result<Migration>
    where
        F: FnMut(&mut Migration) -> Result<()>,
    {
        let key = self.key(name);
        let mut last = None;
        for _ in 0..UPDATE_ATTEMPTS {
            let mut migration = self
                .migrations
                .get(&key)
                .ok_or_else(|| MigrateError::NotFound(format!("Migration {}", key)))?;
            change(&mut migration)?;
            match self.migrations.update(migration) {
                Err(MigrateError::Conflict(e)) => {
                    debug!("Retrying update of {}: {}", key, e);
                    last = Some(MigrateError::Conflict(e));
                }
                other => return other,
            }
        }
        Err(last.unwrap_or_else(|| MigrateError::Internal(format!("update of {} not attempted", key))))
    }

    // Workers

    pub fn add_worker(&self, name: &str, spec: WorkerNodeSpec) -> Result<WorkerNode> {
        let mut node = WorkerNode::new(&self.config.namespace, name, spec);
        node.metadata.add_finalizer(WORKER_FINALIZER);
        let created = self.fleet.workers().create(node)?;
        info!("Added {} node {}", created.spec.role, name);
        Ok(created)
    }

    pub fn worker(&self, name: &str) -> Option<WorkerNode> {
        self.fleet.worker(name)
    }

    pub fn list_workers(&self) -> Vec<WorkerNode> {
        self.fleet.list()
    }

    /// Returns true if the record is already gone, false while its VM and
    /// registry node are torn down.
    pub fn delete_worker(&self, name: &str) -> Result<bool> {
        self.fleet.workers().request_delete(&self.key(name))
    }

    // Observation

    /// Phase changes of every migration
    pub fn subscribe(&self) -> broadcast::Receiver<PhaseChangeEvent> {
        self.migration_controller.subscribe()
    }

    /// Run one migration pass now. Only allowed while the loops are stopped,
    /// since a direct pass is not serialized with theirs.
    pub async fn reconcile_migration(&self, name: &str) -> Result<Action> {
        self.ensure_stopped()?;
        self.migration_controller.reconcile(&self.key(name)).await
    }

    /// Run one worker pass now. Only allowed while the loops are stopped.
    pub async fn reconcile_worker(&self, name: &str) -> Result<Action> {
        self.ensure_stopped()?;
        self.fleet_controller.reconcile(&self.key(name)).await
    }

    fn ensure_stopped(&self) -> Result<()> {
        if self.tasks.lock().is_empty() {
            Ok(())
        } else {
            Err(MigrateError::Conflict(
                "control loops are running; direct passes are refused".to_string(),
            ))
        }
    }

    /// Count records by phase and refresh the fleet and migration gauges
    pub fn summary(&self) -> EngineSummary {
        let migrations = self.list_migrations();
        let workers = self.list_workers();
        metrics::update_migration_metrics(&migrations);
        metrics::update_fleet_metrics(&workers, self.fleet.default_capacity());

        let mut summary = EngineSummary::default();
        for m in &migrations {
            *summary.migrations.entry(m.phase().to_string()).or_default() += 1;
        }
        for w in &workers {
            *summary.workers.entry(w.phase().to_string()).or_default() += 1;
        }
        summary.busy_workers = workers.iter().filter(|w| w.active_count() > 0).count();
        summary
    }
}

/// Wakes migrations whose progress depends on a worker that just changed
struct WorkerEventBridge {
    migrations: Arc<ObjectStore<Migration>>,
    trigger: Trigger,
}

impl WorkerEventBridge {
    async fn run(
        self,
        mut events: broadcast::Receiver<crate::store::StoreEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                event = events.recv() => match event {
                    Ok(event) => self.wake(Some(&event.key.name)),
                    Err(broadcast::error::RecvError::Lagged(_)) => self.wake(None),
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    /// Trigger migrations waiting for a worker, and those running on `worker`
    fn wake(&self, worker: Option<&str>) {
        for m in self.migrations.list() {
            let waiting = m.phase() == MigrationPhase::AwaitingDataCopyStart;
            let affected = match (worker, m.status.assigned_worker.as_deref()) {
                (Some(changed), Some(assigned)) => changed == assigned && !m.phase().is_terminal(),
                (None, Some(_)) => !m.phase().is_terminal(),
                _ => false,
            };
            if waiting || affected {
                self.trigger.trigger(m.key());
            }
        }
    }
}
