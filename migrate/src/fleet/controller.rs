//! Worker node reconciliation
//!
//! Drives each worker through provisioning, readiness and deletion. Once a
//! deletion marker is present the node goes straight to the delete flow; the
//! active-migration refresh only runs for live, ready workers.

use super::manager::FleetManager;
use super::{WorkerNode, WorkerPhase, WORKER_FINALIZER};
use crate::config::RequeueConfig;
use crate::error::{MigrateError, Result};
use crate::external::{with_timeout, Collaborators, CreateVmRequest, DeleteOutcome};
use crate::metrics;
use crate::migration::Migration;
use crate::reconcile::{exponential_backoff, Action, Reconciler};
use crate::settings::{Settings, SettingsProvider};
use crate::store::ObjectStore;
use crate::types::{Object, ObjectKey};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Reconciler for [`WorkerNode`] records
pub struct FleetController {
    fleet: Arc<FleetManager>,
    migrations: Arc<ObjectStore<Migration>>,
    collaborators: Collaborators,
    settings: SettingsProvider,
    requeue: RequeueConfig,
    call_timeout: Duration,
}

impl FleetController {
    pub fn new(
        fleet: Arc<FleetManager>,
        migrations: Arc<ObjectStore<Migration>>,
        collaborators: Collaborators,
        settings: SettingsProvider,
        requeue: RequeueConfig,
        call_timeout: Duration,
    ) -> Self {
        Self {
            fleet,
            migrations,
            collaborators,
            settings,
            requeue,
            call_timeout,
        }
    }

    fn store(&self) -> &ObjectStore<WorkerNode> {
        self.fleet.workers()
    }

    async fn call<T, F>(&self, operation: &str, call: F) -> Result<Option<T>>
    where
        F: Future<Output = std::result::Result<T, crate::error::ExternalError>>,
    {
        Ok(with_timeout(self.call_timeout, operation, call).await?)
    }

    fn set_phase(&self, key: &ObjectKey, from: WorkerPhase, to: WorkerPhase) -> Result<WorkerNode> {
        let node = self.store().patch(key, |n| {
            n.status.phase = to;
            n.status.message = None;
        })?;
        if from != to {
            info!("Worker {} {} -> {}", key.name, from, to);
            metrics::record_worker_transition(from.as_str(), to.as_str());
        }
        Ok(node)
    }

    /// The controller node is never provisioned; it only keeps its image fresh
    async fn reconcile_controller(&self, node: &WorkerNode) -> Result<Action> {
        let key = node.key();
        let target = self.collaborators.target.clone();
        let outcome = self
            .call("refresh controller image", target.refresh_controller_image())
            .await;

        match outcome {
            Ok(Some(())) => {
                self.set_phase(&key, node.phase(), WorkerPhase::Ready)?;
                Ok(Action::requeue(self.requeue.controller_refresh()))
            }
            Ok(None) => Ok(Action::requeue(self.requeue.controller_retry())),
            Err(e) => {
                warn!("Failed to refresh controller node {}: {}", node.name(), e);
                self.store().patch(&key, |n| {
                    n.status.message = Some(format!("Image refresh failed: {}", e));
                })?;
                Ok(Action::requeue(self.requeue.controller_retry()))
            }
        }
    }

    async fn reconcile_provisioning(&self, node: &WorkerNode, settings: &Settings) -> Result<Action> {
        let key = node.key();
        let name = node.name();
        let target = self.collaborators.target.clone();

        let mut vm_id = node.status.vm_id.clone();
        if vm_id.is_none() {
            match self.call("get vm by name", target.get_vm_by_name(name)).await? {
                Some(found) => vm_id = found,
                None => return Ok(Action::requeue(self.requeue.node_wait())),
            }
        }

        if vm_id.is_none() && !node.status.creation_requested {
            let request = CreateVmRequest {
                name: name.to_string(),
                flavor_id: first_non_empty(&node.spec.flavor_id, &self.fleet.config().flavor_id),
                image_id: first_non_empty(&node.spec.image_id, &self.fleet.config().image_id),
                credentials_ref: first_non_empty(
                    &node.spec.credentials_ref,
                    &self.fleet.config().credentials_ref,
                ),
            };
            // A timed-out create may still land; the name lookup adopts it
            vm_id = self
                .call("create vm", target.create_vm(&request))
                .await?
                .flatten();
            info!("Requested VM for worker {}", name);
            metrics::record_worker_event("vm_requested");
            self.store().patch(&key, |n| n.status.creation_requested = true)?;
        }

        let Some(id) = vm_id else {
            return self.await_vm(node, settings, "Waiting for the cloud to assign a VM");
        };

        let ip = match self.call("get vm ip", target.get_vm_ip(&id)).await? {
            Some(ip) => ip,
            None => return Ok(Action::requeue(self.requeue.node_wait())),
        };

        match ip {
            Some(ip) => {
                self.store().patch(&key, |n| {
                    n.status.vm_id = Some(id.clone());
                    n.status.vm_ip = Some(ip.clone());
                    n.status.readiness_polls = 0;
                })?;
                self.set_phase(&key, node.phase(), WorkerPhase::VMCreated)?;
                Ok(Action::requeue(self.requeue.node_wait()))
            }
            None => {
                self.store().patch(&key, |n| n.status.vm_id = Some(id.clone()))?;
                self.await_vm(node, settings, "Waiting for the VM to get an address")
            }
        }
    }

    /// Count a readiness poll; past the retry limit the delay is reported but polling continues
    fn await_vm(&self, node: &WorkerNode, settings: &Settings, waiting: &str) -> Result<Action> {
        let polls = node.status.readiness_polls.saturating_add(1);
        let limit = settings.vm_active_wait_retry_limit;
        let message = if polls > limit {
            warn!(
                "Worker {} VM still not active after {} polls (limit {})",
                node.name(),
                polls,
                limit
            );
            format!("VM did not become active within {} polls", limit)
        } else {
            waiting.to_string()
        };
        self.store().patch(&node.key(), |n| {
            n.status.readiness_polls = polls;
            n.status.message = Some(message);
        })?;
        Ok(Action::requeue(settings.vm_active_wait_interval()))
    }

    async fn reconcile_vm_created(&self, node: &WorkerNode) -> Result<Action> {
        let registry = self.collaborators.registry.clone();
        match self.call("get node", registry.get_node(node.name())).await? {
            Some(Some(registered)) if registered.ready => {
                self.set_phase(&node.key(), node.phase(), WorkerPhase::Ready)?;
                Ok(Action::requeue(self.requeue.trigger_delay()))
            }
            Some(Some(_)) => {
                debug!("Worker {} registered but not ready", node.name());
                Ok(Action::requeue(self.requeue.node_wait()))
            }
            Some(None) => {
                self.store().patch(&node.key(), |n| {
                    n.status.message = Some("Waiting for the node to register".to_string());
                })?;
                Ok(Action::requeue(self.requeue.node_wait()))
            }
            None => Ok(Action::requeue(self.requeue.node_wait())),
        }
    }

    async fn reconcile_ready(&self, node: &WorkerNode) -> Result<Action> {
        let key = node.key();
        let target = self.collaborators.target.clone();
        let registry = self.collaborators.registry.clone();

        // Underlying VM decommissioned outside the engine
        if let Some(None) = self.call("get vm by name", target.get_vm_by_name(node.name())).await? {
            warn!("VM for worker {} has disappeared, removing worker", node.name());
            self.store().request_delete(&key)?;
            return Ok(Action::await_change());
        }

        match self.call("get node", registry.get_node(node.name())).await? {
            Some(Some(registered)) if registered.ready => {}
            Some(_) => {
                warn!("Worker {} is no longer ready", node.name());
                self.set_phase(&key, node.phase(), WorkerPhase::VMCreated)?;
                return Ok(Action::requeue(self.requeue.node_wait()));
            }
            None => return Ok(Action::requeue(self.requeue.node_wait())),
        }

        self.fleet
            .refresh_active_migrations(node.name(), &self.migrations)
            .await?;
        Ok(Action::requeue(self.requeue.active_migrations_refresh()))
    }

    /// Tear down the VM and registry node; release the hold once both are gone
    async fn reconcile_delete(&self, node: &WorkerNode) -> Result<Action> {
        let key = node.key();
        if !node.metadata.has_finalizer(WORKER_FINALIZER) {
            return Ok(Action::await_change());
        }

        if node.is_controller() {
            self.store().remove_finalizer(&key, WORKER_FINALIZER)?;
            info!("Released controller node {}", node.name());
            return Ok(Action::await_change());
        }

        if node.phase() != WorkerPhase::Deleting {
            self.set_phase(&key, node.phase(), WorkerPhase::Deleting)?;
        }

        let target = self.collaborators.target.clone();
        let registry = self.collaborators.registry.clone();

        let vm_id = match &node.status.vm_id {
            Some(id) => Some(id.clone()),
            None => match self.call("get vm by name", target.get_vm_by_name(node.name())).await? {
                Some(found) => found,
                None => return Ok(Action::requeue(self.requeue.node_wait())),
            },
        };

        let vm = match vm_id {
            None => DeleteOutcome::AlreadyAbsent,
            Some(id) => match self.call("delete vm", target.delete_vm(&id)).await? {
                Some(outcome) => outcome,
                None => return Ok(Action::requeue(self.requeue.node_wait())),
            },
        };

        let registered = match self.call("delete node", registry.delete_node(node.name())).await? {
            Some(outcome) => outcome,
            None => return Ok(Action::requeue(self.requeue.node_wait())),
        };

        if vm == DeleteOutcome::AlreadyAbsent && registered == DeleteOutcome::AlreadyAbsent {
            match self.store().patch(&key, |n| {
                n.status.phase = WorkerPhase::Deleted;
                n.status.vm_id = None;
                n.status.vm_ip = None;
                n.metadata.remove_finalizer(WORKER_FINALIZER);
            }) {
                Ok(_) | Err(MigrateError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
            info!("Worker {} deleted", node.name());
            metrics::record_worker_transition(WorkerPhase::Deleting.as_str(), WorkerPhase::Deleted.as_str());
            return Ok(Action::await_change());
        }

        debug!(
            "Worker {} teardown pending (vm: {:?}, node: {:?})",
            node.name(),
            vm,
            registered
        );
        self.store().patch(&key, |n| {
            n.status.message = Some("Waiting for VM and node removal".to_string());
        })?;
        Ok(Action::requeue(self.requeue.node_wait()))
    }
}

fn first_non_empty(preferred: &str, fallback: &str) -> String {
    if preferred.is_empty() {
        fallback.to_string()
    } else {
        preferred.to_string()
    }
}

#[async_trait]
impl Reconciler for FleetController {
    fn name(&self) -> &'static str {
        "fleet"
    }

    fn keys(&self) -> Vec<ObjectKey> {
        self.store().keys()
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(mut node) = self.store().get(key) else {
            debug!("Worker {} no longer exists", key);
            return Ok(Action::await_change());
        };

        if node.metadata.is_deleting() {
            return self.reconcile_delete(&node).await;
        }

        if !node.metadata.has_finalizer(WORKER_FINALIZER) {
            node = self.store().patch(key, |n| {
                n.metadata.add_finalizer(WORKER_FINALIZER);
            })?;
        }

        if node.is_controller() {
            return self.reconcile_controller(&node).await;
        }

        let settings = self.settings.load().await?;
        match node.phase() {
            WorkerPhase::Provisioning => self.reconcile_provisioning(&node, &settings).await,
            WorkerPhase::VMCreated => self.reconcile_vm_created(&node).await,
            WorkerPhase::Ready => self.reconcile_ready(&node).await,
            WorkerPhase::Deleting | WorkerPhase::Deleted => Ok(Action::await_change()),
        }
    }

    fn error_policy(&self, key: &ObjectKey, error: &MigrateError, attempt: u32) -> Action {
        let delay = exponential_backoff(
            self.requeue.error_backoff_base(),
            attempt,
            self.requeue.error_backoff_max(),
        );
        warn!(
            "Worker {} reconcile failed ({}, attempt {}): {}, retrying in {:?}",
            key,
            error.error_type(),
            attempt,
            error,
            delay
        );
        Action::requeue(delay)
    }
}
