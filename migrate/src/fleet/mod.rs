//! Worker fleet: agent VMs that execute copy jobs
//!
//! Each [`WorkerNode`] walks `Provisioning → VMCreated → Ready`, and
//! `Deleting → Deleted` once removal is requested. A ready worker carries
//! the list of migrations it currently owns; that list is bounded by the
//! worker's capacity and is only written by the fleet, through field-scoped
//! patches.

pub mod controller;
pub mod manager;
pub mod placement;

pub use controller::FleetController;
pub use manager::{Assignment, FleetManager};
pub use placement::{select_worker, PlacementError};

use crate::types::{Object, ObjectMeta};
use serde::{Deserialize, Serialize};

/// Hold placed on every worker until its VM and registry node are gone
pub const WORKER_FINALIZER: &str = "migrate.k8s.stellaris.io/finalizer";

/// What a node is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// The node the engine itself runs on; never provisioned as a VM
    #[serde(alias = "master")]
    Controller,
    #[default]
    Worker,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Controller => write!(f, "controller"),
            NodeRole::Worker => write!(f, "worker"),
        }
    }
}

/// Lifecycle phase of a worker node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum WorkerPhase {
    #[default]
    Provisioning,
    VMCreated,
    Ready,
    Deleting,
    Deleted,
}

impl WorkerPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerPhase::Provisioning => "Provisioning",
            WorkerPhase::VMCreated => "VMCreated",
            WorkerPhase::Ready => "Ready",
            WorkerPhase::Deleting => "Deleting",
            WorkerPhase::Deleted => "Deleted",
        }
    }
}

impl std::fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Desired state of a worker node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerNodeSpec {
    #[serde(default)]
    pub role: NodeRole,

    #[serde(default)]
    pub flavor_id: String,

    #[serde(default)]
    pub image_id: String,

    #[serde(default)]
    pub credentials_ref: String,

    /// Concurrent migrations; the fleet default applies when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<u32>,
}

/// Observed state of a worker node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerNodeStatus {
    #[serde(default)]
    pub phase: WorkerPhase,

    /// Identifier in the target cloud
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_ip: Option<String>,

    /// Migrations currently owned by this worker
    #[serde(default)]
    pub active_migrations: Vec<String>,

    /// A create call has been issued for the current VM
    #[serde(default)]
    pub creation_requested: bool,

    /// Readiness polls since the VM was requested
    #[serde(default)]
    pub readiness_polls: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// An agent VM in the worker fleet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerNode {
    pub metadata: ObjectMeta,
    pub spec: WorkerNodeSpec,
    #[serde(default)]
    pub status: WorkerNodeStatus,
}

impl Object for WorkerNode {
    const KIND: &'static str = "WorkerNode";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl WorkerNode {
    pub fn new(namespace: &str, name: &str, spec: WorkerNodeSpec) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec,
            status: WorkerNodeStatus::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn phase(&self) -> WorkerPhase {
        self.status.phase
    }

    pub fn is_controller(&self) -> bool {
        self.spec.role == NodeRole::Controller
    }

    pub fn capacity(&self, default_capacity: u32) -> u32 {
        self.spec.capacity.unwrap_or(default_capacity)
    }

    pub fn active_count(&self) -> usize {
        self.status.active_migrations.len()
    }

    pub fn owns(&self, migration: &str) -> bool {
        self.status.active_migrations.iter().any(|m| m == migration)
    }

    /// Ready, not being deleted, and able to take work
    pub fn is_schedulable(&self) -> bool {
        !self.is_controller()
            && self.status.phase == WorkerPhase::Ready
            && !self.metadata.is_deleting()
    }

    pub fn has_capacity(&self, default_capacity: u32) -> bool {
        self.active_count() < self.capacity(default_capacity) as usize
    }
}
