//! Stellaris Migrate - orchestration engine for moving VM fleets between hypervisors
//!
//! Each VM migration is a record advanced by a level-triggered reconciler
//! through validation, block copy, changed-block convergence, disk
//! conversion and cutover. A second reconciler provisions, tracks and
//! retires the worker VMs that run the copy jobs, and bounds how many
//! migrations each worker carries at once.
//!
//! # Architecture
//!
//! - **Store**: namespaced, versioned records with finalizers and change events
//! - **Reconcile**: control loop with a deduplicated work queue and per-key serialization
//! - **Migration**: the phase state machine, convergence loop and cutover gate
//! - **Fleet**: worker capacity accounting, placement and provisioning
//! - **External**: async traits for every side effect, bounded by timeouts
//! - **Sim**: scriptable in-memory collaborators
//!
//! # Key Operations
//!
//! - Submit, pause, retry and delete migrations
//! - Answer the admin cutover gate, or schedule a cutover time
//! - Add and remove workers; scale up automatically when capacity runs out

pub mod config;
pub mod engine;
pub mod error;
pub mod external;
pub mod fleet;
pub mod metrics;
pub mod migration;
pub mod reconcile;
pub mod settings;
pub mod sim;
pub mod store;
pub mod types;

pub use config::{EngineConfig, FleetConfig, MigrationConfig, RequeueConfig};
pub use engine::{Engine, EngineSummary};
pub use error::{ExternalError, ExternalErrorKind, MigrateError, Result};
pub use external::{
    Collaborators, ConversionProgress, CopyExecutor, CopyProgress, CopyRequest, CreateVmRequest,
    DeleteOutcome, DiskConverter, NodeRegistry, PowerState, RegisteredNode, SourceDisk,
    SourceInventory, SourceVm, TargetCloud,
};
pub use fleet::{
    Assignment, FleetController, FleetManager, NodeRole, WorkerNode, WorkerNodeSpec,
    WorkerNodeStatus, WorkerPhase, WORKER_FINALIZER,
};
pub use migration::{
    Condition, ConditionType, CutoverMode, CutoverSignal, Migration, MigrationController,
    MigrationPhase, MigrationSpec, MigrationStatus, PhaseChangeEvent, TargetPlacement,
    MIGRATION_FINALIZER, PAUSE_LABEL,
};
pub use reconcile::{Action, ControlLoop, Reconciler};
pub use settings::{
    ConfigStore, FileConfigStore, MemoryConfigStore, MigrationMethod, Settings, SettingsProvider,
};
pub use store::{ObjectStore, StoreEvent, StoreEventKind};
pub use types::{Clock, Object, ObjectKey, ObjectMeta, SystemClock, DEFAULT_NAMESPACE};
