//! Engine configuration
//!
//! Process-level configuration loaded from TOML. Runtime tunables that
//! operators change while the engine runs live in [`Settings`](crate::settings::Settings).

use crate::error::Result;
use crate::types::DEFAULT_NAMESPACE;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Namespace migrations and worker nodes are created in
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Maximum reconciliation passes running at once, per controller
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Timeout applied to every external collaborator call, in milliseconds
    #[serde(default = "default_external_call_timeout")]
    pub external_call_timeout_ms: u64,

    /// Directory holding the persisted record snapshots (in-memory only if unset)
    #[serde(default)]
    pub state_dir: Option<PathBuf>,

    /// YAML file with the runtime settings (built-in defaults if unset)
    #[serde(default)]
    pub settings_path: Option<PathBuf>,

    #[serde(default)]
    pub requeue: RequeueConfig,

    #[serde(default)]
    pub fleet: FleetConfig,

    #[serde(default)]
    pub migration: MigrationConfig,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_concurrency() -> usize {
    4
}

fn default_external_call_timeout() -> u64 {
    30_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            concurrency: default_concurrency(),
            external_call_timeout_ms: default_external_call_timeout(),
            state_dir: None,
            settings_path: None,
            requeue: RequeueConfig::default(),
            fleet: FleetConfig::default(),
            migration: MigrationConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load from a TOML file, falling back to defaults if it does not exist
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Get external call timeout as Duration
    pub fn external_call_timeout(&self) -> Duration {
        Duration::from_millis(self.external_call_timeout_ms)
    }

    pub fn migrations_state_path(&self) -> Option<PathBuf> {
        self.state_dir.as_ref().map(|d| d.join("migrations.json"))
    }

    pub fn workers_state_path(&self) -> Option<PathBuf> {
        self.state_dir.as_ref().map(|d| d.join("workers.json"))
    }
}

/// Delays between reconciliation passes
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RequeueConfig {
    /// Waiting for a worker VM or its cluster node to appear
    #[serde(default = "default_node_wait")]
    pub node_wait_secs: u64,

    /// Polling an in-progress migration phase
    #[serde(default = "default_phase_poll")]
    pub phase_poll_secs: u64,

    /// Refreshing a controller-role node
    #[serde(default = "default_controller_refresh")]
    pub controller_refresh_secs: u64,

    /// Retrying a failed controller-role refresh
    #[serde(default = "default_controller_retry")]
    pub controller_retry_secs: u64,

    /// Refreshing the active migrations of a ready worker
    #[serde(default = "default_active_refresh")]
    pub active_migrations_refresh_secs: u64,

    /// Delay before acting on a freshly entered migration phase
    #[serde(default = "default_trigger_delay")]
    pub trigger_delay_secs: u64,

    /// Base delay of the error backoff, in milliseconds
    #[serde(default = "default_backoff_base")]
    pub error_backoff_base_ms: u64,

    /// Cap on the error backoff, in milliseconds
    #[serde(default = "default_backoff_max")]
    pub error_backoff_max_ms: u64,
}

fn default_node_wait() -> u64 {
    10
}

fn default_phase_poll() -> u64 {
    20
}

fn default_controller_refresh() -> u64 {
    60
}

fn default_controller_retry() -> u64 {
    30
}

fn default_active_refresh() -> u64 {
    30
}

fn default_trigger_delay() -> u64 {
    5
}

fn default_backoff_base() -> u64 {
    5_000
}

fn default_backoff_max() -> u64 {
    300_000
}

impl Default for RequeueConfig {
    fn default() -> Self {
        Self {
            node_wait_secs: default_node_wait(),
            phase_poll_secs: default_phase_poll(),
            controller_refresh_secs: default_controller_refresh(),
            controller_retry_secs: default_controller_retry(),
            active_migrations_refresh_secs: default_active_refresh(),
            trigger_delay_secs: default_trigger_delay(),
            error_backoff_base_ms: default_backoff_base(),
            error_backoff_max_ms: default_backoff_max(),
        }
    }
}

impl RequeueConfig {
    pub fn node_wait(&self) -> Duration {
        Duration::from_secs(self.node_wait_secs)
    }

    pub fn phase_poll(&self) -> Duration {
        Duration::from_secs(self.phase_poll_secs)
    }

    pub fn controller_refresh(&self) -> Duration {
        Duration::from_secs(self.controller_refresh_secs)
    }

    pub fn controller_retry(&self) -> Duration {
        Duration::from_secs(self.controller_retry_secs)
    }

    pub fn active_migrations_refresh(&self) -> Duration {
        Duration::from_secs(self.active_migrations_refresh_secs)
    }

    pub fn trigger_delay(&self) -> Duration {
        Duration::from_secs(self.trigger_delay_secs)
    }

    pub fn error_backoff_base(&self) -> Duration {
        Duration::from_millis(self.error_backoff_base_ms)
    }

    pub fn error_backoff_max(&self) -> Duration {
        Duration::from_millis(self.error_backoff_max_ms)
    }
}

/// Worker fleet sizing and the template for new workers
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FleetConfig {
    /// Concurrent migrations a single worker may own
    #[serde(default = "default_worker_capacity")]
    pub worker_capacity: u32,

    /// Upper bound on worker nodes provisioned automatically
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Provision a new worker when none has spare capacity
    #[serde(default = "default_true")]
    pub auto_scale: bool,

    /// Prefix for automatically created worker names
    #[serde(default = "default_worker_prefix")]
    pub worker_name_prefix: String,

    /// Flavor for automatically created workers
    #[serde(default)]
    pub flavor_id: String,

    /// Boot image for automatically created workers
    #[serde(default)]
    pub image_id: String,

    /// Credentials reference used to provision workers
    #[serde(default)]
    pub credentials_ref: String,
}

fn default_worker_capacity() -> u32 {
    1
}

fn default_max_workers() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_worker_prefix() -> String {
    "stellaris-migrate-worker".to_string()
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            worker_capacity: default_worker_capacity(),
            max_workers: default_max_workers(),
            auto_scale: default_true(),
            worker_name_prefix: default_worker_prefix(),
            flavor_id: String::new(),
            image_id: String::new(),
            credentials_ref: String::new(),
        }
    }
}

/// Limits applied while driving a single migration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MigrationConfig {
    /// Remaining changed-block delta, in bytes, at which the copy has converged
    #[serde(default = "default_convergence_cutoff")]
    pub convergence_cutoff_bytes: u64,

    /// Consecutive transient copy failures tolerated before failing the migration
    #[serde(default = "default_copy_retry_limit")]
    pub copy_retry_limit: u32,

    /// Cutover attempts before failing the migration
    #[serde(default = "default_cutover_attempt_limit")]
    pub cutover_attempt_limit: u32,

    /// Longest single wait while parked before a scheduled cutover, in seconds
    #[serde(default = "default_max_cutover_poll")]
    pub max_cutover_poll_secs: u64,

    /// Delay between changed-block passes, in seconds
    #[serde(default = "default_changed_block_interval")]
    pub changed_block_interval_secs: u64,
}

fn default_convergence_cutoff() -> u64 {
    64 * 1024 * 1024 // 64MiB
}

fn default_copy_retry_limit() -> u32 {
    5
}

fn default_cutover_attempt_limit() -> u32 {
    3
}

fn default_max_cutover_poll() -> u64 {
    300
}

fn default_changed_block_interval() -> u64 {
    5
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            convergence_cutoff_bytes: default_convergence_cutoff(),
            copy_retry_limit: default_copy_retry_limit(),
            cutover_attempt_limit: default_cutover_attempt_limit(),
            max_cutover_poll_secs: default_max_cutover_poll(),
            changed_block_interval_secs: default_changed_block_interval(),
        }
    }
}

impl MigrationConfig {
    pub fn max_cutover_poll(&self) -> Duration {
        Duration::from_secs(self.max_cutover_poll_secs)
    }

    pub fn changed_block_interval(&self) -> Duration {
        Duration::from_secs(self.changed_block_interval_secs)
    }
}
