//! Runtime tunables read from the configuration store
//!
//! Settings are loaded once per reconciliation pass as an immutable snapshot.
//! Missing keys, empty values and malformed values all fall back to the
//! built-in defaults.

use crate::error::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Name of the settings object in the configuration store
pub const SETTINGS_NAME: &str = "stellaris-migrate-settings";

pub const KEY_ITERATION_THRESHOLD: &str = "CHANGED_BLOCKS_COPY_ITERATION_THRESHOLD";
pub const KEY_VM_ACTIVE_WAIT_INTERVAL: &str = "VM_ACTIVE_WAIT_INTERVAL_SECONDS";
pub const KEY_VM_ACTIVE_WAIT_RETRY_LIMIT: &str = "VM_ACTIVE_WAIT_RETRY_LIMIT";
pub const KEY_DEFAULT_MIGRATION_METHOD: &str = "DEFAULT_MIGRATION_METHOD";
pub const KEY_SCAN_CONCURRENCY_LIMIT: &str = "VCENTER_SCAN_CONCURRENCY_LIMIT";
pub const KEY_CLEANUP_AFTER_CONVERT_FAILURE: &str = "CLEANUP_VOLUMES_AFTER_CONVERT_FAILURE";
pub const KEY_POPULATE_FLAVORS: &str = "POPULATE_VMWARE_MACHINE_FLAVORS";

/// How the source VM is treated during the copy phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationMethod {
    /// Source keeps running; changed blocks are copied until convergence
    #[default]
    Hot,
    /// Source is powered off before the first copy
    Cold,
}

impl std::fmt::Display for MigrationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationMethod::Hot => write!(f, "hot"),
            MigrationMethod::Cold => write!(f, "cold"),
        }
    }
}

impl FromStr for MigrationMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "hot" => Ok(MigrationMethod::Hot),
            "cold" => Ok(MigrationMethod::Cold),
            _ => Err(format!("Unknown migration method: {}", s)),
        }
    }
}

/// Immutable per-reconcile snapshot of the runtime tunables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Changed-block passes after which the copy is considered converged
    pub changed_blocks_copy_iteration_threshold: u32,

    /// Interval between worker VM readiness polls, in seconds
    pub vm_active_wait_interval_secs: u64,

    /// Readiness polls before a worker VM is reported as slow to start
    pub vm_active_wait_retry_limit: u32,

    /// Method used when a migration does not name one
    pub default_migration_method: MigrationMethod,

    /// Maximum number of source VMs inventoried concurrently
    pub scan_concurrency_limit: usize,

    /// Delete partially written volumes after a failed disk conversion
    pub cleanup_volumes_after_convert_failure: bool,

    /// Fill in target flavors automatically during discovery
    pub populate_flavors: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            changed_blocks_copy_iteration_threshold: 20,
            vm_active_wait_interval_secs: 20,
            vm_active_wait_retry_limit: 15,
            default_migration_method: MigrationMethod::Hot,
            scan_concurrency_limit: 10,
            cleanup_volumes_after_convert_failure: false,
            populate_flavors: true,
        }
    }
}

impl Settings {
    /// Build a snapshot from raw key/value data, defaulting anything absent or malformed
    pub fn from_map(data: &HashMap<String, String>) -> Self {
        let defaults = Self::default();
        Self {
            changed_blocks_copy_iteration_threshold: parse_or_default(
                data,
                KEY_ITERATION_THRESHOLD,
                defaults.changed_blocks_copy_iteration_threshold,
            ),
            vm_active_wait_interval_secs: parse_or_default(
                data,
                KEY_VM_ACTIVE_WAIT_INTERVAL,
                defaults.vm_active_wait_interval_secs,
            ),
            vm_active_wait_retry_limit: parse_or_default(
                data,
                KEY_VM_ACTIVE_WAIT_RETRY_LIMIT,
                defaults.vm_active_wait_retry_limit,
            ),
            default_migration_method: parse_or_default(
                data,
                KEY_DEFAULT_MIGRATION_METHOD,
                defaults.default_migration_method,
            ),
            scan_concurrency_limit: parse_or_default(
                data,
                KEY_SCAN_CONCURRENCY_LIMIT,
                defaults.scan_concurrency_limit,
            ),
            cleanup_volumes_after_convert_failure: parse_bool_or_default(
                data,
                KEY_CLEANUP_AFTER_CONVERT_FAILURE,
                defaults.cleanup_volumes_after_convert_failure,
            ),
            populate_flavors: parse_bool_or_default(
                data,
                KEY_POPULATE_FLAVORS,
                defaults.populate_flavors,
            ),
        }
    }

    /// Get the worker readiness poll interval as Duration
    pub fn vm_active_wait_interval(&self) -> Duration {
        Duration::from_secs(self.vm_active_wait_interval_secs)
    }

    /// Iteration threshold, never below one pass
    pub fn iteration_threshold(&self) -> u32 {
        self.changed_blocks_copy_iteration_threshold.max(1)
    }
}

fn parse_or_default<T>(data: &HashMap<String, String>, key: &str, default: T) -> T
where
    T: FromStr + Copy,
{
    match data.get(key).map(|v| v.trim()) {
        None | Some("") => default,
        Some(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("Malformed setting {}={:?}, using default", key, raw);
                default
            }
        },
    }
}

fn parse_bool_or_default(data: &HashMap<String, String>, key: &str, default: bool) -> bool {
    match data.get(key).map(|v| v.trim().to_lowercase()) {
        None => default,
        Some(raw) if raw.is_empty() => default,
        Some(raw) if raw == "true" => true,
        Some(raw) if raw == "false" => false,
        Some(raw) => {
            warn!("Malformed setting {}={:?}, using default", key, raw);
            default
        }
    }
}

/// Key/value configuration collaborator
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Read the named snapshot; `None` when it does not exist
    async fn read(&self, name: &str) -> Result<Option<HashMap<String, String>>>;
}

/// In-memory configuration store
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    entries: RwLock<HashMap<String, HashMap<String, String>>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a whole snapshot
    pub fn put(&self, name: &str, data: HashMap<String, String>) {
        self.entries.write().insert(name.to_string(), data);
    }

    /// Set a single key
    pub fn set(&self, name: &str, key: &str, value: &str) {
        self.entries
            .write()
            .entry(name.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    pub fn remove(&self, name: &str) {
        self.entries.write().remove(name);
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn read(&self, name: &str) -> Result<Option<HashMap<String, String>>> {
        Ok(self.entries.read().get(name).cloned())
    }
}

/// Configuration store backed by a YAML map on disk.
///
/// The file holds the settings keys at the top level. A missing file reads
/// as an absent snapshot.
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn read(&self, _name: &str) -> Result<Option<HashMap<String, String>>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let raw: HashMap<String, serde_yaml::Value> =
            serde_yaml::from_str(&content)?;
        let data = raw
            .into_iter()
            .filter_map(|(key, value)| {
                let value = match value {
                    serde_yaml::Value::String(s) => s,
                    serde_yaml::Value::Number(n) => n.to_string(),
                    serde_yaml::Value::Bool(b) => b.to_string(),
                    serde_yaml::Value::Null => String::new(),
                    other => {
                        warn!("Ignoring non-scalar setting {}: {:?}", key, other);
                        return None;
                    }
                };
                Some((key, value))
            })
            .collect();
        Ok(Some(data))
    }
}

/// Resolves a [`Settings`] snapshot from a [`ConfigStore`]
#[derive(Clone)]
pub struct SettingsProvider {
    store: Arc<dyn ConfigStore>,
    name: String,
}

impl SettingsProvider {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self {
            store,
            name: SETTINGS_NAME.to_string(),
        }
    }

    /// Load the current snapshot
    pub async fn load(&self) -> Result<Settings> {
        match self.store.read(&self.name).await? {
            Some(data) => Ok(Settings::from_map(&data)),
            None => {
                debug!("{} not found, using default settings", self.name);
                Ok(Settings::default())
            }
        }
    }
}
