//! External collaborators
//!
//! The engine never performs disk I/O or talks to a hypervisor itself. Every
//! side effect goes through one of these traits, and every call is bounded
//! by [`with_timeout`]. A call that does not finish in time yields `None`,
//! which callers treat as "still in progress" and requeue.

use crate::error::ExternalError;
use crate::settings::MigrationMethod;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Power state reported by the source platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    On,
    Off,
    Suspended,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDisk {
    pub name: String,
    pub size_bytes: u64,
}

/// A VM as seen by the source inventory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceVm {
    pub id: String,
    pub disks: Vec<SourceDisk>,
    pub power_state: PowerState,
}

/// Source hypervisor estate
#[async_trait]
pub trait SourceInventory: Send + Sync {
    /// Look up a VM; `None` if it does not exist
    async fn get_vm(&self, vm: &str) -> Result<Option<SourceVm>, ExternalError>;

    /// Power the VM off ahead of a cold copy
    async fn power_off(&self, vm: &str) -> Result<(), ExternalError>;

    /// Power the VM off and flush the last changed blocks for cutover
    async fn power_off_and_final_sync(&self, vm: &str) -> Result<(), ExternalError>;
}

/// Parameters for provisioning a worker VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVmRequest {
    pub name: String,
    pub flavor_id: String,
    pub image_id: String,
    pub credentials_ref: String,
}

/// Result of a delete call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// A delete was issued; the resource may still be going away
    Deleted,
    /// Nothing left to delete
    AlreadyAbsent,
}

/// Target cloud provisioning API
#[async_trait]
pub trait TargetCloud: Send + Sync {
    /// Request a VM. Returns its identifier once the cloud has assigned one.
    async fn create_vm(&self, request: &CreateVmRequest) -> Result<Option<String>, ExternalError>;

    async fn get_vm_by_name(&self, name: &str) -> Result<Option<String>, ExternalError>;

    /// Address of a VM, `None` while not yet reachable
    async fn get_vm_ip(&self, id: &str) -> Result<Option<String>, ExternalError>;

    async fn delete_vm(&self, id: &str) -> Result<DeleteOutcome, ExternalError>;

    /// Boot the migrated VM on the target side
    async fn activate_vm(&self, name: &str) -> Result<(), ExternalError>;

    /// Refresh the image the controller node runs from
    async fn refresh_controller_image(&self) -> Result<(), ExternalError>;
}

/// A node object in the cluster registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredNode {
    pub name: String,
    pub ready: bool,
}

/// Cluster node registry used for worker health
#[async_trait]
pub trait NodeRegistry: Send + Sync {
    async fn get_node(&self, name: &str) -> Result<Option<RegisteredNode>, ExternalError>;

    async fn delete_node(&self, name: &str) -> Result<DeleteOutcome, ExternalError>;
}

/// One copy step for one migration on one worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyRequest {
    pub migration: String,
    pub worker: String,
    pub source_vm: String,
    pub disks: Vec<String>,
    pub method: MigrationMethod,
}

/// Progress reported by the copy executor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyProgress {
    InProgress,
    /// The step finished with this much changed data still outstanding
    Complete { remaining_bytes: u64 },
}

/// Block copy executor running on a worker
#[async_trait]
pub trait CopyExecutor: Send + Sync {
    async fn full_copy(&self, request: &CopyRequest) -> Result<CopyProgress, ExternalError>;

    async fn changed_block_pass(&self, request: &CopyRequest) -> Result<CopyProgress, ExternalError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionProgress {
    InProgress,
    Complete,
}

/// Disk format conversion job
#[async_trait]
pub trait DiskConverter: Send + Sync {
    async fn convert(&self, request: &CopyRequest) -> Result<ConversionProgress, ExternalError>;

    /// Remove partially written target volumes
    async fn cleanup_volumes(&self, migration: &str) -> Result<(), ExternalError>;
}

/// The full set of collaborators handed to the controllers
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn SourceInventory>,
    pub target: Arc<dyn TargetCloud>,
    pub registry: Arc<dyn NodeRegistry>,
    pub copy: Arc<dyn CopyExecutor>,
    pub converter: Arc<dyn DiskConverter>,
}

/// Run an external call with a deadline. `Ok(None)` means it timed out.
pub async fn with_timeout<T, F>(
    timeout: Duration,
    operation: &str,
    call: F,
) -> Result<Option<T>, ExternalError>
where
    F: Future<Output = Result<T, ExternalError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result.map(Some),
        Err(_) => {
            debug!("{} did not finish within {:?}", operation, timeout);
            crate::metrics::record_external_timeout(operation);
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timeout_yields_none() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, ExternalError>(1)
        };
        let result = with_timeout(Duration::from_secs(1), "slow call", slow).await;
        assert_eq!(result, Ok(None));
    }

    #[tokio::test]
    async fn test_errors_pass_through() {
        let failing = async { Err::<u32, _>(ExternalError::unrecoverable("credential rejected")) };
        let err = with_timeout(Duration::from_secs(1), "get vm", failing)
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }
}
