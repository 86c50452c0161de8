//! In-memory collaborators
//!
//! Scriptable stand-ins for the source inventory, target cloud, node
//! registry, copy executor and disk converter. They back the integration
//! tests and the controller binary's `--simulate` mode.

use crate::error::ExternalError;
use crate::external::{
    Collaborators, ConversionProgress, CopyExecutor, CopyProgress, CopyRequest, CreateVmRequest,
    DeleteOutcome, DiskConverter, NodeRegistry, PowerState, RegisteredNode, SourceDisk,
    SourceInventory, SourceVm, TargetCloud,
};
use crate::types::Clock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Clock that only moves when told to
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

#[derive(Default)]
struct SourceState {
    vms: HashMap<String, SourceVm>,
    lookup_failures: VecDeque<ExternalError>,
    power_off_failures: VecDeque<ExternalError>,
    final_sync_failures: VecDeque<ExternalError>,
    final_syncs: u32,
}

/// Source estate
#[derive(Default)]
pub struct FakeSource {
    state: Mutex<SourceState>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a powered-on VM with the given `(disk, size)` pairs
    pub fn add_vm(&self, name: &str, disks: &[(&str, u64)]) {
        let vm = SourceVm {
            id: format!("src-{}", name),
            disks: disks
                .iter()
                .map(|(disk, size)| SourceDisk {
                    name: disk.to_string(),
                    size_bytes: *size,
                })
                .collect(),
            power_state: PowerState::On,
        };
        self.state.lock().vms.insert(name.to_string(), vm);
    }

    pub fn remove_vm(&self, name: &str) {
        self.state.lock().vms.remove(name);
    }

    pub fn power_state(&self, name: &str) -> Option<PowerState> {
        self.state.lock().vms.get(name).map(|vm| vm.power_state)
    }

    pub fn final_syncs(&self) -> u32 {
        self.state.lock().final_syncs
    }

    pub fn fail_next_lookup(&self, error: ExternalError) {
        self.state.lock().lookup_failures.push_back(error);
    }

    pub fn fail_next_power_off(&self, error: ExternalError) {
        self.state.lock().power_off_failures.push_back(error);
    }

    pub fn fail_next_final_sync(&self, error: ExternalError) {
        self.state.lock().final_sync_failures.push_back(error);
    }

    fn set_power(state: &mut SourceState, vm: &str, power: PowerState) -> Result<(), ExternalError> {
        match state.vms.get_mut(vm) {
            Some(found) => {
                found.power_state = power;
                Ok(())
            }
            None => Err(ExternalError::unrecoverable(format!("source VM {} not found", vm))),
        }
    }
}

#[async_trait]
impl SourceInventory for FakeSource {
    async fn get_vm(&self, vm: &str) -> Result<Option<SourceVm>, ExternalError> {
        let mut state = self.state.lock();
        if let Some(e) = state.lookup_failures.pop_front() {
            return Err(e);
        }
        Ok(state.vms.get(vm).cloned())
    }

    async fn power_off(&self, vm: &str) -> Result<(), ExternalError> {
        let mut state = self.state.lock();
        if let Some(e) = state.power_off_failures.pop_front() {
            return Err(e);
        }
        Self::set_power(&mut state, vm, PowerState::Off)
    }

    async fn power_off_and_final_sync(&self, vm: &str) -> Result<(), ExternalError> {
        let mut state = self.state.lock();
        if let Some(e) = state.final_sync_failures.pop_front() {
            return Err(e);
        }
        Self::set_power(&mut state, vm, PowerState::Off)?;
        state.final_syncs += 1;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct CloudVm {
    id: String,
    ip: String,
    /// Delete calls that report `Deleted` while the VM lingers
    lingering_deletes: u32,
}

#[derive(Default)]
struct CloudState {
    vms: HashMap<String, CloudVm>,
    lookup_delay: u32,
    lookups: HashMap<String, u32>,
    delete_linger: u32,
    create_requests: Vec<CreateVmRequest>,
    activated: Vec<String>,
    activate_failures: VecDeque<ExternalError>,
    refresh_failures: VecDeque<ExternalError>,
    controller_refreshes: u32,
    next_id: u32,
}

/// Target cloud. Created VMs register with the linked registry as ready nodes.
#[derive(Default)]
pub struct FakeCloud {
    state: Mutex<CloudState>,
    registry: Option<Arc<FakeRegistry>>,
}

impl FakeCloud {
    pub fn new(registry: Arc<FakeRegistry>) -> Self {
        Self {
            state: Mutex::new(CloudState::default()),
            registry: Some(registry),
        }
    }

    /// Name lookups miss for the first `lookups` calls per name, and
    /// `create_vm` does not hand back an identifier.
    pub fn set_lookup_delay(&self, lookups: u32) {
        self.state.lock().lookup_delay = lookups;
    }

    /// Every VM survives this many delete calls before it is gone
    pub fn set_delete_linger(&self, calls: u32) {
        self.state.lock().delete_linger = calls;
    }

    /// A VM that exists without the engine having asked for it
    pub fn add_vm(&self, name: &str) -> String {
        let mut state = self.state.lock();
        let vm = Self::allocate(&mut state);
        let id = vm.id.clone();
        state.vms.insert(name.to_string(), vm);
        id
    }

    /// Decommission a VM behind the engine's back
    pub fn remove_vm(&self, name: &str) {
        self.state.lock().vms.remove(name);
    }

    pub fn has_vm(&self, name: &str) -> bool {
        self.state.lock().vms.contains_key(name)
    }

    pub fn create_requests(&self) -> Vec<CreateVmRequest> {
        self.state.lock().create_requests.clone()
    }

    pub fn activated(&self) -> Vec<String> {
        self.state.lock().activated.clone()
    }

    pub fn controller_refreshes(&self) -> u32 {
        self.state.lock().controller_refreshes
    }

    pub fn fail_next_activate(&self, error: ExternalError) {
        self.state.lock().activate_failures.push_back(error);
    }

    pub fn fail_next_refresh(&self, error: ExternalError) {
        self.state.lock().refresh_failures.push_back(error);
    }

    fn allocate(state: &mut CloudState) -> CloudVm {
        state.next_id += 1;
        CloudVm {
            id: format!("vm-{:04}", state.next_id),
            ip: format!("10.0.{}.{}", state.next_id / 250, state.next_id % 250 + 2),
            lingering_deletes: state.delete_linger,
        }
    }
}

#[async_trait]
impl TargetCloud for FakeCloud {
    async fn create_vm(&self, request: &CreateVmRequest) -> Result<Option<String>, ExternalError> {
        let (id, delayed) = {
            let mut state = self.state.lock();
            state.create_requests.push(request.clone());
            let vm = match state.vms.get(&request.name) {
                Some(existing) => existing.clone(),
                None => {
                    let vm = Self::allocate(&mut state);
                    state.vms.insert(request.name.clone(), vm.clone());
                    vm
                }
            };
            (vm.id, state.lookup_delay > 0)
        };
        if let Some(registry) = &self.registry {
            registry.register(&request.name, true);
        }
        Ok(if delayed { None } else { Some(id) })
    }

    async fn get_vm_by_name(&self, name: &str) -> Result<Option<String>, ExternalError> {
        let mut state = self.state.lock();
        let seen = {
            let count = state.lookups.entry(name.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        if seen <= state.lookup_delay {
            return Ok(None);
        }
        Ok(state.vms.get(name).map(|vm| vm.id.clone()))
    }

    async fn get_vm_ip(&self, id: &str) -> Result<Option<String>, ExternalError> {
        let state = self.state.lock();
        Ok(state.vms.values().find(|vm| vm.id == id).map(|vm| vm.ip.clone()))
    }

    async fn delete_vm(&self, id: &str) -> Result<DeleteOutcome, ExternalError> {
        let mut state = self.state.lock();
        let Some(name) = state
            .vms
            .iter()
            .find(|(_, vm)| vm.id == id)
            .map(|(name, _)| name.clone())
        else {
            return Ok(DeleteOutcome::AlreadyAbsent);
        };
        if let Some(vm) = state.vms.get_mut(&name) {
            if vm.lingering_deletes > 0 {
                vm.lingering_deletes -= 1;
                return Ok(DeleteOutcome::Deleted);
            }
        }
        state.vms.remove(&name);
        Ok(DeleteOutcome::Deleted)
    }

    async fn activate_vm(&self, name: &str) -> Result<(), ExternalError> {
        let mut state = self.state.lock();
        if let Some(e) = state.activate_failures.pop_front() {
            return Err(e);
        }
        state.activated.push(name.to_string());
        Ok(())
    }

    async fn refresh_controller_image(&self) -> Result<(), ExternalError> {
        let mut state = self.state.lock();
        if let Some(e) = state.refresh_failures.pop_front() {
            return Err(e);
        }
        state.controller_refreshes += 1;
        Ok(())
    }
}

/// Cluster node registry
#[derive(Default)]
pub struct FakeRegistry {
    nodes: Mutex<HashMap<String, bool>>,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, ready: bool) {
        self.nodes.lock().insert(name.to_string(), ready);
    }

    pub fn set_ready(&self, name: &str, ready: bool) {
        if let Some(node) = self.nodes.lock().get_mut(name) {
            *node = ready;
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.lock().contains_key(name)
    }
}

#[async_trait]
impl NodeRegistry for FakeRegistry {
    async fn get_node(&self, name: &str) -> Result<Option<RegisteredNode>, ExternalError> {
        Ok(self.nodes.lock().get(name).map(|ready| RegisteredNode {
            name: name.to_string(),
            ready: *ready,
        }))
    }

    async fn delete_node(&self, name: &str) -> Result<DeleteOutcome, ExternalError> {
        Ok(match self.nodes.lock().remove(name) {
            Some(_) => DeleteOutcome::Deleted,
            None => DeleteOutcome::AlreadyAbsent,
        })
    }
}

#[derive(Default)]
struct CopyState {
    full_copy_polls: u32,
    polls: HashMap<String, u32>,
    remaining: VecDeque<u64>,
    failures: VecDeque<ExternalError>,
    latency: Option<Duration>,
    full_copies: u32,
    passes: u32,
}

/// Block copy executor
#[derive(Default)]
pub struct FakeCopy {
    state: Mutex<CopyState>,
}

impl FakeCopy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full copies report in-progress this many times before completing
    pub fn set_full_copy_polls(&self, polls: u32) {
        self.state.lock().full_copy_polls = polls;
    }

    /// Outstanding bytes reported by successive changed-block passes; zero once exhausted
    pub fn script_remaining(&self, remaining: &[u64]) {
        self.state.lock().remaining = remaining.iter().copied().collect();
    }

    pub fn fail_next(&self, error: ExternalError) {
        self.state.lock().failures.push_back(error);
    }

    /// Delay every call, to exercise deadlines
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().latency = latency;
    }

    pub fn full_copies(&self) -> u32 {
        self.state.lock().full_copies
    }

    pub fn passes(&self) -> u32 {
        self.state.lock().passes
    }

    async fn stall(&self) {
        let latency = self.state.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl CopyExecutor for FakeCopy {
    async fn full_copy(&self, request: &CopyRequest) -> Result<CopyProgress, ExternalError> {
        self.stall().await;
        let mut state = self.state.lock();
        if let Some(e) = state.failures.pop_front() {
            return Err(e);
        }
        let limit = state.full_copy_polls;
        let polls = state.polls.entry(request.migration.clone()).or_insert(0);
        if *polls < limit {
            *polls += 1;
            return Ok(CopyProgress::InProgress);
        }
        state.polls.remove(&request.migration);
        state.full_copies += 1;
        Ok(CopyProgress::Complete { remaining_bytes: 0 })
    }

    async fn changed_block_pass(&self, _request: &CopyRequest) -> Result<CopyProgress, ExternalError> {
        self.stall().await;
        let mut state = self.state.lock();
        if let Some(e) = state.failures.pop_front() {
            return Err(e);
        }
        state.passes += 1;
        let remaining_bytes = state.remaining.pop_front().unwrap_or(0);
        Ok(CopyProgress::Complete { remaining_bytes })
    }
}

#[derive(Default)]
struct ConverterState {
    failures: VecDeque<ExternalError>,
    conversions: u32,
    cleanups: Vec<String>,
}

/// Disk conversion job runner
#[derive(Default)]
pub struct FakeConverter {
    state: Mutex<ConverterState>,
}

impl FakeConverter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, error: ExternalError) {
        self.state.lock().failures.push_back(error);
    }

    pub fn conversions(&self) -> u32 {
        self.state.lock().conversions
    }

    pub fn cleanups(&self) -> Vec<String> {
        self.state.lock().cleanups.clone()
    }
}

#[async_trait]
impl DiskConverter for FakeConverter {
    async fn convert(&self, _request: &CopyRequest) -> Result<ConversionProgress, ExternalError> {
        let mut state = self.state.lock();
        if let Some(e) = state.failures.pop_front() {
            return Err(e);
        }
        state.conversions += 1;
        Ok(ConversionProgress::Complete)
    }

    async fn cleanup_volumes(&self, migration: &str) -> Result<(), ExternalError> {
        self.state.lock().cleanups.push(migration.to_string());
        Ok(())
    }
}

/// One simulated estate, with handles kept for scripting and inspection
#[derive(Clone)]
pub struct Simulation {
    pub source: Arc<FakeSource>,
    pub cloud: Arc<FakeCloud>,
    pub registry: Arc<FakeRegistry>,
    pub copy: Arc<FakeCopy>,
    pub converter: Arc<FakeConverter>,
}

impl Simulation {
    pub fn new() -> Self {
        let registry = Arc::new(FakeRegistry::new());
        Self {
            source: Arc::new(FakeSource::new()),
            cloud: Arc::new(FakeCloud::new(registry.clone())),
            registry,
            copy: Arc::new(FakeCopy::new()),
            converter: Arc::new(FakeConverter::new()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            source: self.source.clone(),
            target: self.cloud.clone(),
            registry: self.registry.clone(),
            copy: self.copy.clone(),
            converter: self.converter.clone(),
        }
    }
}

impl Default for Simulation {
    fn default() -> Self {
        Self::new()
    }
}
