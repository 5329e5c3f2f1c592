//! In-memory provider for tests of code layered above `Provider`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::clock::ManualClock;
use crate::ready::{POLL_INTERVAL, ReadyPoller, StaticProbe};
use crate::types::{CreateOptions, Vm, VmId, VmStatus};
use crate::{Error, Provider, ProviderName, Result};

struct MemoryState {
    vms: BTreeMap<VmId, Vm>,
    polls: HashMap<VmId, u32>,
    /// Number of `get` calls before a provisioning VM reports running; `None` never.
    ready_after: Option<u32>,
    fail_next_create: Option<Error>,
    fail_next_list: Option<Error>,
    fail_next_delete: Option<Error>,
    creates: Vec<CreateOptions>,
    deleted: Vec<VmId>,
    next_id: u64,
}

pub struct MemoryProvider {
    state: Mutex<MemoryState>,
    clock: Arc<ManualClock>,
    poller: ReadyPoller,
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProvider {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new());
        let poller = ReadyPoller::new(clock.clone(), Arc::new(StaticProbe(true)), POLL_INTERVAL);
        Self {
            state: Mutex::new(MemoryState {
                vms: BTreeMap::new(),
                polls: HashMap::new(),
                ready_after: Some(1),
                fail_next_create: None,
                fail_next_list: None,
                fail_next_delete: None,
                creates: Vec::new(),
                deleted: Vec::new(),
                next_id: 1000,
            }),
            clock,
            poller,
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap()
    }

    /// Virtual clock used by `wait_ready`.
    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    pub fn never_ready(&self) {
        self.state().ready_after = None;
    }

    pub fn ready_after(&self, polls: u32) {
        self.state().ready_after = Some(polls);
    }

    pub fn fail_next_create(&self, err: Error) {
        self.state().fail_next_create = Some(err);
    }

    pub fn fail_next_list(&self, err: Error) {
        self.state().fail_next_list = Some(err);
    }

    pub fn fail_next_delete(&self, err: Error) {
        self.state().fail_next_delete = Some(err);
    }

    /// Add a running VM as if it had been created outside this process.
    pub fn insert_external(&self, name: &str) -> Vm {
        let mut state = self.state();
        let mut vm = new_vm(&mut state, name, None, None);
        vm.status = VmStatus::Running;
        state.vms.insert(vm.id.clone(), vm.clone());
        vm
    }

    /// Drop a VM without going through `delete`.
    pub fn vanish(&self, id: &VmId) {
        self.state().vms.remove(id);
    }

    pub fn set_status(&self, id: &VmId, status: VmStatus) {
        if let Some(vm) = self.state().vms.get_mut(id) {
            vm.status = status;
        }
    }

    pub fn vms(&self) -> Vec<Vm> {
        self.state().vms.values().cloned().collect()
    }

    pub fn creates(&self) -> Vec<CreateOptions> {
        self.state().creates.clone()
    }

    pub fn deleted(&self) -> Vec<VmId> {
        self.state().deleted.clone()
    }
}

fn new_vm(state: &mut MemoryState, name: &str, region: Option<&str>, instance_type: Option<&str>) -> Vm {
    state.next_id += 1;
    let n = state.next_id;
    Vm {
        id: VmId(n.to_string()),
        name: name.to_string(),
        status: VmStatus::Provisioning,
        address: Some(format!("192.0.2.{}", n % 250 + 1)),
        created_at: Utc::now(),
        region: region.unwrap_or("mem1").to_string(),
        instance_type: instance_type.unwrap_or("small").to_string(),
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    async fn create(&self, opts: &CreateOptions) -> Result<Vm> {
        let mut state = self.state();
        if let Some(err) = state.fail_next_create.take() {
            return Err(err);
        }
        if state.vms.values().any(|vm| vm.name == opts.name) {
            return Err(Error::ProvisionFailed(format!("name {} already in use", opts.name)));
        }
        state.creates.push(opts.clone());
        let vm = new_vm(
            &mut state,
            &opts.name,
            opts.region.as_deref(),
            opts.instance_type.as_deref(),
        );
        state.vms.insert(vm.id.clone(), vm.clone());
        Ok(vm)
    }

    async fn get(&self, id: &VmId) -> Result<Vm> {
        let mut state = self.state();
        let polls = {
            let polls = state.polls.entry(id.clone()).or_insert(0);
            *polls += 1;
            *polls
        };
        let ready_after = state.ready_after;
        let vm = state
            .vms
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("vm {id}")))?;
        if vm.status == VmStatus::Provisioning && ready_after.is_some_and(|n| polls >= n) {
            vm.status = VmStatus::Running;
        }
        Ok(vm.clone())
    }

    async fn delete(&self, id: &VmId) -> Result<()> {
        let mut state = self.state();
        if let Some(err) = state.fail_next_delete.take() {
            return Err(err);
        }
        if state.vms.remove(id).is_some() {
            state.deleted.push(id.clone());
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Vm>> {
        let mut state = self.state();
        if let Some(err) = state.fail_next_list.take() {
            return Err(err);
        }
        Ok(state.vms.values().cloned().collect())
    }

    async fn wait_ready(&self, id: &VmId, timeout: Duration) -> Result<Vm> {
        self.poller.wait(self, id, timeout).await
    }

    fn name(&self) -> ProviderName {
        ProviderName::Hetzner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_get_returns_named_vm() {
        let provider = MemoryProvider::new();
        let vm = provider.create(&CreateOptions::new("swift-tiger", "ssh-ed25519 AAAA")).await.unwrap();
        let fetched = provider.get(&vm.id).await.unwrap();
        assert_eq!(fetched.name, "swift-tiger");
        assert_eq!(fetched.status, VmStatus::Running);
    }

    #[tokio::test]
    async fn vanished_vm_is_gone_from_list() {
        let provider = MemoryProvider::new();
        let vm = provider.insert_external("lone-heron");
        assert_eq!(provider.list().await.unwrap().len(), 1);
        provider.vanish(&vm.id);
        assert!(provider.list().await.unwrap().is_empty());
        assert!(provider.deleted().is_empty());
    }
}
