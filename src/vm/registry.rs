//! Namespace-scoped VM registry.
//!
//! An ordered map from per-host id (and name) to VM. Creation enforces
//! name uniqueness and the inter-VM conflict rules before anything touches
//! the OS; the kill-ack channel pairs with the per-VM kill-waiters so a
//! bulk kill can wait for every process to actually die.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::vm::config::{conflict_between, VmConfig};
use crate::vm::{Vm, VmContext, VmState};
use crate::{Error, Result};

/// Cluster-wide VM identity from the kernel's UUID source, with a sentinel
/// when the source is unreadable.
pub fn generate_uuid() -> String {
    match std::fs::read_to_string("/proc/sys/kernel/random/uuid") {
        Ok(s) => s.trim().to_string(),
        Err(_) => uuid::Uuid::nil().to_string(),
    }
}

pub struct VmRegistry {
    namespace: String,
    base: PathBuf,
    next_id: Arc<AtomicU32>,
    ack_tx: mpsc::UnboundedSender<u32>,
    ack_rx: Mutex<mpsc::UnboundedReceiver<u32>>,
    vms: Mutex<BTreeMap<u32, Arc<Vm>>>,
}

impl VmRegistry {
    /// `next_id` is shared across namespaces so per-host ids stay unique.
    pub fn new(namespace: impl Into<String>, base: impl Into<PathBuf>, next_id: Arc<AtomicU32>) -> Self {
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        Self {
            namespace: namespace.into(),
            base: base.into(),
            next_id,
            ack_tx,
            ack_rx: Mutex::new(ack_rx),
            vms: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Kill-acks from this registry's kill-waiters land here.
    pub fn ack_sender(&self) -> mpsc::UnboundedSender<u32> {
        self.ack_tx.clone()
    }

    /// Register a new VM: unique name, MACs filled from the vendor pool,
    /// conflict-checked against every live peer.
    pub async fn create(&self, name: &str, mut config: VmConfig) -> Result<Arc<Vm>> {
        if name.is_empty() {
            return Err(Error::Validation("vm name cannot be empty".into()));
        }
        let mut vms = self.vms.lock().await;
        if vms.values().any(|vm| vm.name == name) {
            return Err(Error::already_exists("vm", name));
        }

        let mut taken: HashSet<String> = HashSet::new();
        for vm in vms.values() {
            taken.extend(vm.config.macs().map(str::to_string));
        }
        config.assign_macs(&taken);

        for vm in vms.values() {
            if vm.state().await.is_terminal() {
                continue;
            }
            if let Some(conflict) = conflict_between(&vm.config, &config) {
                return Err(conflict);
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let uuid = generate_uuid();
        let dir = self.base.join(id.to_string());
        let vm = Vm::new(id, uuid, name.to_string(), self.namespace.clone(), dir, config);
        vms.insert(id, vm.clone());
        info!(namespace = %self.namespace, vm = %name, id, "vm registered");
        Ok(vm)
    }

    pub async fn get(&self, name: &str) -> Result<Arc<Vm>> {
        let vms = self.vms.lock().await;
        vms.values()
            .find(|vm| vm.name == name)
            .cloned()
            .ok_or_else(|| Error::not_found("vm", name))
    }

    pub async fn get_by_id(&self, id: u32) -> Result<Arc<Vm>> {
        let vms = self.vms.lock().await;
        vms.get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("vm", id.to_string()))
    }

    /// Resolve a name-or-id target.
    pub async fn resolve(&self, target: &str) -> Result<Arc<Vm>> {
        if let Ok(id) = target.parse::<u32>() {
            if let Ok(vm) = self.get_by_id(id).await {
                return Ok(vm);
            }
        }
        self.get(target).await
    }

    /// All VMs ordered by id.
    pub async fn list(&self) -> Vec<Arc<Vm>> {
        self.vms.lock().await.values().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.vms.lock().await.len()
    }

    /// Sum of vcpus and memory across non-terminal VMs, plus the interface
    /// count — the commit numbers the scheduler consumes.
    pub async fn commits(&self) -> (u64, u64, u64) {
        let vms = self.list().await;
        let mut cpu = 0u64;
        let mut mem = 0u64;
        let mut net = 0u64;
        for vm in vms {
            if vm.state().await.is_terminal() {
                continue;
            }
            cpu += vm.config.vcpus as u64;
            mem += vm.config.memory;
            net += vm.config.networks.len() as u64;
        }
        (cpu, mem, net)
    }

    /// Remove every VM in a terminal state, releasing its taps.
    pub async fn flush(&self, ctx: &VmContext) -> Result<usize> {
        let mut vms = self.vms.lock().await;
        let mut flushed = Vec::new();
        for (id, vm) in vms.iter() {
            if vm.state().await.is_terminal() {
                flushed.push((*id, vm.clone()));
            }
        }
        for (id, vm) in &flushed {
            if let Err(e) = vm.cleanup(ctx).await {
                warn!(vm = %vm.name, error = %e, "flush cleanup failed");
            }
            vms.remove(id);
        }
        Ok(flushed.len())
    }

    /// Fire every live VM's kill channel and wait for the acks.
    pub async fn kill_all(&self, timeout: Duration) -> usize {
        let vms = self.list().await;
        let mut expected: HashSet<u32> = HashSet::new();
        for vm in &vms {
            let state = vm.state().await;
            if matches!(state, VmState::Running | VmState::Paused) && vm.kill().await.is_ok() {
                expected.insert(vm.id);
            }
        }
        if expected.is_empty() {
            return 0;
        }

        let killed = expected.len();
        let mut ack_rx = self.ack_rx.lock().await;
        let deadline = tokio::time::Instant::now() + timeout;
        while !expected.is_empty() {
            match tokio::time::timeout_at(deadline, ack_rx.recv()).await {
                Ok(Some(id)) => {
                    expected.remove(&id);
                }
                Ok(None) | Err(_) => break,
            }
        }
        if !expected.is_empty() {
            warn!(namespace = %self.namespace, pending = expected.len(), "kill acks missing");
        }
        killed - expected.len()
    }
}
