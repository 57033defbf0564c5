//! Cluster namespaces.
//!
//! A namespace scopes a host set, a VM registry, and a queue of launch
//! requests. Wildcard commands resolve against the active namespace's
//! hosts; VM names are unique only within their namespace. Distinct from
//! OS network namespaces.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::scheduler::QueuedVms;
use crate::vm::VmRegistry;
use crate::{Error, Result};

/// The namespace every session starts in.
pub const DEFAULT_NAMESPACE: &str = "default";

pub struct Namespace {
    pub name: String,
    pub registry: VmRegistry,
    hosts: Mutex<BTreeSet<String>>,
    queue: Mutex<Vec<QueuedVms>>,
}

impl Namespace {
    fn new(name: &str, base: &PathBuf, next_id: Arc<AtomicU32>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            registry: VmRegistry::new(name, base.join("vms"), next_id),
            hosts: Mutex::new(BTreeSet::new()),
            queue: Mutex::new(Vec::new()),
        })
    }

    /// Hosts participating in this namespace, sorted.
    pub async fn hosts(&self) -> Vec<String> {
        self.hosts.lock().await.iter().cloned().collect()
    }

    pub async fn add_hosts(&self, hosts: impl IntoIterator<Item = String>) {
        self.hosts.lock().await.extend(hosts);
    }

    pub async fn remove_host(&self, host: &str) -> bool {
        self.hosts.lock().await.remove(host)
    }

    /// Append a launch request to the queue.
    pub async fn enqueue(&self, queued: QueuedVms) {
        self.queue.lock().await.push(queued);
    }

    /// Take the whole queue for scheduling.
    pub async fn drain_queue(&self) -> Vec<QueuedVms> {
        std::mem::take(&mut *self.queue.lock().await)
    }

    pub async fn queue_len(&self) -> usize {
        self.queue.lock().await.iter().map(|q| q.names.len()).sum()
    }
}

/// All namespaces plus the active one.
pub struct Namespaces {
    base: PathBuf,
    next_id: Arc<AtomicU32>,
    active: Mutex<String>,
    map: Mutex<HashMap<String, Arc<Namespace>>>,
}

impl Namespaces {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        let next_id = Arc::new(AtomicU32::new(0));
        let map = HashMap::from([(
            DEFAULT_NAMESPACE.to_string(),
            Namespace::new(DEFAULT_NAMESPACE, &base, next_id.clone()),
        )]);
        Self {
            base,
            next_id,
            active: Mutex::new(DEFAULT_NAMESPACE.to_string()),
            map: Mutex::new(map),
        }
    }

    /// The currently-active namespace.
    pub async fn active(&self) -> Arc<Namespace> {
        let name = self.active.lock().await.clone();
        self.map.lock().await[&name].clone()
    }

    /// Switch to (creating if needed) the named namespace.
    pub async fn activate(&self, name: &str) -> Result<Arc<Namespace>> {
        if name.is_empty() {
            return Err(Error::Validation("namespace name cannot be empty".into()));
        }
        let mut map = self.map.lock().await;
        let ns = map
            .entry(name.to_string())
            .or_insert_with(|| Namespace::new(name, &self.base, self.next_id.clone()))
            .clone();
        *self.active.lock().await = name.to_string();
        Ok(ns)
    }

    pub async fn get(&self, name: &str) -> Result<Arc<Namespace>> {
        self.map
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("namespace", name))
    }

    /// Get an existing namespace or create it without activating.
    pub async fn get_or_create(&self, name: &str) -> Arc<Namespace> {
        let mut map = self.map.lock().await;
        map.entry(name.to_string())
            .or_insert_with(|| Namespace::new(name, &self.base, self.next_id.clone()))
            .clone()
    }

    /// Namespace names, sorted, active first marked by the caller.
    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.map.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Every namespace value.
    pub async fn all(&self) -> Vec<Arc<Namespace>> {
        self.map.lock().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::VmConfig;

    #[tokio::test]
    async fn default_namespace_is_active() {
        let dir = tempfile::tempdir().unwrap();
        let namespaces = Namespaces::new(dir.path());
        assert_eq!(namespaces.active().await.name, DEFAULT_NAMESPACE);
        assert_eq!(namespaces.list().await, vec![DEFAULT_NAMESPACE]);
    }

    #[tokio::test]
    async fn activation_creates_and_switches() {
        let dir = tempfile::tempdir().unwrap();
        let namespaces = Namespaces::new(dir.path());
        namespaces.activate("lab").await.unwrap();
        assert_eq!(namespaces.active().await.name, "lab");
        assert_eq!(namespaces.list().await, vec![DEFAULT_NAMESPACE, "lab"]);
    }

    #[tokio::test]
    async fn names_are_scoped_per_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let namespaces = Namespaces::new(dir.path());
        let default = namespaces.active().await;
        default.registry.create("t1", VmConfig::default()).await.unwrap();

        let lab = namespaces.activate("lab").await.unwrap();
        // Same name is fine in another namespace.
        lab.registry.create("t1", VmConfig::default()).await.unwrap();
        // Per-host ids stay unique across namespaces.
        assert_ne!(
            default.registry.get("t1").await.unwrap().id,
            lab.registry.get("t1").await.unwrap().id
        );
    }

    #[tokio::test]
    async fn queue_drains_wholesale() {
        let dir = tempfile::tempdir().unwrap();
        let namespaces = Namespaces::new(dir.path());
        let ns = namespaces.active().await;
        ns.enqueue(QueuedVms {
            names: vec!["a".into(), "b".into()],
            config: VmConfig::default(),
        })
        .await;
        assert_eq!(ns.queue_len().await, 2);
        assert_eq!(ns.drain_queue().await.len(), 1);
        assert_eq!(ns.queue_len().await, 0);
    }
}
