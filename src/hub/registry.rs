//! Authoritative in-memory view of workers and the capability index.
//!
//! Workers and capabilities co-reference; they are held as two flat tables
//! (`worker id → descriptor`, `capability name → [worker id]`) behind one
//! reader/writer mutex, and every mutation goes through the registry's
//! methods. When a durable store is attached the registry mirrors into it
//! after each mutation; store failures are logged and memory stays
//! authoritative.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::store::Store;
use crate::wire::{Capability, WorkerDescriptor, WorkerStatus};

#[derive(Default)]
struct RegistryInner {
    workers: HashMap<String, WorkerDescriptor>,
    /// Capability name → worker ids in first-registered order, no
    /// duplicate (capability, worker) pairs.
    index: HashMap<String, Vec<String>>,
}

impl RegistryInner {
    fn drop_from_index(&mut self, worker_id: &str) {
        self.index.retain(|_, ids| {
            ids.retain(|id| id != worker_id);
            !ids.is_empty()
        });
    }

    fn add_to_index(&mut self, worker_id: &str, caps: &[Capability]) {
        for cap in caps {
            let ids = self.index.entry(cap.name.clone()).or_default();
            if !ids.iter().any(|id| id == worker_id) {
                ids.push(worker_id.to_owned());
            }
        }
    }
}

pub struct ServiceRegistry {
    inner: RwLock<RegistryInner>,
    store: Option<Store>,
}

impl ServiceRegistry {
    pub fn new(store: Option<Store>) -> Self {
        let registry = Self {
            inner: RwLock::new(RegistryInner::default()),
            store,
        };
        registry.restore();
        registry
    }

    /// Load durable `online` rows back into memory so capabilities stay
    /// discoverable across a hub restart until connection-level truth
    /// catches up.
    fn restore(&self) {
        let Some(store) = &self.store else { return };
        match store.load_online() {
            Ok(workers) => {
                let mut inner = self.inner.write().expect("registry lock");
                for desc in workers {
                    inner.add_to_index(&desc.id, &desc.capabilities);
                    inner.workers.insert(desc.id.clone(), desc);
                }
                tracing::info!(
                    workers = inner.workers.len(),
                    "Restored registry from store"
                );
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to restore registry");
            }
        }
    }

    /// Register (or re-register) a worker. Any prior descriptor for the
    /// same id is replaced and its index entries rebuilt from the newly
    /// declared capability list, in declared order.
    pub fn register(&self, desc: WorkerDescriptor) {
        {
            let mut inner = self.inner.write().expect("registry lock");
            inner.drop_from_index(&desc.id);
            inner.add_to_index(&desc.id, &desc.capabilities);
            inner.workers.insert(desc.id.clone(), desc.clone());
        }
        tracing::info!(
            worker_id = %desc.id,
            worker_type = %desc.worker_type,
            capabilities = desc.capabilities.len(),
            "Worker registered"
        );
        if let Some(store) = &self.store
            && let Err(err) = store.save_worker(&desc)
        {
            tracing::error!(error = %err, worker_id = %desc.id, "Store write failed");
        }
    }

    /// Remove a worker and every capability-index entry it contributed.
    pub fn unregister(&self, worker_id: &str) {
        let removed = {
            let mut inner = self.inner.write().expect("registry lock");
            inner.drop_from_index(worker_id);
            inner.workers.remove(worker_id).is_some()
        };
        if !removed {
            return;
        }
        tracing::info!(worker_id, "Worker unregistered");
        if let Some(store) = &self.store
            && let Err(err) = store.mark_offline(worker_id)
        {
            tracing::error!(error = %err, worker_id, "Store write failed");
        }
    }

    /// First online worker exposing `capability`, in first-registered
    /// order.
    pub fn resolve(&self, capability: &str) -> Option<String> {
        let inner = self.inner.read().expect("registry lock");
        inner.index.get(capability)?.iter().find_map(|id| {
            let worker = inner.workers.get(id)?;
            (worker.status == WorkerStatus::Online).then(|| id.clone())
        })
    }

    /// Union of capabilities across online workers, keyed by name. When
    /// several workers expose the same name the descriptor of the
    /// first-registered one is returned.
    pub fn all_capabilities(&self) -> HashMap<String, Capability> {
        let inner = self.inner.read().expect("registry lock");
        let mut caps = HashMap::new();
        for (name, ids) in &inner.index {
            let descriptor = ids.iter().find_map(|id| {
                let worker = inner.workers.get(id)?;
                if worker.status != WorkerStatus::Online {
                    return None;
                }
                worker.capabilities.iter().find(|cap| &cap.name == name)
            });
            if let Some(cap) = descriptor {
                caps.insert(name.clone(), cap.clone());
            }
        }
        caps
    }

    pub fn all_workers(&self) -> Vec<WorkerDescriptor> {
        let inner = self.inner.read().expect("registry lock");
        inner.workers.values().cloned().collect()
    }

    pub fn worker(&self, worker_id: &str) -> Option<WorkerDescriptor> {
        let inner = self.inner.read().expect("registry lock");
        inner.workers.get(worker_id).cloned()
    }

    pub fn update_status(&self, worker_id: &str, status: WorkerStatus) {
        let mut inner = self.inner.write().expect("registry lock");
        if let Some(worker) = inner.workers.get_mut(worker_id) {
            worker.status = status;
            worker.last_seen = chrono::Utc::now();
        }
    }
}
