//! LoRA adapter cache with LRU eviction.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;

use super::loader::LoraLoadError;
use super::types::{LoraModel, LoraRequest};
use super::worker::WorkerLoraManager;

/// Errors from the LoRA manager.
#[derive(Debug, Error)]
pub enum LoraManagerError {
    #[error("adapter not found: {0}")]
    AdapterNotFound(u32),
    #[error("Number of requested LoRAs ({requested}) is greater than the number of LoRA slots ({slots}).")]
    TooManyActiveAdapters { requested: usize, slots: usize },
    #[error("max adapters limit reached: {0} (all pinned)")]
    MaxAdaptersReached(usize),
    #[error("load error: {0}")]
    Load(#[from] LoraLoadError),
}

/// Keeps loaded adapters resident, evicting the least recently used one
/// when `max_cpu_loras` is reached.
///
/// Provides:
/// - Loading adapters on first use through a [`WorkerLoraManager`]
/// - Per-request adapter lookup
/// - Pinning adapters so they are never evicted
pub struct LruCacheWorkerLoraManager {
    /// Loader for cache misses.
    worker: WorkerLoraManager,
    /// Loaded adapters by ID.
    adapters: HashMap<u32, Arc<LoraModel>>,
    /// LRU order for eviction (most recently used at end).
    lru_order: Vec<u32>,
    /// Adapters exempt from eviction.
    pinned: HashSet<u32>,
    /// Maximum number of resident adapters.
    capacity: usize,
}

impl LruCacheWorkerLoraManager {
    /// Create a cache sized by the worker's `max_cpu_loras`.
    pub fn new(worker: WorkerLoraManager) -> Self {
        let capacity = worker.lora_config().cpu_capacity();
        Self {
            worker,
            adapters: HashMap::new(),
            lru_order: Vec::new(),
            pinned: HashSet::new(),
            capacity,
        }
    }

    pub fn worker(&self) -> &WorkerLoraManager {
        &self.worker
    }

    /// Make sure an adapter is resident.
    ///
    /// Returns `true` if it was loaded by this call, `false` if it was
    /// already cached (in which case it is marked recently used).
    pub fn add_adapter(&mut self, request: &LoraRequest) -> Result<bool, LoraManagerError> {
        let id = request.id();
        if self.adapters.contains_key(&id) {
            self.touch(id);
            return Ok(false);
        }

        // Load before evicting so a failed load leaves the cache intact
        let model = self.worker.load_adapter(request)?;

        if self.adapters.len() >= self.capacity {
            self.evict_lru()?;
        }

        self.adapters.insert(id, Arc::new(model));
        self.lru_order.push(id);
        Ok(true)
    }

    /// Make exactly these adapters available for the next batch.
    ///
    /// Fails without loading anything if more adapters are requested than
    /// the engine has slots for.
    pub fn set_active_adapters(&mut self, requests: &[LoraRequest]) -> Result<(), LoraManagerError> {
        let slots = self.worker.lora_config().max_loras;
        let mut distinct: Vec<u32> = requests.iter().map(LoraRequest::id).collect();
        distinct.sort_unstable();
        distinct.dedup();
        if distinct.len() > slots {
            return Err(LoraManagerError::TooManyActiveAdapters {
                requested: distinct.len(),
                slots,
            });
        }

        for request in requests {
            self.add_adapter(request)?;
        }
        Ok(())
    }

    /// Get an adapter by ID.
    pub fn get(&self, id: u32) -> Option<Arc<LoraModel>> {
        self.adapters.get(&id).cloned()
    }

    /// Get an adapter by name.
    pub fn get_by_name(&self, name: &str) -> Option<Arc<LoraModel>> {
        self.adapters.values().find(|m| m.name == name).cloned()
    }

    /// Check if an adapter is loaded.
    pub fn is_loaded(&self, id: u32) -> bool {
        self.adapters.contains_key(&id)
    }

    /// Exempt a resident adapter from eviction.
    pub fn pin_adapter(&mut self, id: u32) -> Result<(), LoraManagerError> {
        if !self.adapters.contains_key(&id) {
            return Err(LoraManagerError::AdapterNotFound(id));
        }
        self.pinned.insert(id);
        Ok(())
    }

    /// Unload an adapter by ID.
    pub fn remove_adapter(&mut self, id: u32) -> Option<Arc<LoraModel>> {
        let model = self.adapters.remove(&id)?;
        self.lru_order.retain(|&n| n != id);
        self.pinned.remove(&id);
        Some(model)
    }

    /// Unload everything, pinned adapters included.
    pub fn remove_all_adapters(&mut self) {
        self.adapters.clear();
        self.lru_order.clear();
        self.pinned.clear();
    }

    /// IDs of resident adapters, ascending.
    pub fn list_adapters(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.adapters.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of loaded adapters.
    pub fn num_loaded(&self) -> usize {
        self.adapters.len()
    }

    /// Maximum number of adapters.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Mark an adapter as recently used.
    fn touch(&mut self, id: u32) {
        if let Some(pos) = self.lru_order.iter().position(|&n| n == id) {
            let id = self.lru_order.remove(pos);
            self.lru_order.push(id);
        }
    }

    /// Evict the least recently used unpinned adapter.
    fn evict_lru(&mut self) -> Result<(), LoraManagerError> {
        let Some(pos) = self
            .lru_order
            .iter()
            .position(|id| !self.pinned.contains(id))
        else {
            return Err(LoraManagerError::MaxAdaptersReached(self.capacity));
        };

        let id = self.lru_order.remove(pos);
        self.adapters.remove(&id);
        tracing::debug!(lora_id = id, "Evicted LoRA adapter");
        Ok(())
    }
}
