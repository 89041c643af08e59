//! # Sharded Registry
//!
//! A concurrent `u32 -> V` map split into one shard per available core, each
//! behind its own mutex, so dispatch on one stream does not contend with
//! registration of another.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

pub struct ShardedRegistry<V> {
    shards: Box<[Mutex<HashMap<u32, V>>]>,
    len: AtomicUsize,
}

impl<V: Clone> ShardedRegistry<V> {
    /// Creates a registry with one shard per unit of available parallelism.
    pub fn new() -> Self {
        let shards = std::thread::available_parallelism().map_or(1, |n| n.get());
        Self::with_shards(shards)
    }

    pub fn with_shards(shards: usize) -> Self {
        let shards = (0..shards.max(1)).map(|_| Mutex::new(HashMap::new())).collect();
        Self {
            shards,
            len: AtomicUsize::new(0),
        }
    }

    fn shard(&self, id: u32) -> MutexGuard<'_, HashMap<u32, V>> {
        let index = id as usize % self.shards.len();
        self.shards[index].lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the existing value and `true`, or stores `value` and returns it
    /// with `false`.
    pub fn load_or_store(&self, id: u32, value: V) -> (V, bool) {
        let mut shard = self.shard(id);
        if let Some(existing) = shard.get(&id) {
            return (existing.clone(), true);
        }
        shard.insert(id, value.clone());
        self.len.fetch_add(1, Ordering::Relaxed);
        (value, false)
    }

    pub fn load(&self, id: u32) -> Option<V> {
        self.shard(id).get(&id).cloned()
    }

    pub fn delete(&self, id: u32) -> Option<V> {
        self.delete_if(id, |_| true)
    }

    /// Removes the entry only if `predicate` accepts the stored value.
    pub fn delete_if(&self, id: u32, predicate: impl FnOnce(&V) -> bool) -> Option<V> {
        let mut shard = self.shard(id);
        if !shard.get(&id).is_some_and(predicate) {
            return None;
        }
        let removed = shard.remove(&id);
        if removed.is_some() {
            self.len.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Snapshot of every stored value.
    pub fn load_all(&self) -> Vec<V> {
        let mut all = Vec::with_capacity(self.len());
        for shard in self.shards.iter() {
            let shard = shard.lock().unwrap_or_else(PoisonError::into_inner);
            all.extend(shard.values().cloned());
        }
        all
    }

    pub fn reset(&self) {
        for shard in self.shards.iter() {
            let mut shard = shard.lock().unwrap_or_else(PoisonError::into_inner);
            self.len.fetch_sub(shard.len(), Ordering::Relaxed);
            shard.clear();
        }
    }

    /// Approximate number of entries.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone> Default for ShardedRegistry<V> {
    fn default() -> Self {
        Self::new()
    }
}
