//! In-memory cache over persisted per-frame tensors.
//!
//! The files on disk are authoritative; the map only saves re-reads. Eviction is
//! strictly by insertion order (a hit does not refresh an entry).

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ndarray::ArrayD;
use tracing::{debug, trace};

use crate::error::{FuseError, Result};
use crate::tensor_io::{read_tensor, write_tensor};
use crate::window::Window;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

pub struct BoundedDiskCache<K, V> {
    capacity: usize,
    entries: HashMap<K, Arc<V>>,
    insertion_order: VecDeque<K>,
    stats: CacheStats,
}

impl<K, V> BoundedDiskCache<K, V>
where
    K: Hash + Eq + Clone + std::fmt::Debug,
{
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(FuseError::config("cache capacity must be at least 1"));
        }
        Ok(Self {
            capacity,
            entries: HashMap::with_capacity(capacity + 1),
            insertion_order: VecDeque::with_capacity(capacity + 1),
            stats: CacheStats::default(),
        })
    }

    /// Returns the cached value, or loads, inserts and returns it. Loader
    /// failures propagate and leave the cache untouched. Values handed out stay
    /// valid after eviction.
    pub fn get_or_load<F>(&mut self, key: &K, loader: F) -> Result<Arc<V>>
    where
        F: FnOnce(&K) -> Result<V>,
    {
        if let Some(value) = self.entries.get(key) {
            self.stats.hits += 1;
            trace!(?key, "cache hit");
            return Ok(Arc::clone(value));
        }

        self.stats.misses += 1;
        let value = Arc::new(loader(key)?);
        self.entries.insert(key.clone(), Arc::clone(&value));
        self.insertion_order.push_back(key.clone());
        debug!(?key, len = self.entries.len(), "cache load");

        while self.entries.len() > self.capacity {
            let Some(oldest) = self.insertion_order.pop_front() else {
                break;
            };
            if &oldest == key {
                // Never evict the entry just inserted.
                self.insertion_order.push_back(oldest);
                continue;
            }
            if self.entries.remove(&oldest).is_some() {
                self.stats.evictions += 1;
                debug!(key = ?oldest, "cache evict");
            }
        }

        Ok(value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.insertion_order.clear();
    }
}

/// Per-window conditioning tensors, indexed `[processor][frame - window.start]`.
#[derive(Debug, Clone, Default)]
pub struct Conditioning {
    pub per_processor: Vec<Vec<Arc<ArrayD<f32>>>>,
}

impl Conditioning {
    pub fn processor_count(&self) -> usize {
        self.per_processor.len()
    }

    pub fn frame(&self, processor_id: usize, offset: usize) -> Option<&ArrayD<f32>> {
        self.per_processor
            .get(processor_id)
            .and_then(|frames| frames.get(offset))
            .map(Arc::as_ref)
    }
}

/// Conditioning files at `{cache_dir}/cache_p{processor_id}_{frame}` read
/// through a [`BoundedDiskCache`].
pub struct ConditioningCache {
    cache_dir: PathBuf,
    processor_count: usize,
    cache: BoundedDiskCache<PathBuf, ArrayD<f32>>,
}

impl ConditioningCache {
    pub fn new(cache_dir: impl Into<PathBuf>, processor_count: usize, capacity: usize) -> Result<Self> {
        Ok(Self {
            cache_dir: cache_dir.into(),
            processor_count,
            cache: BoundedDiskCache::new(capacity)?,
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn processor_count(&self) -> usize {
        self.processor_count
    }

    pub fn cache_path(&self, processor_id: usize, frame: usize) -> PathBuf {
        conditioning_path(&self.cache_dir, processor_id, frame)
    }

    /// Writes the conditioning file for `(processor_id, frame)` unless it exists.
    pub fn ensure_cached<F>(&self, processor_id: usize, frame: usize, producer: F) -> Result<()>
    where
        F: FnOnce() -> anyhow::Result<ArrayD<f32>>,
    {
        let path = self.cache_path(processor_id, frame);
        if path.is_file() {
            return Ok(());
        }
        let tensor = producer().map_err(|e| {
            FuseError::engine(format!("conditioning processor {processor_id}"), frame, e)
        })?;
        write_tensor(&path, &tensor)
    }

    pub fn load(&mut self, processor_id: usize, frame: usize) -> Result<Arc<ArrayD<f32>>> {
        let path = self.cache_path(processor_id, frame);
        self.cache.get_or_load(&path, |p| read_tensor(p))
    }

    pub fn load_window(&mut self, window: Window) -> Result<Conditioning> {
        let mut per_processor = Vec::with_capacity(self.processor_count);
        for processor_id in 0..self.processor_count {
            let frames = window
                .indices()
                .map(|frame| self.load(processor_id, frame))
                .collect::<Result<Vec<_>>>()?;
            per_processor.push(frames);
        }
        Ok(Conditioning { per_processor })
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn resident(&self) -> usize {
        self.cache.len()
    }
}

pub fn conditioning_path(cache_dir: &Path, processor_id: usize, frame: usize) -> PathBuf {
    cache_dir.join(format!("cache_p{processor_id}_{frame}"))
}
