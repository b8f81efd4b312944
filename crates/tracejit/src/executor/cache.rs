use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use lru::LruCache;

use super::plan::ExecutionPlan;
use crate::ir::Graph;

pub const DEFAULT_CACHE_CAPACITY: usize = 64;

/// Output of one pipeline run, ready to replay.
#[derive(Debug)]
pub struct OptimizedGraph {
    pub graph: Graph,
    pub plan: ExecutionPlan,
}

/// Shares optimized graphs between executors whose source graphs and pipelines match.
///
/// Executors only consult a cache that is handed to them through
/// [`ExecutorConfig`](super::ExecutorConfig); there is no process-wide instance.
pub struct OptimizedGraphCache {
    inner: Mutex<LruCache<u64, Arc<OptimizedGraph>>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl OptimizedGraphCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    pub fn get(&self, key: u64) -> Option<Arc<OptimizedGraph>> {
        let mut guard = self.inner.lock().expect("optimized graph cache poisoned");
        let found = guard.get(&key).cloned();
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            log::trace!("optimized graph cache hit for {key:016x}");
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    pub fn insert(&self, key: u64, value: Arc<OptimizedGraph>) {
        let mut guard = self.inner.lock().expect("optimized graph cache poisoned");
        guard.put(key, value);
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("optimized graph cache poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> usize {
        self.misses.load(Ordering::Relaxed)
    }
}

impl Default for OptimizedGraphCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl fmt::Debug for OptimizedGraphCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimizedGraphCache")
            .field("len", &self.len())
            .field("hits", &self.hits())
            .field("misses", &self.misses())
            .finish()
    }
}
