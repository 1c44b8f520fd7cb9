//! LRU cache of compiled procedures.

use crate::error::Result;
use crate::host::{ProcedureId, ProcedureSource};
use crate::unit::{ExecutionUnit, UnitId};
use mlua::{Lua, Table};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Statistics for cache performance monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Total number of cache lookups
    pub lookups: u64,
    /// Number of cache hits
    pub hits: u64,
    /// Number of cache misses
    pub misses: u64,
    /// Number of units compiled and stored
    pub insertions: u64,
    /// Number of units dropped to stay within capacity
    pub evictions: u64,
    /// Number of units removed by invalidation
    pub invalidations: u64,
    /// Number of compilations that failed and stored nothing
    pub compile_failures: u64,
}

impl CacheStats {
    /// Calculate the cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        if self.lookups == 0 {
            0.0
        } else {
            self.hits as f64 / self.lookups as f64
        }
    }

    /// Reset all statistics to zero
    pub fn reset(&mut self) {
        *self = CacheStats::default();
    }
}

/// Session-wide cache from procedure id to compiled [`ExecutionUnit`].
///
/// Repeated lookups of a cached id return the same `Arc`, so top-level state
/// kept in a unit's namespace survives between calls. Invalidation only drops
/// the cache's reference: a unit that is still executing stays alive until
/// the call finishes.
///
/// # Thread Safety
///
/// All methods take `&self`. Locks are never held while compiling.
#[derive(Debug)]
pub struct CodeCache {
    /// Maximum number of units, 0 for no limit
    capacity: usize,
    /// Cached units by id
    units: RwLock<HashMap<ProcedureId, Arc<ExecutionUnit>>>,
    /// LRU queue (most recently used at the back)
    lru_queue: RwLock<VecDeque<ProcedureId>>,
    /// Cache statistics
    stats: RwLock<CacheStats>,
}

impl CodeCache {
    /// Create a cache holding at most `capacity` units.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            units: RwLock::new(HashMap::new()),
            lru_queue: RwLock::new(VecDeque::new()),
            stats: RwLock::new(CacheStats::default()),
        }
    }

    /// Get a cached unit, marking it most recently used.
    pub fn get(&self, id: ProcedureId) -> Option<Arc<ExecutionUnit>> {
        let found = self.units.read().get(&id).cloned();

        let mut stats = self.stats.write();
        stats.lookups += 1;
        match found {
            Some(unit) => {
                stats.hits += 1;
                drop(stats);
                self.touch(id);
                Some(unit)
            }
            None => {
                stats.misses += 1;
                None
            }
        }
    }

    /// Get a cached unit without touching LRU order or statistics.
    pub fn peek(&self, id: ProcedureId) -> Option<Arc<ExecutionUnit>> {
        self.units.read().get(&id).cloned()
    }

    /// Return the cached unit for `id`, compiling it on a miss.
    ///
    /// `source_fn` is only called on a miss. When fetching or compiling fails
    /// nothing is stored, so the next call tries again.
    pub fn get_or_compile<'lua, F>(
        &self,
        lua: &'lua Lua,
        builtins: &Table<'lua>,
        id: ProcedureId,
        source_fn: F,
    ) -> Result<Arc<ExecutionUnit>>
    where
        F: FnOnce() -> Result<ProcedureSource>,
    {
        if let Some(unit) = self.get(id) {
            return Ok(unit);
        }

        let compiled = source_fn().and_then(|source| {
            ExecutionUnit::compile(
                lua,
                UnitId::Procedure(id),
                &source.qualified_name(),
                &source.source,
                builtins,
            )
        });
        match compiled {
            Ok(unit) => Ok(self.insert(id, unit)),
            Err(e) => {
                self.stats.write().compile_failures += 1;
                log::debug!("procedure {} was not cached: {}", id, e);
                Err(e)
            }
        }
    }

    /// Store a compiled unit. An entry that appeared meanwhile wins.
    fn insert(&self, id: ProcedureId, unit: ExecutionUnit) -> Arc<ExecutionUnit> {
        let unit = {
            let mut units = self.units.write();
            if let Some(existing) = units.get(&id) {
                return Arc::clone(existing);
            }
            let unit = Arc::new(unit);
            units.insert(id, Arc::clone(&unit));
            unit
        };
        self.lru_queue.write().push_back(id);
        self.stats.write().insertions += 1;
        log::debug!("cached procedure {}", id);

        if self.capacity > 0 {
            while self.len() > self.capacity {
                if !self.evict_one() {
                    break;
                }
            }
        }
        unit
    }

    /// Drop the cached unit for `id`. Returns true if one was cached.
    pub fn invalidate(&self, id: ProcedureId) -> bool {
        let removed = self.units.write().remove(&id).is_some();
        if removed {
            self.lru_queue.write().retain(|k| *k != id);
            self.stats.write().invalidations += 1;
            log::debug!("invalidated procedure {}", id);
        }
        removed
    }

    /// Drop every cached unit. Returns how many were dropped.
    pub fn invalidate_all(&self) -> usize {
        let count = {
            let mut units = self.units.write();
            let count = units.len();
            units.clear();
            count
        };
        self.lru_queue.write().clear();
        self.stats.write().invalidations += count as u64;
        log::debug!("invalidated {} cached procedure(s)", count);
        count
    }

    /// True when `id` is cached and was compiled from `source`.
    pub fn is_current(&self, id: ProcedureId, source: &str) -> bool {
        self.peek(id).is_some_and(|unit| unit.is_current(source))
    }

    /// Move `id` to the most recently used position.
    ///
    /// O(n) in the number of cached units, like the eviction scan.
    fn touch(&self, id: ProcedureId) {
        let mut lru_queue = self.lru_queue.write();
        if let Some(pos) = lru_queue.iter().position(|k| *k == id) {
            lru_queue.remove(pos);
        }
        lru_queue.push_back(id);
    }

    fn evict_one(&self) -> bool {
        let Some(id) = self.lru_queue.write().pop_front() else {
            return false;
        };
        if self.units.write().remove(&id).is_some() {
            self.stats.write().evictions += 1;
            log::debug!("evicted procedure {}", id);
        }
        true
    }

    /// Cached ids, least recently used first.
    pub fn ids(&self) -> Vec<ProcedureId> {
        self.lru_queue.read().iter().copied().collect()
    }

    /// Get current cache statistics.
    pub fn stats(&self) -> CacheStats {
        self.stats.read().clone()
    }

    /// Reset cache statistics to zero.
    pub fn reset_stats(&self) {
        self.stats.write().reset();
    }

    /// Get the capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get the number of cached units.
    pub fn len(&self) -> usize {
        self.units.read().len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
