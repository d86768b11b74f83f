//! Page cache for the log.
//!
//! The cache stores decoded (plaintext) page buffers keyed by
//! `(log id, page address)` to reduce I/O and repeated verification.
//! Eviction is a generational clock sweep: entries age through a
//! configurable number of generations; hits promote, sweeps demote, and
//! only generation-zero entries without a recent access are evicted.
//!
//! Two deployment variants exist: a process-global shared instance
//! (single page size enforced across all users) and per-log instances for
//! isolation.

mod semaphore;

pub use semaphore::Semaphore;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, OnceLock,
    },
};

use parking_lot::{Condvar, Mutex};

use crate::error::{Address, Error, Result};
use crate::log::loggable::PageData;

/// How the cache's byte budget is expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSizing {
    /// A hard byte budget.
    Bytes(u64),
    /// A percentage of currently available system memory.
    Percent(u8),
}

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Byte budget, hard or relative.
    pub sizing: CacheSizing,
    /// Number of eviction generations (at least 1).
    pub generations: u8,
    /// When set, concurrent misses for the same page load redundantly
    /// instead of waiting on the in-flight loader.
    pub non_blocking: bool,
    /// When set, the log attaches to the process-global shared cache
    /// instead of creating its own.
    pub shared: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            sizing: CacheSizing::Bytes(8 * 1024 * 1024),
            generations: 2,
            non_blocking: false,
            shared: false,
        }
    }
}

impl CacheConfig {
    /// Resolves the configured budget into a page-count capacity.
    pub fn capacity_pages(&self, page_size: usize) -> usize {
        let bytes = match self.sizing {
            CacheSizing::Bytes(bytes) => bytes,
            CacheSizing::Percent(percent) => {
                let mut system = sysinfo::System::new();
                system.refresh_memory();
                system.available_memory() / 100 * u64::from(percent.min(100))
            }
        };
        ((bytes / page_size as u64) as usize).max(1)
    }
}

/// Key of a cached page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PageKey {
    log_id: u64,
    page_address: Address,
}

struct CacheEntry {
    page: PageData,
    generation: u8,
    accessed: bool,
}

struct CacheState {
    pages: HashMap<PageKey, CacheEntry>,
    /// Insertion order for the clock sweep.
    page_order: Vec<PageKey>,
    clock_hand: usize,
    /// Keys currently being loaded by some thread.
    in_flight: HashMap<PageKey, usize>,
}

/// Page cache with generational clock eviction.
pub struct PageCache {
    state: Mutex<CacheState>,
    loaded: Condvar,
    capacity: usize,
    page_size: usize,
    generations: u8,
    non_blocking: bool,
    hits: AtomicU64,
    misses: AtomicU64,
}

static SHARED_CACHE: OnceLock<Mutex<Option<Arc<PageCache>>>> = OnceLock::new();
static NEXT_LOG_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a process-unique log identity for cache keying.
pub fn next_log_id() -> u64 {
    NEXT_LOG_ID.fetch_add(1, Ordering::Relaxed)
}

impl PageCache {
    /// Creates a per-log cache.
    pub fn new(page_size: usize, config: &CacheConfig) -> Self {
        Self {
            state: Mutex::new(CacheState {
                pages: HashMap::new(),
                page_order: Vec::new(),
                clock_hand: 0,
                in_flight: HashMap::new(),
            }),
            loaded: Condvar::new(),
            capacity: config.capacity_pages(page_size),
            page_size,
            generations: config.generations.max(1),
            non_blocking: config.non_blocking,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the process-global shared cache, initializing it on first
    /// use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSetting`] if the shared cache was already
    /// initialized with a different page size.
    pub fn shared(page_size: usize, config: &CacheConfig) -> Result<Arc<PageCache>> {
        let slot = SHARED_CACHE.get_or_init(|| Mutex::new(None));
        let mut guard = slot.lock();
        match guard.as_ref() {
            Some(cache) => {
                if cache.page_size != page_size {
                    return Err(Error::InvalidSetting {
                        reason: format!(
                            "shared page cache already configured with page size {}, requested {}",
                            cache.page_size, page_size
                        ),
                    });
                }
                Ok(Arc::clone(cache))
            }
            None => {
                let cache = Arc::new(PageCache::new(page_size, config));
                *guard = Some(Arc::clone(&cache));
                Ok(cache)
            }
        }
    }

    /// Page size this cache serves.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Looks up a page without loading.
    pub fn get(&self, log_id: u64, page_address: Address) -> Option<PageData> {
        let key = PageKey { log_id, page_address };
        let mut state = self.state.lock();
        if let Some(entry) = state.pages.get_mut(&key) {
            entry.accessed = true;
            entry.generation = (entry.generation + 1).min(self.generations - 1);
            self.hits.fetch_add(1, Ordering::Relaxed);
            Some(Arc::clone(&entry.page))
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Returns the cached page or loads it via `loader`, caching the
    /// result.
    ///
    /// Concurrent gets for the same key load at most once unless the cache
    /// is in non-blocking mode.
    ///
    /// # Errors
    ///
    /// Propagates the loader's error; nothing is cached on failure.
    pub fn get_or_load<F>(&self, log_id: u64, page_address: Address, loader: F) -> Result<PageData>
    where
        F: FnOnce() -> Result<PageData>,
    {
        let key = PageKey { log_id, page_address };
        {
            let mut state = self.state.lock();
            loop {
                if let Some(entry) = state.pages.get_mut(&key) {
                    entry.accessed = true;
                    entry.generation = (entry.generation + 1).min(self.generations - 1);
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Arc::clone(&entry.page));
                }
                if self.non_blocking || !state.in_flight.contains_key(&key) {
                    break;
                }
                // Another thread is loading this page; wait for it.
                self.loaded.wait(&mut state);
            }
            self.misses.fetch_add(1, Ordering::Relaxed);
            *state.in_flight.entry(key).or_insert(0) += 1;
        }

        let result = loader();

        let mut state = self.state.lock();
        if let Some(count) = state.in_flight.get_mut(&key) {
            *count -= 1;
            if *count == 0 {
                state.in_flight.remove(&key);
            }
        }
        self.loaded.notify_all();
        match result {
            Ok(page) => {
                Self::insert_locked(&mut state, self.capacity, key, Arc::clone(&page));
                Ok(page)
            }
            Err(e) => Err(e),
        }
    }

    /// Inserts (or replaces) a page, evicting if needed.
    pub fn insert(&self, log_id: u64, page_address: Address, page: PageData) {
        let key = PageKey { log_id, page_address };
        let mut state = self.state.lock();
        Self::insert_locked(&mut state, self.capacity, key, page);
    }

    fn insert_locked(state: &mut CacheState, capacity: usize, key: PageKey, page: PageData) {
        if let Some(entry) = state.pages.get_mut(&key) {
            entry.page = page;
            entry.accessed = true;
            return;
        }
        if state.pages.len() >= capacity {
            Self::evict_one(state);
        }
        state.page_order.push(key);
        state.pages.insert(key, CacheEntry { page, generation: 0, accessed: true });
    }

    /// Clock sweep: evict the first generation-zero entry without a recent
    /// access, demoting survivors along the way.
    fn evict_one(state: &mut CacheState) {
        if state.page_order.is_empty() {
            return;
        }
        let max_iterations = state.page_order.len() * 2;
        let mut iterations = 0;
        loop {
            if state.clock_hand >= state.page_order.len() {
                state.clock_hand = 0;
            }
            let key = state.page_order[state.clock_hand];
            let evict = match state.pages.get_mut(&key) {
                Some(entry) => {
                    if !entry.accessed && entry.generation == 0 {
                        true
                    } else {
                        entry.accessed = false;
                        entry.generation = entry.generation.saturating_sub(1);
                        false
                    }
                }
                // Stale order slot; drop it.
                None => {
                    state.page_order.remove(state.clock_hand);
                    continue;
                }
            };
            if evict {
                state.pages.remove(&key);
                state.page_order.remove(state.clock_hand);
                return;
            }
            state.clock_hand += 1;
            iterations += 1;
            if iterations >= max_iterations {
                // Everything was hot; evict at the hand to make progress.
                if state.clock_hand >= state.page_order.len() {
                    state.clock_hand = 0;
                }
                let key = state.page_order.remove(state.clock_hand);
                state.pages.remove(&key);
                return;
            }
        }
    }

    /// Removes a single page.
    pub fn remove(&self, log_id: u64, page_address: Address) {
        let key = PageKey { log_id, page_address };
        let mut state = self.state.lock();
        if state.pages.remove(&key).is_some() {
            state.page_order.retain(|k| *k != key);
        }
    }

    /// Drops every page belonging to `log_id`.
    pub fn clear_log(&self, log_id: u64) {
        let mut state = self.state.lock();
        state.pages.retain(|k, _| k.log_id != log_id);
        state.page_order.retain(|k| k.log_id != log_id);
        state.clock_hand = 0;
    }

    /// Drops all cached pages.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.pages.clear();
        state.page_order.clear();
        state.clock_hand = 0;
    }

    /// Number of cached pages.
    pub fn len(&self) -> usize {
        self.state.lock().pages.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fraction of lookups served from the cache since creation.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed) as f64;
        let misses = self.misses.load(Ordering::Relaxed) as f64;
        if hits + misses == 0.0 {
            0.0
        } else {
            hits / (hits + misses)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(fill: u8, size: usize) -> PageData {
        Arc::from(vec![fill; size].into_boxed_slice())
    }

    fn cache(capacity_pages: u64) -> PageCache {
        PageCache::new(
            4096,
            &CacheConfig { sizing: CacheSizing::Bytes(capacity_pages * 4096), ..Default::default() },
        )
    }

    #[test]
    fn test_cache_basic() {
        let cache = cache(10);
        cache.insert(1, 0, page(0xaa, 4096));
        assert_eq!(cache.get(1, 0).unwrap()[0], 0xaa);
        // Different log identity is a different key.
        assert!(cache.get(2, 0).is_none());

        cache.remove(1, 0);
        assert!(cache.get(1, 0).is_none());
    }

    #[test]
    fn test_cache_eviction_bounds_size() {
        let cache = cache(4);
        for i in 0..32u64 {
            cache.insert(1, i * 4096, page(i as u8, 4096));
        }
        assert!(cache.len() <= 4, "cache grew to {}", cache.len());
        // The most recent insert must still be present.
        assert!(cache.get(1, 31 * 4096).is_some());
    }

    #[test]
    fn test_generations_protect_hot_pages() {
        let cache = cache(4);
        cache.insert(1, 0, page(1, 4096));
        // Promote page 0 through repeated hits.
        for _ in 0..4 {
            cache.get(1, 0);
        }
        for i in 1..16u64 {
            cache.insert(1, i * 4096, page(i as u8, 4096));
        }
        assert!(cache.get(1, 0).is_some(), "hot page was evicted");
    }

    #[test]
    fn test_get_or_load_loads_once() {
        let cache = cache(10);
        let mut calls = 0;
        let p = cache
            .get_or_load(1, 0, || {
                calls += 1;
                Ok(page(0x42, 4096))
            })
            .unwrap();
        assert_eq!(p[0], 0x42);
        assert_eq!(calls, 1);

        let p = cache.get_or_load(1, 0, || panic!("should not reload")).unwrap();
        assert_eq!(p[0], 0x42);
        assert!(cache.hit_rate() > 0.0);
    }

    #[test]
    fn test_loader_error_is_not_cached() {
        let cache = cache(10);
        let err = cache
            .get_or_load(1, 0, || Err(Error::BlockNotFound { address: 0 }))
            .unwrap_err();
        assert!(matches!(err, Error::BlockNotFound { .. }));
        assert!(cache.is_empty());

        // A later load succeeds.
        cache.get_or_load(1, 0, || Ok(page(7, 4096))).unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_clear_log_scopes_to_identity() {
        let cache = cache(10);
        cache.insert(1, 0, page(1, 4096));
        cache.insert(2, 0, page(2, 4096));
        cache.clear_log(1);
        assert!(cache.get(1, 0).is_none());
        assert!(cache.get(2, 0).is_some());
    }

    #[test]
    fn test_shared_cache_page_size_mismatch() {
        let a = PageCache::shared(4096, &CacheConfig::default()).unwrap();
        let b = PageCache::shared(4096, &CacheConfig::default()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(matches!(
            PageCache::shared(8192, &CacheConfig::default()),
            Err(Error::InvalidSetting { .. })
        ));
    }

    // ── Concurrency stress ───────────────────────────────────────────────

    /// Many threads inserting, reading, and removing pages while eviction
    /// runs; the cache must stay consistent and bounded.
    #[test]
    fn stress_concurrent_access_with_eviction() {
        use std::thread;

        let cache = Arc::new(cache(50));
        let num_threads = 8;
        let ops_per_thread = 300u64;

        let mut handles = Vec::new();
        for thread_id in 0..num_threads {
            let cache = Arc::clone(&cache);
            handles.push(thread::spawn(move || {
                for i in 0..ops_per_thread {
                    let addr = (thread_id * ops_per_thread + i) * 4096;
                    cache.insert(1, addr, page(i as u8, 4096));
                    if i > 0 {
                        let _ = cache.get(1, addr - 4096);
                    }
                    if i % 7 == 0 {
                        cache.remove(1, addr);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().expect("thread panicked");
        }

        assert!(cache.len() <= 50 + num_threads as usize, "cache grew far beyond capacity");
    }
}
