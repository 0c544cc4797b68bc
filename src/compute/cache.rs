//! Bounded tick → frame store shared by workers and consumers.
//!
//! Eviction is FIFO-by-tick: the lowest ticks go first, which matches forward
//! playback. Access recency is not tracked.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::debug;

use super::frame::{FrameState, Tick};
use crate::schema::CacheConfig;

#[derive(Debug, Default)]
struct CacheInner {
    frames: BTreeMap<Tick, Arc<FrameState>>,
    /// Sum of `estimated_bytes` over `frames`.
    memory: usize,
}

impl CacheInner {
    fn evict_to(&mut self, max_frames: usize, max_memory: usize) -> usize {
        let mut evicted = 0;
        while self.frames.len() > max_frames
            || (self.memory > max_memory && !self.frames.is_empty())
        {
            if let Some((_, frame)) = self.frames.pop_first() {
                self.memory -= frame.estimated_bytes();
                evicted += 1;
            }
        }
        evicted
    }
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub hit_count: u64,
    pub miss_count: u64,
    /// Hits over lookups (0.0 when nothing was looked up).
    pub hit_rate: f64,
    pub cached_frames: usize,
    /// Estimated footprint in bytes.
    pub memory_estimate: usize,
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} frames cached ({:.1} KiB), {} hits / {} misses ({:.1}% hit rate)",
            self.cached_frames,
            self.memory_estimate as f64 / 1024.0,
            self.hit_count,
            self.miss_count,
            self.hit_rate * 100.0
        )
    }
}

/// Bounded frame cache.
///
/// All operations take `&self`; the map sits behind a `RwLock` so lookups from
/// many consumers proceed in parallel, and counters are atomics.
#[derive(Debug)]
pub struct FrameCache {
    inner: RwLock<CacheInner>,
    max_frames: AtomicUsize,
    max_memory: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl FrameCache {
    /// Create a cache with the given entry and byte budgets.
    pub fn new(max_frames: usize, max_memory: usize) -> Self {
        Self {
            inner: RwLock::new(CacheInner::default()),
            max_frames: AtomicUsize::new(max_frames),
            max_memory: AtomicUsize::new(max_memory),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Create a cache from configuration.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_frames, config.max_memory_bytes)
    }

    // Frames are immutable once stored, so a poisoned lock still guards a
    // consistent map.
    fn read(&self) -> RwLockReadGuard<'_, CacheInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or overwrite the frame for `tick`, then enforce budgets.
    ///
    /// Returns false without storing when `frame.tick` disagrees with `tick`.
    pub fn store_frame(&self, tick: Tick, frame: FrameState) -> bool {
        self.store_shared(tick, Arc::new(frame))
    }

    /// Like [`store_frame`](Self::store_frame) for an already shared frame.
    pub fn store_shared(&self, tick: Tick, frame: Arc<FrameState>) -> bool {
        if frame.tick != tick {
            return false;
        }

        let max_frames = self.max_frames.load(Ordering::Relaxed);
        let max_memory = self.max_memory.load(Ordering::Relaxed);

        let mut inner = self.write();
        inner.memory += frame.estimated_bytes();
        if let Some(old) = inner.frames.insert(tick, frame) {
            inner.memory -= old.estimated_bytes();
        }
        let evicted = inner.evict_to(max_frames, max_memory);
        drop(inner);

        if evicted > 0 {
            debug!("cache evicted {} frame(s) after storing tick {}", evicted, tick);
        }
        true
    }

    /// Look up a frame, recording a hit or miss.
    pub fn get_frame(&self, tick: Tick) -> Option<Arc<FrameState>> {
        let frame = self.read().frames.get(&tick).cloned();
        let counter = if frame.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        frame
    }

    /// Look up a frame without touching the counters.
    pub fn peek(&self, tick: Tick) -> Option<Arc<FrameState>> {
        self.read().frames.get(&tick).cloned()
    }

    pub fn contains(&self, tick: Tick) -> bool {
        self.read().frames.contains_key(&tick)
    }

    /// Number of cached frames.
    pub fn len(&self) -> usize {
        self.read().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().frames.is_empty()
    }

    /// Lowest and highest cached tick.
    pub fn tick_range(&self) -> Option<(Tick, Tick)> {
        let inner = self.read();
        let first = *inner.frames.first_key_value()?.0;
        let last = *inner.frames.last_key_value()?.0;
        Some((first, last))
    }

    pub fn max_frames(&self) -> usize {
        self.max_frames.load(Ordering::Relaxed)
    }

    pub fn max_memory(&self) -> usize {
        self.max_memory.load(Ordering::Relaxed)
    }

    /// Change the entry budget, evicting immediately if it shrank.
    pub fn set_max_frames(&self, max_frames: usize) {
        self.max_frames.store(max_frames, Ordering::Relaxed);
        let max_memory = self.max_memory();
        self.write().evict_to(max_frames, max_memory);
    }

    /// Change the byte budget, evicting immediately if it shrank.
    pub fn set_max_memory(&self, max_memory: usize) {
        self.max_memory.store(max_memory, Ordering::Relaxed);
        let max_frames = self.max_frames();
        self.write().evict_to(max_frames, max_memory);
    }

    /// Current counters.
    pub fn get_cache_stats(&self) -> CacheStats {
        let (cached_frames, memory_estimate) = {
            let inner = self.read();
            (inner.frames.len(), inner.memory)
        };
        let hit_count = self.hits.load(Ordering::Relaxed);
        let miss_count = self.misses.load(Ordering::Relaxed);
        let lookups = hit_count + miss_count;

        CacheStats {
            hit_count,
            miss_count,
            hit_rate: if lookups > 0 {
                hit_count as f64 / lookups as f64
            } else {
                0.0
            },
            cached_frames,
            memory_estimate,
        }
    }

    /// Drop all frames and reset counters.
    pub fn clear_cache(&self) {
        let mut inner = self.write();
        inner.frames.clear();
        inner.memory = 0;
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

impl Default for FrameCache {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::AnimationState;
    use proptest::prelude::*;
    use std::thread;

    fn frame(tick: Tick, animations: usize) -> FrameState {
        let mut frame = FrameState::empty(tick);
        for i in 0..animations {
            frame.animations.insert(
                format!("anim_{i}"),
                AnimationState {
                    x: tick as f64,
                    ..Default::default()
                },
            );
        }
        frame
    }

    #[test]
    fn test_fifo_eviction_by_tick() {
        let cache = FrameCache::new(10, usize::MAX);
        for tick in 0..15 {
            assert!(cache.store_frame(tick, frame(tick, 2)));
        }

        assert_eq!(cache.len(), 10);
        for tick in 0..5 {
            assert!(cache.get_frame(tick).is_none(), "tick {} should be evicted", tick);
        }
        for tick in 5..15 {
            assert_eq!(cache.get_frame(tick).unwrap().tick, tick);
        }
        assert_eq!(cache.tick_range(), Some((5, 14)));
    }

    #[test]
    fn test_memory_budget_evicts_oldest() {
        let per_frame = frame(0, 4).estimated_bytes();
        let cache = FrameCache::new(100, per_frame * 3);
        for tick in 0..6 {
            cache.store_frame(tick, frame(tick, 4));
        }

        let stats = cache.get_cache_stats();
        assert_eq!(stats.cached_frames, 3);
        assert!(stats.memory_estimate <= per_frame * 3);
        assert!(cache.peek(2).is_none());
        assert!(cache.peek(5).is_some());
    }

    #[test]
    fn test_overwrite_keeps_memory_consistent() {
        let cache = FrameCache::new(10, usize::MAX);
        cache.store_frame(1, frame(1, 1));
        cache.store_frame(1, frame(1, 5));

        let stats = cache.get_cache_stats();
        assert_eq!(stats.cached_frames, 1);
        assert_eq!(stats.memory_estimate, frame(1, 5).estimated_bytes());
    }

    #[test]
    fn test_rejects_mismatched_tick() {
        let cache = FrameCache::new(10, usize::MAX);
        assert!(!cache.store_frame(3, frame(4, 1)));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_hit_miss_accounting_and_clear() {
        let cache = FrameCache::new(10, usize::MAX);
        cache.store_frame(1, frame(1, 1));
        cache.get_frame(1);
        cache.get_frame(1);
        cache.get_frame(2);
        cache.peek(2);

        let stats = cache.get_cache_stats();
        assert_eq!(stats.hit_count, 2);
        assert_eq!(stats.miss_count, 1);
        assert!((stats.hit_rate - 2.0 / 3.0).abs() < 1e-9);

        cache.clear_cache();
        let stats = cache.get_cache_stats();
        assert_eq!(stats.hit_count, 0);
        assert_eq!(stats.miss_count, 0);
        assert_eq!(stats.cached_frames, 0);
        assert_eq!(stats.memory_estimate, 0);
        assert!(cache.get_frame(1).is_none());
    }

    #[test]
    fn test_empty_cache_returns_none() {
        let cache = FrameCache::default();
        for tick in [0, 1, 59, u64::MAX] {
            assert!(cache.get_frame(tick).is_none());
        }
    }

    #[test]
    fn test_shrinking_budget_evicts() {
        let cache = FrameCache::new(10, usize::MAX);
        for tick in 0..10 {
            cache.store_frame(tick, frame(tick, 1));
        }
        cache.set_max_frames(4);
        assert_eq!(cache.len(), 4);
        assert_eq!(cache.tick_range(), Some((6, 9)));
    }

    #[test]
    fn test_concurrent_store_and_get() {
        let cache = Arc::new(FrameCache::new(64, usize::MAX));
        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for tick in (worker..400).step_by(4) {
                        cache.store_frame(tick, frame(tick, 3));
                        if let Some(found) = cache.get_frame(tick.saturating_sub(8)) {
                            assert_eq!(found.tick, tick.saturating_sub(8));
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(cache.len() <= 64);
    }

    proptest! {
        #[test]
        fn prop_budgets_hold(
            ticks in proptest::collection::vec(0u64..500, 1..200),
            max_frames in 1usize..40,
            frame_budget in 1usize..40,
        ) {
            let max_memory = frame(0, 2).estimated_bytes() * frame_budget;
            let cache = FrameCache::new(max_frames, max_memory);
            for &tick in &ticks {
                cache.store_frame(tick, frame(tick, 2));
                let stats = cache.get_cache_stats();
                prop_assert!(stats.cached_frames <= max_frames);
                prop_assert!(stats.memory_estimate <= max_memory);
            }
        }
    }
}
