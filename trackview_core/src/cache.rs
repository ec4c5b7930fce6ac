//! The window cache - single coordination point for resident telemetry.
//!
//! Owns the sample store together with per-window state, the current
//! retention set and failure bookkeeping. Every mutation (insert on load
//! completion, removal on eviction) goes through here under one lock, which
//! keeps the store equal to the union of samples of `Loaded` windows.
//!
//! ```text
//!            begin_load            complete_load (relevant)
//! NotLoaded ───────────► Loading ──────────────────────────► Loaded
//!     ▲                   │  │                                 │
//!     │   abandon / stale │  │ fail_load                       │ evict
//!     ├───────────────────┘  ▼                                 │
//!     │                    Failed ──(retry: begin_load)──►     │
//!     └────────────────────────────────────────────────────────┘
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::debug;
use trackview_env::{EntityId, Sample};

use crate::eviction::{EvictionPolicy, RetentionSet, TrailingEviction};
use crate::metrics::CacheMetrics;
use crate::sample_store::SampleStore;
use crate::window_index::WindowIndex;

/// The cache as shared between the loader, scheduler and engine.
pub type SharedCache = Arc<Mutex<WindowCache>>;

/// Locks a mutex, recovering the data if a holder panicked.
///
/// Every mutation under the cache lock leaves it consistent before
/// returning, so a poisoned lock still guards valid state.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lifecycle of one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowState {
    NotLoaded,
    Loading,
    Loaded,
    Failed,
}

/// What happened to a completed fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Samples were inserted; `evicted` lists windows dropped to stay in budget
    Inserted {
        samples: usize,
        evicted: Vec<usize>,
        recovered: bool,
    },
    
    /// The window left the retention set while in flight; nothing inserted
    Discarded,
    
    /// The window was already resident
    AlreadyResident,
}

/// Resident samples plus the bookkeeping that explains them.
pub struct WindowCache {
    index: WindowIndex,
    store: SampleStore,
    
    /// Explicit states; absent means `NotLoaded`
    states: BTreeMap<usize, WindowState>,
    
    retention: RetentionSet,
    lookahead: usize,
    budget: usize,
    policy: Box<dyn EvictionPolicy>,
    
    /// Consecutive failed attempts per window
    failures: HashMap<usize, u32>,
    
    /// Every entity seen this session, resident or not
    known_entities: BTreeSet<EntityId>,
    
    metrics: CacheMetrics,
}

impl WindowCache {
    /// Creates an empty cache retaining the first windows of the session.
    ///
    /// `budget` is the maximum number of loaded windows.
    pub fn new(index: WindowIndex, lookahead: usize, budget: usize) -> Self {
        Self {
            retention: RetentionSet::new(0, lookahead, index.total_windows()),
            index,
            store: SampleStore::new(),
            states: BTreeMap::new(),
            lookahead,
            budget,
            policy: Box::new(TrailingEviction),
            failures: HashMap::new(),
            known_entities: BTreeSet::new(),
            metrics: CacheMetrics::default(),
        }
    }
    
    /// Replaces the eviction policy.
    pub fn with_policy(mut self, policy: Box<dyn EvictionPolicy>) -> Self {
        self.policy = policy;
        self
    }
    
    // ========================================================================
    // QUERIES
    // ========================================================================
    
    pub fn index(&self) -> &WindowIndex {
        &self.index
    }
    
    pub fn store(&self) -> &SampleStore {
        &self.store
    }
    
    pub fn state(&self, window: usize) -> WindowState {
        self.states.get(&window).copied().unwrap_or(WindowState::NotLoaded)
    }
    
    pub fn retention(&self) -> RetentionSet {
        self.retention
    }
    
    pub fn budget(&self) -> usize {
        self.budget
    }
    
    /// True if a result for `window` may still be inserted.
    pub fn is_relevant(&self, window: usize) -> bool {
        self.retention.contains(window)
    }
    
    pub fn loaded_windows(&self) -> BTreeSet<usize> {
        self.windows_in(WindowState::Loaded).collect()
    }
    
    pub fn loaded_count(&self) -> usize {
        self.windows_in(WindowState::Loaded).count()
    }
    
    pub fn loading_count(&self) -> usize {
        self.windows_in(WindowState::Loading).count()
    }
    
    pub fn failed_windows(&self) -> Vec<usize> {
        self.windows_in(WindowState::Failed).collect()
    }
    
    pub fn failure_count(&self, window: usize) -> u32 {
        self.failures.get(&window).copied().unwrap_or(0)
    }
    
    /// True if the scheduler should request `window`.
    ///
    /// `Loading` counts: the request joins the in-flight fetch so the
    /// scheduler can evict once it lands. Failure counts outlive the
    /// `Failed` state, so the attempt limit holds across seeks.
    pub fn needs_load(&self, window: usize, max_attempts: Option<u32>) -> bool {
        match self.state(window) {
            WindowState::Loaded => false,
            WindowState::Loading => true,
            WindowState::NotLoaded | WindowState::Failed => {
                max_attempts.map_or(true, |max| self.failure_count(window) < max)
            }
        }
    }
    
    /// Resident samples belonging to `window`, by recomputed membership.
    pub fn window_samples(&self, window: usize) -> Vec<Sample> {
        self.store
            .iter()
            .filter(|s| self.index.window_of(s.timestamp_ms) == window)
            .copied()
            .collect()
    }
    
    pub fn known_entities(&self) -> &BTreeSet<EntityId> {
        &self.known_entities
    }
    
    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }
    
    /// Counts a load request that joined an in-flight fetch.
    pub(crate) fn record_coalesced(&mut self) {
        self.metrics.coalesced += 1;
    }
    
    fn windows_in(&self, wanted: WindowState) -> impl Iterator<Item = usize> + '_ {
        self.states
            .iter()
            .filter(move |(_, state)| **state == wanted)
            .map(|(window, _)| *window)
    }
    
    // ========================================================================
    // TRANSITIONS
    // ========================================================================
    
    /// Recomputes the retention set around `current` and evicts immediately.
    ///
    /// Failed windows outside the new set go back to `NotLoaded`; only
    /// retained windows can stall playback. Returns the windows evicted.
    pub fn set_retention(&mut self, current: usize) -> Vec<usize> {
        let retention = RetentionSet::new(current, self.lookahead, self.index.total_windows());
        self.retention = retention;
        self.states
            .retain(|window, state| *state != WindowState::Failed || retention.contains(*window));
        self.enforce_budget()
    }
    
    /// Resets the attempt count of every failed retained window so the
    /// next pass requests them again. Returns the windows reset.
    pub fn clear_failures(&mut self) -> Vec<usize> {
        let mut reset = Vec::new();
        for window in self.retention.indices() {
            if let Some(attempts) = self.failures.get_mut(&window) {
                // Zero, not removed: a later success still counts as recovery
                *attempts = 0;
                reset.push(window);
            }
        }
        reset
    }
    
    /// Marks `window` as in flight. Returns false if it is already
    /// loading or resident.
    pub(crate) fn begin_load(&mut self, window: usize) -> bool {
        match self.state(window) {
            WindowState::Loading | WindowState::Loaded => false,
            WindowState::NotLoaded | WindowState::Failed => {
                self.states.insert(window, WindowState::Loading);
                self.metrics.fetches += 1;
                true
            }
        }
    }
    
    /// Applies a successful fetch, checking relevance at completion time.
    pub(crate) fn complete_load(&mut self, window: usize, samples: &[Sample]) -> Disposition {
        if self.state(window) == WindowState::Loaded {
            return Disposition::AlreadyResident;
        }
        
        if !self.is_relevant(window) {
            self.states.remove(&window);
            self.metrics.stale_discards += 1;
            debug!("Discarding stale fetch result for window {}", window);
            return Disposition::Discarded;
        }
        
        let index = self.index;
        let (owned, foreign): (Vec<Sample>, Vec<Sample>) = samples
            .iter()
            .copied()
            .partition(|s| index.contains(window, s.timestamp_ms));
        self.metrics.out_of_window_samples += foreign.len() as u64;
        
        self.known_entities.extend(owned.iter().map(|s| s.entity_id));
        let inserted = self.store.insert(owned);
        self.states.insert(window, WindowState::Loaded);
        let recovered = self.failures.remove(&window).is_some();
        self.metrics.windows_inserted += 1;
        
        let evicted = self.enforce_budget();
        let loaded = self.loaded_count();
        self.metrics.observe_loaded(loaded);
        
        Disposition::Inserted {
            samples: inserted,
            evicted,
            recovered,
        }
    }
    
    /// Records a failed fetch. Returns the attempt count so far.
    pub(crate) fn fail_load(&mut self, window: usize) -> u32 {
        self.states.insert(window, WindowState::Failed);
        self.metrics.failures += 1;
        let attempts = self.failures.entry(window).or_insert(0);
        *attempts += 1;
        *attempts
    }
    
    /// Rolls back an in-flight window whose fetch was dropped.
    pub(crate) fn abandon_load(&mut self, window: usize) {
        if self.state(window) == WindowState::Loading {
            self.states.remove(&window);
        }
    }
    
    /// Evicts loaded windows the policy selects under the budget.
    pub fn enforce_budget(&mut self) -> Vec<usize> {
        let loaded = self.loaded_windows();
        let victims = self
            .policy
            .select_for_eviction(&loaded, &self.retention, self.budget);
        
        let mut evicted = Vec::with_capacity(victims.len());
        for window in victims {
            // Never touch anything but resident windows
            if self.state(window) != WindowState::Loaded || self.retention.contains(window) {
                continue;
            }
            let removed = self.evict(window);
            debug!("Evicted window {} ({} samples)", window, removed);
            evicted.push(window);
        }
        evicted
    }
    
    /// Removes exactly the samples whose recomputed window is `window`.
    fn evict(&mut self, window: usize) -> usize {
        let index = self.index;
        let removed = self
            .store
            .remove_where(|s| index.window_of(s.timestamp_ms) == window);
        self.states.remove(&window);
        self.metrics.windows_evicted += 1;
        removed
    }
    
    /// Checks that resident samples are exactly those of loaded windows.
    pub fn verify(&self) -> Result<(), String> {
        let mut populated = BTreeSet::new();
        for sample in self.store.iter() {
            let window = self.index.window_of(sample.timestamp_ms);
            if self.state(window) != WindowState::Loaded {
                return Err(format!(
                    "orphan sample at {} in window {} ({:?})",
                    sample.timestamp_ms,
                    window,
                    self.state(window)
                ));
            }
            populated.insert(window);
        }
        
        let loaded = self.loaded_count();
        if loaded > self.budget {
            return Err(format!("{} windows loaded, budget is {}", loaded, self.budget));
        }
        
        // A loaded window may legitimately be empty, never the reverse
        if !populated.is_subset(&self.loaded_windows()) {
            return Err("populated windows not all loaded".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window_index::{SessionRange, WindowSpec};
    use proptest::prelude::*;
    
    const START: i64 = 1_000_000;
    
    fn cache(windows: i64, lookahead: usize, budget: usize) -> WindowCache {
        let range = SessionRange::new(START, START + windows * 10_000).unwrap();
        let index = WindowIndex::new(range, WindowSpec { duration_secs: 10 });
        WindowCache::new(index, lookahead, budget)
    }
    
    /// Two entities, one sample per second, for one window.
    fn window_payload(window: usize) -> Vec<Sample> {
        let base = START + window as i64 * 10_000;
        (0..10)
            .flat_map(|i| {
                let t = base + i * 1000;
                [
                    Sample::new(t, EntityId(1), i as f64, 0.0, 0.0),
                    Sample::new(t + 500, EntityId(2), 0.0, i as f64, 0.0),
                ]
            })
            .collect()
    }
    
    fn load(cache: &mut WindowCache, window: usize) -> Disposition {
        assert!(cache.begin_load(window));
        cache.complete_load(window, &window_payload(window))
    }
    
    #[test]
    fn test_load_inserts_and_marks_loaded() {
        let mut cache = cache(10, 2, 5);
        
        let disposition = load(&mut cache, 0);
        assert_eq!(
            disposition,
            Disposition::Inserted { samples: 20, evicted: vec![], recovered: false }
        );
        assert_eq!(cache.state(0), WindowState::Loaded);
        assert_eq!(cache.store().len(), 20);
        assert_eq!(cache.known_entities().len(), 2);
        assert!(cache.verify().is_ok());
    }
    
    #[test]
    fn test_begin_load_rejects_duplicates() {
        let mut cache = cache(10, 2, 5);
        assert!(cache.begin_load(1));
        assert!(!cache.begin_load(1));
        assert_eq!(cache.metrics().fetches, 1);
    }
    
    #[test]
    fn test_stale_completion_discarded() {
        let mut cache = cache(100, 2, 5);
        cache.set_retention(5);
        assert!(cache.begin_load(5));
        
        // Cursor jumps far away while window 5 is in flight
        cache.set_retention(60);
        let disposition = cache.complete_load(5, &window_payload(5));
        
        assert_eq!(disposition, Disposition::Discarded);
        assert_eq!(cache.state(5), WindowState::NotLoaded);
        assert!(cache.store().is_empty());
        assert_eq!(cache.metrics().stale_discards, 1);
    }
    
    #[test]
    fn test_foreign_samples_dropped_at_ingest() {
        let mut cache = cache(10, 2, 5);
        let mut payload = window_payload(0);
        payload.push(Sample::new(START + 10_000, EntityId(1), 0.0, 0.0, 0.0)); // window 1
        payload.push(Sample::new(START - 1, EntityId(1), 0.0, 0.0, 0.0)); // before session
        
        assert!(cache.begin_load(0));
        cache.complete_load(0, &payload);
        
        assert_eq!(cache.store().len(), 20);
        assert_eq!(cache.metrics().out_of_window_samples, 2);
        assert!(cache.verify().is_ok());
    }
    
    #[test]
    fn test_eviction_removes_only_own_samples() {
        let mut cache = cache(100, 1, 3);
        for window in [7, 8, 9] {
            cache.set_retention(window);
            load(&mut cache, window);
        }
        cache.set_retention(10);
        let disposition = load(&mut cache, 10);
        
        // Budget 3, retention {10, 11}: keep 9, drop 7 and 8
        match disposition {
            Disposition::Inserted { evicted, .. } => assert_eq!(evicted, vec![7, 8]),
            other => panic!("unexpected disposition {:?}", other),
        }
        assert_eq!(cache.loaded_windows(), [9, 10].into_iter().collect());
        assert!(cache.window_samples(7).is_empty());
        assert!(cache.window_samples(8).is_empty());
        assert_eq!(cache.window_samples(9).len(), 20);
        assert_eq!(cache.store().len(), 40);
        assert!(cache.verify().is_ok());
    }
    
    #[test]
    fn test_failure_then_recovery() {
        let mut cache = cache(10, 2, 5);
        assert!(cache.begin_load(1));
        assert_eq!(cache.fail_load(1), 1);
        assert_eq!(cache.state(1), WindowState::Failed);
        assert!(cache.needs_load(1, None));
        assert!(!cache.needs_load(1, Some(1)));
        assert!(cache.needs_load(1, Some(2)));
        
        let disposition = load(&mut cache, 1);
        assert!(matches!(disposition, Disposition::Inserted { recovered: true, .. }));
        assert_eq!(cache.failure_count(1), 0);
    }
    
    #[test]
    fn test_failed_window_reset_when_left_behind() {
        let mut cache = cache(10, 2, 5);
        assert!(cache.begin_load(1));
        cache.fail_load(1);
        assert_eq!(cache.failed_windows(), vec![1]);
        
        cache.set_retention(6);
        
        assert_eq!(cache.state(1), WindowState::NotLoaded);
        assert!(cache.failed_windows().is_empty());
        // The attempt count survives, so the limit still applies on return
        assert_eq!(cache.failure_count(1), 1);
        assert!(!cache.needs_load(1, Some(1)));
        assert!(cache.needs_load(1, None));
    }
    
    #[test]
    fn test_clear_failures_resets_retained_windows() {
        let mut cache = cache(10, 2, 5);
        for window in [1, 2, 8] {
            assert!(cache.begin_load(window));
            cache.fail_load(window);
        }
        cache.set_retention(0);
        assert!(!cache.needs_load(1, Some(1)));
        
        assert_eq!(cache.clear_failures(), vec![1, 2]);
        
        assert!(cache.needs_load(1, Some(1)));
        assert!(cache.needs_load(2, Some(1)));
        assert_eq!(cache.failure_count(8), 1);
        
        // Still reported as a recovery once it loads
        assert!(cache.begin_load(1));
        let disposition = cache.complete_load(1, &window_payload(1));
        assert!(matches!(disposition, Disposition::Inserted { recovered: true, .. }));
    }
    
    #[test]
    fn test_abandon_rolls_back() {
        let mut cache = cache(10, 2, 5);
        assert!(cache.begin_load(2));
        cache.abandon_load(2);
        assert_eq!(cache.state(2), WindowState::NotLoaded);
        assert_eq!(cache.loading_count(), 0);
    }
    
    #[derive(Debug, Clone)]
    enum Op {
        Seek(usize),
        Load(usize),
        Fail(usize),
    }
    
    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..40).prop_map(Op::Seek),
            (0usize..40).prop_map(Op::Load),
            (0usize..40).prop_map(Op::Fail),
        ]
    }
    
    proptest! {
        #[test]
        fn store_matches_loaded_windows(ops in prop::collection::vec(op_strategy(), 1..80)) {
            let mut cache = cache(40, 2, 5);
            
            for op in ops {
                match op {
                    Op::Seek(w) => {
                        cache.set_retention(w);
                    }
                    Op::Load(w) => {
                        if cache.begin_load(w) {
                            cache.complete_load(w, &window_payload(w));
                        }
                    }
                    Op::Fail(w) => {
                        if cache.begin_load(w) {
                            cache.fail_load(w);
                        }
                    }
                }
                
                prop_assert!(cache.verify().is_ok(), "{:?}", cache.verify());
                
                // Exact union: every loaded window is fully resident
                let expected: usize = cache.loaded_windows().len() * 20;
                prop_assert_eq!(cache.store().len(), expected);
                for w in cache.retention().indices() {
                    let state = cache.state(w);
                    prop_assert!(state != WindowState::Loaded || cache.window_samples(w).len() == 20);
                }
            }
        }
    }
}
