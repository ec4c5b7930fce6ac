//! Retention and eviction policy.
//!
//! The retention set is the window under the cursor plus a fixed
//! look-ahead. Under a window-count budget, eviction keeps the retention
//! set first, then backfills with the nearest windows *behind* the cursor
//! ("just played"), and drops everything else.

use std::collections::BTreeSet;
use std::ops::RangeInclusive;

/// Windows that must stay resident for the current cursor position.
///
/// Ephemeral: recomputed whenever the cursor's owning window changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionSet {
    current: usize,
    last: usize,
}

impl RetentionSet {
    /// `{current} ∪ {current+1 ..= current+lookahead}`, clipped to the session.
    pub fn new(current: usize, lookahead: usize, total_windows: usize) -> Self {
        let final_window = total_windows.saturating_sub(1);
        let current = current.min(final_window);
        let last = current.saturating_add(lookahead).min(final_window);
        Self { current, last }
    }
    
    /// Window under the cursor.
    pub fn current(&self) -> usize {
        self.current
    }
    
    /// Indices in ascending order (current first).
    pub fn indices(&self) -> RangeInclusive<usize> {
        self.current..=self.last
    }
    
    pub fn contains(&self, window: usize) -> bool {
        self.indices().contains(&window)
    }
    
    pub fn len(&self) -> usize {
        self.last - self.current + 1
    }
    
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Decides which loaded windows to drop.
pub trait EvictionPolicy: Send + Sync {
    /// Returns the subset of `loaded` to evict.
    ///
    /// Must never return a member of `retention`, and must leave at most
    /// `budget` windows loaded whenever `retention.len() <= budget`.
    fn select_for_eviction(
        &self,
        loaded: &BTreeSet<usize>,
        retention: &RetentionSet,
        budget: usize,
    ) -> BTreeSet<usize>;
}

/// Keeps the retention set, then the nearest preceding loaded windows.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrailingEviction;

impl EvictionPolicy for TrailingEviction {
    fn select_for_eviction(
        &self,
        loaded: &BTreeSet<usize>,
        retention: &RetentionSet,
        budget: usize,
    ) -> BTreeSet<usize> {
        if loaded.len() <= budget {
            return BTreeSet::new();
        }
        
        let mut keep: BTreeSet<usize> = retention.indices().collect();
        
        // Backfill with the closest already-played windows
        for window in loaded.range(..retention.current()).rev() {
            if keep.len() >= budget {
                break;
            }
            keep.insert(*window);
        }
        
        loaded.difference(&keep).copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    
    fn set(items: &[usize]) -> BTreeSet<usize> {
        items.iter().copied().collect()
    }
    
    #[test]
    fn test_retention_set_clipped() {
        let r = RetentionSet::new(10, 2, 100);
        assert_eq!(r.indices().collect::<Vec<_>>(), vec![10, 11, 12]);
        assert_eq!(r.len(), 3);
        
        let tail = RetentionSet::new(44, 2, 45);
        assert_eq!(tail.indices().collect::<Vec<_>>(), vec![44]);
        assert!(!tail.contains(45));
    }
    
    #[test]
    fn test_under_budget_evicts_nothing() {
        let policy = TrailingEviction;
        let retention = RetentionSet::new(30, 2, 100);
        let evicted = policy.select_for_eviction(&set(&[1, 2, 30]), &retention, 5);
        assert!(evicted.is_empty());
    }
    
    #[test]
    fn test_keeps_retention_and_nearest_preceding() {
        // budget 3, lookahead 1, cursor at 10, {7..=11} loaded
        let policy = TrailingEviction;
        let retention = RetentionSet::new(10, 1, 100);
        let evicted = policy.select_for_eviction(&set(&[7, 8, 9, 10, 11]), &retention, 3);
        assert_eq!(evicted, set(&[7, 8]));
    }
    
    #[test]
    fn test_windows_ahead_of_retention_are_evicted() {
        // After a backward seek, far-ahead windows lose to nearby played ones
        let policy = TrailingEviction;
        let retention = RetentionSet::new(3, 2, 100);
        let loaded = set(&[1, 2, 3, 20, 21, 22]);
        let evicted = policy.select_for_eviction(&loaded, &retention, 5);
        assert_eq!(evicted, set(&[20, 21, 22]));
    }
    
    #[test]
    fn test_unloaded_retention_still_reserves_slots() {
        let policy = TrailingEviction;
        let retention = RetentionSet::new(10, 2, 100);
        // 11 and 12 not yet loaded; only one slot left for backfill
        let loaded = set(&[6, 7, 8, 9, 10]);
        let evicted = policy.select_for_eviction(&loaded, &retention, 4);
        assert_eq!(evicted, set(&[6, 7, 8]));
    }
}
