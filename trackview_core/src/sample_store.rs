//! Resident sample storage, grouped by entity and sorted by time.
//!
//! The store knows nothing about windows: the cache decides what goes in
//! and what comes out, the store keeps each entity's series ordered so
//! point queries are a binary search.

use std::collections::BTreeMap;

use trackview_env::{EntityId, Sample};

/// All currently resident samples.
#[derive(Debug, Default, Clone)]
pub struct SampleStore {
    /// Per-entity series, each sorted by `timestamp_ms`
    by_entity: BTreeMap<EntityId, Vec<Sample>>,
    
    /// Total resident samples
    len: usize,
    
    /// Bumped on every mutation; lets readers invalidate cached positions
    generation: u64,
}

impl SampleStore {
    pub fn new() -> Self {
        Self::default()
    }
    
    /// Inserts samples, keeping every touched series sorted.
    ///
    /// Returns the number of samples inserted.
    pub fn insert<I>(&mut self, samples: I) -> usize
    where
        I: IntoIterator<Item = Sample>,
    {
        let mut touched: Vec<EntityId> = Vec::new();
        let mut inserted = 0;
        
        for sample in samples {
            let series = self.by_entity.entry(sample.entity_id).or_default();
            if series.last().is_some_and(|last| last.timestamp_ms > sample.timestamp_ms)
                && !touched.contains(&sample.entity_id)
            {
                touched.push(sample.entity_id);
            }
            series.push(sample);
            inserted += 1;
        }
        
        // Stable sort: equal timestamps keep their arrival order
        for entity in touched {
            if let Some(series) = self.by_entity.get_mut(&entity) {
                series.sort_by_key(|s| s.timestamp_ms);
            }
        }
        
        if inserted > 0 {
            self.len += inserted;
            self.generation += 1;
        }
        inserted
    }
    
    /// Removes every sample matching `predicate`.
    ///
    /// Returns the number of samples removed. Entities left without
    /// samples are dropped.
    pub fn remove_where<F>(&mut self, mut predicate: F) -> usize
    where
        F: FnMut(&Sample) -> bool,
    {
        let mut removed = 0;
        
        for series in self.by_entity.values_mut() {
            let before = series.len();
            series.retain(|s| !predicate(s));
            removed += before - series.len();
        }
        self.by_entity.retain(|_, series| !series.is_empty());
        
        if removed > 0 {
            self.len -= removed;
            self.generation += 1;
        }
        removed
    }
    
    /// Drops everything.
    pub fn clear(&mut self) {
        if self.len > 0 {
            self.generation += 1;
        }
        self.by_entity.clear();
        self.len = 0;
    }
    
    /// The sorted series of one entity (empty if none resident).
    pub fn samples_for(&self, entity: EntityId) -> &[Sample] {
        self.by_entity
            .get(&entity)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
    
    /// Samples of one entity with `from_ms <= t < to_ms`.
    pub fn range(&self, entity: EntityId, from_ms: i64, to_ms: i64) -> &[Sample] {
        let series = self.samples_for(entity);
        let lo = series.partition_point(|s| s.timestamp_ms < from_ms);
        let hi = series.partition_point(|s| s.timestamp_ms < to_ms);
        if lo >= hi {
            return &[];
        }
        &series[lo..hi]
    }
    
    /// Most recent sample of `entity` at or before `timestamp_ms`.
    pub fn latest_at(&self, entity: EntityId, timestamp_ms: i64) -> Option<&Sample> {
        let series = self.samples_for(entity);
        let upper = series.partition_point(|s| s.timestamp_ms <= timestamp_ms);
        upper.checked_sub(1).and_then(|i| series.get(i))
    }
    
    /// Entities with at least one resident sample, in id order.
    pub fn entities(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.by_entity.keys().copied()
    }
    
    /// Every resident sample, grouped by entity then ordered by time.
    pub fn iter(&self) -> impl Iterator<Item = &Sample> + '_ {
        self.by_entity.values().flat_map(|series| series.iter())
    }
    
    pub fn len(&self) -> usize {
        self.len
    }
    
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    
    /// Mutation counter.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}
