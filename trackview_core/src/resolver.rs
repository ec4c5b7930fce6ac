//! Position Resolver - "last known position" lookups.
//!
//! Zeroth-order hold: for an entity and a time, the answer is the resident
//! sample with the greatest timestamp at or before that time, or nothing.
//! Series are kept sorted by the store, so a lookup is a binary search.
//! During linear playback successive queries move forward a little each
//! frame; a per-entity hint turns those into a short forward walk.

use std::collections::{BTreeMap, HashMap};

use trackview_env::{EntityId, Sample};

use crate::sample_store::SampleStore;

/// Forward steps tried from a hint before falling back to binary search.
const MAX_HINT_STEPS: usize = 16;

/// Per-entity lookup with monotonic hints.
///
/// Hints are positions into the store's series; any store mutation
/// (tracked by its generation) invalidates all of them.
#[derive(Debug, Default)]
pub struct PositionResolver {
    hints: HashMap<EntityId, usize>,
    generation: u64,
}

impl PositionResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops all hints.
    pub fn invalidate(&mut self) {
        self.hints.clear();
    }

    /// Latest resident sample of `entity` at or before `time_ms`.
    ///
    /// `None` means the entity has not been observed yet at that time (or
    /// its window is not resident); it is not an error.
    pub fn resolve<'a>(
        &mut self,
        store: &'a SampleStore,
        entity: EntityId,
        time_ms: i64,
    ) -> Option<&'a Sample> {
        if store.generation() != self.generation {
            self.hints.clear();
            self.generation = store.generation();
        }

        let series = store.samples_for(entity);
        let found = match self.hints.get(&entity) {
            Some(&hint) if hint < series.len() && series[hint].timestamp_ms <= time_ms => {
                walk_forward(series, hint, time_ms)
            }
            _ => latest_index(series, time_ms),
        };

        match found {
            Some(position) => {
                self.hints.insert(entity, position);
                Some(&series[position])
            }
            None => {
                self.hints.remove(&entity);
                None
            }
        }
    }

    /// Resolves every entity in `entities` at `time_ms`.
    pub fn resolve_all<I>(
        &mut self,
        store: &SampleStore,
        entities: I,
        time_ms: i64,
    ) -> BTreeMap<EntityId, Option<Sample>>
    where
        I: IntoIterator<Item = EntityId>,
    {
        entities
            .into_iter()
            .map(|entity| (entity, self.resolve(store, entity, time_ms).copied()))
            .collect()
    }
}

/// Index of the last sample with `timestamp_ms <= time_ms`.
fn latest_index(series: &[Sample], time_ms: i64) -> Option<usize> {
    series
        .partition_point(|s| s.timestamp_ms <= time_ms)
        .checked_sub(1)
}

/// Walks forward from a hint known to satisfy `timestamp_ms <= time_ms`.
fn walk_forward(series: &[Sample], hint: usize, time_ms: i64) -> Option<usize> {
    let mut position = hint;
    for _ in 0..MAX_HINT_STEPS {
        match series.get(position + 1) {
            Some(next) if next.timestamp_ms <= time_ms => position += 1,
            _ => return Some(position),
        }
    }
    // Large jump: search the remainder
    let rest = &series[position..];
    latest_index(rest, time_ms).map(|offset| position + offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const E: EntityId = EntityId(44);

    fn store_with(timestamps: &[i64]) -> SampleStore {
        let mut store = SampleStore::new();
        store.insert(
            timestamps
                .iter()
                .map(|&t| Sample::new(t, E, t as f64, 0.0, 0.0)),
        );
        store
    }

    #[test]
    fn test_last_known_position() {
        let mut store = SampleStore::new();
        store.insert([
            Sample::new(100, E, 1.0, 1.0, 0.0), // A
            Sample::new(300, E, 2.0, 2.0, 0.0), // B
        ]);
        let mut resolver = PositionResolver::new();

        assert!(resolver.resolve(&store, E, 50).is_none());
        assert_eq!(resolver.resolve(&store, E, 150).unwrap().x(), 1.0);
        assert_eq!(resolver.resolve(&store, E, 300).unwrap().x(), 2.0);
        assert_eq!(resolver.resolve(&store, E, 10_000).unwrap().x(), 2.0);
    }

    #[test]
    fn test_unknown_entity_is_absent() {
        let store = store_with(&[100, 200]);
        let mut resolver = PositionResolver::new();
        assert!(resolver.resolve(&store, EntityId(1), 500).is_none());
    }

    #[test]
    fn test_backward_query_after_hint() {
        let store = store_with(&(0..100).map(|i| i * 10).collect::<Vec<_>>());
        let mut resolver = PositionResolver::new();

        assert_eq!(resolver.resolve(&store, E, 905).unwrap().timestamp_ms, 900);
        assert_eq!(resolver.resolve(&store, E, 15).unwrap().timestamp_ms, 10);
        assert!(resolver.resolve(&store, E, -1).is_none());
    }

    #[test]
    fn test_hints_reset_on_store_change() {
        let mut store = store_with(&[100, 200, 300]);
        let mut resolver = PositionResolver::new();
        assert_eq!(resolver.resolve(&store, E, 250).unwrap().timestamp_ms, 200);

        // Remove the hinted sample; the stale index must not be trusted
        store.remove_where(|s| s.timestamp_ms <= 200);
        assert!(resolver.resolve(&store, E, 250).is_none());
        assert_eq!(resolver.resolve(&store, E, 300).unwrap().timestamp_ms, 300);
    }

    #[test]
    fn test_resolve_all_includes_absent() {
        let store = store_with(&[100]);
        let mut resolver = PositionResolver::new();
        let positions = resolver.resolve_all(&store, [E, EntityId(1)], 150);
        assert_eq!(positions.len(), 2);
        assert!(positions[&E].is_some());
        assert!(positions[&EntityId(1)].is_none());
    }

    proptest! {
        #[test]
        fn hinted_matches_binary_search(
            mut timestamps in prop::collection::vec(0i64..10_000, 1..200),
            queries in prop::collection::vec(-100i64..11_000, 1..100),
        ) {
            timestamps.sort_unstable();
            let store = store_with(&timestamps);
            let mut resolver = PositionResolver::new();

            for t in queries {
                let hinted = resolver.resolve(&store, E, t).map(|s| s.timestamp_ms);
                let expected = store.latest_at(E, t).map(|s| s.timestamp_ms);
                prop_assert_eq!(hinted, expected);
            }
        }
    }
}
