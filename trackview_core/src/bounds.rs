//! Bounds estimation over resident samples.
//!
//! Exact bounds would cost a pass over every resident sample per frame.
//! These helpers use fixed-size deterministic subsampling instead: with a
//! stride of `max(1, len / target)` the work is bounded by roughly
//! `target` samples regardless of how much is loaded. The result only
//! drives a display scale factor, so an approximation is acceptable.

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use trackview_env::EntityId;

use crate::sample_store::SampleStore;

/// Samples inspected by [`estimate_bounds`] (default: 1000).
pub const DEFAULT_BOUNDS_TARGET: usize = 1000;

/// Points kept by [`track_outline`] (default: 500).
pub const DEFAULT_OUTLINE_POINTS: usize = 500;

/// Axis-aligned XY bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
}

impl Default for Bounds {
    /// Placeholder used while nothing is resident.
    fn default() -> Self {
        Self {
            min_x: 0.0,
            max_x: 1000.0,
            min_y: 0.0,
            max_y: 1000.0,
        }
    }
}

impl Bounds {
    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    /// Maps a point into `[0, 1]²` relative to these bounds.
    ///
    /// Degenerate axes (zero extent) map to 0.5.
    pub fn normalize(&self, x: f64, y: f64) -> Vector2<f64> {
        let axis = |v: f64, min: f64, extent: f64| {
            if extent > f64::EPSILON {
                (v - min) / extent
            } else {
                0.5
            }
        };
        Vector2::new(
            axis(x, self.min_x, self.width()),
            axis(y, self.min_y, self.height()),
        )
    }

    fn include(&mut self, x: f64, y: f64) {
        self.min_x = self.min_x.min(x);
        self.max_x = self.max_x.max(x);
        self.min_y = self.min_y.min(y);
        self.max_y = self.max_y.max(y);
    }

    fn empty() -> Self {
        Self {
            min_x: f64::INFINITY,
            max_x: f64::NEG_INFINITY,
            min_y: f64::INFINITY,
            max_y: f64::NEG_INFINITY,
        }
    }
}

/// Subsampling stride for `len` items and a `target` count.
pub fn stride(len: usize, target: usize) -> usize {
    (len / target.max(1)).max(1)
}

/// Approximate XY bounds of every resident sample.
///
/// Returns [`Bounds::default`] when the store is empty.
pub fn estimate_bounds(store: &SampleStore, target: usize) -> Bounds {
    if store.is_empty() {
        return Bounds::default();
    }

    let step = stride(store.len(), target);
    let mut bounds = Bounds::empty();
    for sample in store.iter().step_by(step) {
        bounds.include(sample.x(), sample.y());
    }
    bounds
}

/// Downsampled XY path of one entity, for drawing the circuit.
///
/// Uses the lowest-numbered resident entity when `entity` is `None`.
pub fn track_outline(
    store: &SampleStore,
    entity: Option<EntityId>,
    max_points: usize,
) -> Vec<Vector2<f64>> {
    let Some(entity) = entity.or_else(|| store.entities().next()) else {
        return Vec::new();
    };

    let series = store.samples_for(entity);
    let step = stride(series.len(), max_points);
    series
        .iter()
        .step_by(step)
        .map(|s| Vector2::new(s.x(), s.y()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use trackview_env::Sample;

    fn ring(entity: u32, count: usize) -> Vec<Sample> {
        (0..count)
            .map(|i| {
                let theta = i as f64 / count as f64 * std::f64::consts::TAU;
                Sample::new(i as i64, EntityId(entity), 500.0 * theta.cos(), 300.0 * theta.sin(), 0.0)
            })
            .collect()
    }

    #[test]
    fn test_stride() {
        assert_eq!(stride(0, 1000), 1);
        assert_eq!(stride(999, 1000), 1);
        assert_eq!(stride(2500, 1000), 2);
        assert_eq!(stride(120_000, 1000), 120);
    }

    #[test]
    fn test_empty_store_default_bounds() {
        let store = SampleStore::new();
        assert_eq!(estimate_bounds(&store, DEFAULT_BOUNDS_TARGET), Bounds::default());
        assert!(track_outline(&store, None, DEFAULT_OUTLINE_POINTS).is_empty());
    }

    #[test]
    fn test_small_store_exact() {
        let mut store = SampleStore::new();
        store.insert(ring(1, 400));
        let bounds = estimate_bounds(&store, DEFAULT_BOUNDS_TARGET);

        assert_relative_eq!(bounds.max_x, 500.0, epsilon = 1e-9);
        assert_relative_eq!(bounds.min_y, -300.0, epsilon = 1e-3);
    }

    #[test]
    fn test_large_store_approximate() {
        let mut store = SampleStore::new();
        store.insert(ring(1, 50_000));
        let bounds = estimate_bounds(&store, DEFAULT_BOUNDS_TARGET);

        // Subsampled, so within one stride of the true extremes
        assert_relative_eq!(bounds.max_x, 500.0, epsilon = 1.0);
        assert_relative_eq!(bounds.min_x, -500.0, epsilon = 1.0);
        assert_relative_eq!(bounds.max_y, 300.0, epsilon = 1.0);
    }

    #[test]
    fn test_normalize() {
        let bounds = Bounds { min_x: -100.0, max_x: 100.0, min_y: 0.0, max_y: 0.0 };
        let p = bounds.normalize(50.0, 10.0);
        assert_relative_eq!(p.x, 0.75);
        assert_relative_eq!(p.y, 0.5);
    }

    #[test]
    fn test_outline_uses_first_entity() {
        let mut store = SampleStore::new();
        store.insert(ring(16, 100));
        store.insert(ring(3, 2000));

        let outline = track_outline(&store, None, DEFAULT_OUTLINE_POINTS);
        assert_eq!(outline.len(), 500);
        assert_relative_eq!(outline[0].x, 500.0);

        let explicit = track_outline(&store, Some(EntityId(16)), DEFAULT_OUTLINE_POINTS);
        assert_eq!(explicit.len(), 100);
    }
}
