//! Ground truth oracle for simulation.
//!
//! The Oracle is the "recorded event" the engine replays:
//! - Entities lapping an elliptical circuit at individual speeds
//! - Position samples at a fixed per-entity cadence with a phase offset
//! - Measurement noise derived from (seed, entity, timestamp)
//!
//! Every sample is a pure function of its coordinates, so any query range
//! returns exactly the same samples no matter how often or in which order
//! it is asked for. That is what lets the runner compare the cache
//! against the truth window by window.

use nalgebra::Vector3;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use trackview_env::{EntityId, Sample};

/// Semi-axes of the circuit in source units.
const CIRCUIT_A: f64 = 5000.0;
const CIRCUIT_B: f64 = 3000.0;

/// One simulated car.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundTruthEntity {
    pub id: EntityId,

    /// Angle on the circuit at t = 0 (radians)
    pub start_angle: f64,

    /// Angular speed (radians per second)
    pub angular_speed: f64,

    /// Offset of the first sample within a sampling period (ms)
    pub phase_ms: i64,
}

impl GroundTruthEntity {
    /// Noise-free position at `t_ms` (relative to the oracle origin).
    pub fn position_at(&self, t_ms: i64) -> Vector3<f64> {
        let theta = self.start_angle + self.angular_speed * t_ms as f64 / 1000.0;
        Vector3::new(CIRCUIT_A * theta.cos(), CIRCUIT_B * theta.sin(), 0.0)
    }
}

/// The Oracle - deterministic telemetry for a whole session.
pub struct TelemetryOracle {
    /// Seed the entities and noise derive from
    seed: u64,

    /// Unix ms the oracle's time axis starts at
    origin_ms: i64,

    /// Sampling period per entity (ms)
    sample_period_ms: i64,

    /// Position noise standard deviation
    position_noise_std: f64,

    entities: Vec<GroundTruthEntity>,
}

impl TelemetryOracle {
    /// Creates an oracle with `entity_count` cars.
    ///
    /// Car numbers start at 1; speeds vary around a 90 second lap.
    pub fn new(seed: u64, origin_ms: i64, entity_count: u32) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let sample_period_ms = 270;
        let base_speed = std::f64::consts::TAU / 90.0;

        let entities = (1..=entity_count)
            .map(|n| GroundTruthEntity {
                id: EntityId(n),
                start_angle: rng.gen_range(0.0..std::f64::consts::TAU),
                angular_speed: base_speed * rng.gen_range(0.95..1.05),
                phase_ms: rng.gen_range(0..sample_period_ms),
            })
            .collect();

        Self {
            seed,
            origin_ms,
            sample_period_ms,
            position_noise_std: 0.5,
            entities,
        }
    }

    /// Sets the sampling period (default: 270ms).
    pub fn with_sample_period(mut self, period_ms: i64) -> Self {
        self.sample_period_ms = period_ms.max(1);
        for entity in &mut self.entities {
            entity.phase_ms %= self.sample_period_ms;
        }
        self
    }

    /// Sets the position noise standard deviation (default: 0.5).
    pub fn with_noise(mut self, std_dev: f64) -> Self {
        self.position_noise_std = std_dev.max(0.0);
        self
    }

    pub fn entities(&self) -> &[GroundTruthEntity] {
        &self.entities
    }

    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.entities.iter().map(|e| e.id).collect()
    }

    /// Every sample with `start_ms <= t < end_ms`, ordered by time then entity.
    pub fn samples_in(&self, start_ms: i64, end_ms: i64) -> Vec<Sample> {
        let mut samples: Vec<Sample> = self
            .entities
            .iter()
            .flat_map(|entity| {
                self.sample_times(entity, start_ms, end_ms)
                    .map(move |t| self.sample_at(entity, t))
            })
            .collect();
        samples.sort_by_key(|s| (s.timestamp_ms, s.entity_id));
        samples
    }

    /// Number of samples with `start_ms <= t < end_ms`.
    pub fn count_in(&self, start_ms: i64, end_ms: i64) -> usize {
        self.entities
            .iter()
            .map(|entity| self.sample_times(entity, start_ms, end_ms).count())
            .sum()
    }

    /// The latest sample of `entity` at or before `timestamp_ms`, if the
    /// entity had produced any by then.
    pub fn latest_at(&self, entity: EntityId, timestamp_ms: i64) -> Option<Sample> {
        let truth = self.entities.iter().find(|e| e.id == entity)?;
        let first = self.origin_ms + truth.phase_ms;
        if timestamp_ms < first {
            return None;
        }
        let k = (timestamp_ms - first).div_euclid(self.sample_period_ms);
        Some(self.sample_at(truth, first + k * self.sample_period_ms))
    }

    fn sample_times(
        &self,
        entity: &GroundTruthEntity,
        start_ms: i64,
        end_ms: i64,
    ) -> impl Iterator<Item = i64> {
        let period = self.sample_period_ms;
        let first = self.origin_ms + entity.phase_ms;
        let from = start_ms.max(first);
        // First k with first + k * period >= from
        let k0 = (from - first + period - 1).div_euclid(period);
        (k0..)
            .map(move |k| first + k * period)
            .take_while(move |t| *t < end_ms)
    }

    fn sample_at(&self, entity: &GroundTruthEntity, timestamp_ms: i64) -> Sample {
        let truth = entity.position_at(timestamp_ms - self.origin_ms);
        let noise = self.noise(entity.id, timestamp_ms);
        let position = truth + noise;
        Sample::new(timestamp_ms, entity.id, position.x, position.y, position.z)
    }

    /// Per-sample noise, reproducible from its coordinates alone.
    fn noise(&self, entity: EntityId, timestamp_ms: i64) -> Vector3<f64> {
        if self.position_noise_std == 0.0 {
            return Vector3::zeros();
        }
        let key = self.seed
            ^ u64::from(entity.0).wrapping_mul(0x9e3779b97f4a7c15)
            ^ (timestamp_ms as u64).wrapping_mul(0x517cc1b727220a95);
        let mut rng = ChaCha8Rng::seed_from_u64(key);
        match Normal::new(0.0, self.position_noise_std) {
            Ok(normal) => Vector3::new(normal.sample(&mut rng), normal.sample(&mut rng), 0.0),
            Err(_) => Vector3::zeros(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORIGIN: i64 = 1_700_000_000_000;

    #[test]
    fn test_oracle_deterministic() {
        let a = TelemetryOracle::new(42, ORIGIN, 5);
        let b = TelemetryOracle::new(42, ORIGIN, 5);
        assert_eq!(a.samples_in(ORIGIN, ORIGIN + 60_000), b.samples_in(ORIGIN, ORIGIN + 60_000));

        let c = TelemetryOracle::new(43, ORIGIN, 5);
        assert_ne!(a.samples_in(ORIGIN, ORIGIN + 60_000), c.samples_in(ORIGIN, ORIGIN + 60_000));
    }

    #[test]
    fn test_ranges_partition_cleanly() {
        let oracle = TelemetryOracle::new(7, ORIGIN, 20);
        let whole = oracle.samples_in(ORIGIN, ORIGIN + 240_000);

        let mut pieces = Vec::new();
        for w in 0..3 {
            let start = ORIGIN + w * 80_000;
            pieces.extend(oracle.samples_in(start, start + 80_000));
        }
        pieces.sort_by_key(|s| (s.timestamp_ms, s.entity_id));

        assert_eq!(whole, pieces);
        assert_eq!(oracle.count_in(ORIGIN, ORIGIN + 240_000), whole.len());
    }

    #[test]
    fn test_cadence() {
        let oracle = TelemetryOracle::new(1, ORIGIN, 1).with_sample_period(250);
        let samples = oracle.samples_in(ORIGIN, ORIGIN + 10_000);
        assert_eq!(samples.len(), 40);
        for pair in samples.windows(2) {
            assert_eq!(pair[1].timestamp_ms - pair[0].timestamp_ms, 250);
        }
    }

    #[test]
    fn test_latest_at_matches_samples() {
        let oracle = TelemetryOracle::new(3, ORIGIN, 3);
        let samples = oracle.samples_in(ORIGIN, ORIGIN + 5_000);
        let id = EntityId(2);
        let t = ORIGIN + 3_333;

        let expected = samples
            .iter()
            .filter(|s| s.entity_id == id && s.timestamp_ms <= t)
            .last()
            .copied();
        assert_eq!(oracle.latest_at(id, t), expected);
        assert!(oracle.latest_at(id, ORIGIN - 1).is_none());
    }

    #[test]
    fn test_positions_on_circuit() {
        let oracle = TelemetryOracle::new(9, ORIGIN, 4).with_noise(0.0);
        for sample in oracle.samples_in(ORIGIN, ORIGIN + 30_000) {
            let r = (sample.x() / CIRCUIT_A).powi(2) + (sample.y() / CIRCUIT_B).powi(2);
            assert!((r - 1.0).abs() < 1e-9);
        }
    }
}
