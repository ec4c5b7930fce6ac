//! Common types for the TrackView environment abstraction.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// Identifier of a tracked entity (a car number in race telemetry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u32);

impl EntityId {
    /// Returns the raw integer id.
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl From<u32> for EntityId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A single spatial sample of one entity.
///
/// Immutable once created: produced by the chunk loader from a source
/// response, owned by the sample store afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Capture time (Unix milliseconds)
    pub timestamp_ms: i64,
    
    /// Entity this sample belongs to
    pub entity_id: EntityId,
    
    /// Position [x, y, z] in source units
    pub position: Vector3<f64>,
}

impl Sample {
    /// Creates a sample from raw coordinates.
    pub fn new(timestamp_ms: i64, entity_id: EntityId, x: f64, y: f64, z: f64) -> Self {
        Self {
            timestamp_ms,
            entity_id,
            position: Vector3::new(x, y, z),
        }
    }
    
    #[inline]
    pub fn x(&self) -> f64 {
        self.position.x
    }
    
    #[inline]
    pub fn y(&self) -> f64 {
        self.position.y
    }
    
    #[inline]
    pub fn z(&self) -> f64 {
        self.position.z
    }
}

/// Which entities a fetch should cover.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityScope {
    /// Every entity the source knows about
    #[default]
    All,
    
    /// Only the listed entities
    Entities(Vec<EntityId>),
}

impl EntityScope {
    /// Returns true if the scope covers the given entity.
    pub fn includes(&self, entity: EntityId) -> bool {
        match self {
            EntityScope::All => true,
            EntityScope::Entities(ids) => ids.contains(&entity),
        }
    }
}

/// Wire record of a location sample as served by telemetry APIs.
///
/// Field names follow the upstream JSON (`driver_number`, `date_ms`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    /// Capture time (Unix milliseconds)
    pub date_ms: i64,
    
    /// Upstream entity number
    pub driver_number: u32,
    
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl From<RawSample> for Sample {
    fn from(raw: RawSample) -> Self {
        Sample::new(raw.date_ms, EntityId(raw.driver_number), raw.x, raw.y, raw.z)
    }
}

impl From<&Sample> for RawSample {
    fn from(sample: &Sample) -> Self {
        Self {
            date_ms: sample.timestamp_ms,
            driver_number: sample.entity_id.0,
            x: sample.x(),
            y: sample.y(),
            z: sample.z(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[test]
    fn test_scope_includes() {
        let all = EntityScope::All;
        let some = EntityScope::Entities(vec![EntityId(1), EntityId(44)]);
        
        assert!(all.includes(EntityId(7)));
        assert!(some.includes(EntityId(44)));
        assert!(!some.includes(EntityId(7)));
    }
    
    #[test]
    fn test_raw_sample_conversion() {
        let raw = RawSample {
            date_ms: 1_700_000_000_123,
            driver_number: 16,
            x: 120.0,
            y: -340.5,
            z: 12.0,
        };
        
        let sample: Sample = raw.clone().into();
        assert_eq!(sample.entity_id, EntityId(16));
        assert_eq!(sample.timestamp_ms, 1_700_000_000_123);
        assert_eq!(sample.y(), -340.5);
        
        assert_eq!(RawSample::from(&sample), raw);
    }
    
    #[test]
    fn test_entity_display() {
        assert_eq!(EntityId(81).to_string(), "#81");
    }
}
