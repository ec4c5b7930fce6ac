//! Telemetry source abstraction for the TrackView engine.

use async_trait::async_trait;
use crate::error::EnvError;
use crate::types::{EntityScope, RawSample, Sample};

/// Abstraction over whatever turns a time range into raw samples.
///
/// # Implementations
///
/// - **Production**: an HTTP client against a telemetry API
/// - **Simulation**: `SimSource`, a seeded generator with fault injection
///
/// # Request Flow
///
/// ```text
/// Engine                     Source                     Upstream
///   |                           |                          |
///   |-- fetch(scope, a, b) ---->|                          |
///   |                           |-- query [a, b) --------->|
///   |                           |<------------ records ----|
///   |<-------- Vec<Sample> -----|                          |
/// ```
#[async_trait]
pub trait SampleSource: Send + Sync + 'static {
    /// Fetches every sample in `scope` with `range_start_ms <= t < range_end_ms`.
    ///
    /// # Arguments
    /// * `scope` - Which entities to include
    /// * `range_start_ms` - Inclusive lower bound (Unix milliseconds)
    /// * `range_end_ms` - Exclusive upper bound (Unix milliseconds)
    ///
    /// # Returns
    /// * `Ok(samples)` - In any order; the engine sorts per entity
    /// * `Err(EnvError::NetworkError)` - Transport failure
    /// * `Err(EnvError::ParseError)` - Malformed payload
    ///
    /// # Idempotence
    /// Must be safe to call again for the same range after a failure.
    async fn fetch_samples(
        &self,
        scope: &EntityScope,
        range_start_ms: i64,
        range_end_ms: i64,
    ) -> Result<Vec<Sample>, EnvError>;
}

/// Decodes a JSON array of wire records into samples.
pub fn parse_samples(payload: &str) -> Result<Vec<Sample>, EnvError> {
    let records: Vec<RawSample> = serde_json::from_str(payload)?;
    Ok(records.into_iter().map(Sample::from).collect())
}
