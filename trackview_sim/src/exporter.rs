//! JSON exporter for replay visualization.
//!
//! Exports sampled frames of a scenario run (cursor, resolved positions,
//! cache residency) plus the circuit outline, for offline plotting.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use trackview_core::{format_duration, Bounds, LoadingState};
use trackview_env::{EntityId, Sample};

use crate::runner::ScenarioMetrics;

/// A single frame of a replay run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimFrame {
    /// Cursor in ms since session start
    pub cursor_ms: u64,

    /// Cursor as shown to a user (m:ss / h:mm:ss)
    pub cursor_label: String,

    /// Last known position per entity; absent entities are omitted
    pub positions: Vec<EntityPosition>,

    /// Windows resident at this frame
    pub loaded_windows: Vec<usize>,

    pub loading: bool,

    /// Notable events since the previous frame
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<SimEvent>,
}

impl SimFrame {
    /// Builds a frame from engine query results.
    pub fn capture(
        cursor_ms: u64,
        positions: &BTreeMap<EntityId, Option<Sample>>,
        loaded_windows: Vec<usize>,
        loading: &LoadingState,
    ) -> Self {
        Self {
            cursor_ms,
            cursor_label: format_duration(cursor_ms),
            positions: positions
                .values()
                .flatten()
                .map(EntityPosition::from)
                .collect(),
            loaded_windows,
            loading: loading.is_loading,
            events: Vec::new(),
        }
    }
}

/// Position of an entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityPosition {
    pub id: u32,
    pub timestamp_ms: i64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl From<&Sample> for EntityPosition {
    fn from(sample: &Sample) -> Self {
        Self {
            id: sample.entity_id.as_u32(),
            timestamp_ms: sample.timestamp_ms,
            x: sample.x(),
            y: sample.y(),
            z: sample.z(),
        }
    }
}

/// Simulation event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimEvent {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

/// Complete simulation export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimExport {
    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    /// Session duration in ms
    pub duration_ms: u64,

    /// Approximate XY extent of the replayed data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Bounds>,

    /// Downsampled circuit path
    pub outline: Vec<[f64; 2]>,

    /// All frames
    pub frames: Vec<SimFrame>,

    /// Final results
    pub passed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ScenarioMetrics>,
}

impl SimExport {
    /// Creates a new export container.
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            duration_ms: 0,
            bounds: None,
            outline: Vec::new(),
            frames: Vec::new(),
            passed: false,
            metrics: None,
        }
    }

    /// Adds a frame.
    pub fn add_frame(&mut self, frame: SimFrame) {
        self.frames.push(frame);
    }

    /// Finalizes the export.
    pub fn finalize(&mut self, passed: bool, metrics: ScenarioMetrics) {
        self.passed = passed;
        self.metrics = Some(metrics);
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: &str) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}
