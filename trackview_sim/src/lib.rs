//! TrackView Deterministic Simulation Testing (DST) Harness
//!
//! Runs the real replay engine against a seeded, fully reproducible
//! telemetry source and checks the cache invariants after every tick.
//!
//! # Core Principle: Everything From One Seed
//!
//! All sources of non-determinism are intercepted and controlled:
//! - **Time**: Virtual clock advances only when the runner or a fetch says so
//! - **Data**: Samples are a pure function of (seed, entity, timestamp)
//! - **Faults**: Failures, corruption and latency are drawn from the seed
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     ScenarioRunner                       │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │ current-thread runtime + SimContext (virtual clock) │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │         │ tick / seek                  ▲ invariants       │
//! │    ┌────▼─────────┐   fetch    ┌───────┴──────┐          │
//! │    │ ReplayEngine │───────────►│  SimSource   │          │
//! │    └──────────────┘            │ (faults)     │          │
//! │                                └───────┬──────┘          │
//! │                                ┌───────▼──────┐          │
//! │                                │    Oracle    │          │
//! │                                └──────────────┘          │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use trackview_sim::{ScenarioId, ScenarioRunner};
//!
//! let result = ScenarioRunner::new(42).run(ScenarioId::RapidSeek);
//! assert!(result.passed);
//! ```

mod context;
mod exporter;
mod oracle;
mod runner;
pub mod scenarios;
mod source;

pub use context::SimContext;
pub use exporter::{EntityPosition, SimEvent, SimExport, SimFrame};
pub use oracle::{GroundTruthEntity, TelemetryOracle};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner, SimError};
pub use scenarios::ScenarioId;
pub use source::{FaultPlan, SimSource};
