//! Scenario runner - executes replay scenarios against the real engine.
//!
//! Each scenario builds a fresh engine over a seeded oracle, drives the
//! playback clock tick by tick on a current-thread runtime, and checks the
//! cache invariants after every tick:
//! - resident samples are exactly the union of loaded windows
//! - the loaded window count never exceeds the budget
//! - resolved positions never come from the future
//! - no two fetches of one window ever overlap

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, info, warn};
use trackview_core::{
    ClockState, EngineConfig, EngineError, EngineNotice, ReplayEngine, TickOutcome, TickSource, WindowState,
};

use crate::context::SimContext;
use crate::exporter::{SimEvent, SimExport, SimFrame};
use crate::oracle::TelemetryOracle;
use crate::scenarios::ScenarioId;
use crate::source::{FaultPlan, SimSource};

/// Unix ms every simulated session starts at.
const SESSION_ORIGIN_MS: i64 = 1_700_000_000_000;

/// Full sample-count comparison runs every this many ticks.
const UNION_CHECK_INTERVAL: u64 = 10;

/// Scheduler turns to wait for outstanding fetches before giving up.
const DRAIN_LIMIT: usize = 100_000;

/// Why a scenario run stopped early.
#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("tick {tick}: {detail}")]
    Invariant { tick: u64, detail: String },

    #[error("runtime setup failed: {0}")]
    Runtime(#[from] std::io::Error),
}

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Total ticks executed
    pub total_ticks: u64,

    /// Cursor when the run ended (ms since session start)
    pub final_cursor_ms: u64,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioMetrics {
    /// Fetches issued by the engine
    pub fetches: u64,

    /// Loads that joined an in-flight fetch
    pub coalesced: u64,

    pub windows_inserted: u64,

    /// Results discarded because the window was no longer needed
    pub stale_discards: u64,

    pub windows_evicted: u64,

    pub failures: u64,

    pub peak_loaded_windows: usize,

    /// Calls observed by the source itself
    pub source_calls: u64,

    /// "Window unavailable" notices received
    pub unavailable_notices: u64,

    /// "Window recovered" notices received
    pub recovered_notices: u64,

    pub seeks: u64,
}

/// Runs replay scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Number of simulated entities
    entities: u32,

    /// Base engine configuration; scenarios override the time step
    config: EngineConfig,

    /// Export a frame every N ticks
    export_interval: Option<u64>,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            entities: 10,
            config: EngineConfig::default(),
            export_interval: None,
        }
    }

    /// Sets the number of entities.
    pub fn with_entities(mut self, entities: u32) -> Self {
        self.entities = entities.max(1);
        self
    }

    /// Sets the base engine configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Records a frame every `interval` ticks.
    pub fn with_export(mut self, interval: u64) -> Self {
        self.export_interval = Some(interval.max(1));
        self
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        self.run_with_export(scenario).0
    }

    /// Runs a scenario, also returning the export if enabled.
    pub fn run_with_export(&self, scenario: ScenarioId) -> (ScenarioResult, Option<SimExport>) {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(e) => return (self.failed(scenario, SimError::Runtime(e)), None),
        };

        runtime.block_on(async {
            let mut harness = None;
            let outcome = self.execute(scenario, &mut harness).await;

            let Some(mut harness) = harness else {
                let err = outcome.err().unwrap_or_else(|| EngineError::NoSession.into());
                return (self.failed(scenario, err), None);
            };

            let metrics = harness.metrics();
            let (passed, failure_reason) = match outcome {
                Ok(()) => (true, None),
                Err(e) => (false, Some(e.to_string())),
            };
            if let Some(reason) = &failure_reason {
                warn!("{} failed at tick {}: {}", scenario.name(), harness.tick, reason);
            }

            let export = harness.export.take().map(|mut export| {
                export.finalize(passed, metrics.clone());
                export
            });
            let result = ScenarioResult {
                scenario,
                seed: self.seed,
                passed,
                total_ticks: harness.tick,
                final_cursor_ms: harness.engine.cursor_ms().unwrap_or(0),
                failure_reason,
                metrics,
            };
            harness.engine.shutdown();
            (result, export)
        })
    }

    fn failed(&self, scenario: ScenarioId, error: SimError) -> ScenarioResult {
        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: false,
            total_ticks: 0,
            final_cursor_ms: 0,
            failure_reason: Some(error.to_string()),
            metrics: ScenarioMetrics::default(),
        }
    }

    async fn execute(&self, scenario: ScenarioId, slot: &mut Option<Harness>) -> Result<(), SimError> {
        match scenario {
            ScenarioId::LinearPlayback => self.run_linear_playback(slot).await,
            ScenarioId::FastForward => self.run_fast_forward(slot).await,
            ScenarioId::RapidSeek => self.run_rapid_seek(slot).await,
            ScenarioId::FlakySource => self.run_flaky_source(slot).await,
            ScenarioId::SlowSource => self.run_slow_source(slot).await,
            ScenarioId::Rewind => self.run_rewind(slot).await,
            ScenarioId::LongHaul => self.run_long_haul(slot).await,
        }
    }

    fn harness<'a>(
        &self,
        slot: &'a mut Option<Harness>,
        scenario: ScenarioId,
        duration_ms: i64,
        time_step_ms: u64,
        faults: FaultPlan,
    ) -> Result<&'a mut Harness, SimError> {
        let config = EngineConfig {
            time_step_ms,
            tick_source: TickSource::External,
            ..self.config.clone()
        };
        let harness = Harness::new(self, scenario, config, duration_ms, faults)?;
        Ok(slot.insert(harness))
    }

    // ========================================================================
    // SCENARIOS
    // ========================================================================

    /// SIM-001: LinearPlayback - healthy source, settle every tick.
    ///
    /// **Assertion**: ends Stopped at the total; each window fetched once;
    /// nothing discarded.
    async fn run_linear_playback(&self, slot: &mut Option<Harness>) -> Result<(), SimError> {
        info!("SIM-001: LinearPlayback");
        let h = self.harness(slot, ScenarioId::LinearPlayback, 20 * 60_000, 1000, FaultPlan::healthy())?;
        h.engine.settle().await?;
        h.engine.play()?;

        h.play_to_end(1, true).await?;

        h.ensure(h.engine.clock_state()? == ClockState::Stopped, "clock still playing at the end")?;
        h.ensure(h.engine.cursor_ms()? == h.engine.total_ms()?, "cursor short of the end")?;

        let metrics = h.engine.metrics()?;
        let windows = h.total_windows()? as u64;
        h.ensure(
            metrics.fetches == windows,
            &format!("{} fetches for {} windows", metrics.fetches, windows),
        )?;
        h.ensure(metrics.stale_discards == 0, "linear playback discarded results")?;

        info!("✓ LinearPlayback: {} ticks, {} fetches", h.tick, metrics.fetches);
        Ok(())
    }

    /// SIM-002: FastForward - the cursor outruns slow fetches.
    ///
    /// **Assertion**: the cursor moves a full step on every tick.
    async fn run_fast_forward(&self, slot: &mut Option<Harness>) -> Result<(), SimError> {
        info!("SIM-002: FastForward");
        let h = self.harness(slot, ScenarioId::FastForward, 20 * 60_000, 20_000, FaultPlan::slow(6))?;
        h.engine.play()?;

        h.play_to_end(2, false).await?;
        h.finish().await?;

        info!("✓ FastForward: {} ticks, {} stale discards", h.tick, h.engine.metrics()?.stale_discards);
        Ok(())
    }

    /// SIM-003: RapidSeek - seek somewhere random every tick.
    ///
    /// **Assertion**: stale results never reach the store; every fetch is
    /// accounted for as inserted, discarded or failed.
    async fn run_rapid_seek(&self, slot: &mut Option<Harness>) -> Result<(), SimError> {
        info!("SIM-003: RapidSeek");
        let h = self.harness(slot, ScenarioId::RapidSeek, 2 * 3_600_000, 1000, FaultPlan::slow(8))?;
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed ^ 0x5eed);
        let total = h.engine.total_ms()?;

        for _ in 0..200 {
            let target = rng.gen_range(0..=total);
            h.seek(target)?;
            h.step(3).await?;
        }
        h.finish().await?;

        info!(
            "✓ RapidSeek: {} seeks, {} stale discards",
            h.seeks,
            h.engine.metrics()?.stale_discards
        );
        Ok(())
    }

    /// SIM-004: FlakySource - random failures, then the source heals.
    ///
    /// **Assertion**: failures surface as notices without stalling the
    /// cursor; retries fill the retention set once the source recovers.
    async fn run_flaky_source(&self, slot: &mut Option<Harness>) -> Result<(), SimError> {
        info!("SIM-004: FlakySource");
        let mut faults = FaultPlan::flaky(0.3);
        faults.scripted_failures.insert(SESSION_ORIGIN_MS, 1);
        let h = self.harness(slot, ScenarioId::FlakySource, 20 * 60_000, 1000, faults)?;
        h.engine.play()?;

        h.play_to_end(1, true).await?;
        h.ensure(h.unavailable > 0, "no failure was surfaced")?;

        h.source.set_faults(FaultPlan::healthy());
        for _ in 0..5 {
            h.engine.retry()?;
            h.engine.settle().await?;
            h.drain_notices();
            if h.engine.get_loading_state().failed_windows.is_empty() {
                break;
            }
        }
        h.finish().await?;

        info!(
            "✓ FlakySource: {} failures, {} notices, {} recovered",
            h.source.failures(),
            h.unavailable,
            h.recovered
        );
        Ok(())
    }

    /// SIM-005: SlowSource - fetches span many ticks.
    ///
    /// **Assertion**: playback advances every tick while data is missing.
    async fn run_slow_source(&self, slot: &mut Option<Harness>) -> Result<(), SimError> {
        info!("SIM-005: SlowSource");
        let h = self.harness(slot, ScenarioId::SlowSource, 10 * 60_000, 1000, FaultPlan::slow(40))?;
        h.engine.play()?;

        let mut saw_gap = false;
        for _ in 0..120 {
            h.step(2).await?;
            let positions = h.engine.get_current_positions()?;
            saw_gap |= positions.is_empty() || positions.values().any(Option::is_none);
        }
        h.ensure(saw_gap, "slow source never left a gap")?;
        h.ensure(h.engine.cursor_ms()? == 120_000, "cursor waited for data")?;
        h.finish().await?;

        info!("✓ SlowSource: {} ticks", h.tick);
        Ok(())
    }

    /// SIM-006: Rewind - play past the middle, seek back to 0.
    ///
    /// **Assertion**: the windows around the old cursor give way to the
    /// new retention set; window 0 is fetched again.
    async fn run_rewind(&self, slot: &mut Option<Harness>) -> Result<(), SimError> {
        info!("SIM-006: Rewind");
        let h = self.harness(slot, ScenarioId::Rewind, 30 * 60_000, 5000, FaultPlan::healthy())?;
        h.engine.settle().await?;
        h.engine.play()?;

        let total = h.engine.total_ms()?;
        while h.engine.cursor_ms()? < total / 2 {
            h.step(1).await?;
            h.engine.settle().await?;
        }

        h.seek(0)?;
        h.finish().await?;

        let lookahead = h.config.lookahead_windows;
        let loaded: Vec<usize> = h.engine.with_cache(|cache| cache.loaded_windows().into_iter().collect())?;
        let expected: Vec<usize> = (0..=lookahead).collect();
        h.ensure(
            loaded == expected,
            &format!("after rewind loaded {:?}, expected {:?}", loaded, expected),
        )?;
        h.ensure(h.source.fetches_of(SESSION_ORIGIN_MS) == 2, "window 0 not refetched")?;

        info!("✓ Rewind: {} evictions", h.engine.metrics()?.windows_evicted);
        Ok(())
    }

    /// SIM-007: LongHaul - a three hour session.
    ///
    /// **Assertion**: residency stays within budget throughout.
    async fn run_long_haul(&self, slot: &mut Option<Harness>) -> Result<(), SimError> {
        info!("SIM-007: LongHaul");
        let h = self.harness(slot, ScenarioId::LongHaul, 3 * 3_600_000, 10_000, FaultPlan::healthy())?;
        h.engine.play()?;

        h.play_to_end(1, true).await?;

        let metrics = h.engine.metrics()?;
        h.ensure(
            metrics.peak_loaded_windows <= h.config.max_loaded_windows,
            &format!("peak residency {} windows", metrics.peak_loaded_windows),
        )?;

        info!(
            "✓ LongHaul: {} windows inserted, {} evicted",
            metrics.windows_inserted, metrics.windows_evicted
        );
        Ok(())
    }
}

// ============================================================================
// HARNESS
// ============================================================================

/// One engine under test plus everything needed to judge it.
struct Harness {
    context: Arc<SimContext>,
    source: Arc<SimSource>,
    engine: ReplayEngine<SimContext, SimSource>,
    notices: broadcast::Receiver<EngineNotice>,
    config: EngineConfig,
    export: Option<SimExport>,
    export_interval: u64,
    pending_events: Vec<SimEvent>,
    tick: u64,
    seeks: u64,
    unavailable: u64,
    recovered: u64,
}

impl Harness {
    fn new(
        runner: &ScenarioRunner,
        scenario: ScenarioId,
        config: EngineConfig,
        duration_ms: i64,
        faults: FaultPlan,
    ) -> Result<Self, SimError> {
        let context = SimContext::shared(runner.seed);
        let physics_seed = runner.seed.wrapping_mul(0x9e3779b97f4a7c15);
        let oracle = Arc::new(TelemetryOracle::new(physics_seed, SESSION_ORIGIN_MS, runner.entities));
        let source = Arc::new(SimSource::new(Arc::clone(&context), oracle, faults));

        let engine = ReplayEngine::new(Arc::clone(&context), Arc::clone(&source), config.clone())?;
        let notices = engine.notices();
        engine.set_session_range(SESSION_ORIGIN_MS, SESSION_ORIGIN_MS + duration_ms)?;

        let mut export = runner.export_interval.map(|_| SimExport::new(scenario.name(), runner.seed));
        if let Some(export) = &mut export {
            export.duration_ms = duration_ms as u64;
        }

        Ok(Self {
            context,
            source,
            engine,
            notices,
            config,
            export,
            export_interval: runner.export_interval.unwrap_or(u64::MAX),
            pending_events: Vec::new(),
            tick: 0,
            seeks: 0,
            unavailable: 0,
            recovered: 0,
        })
    }

    fn total_windows(&self) -> Result<usize, SimError> {
        Ok(self.engine.with_cache(|cache| cache.index().total_windows())?)
    }

    fn ensure(&self, condition: bool, detail: &str) -> Result<(), SimError> {
        if condition {
            Ok(())
        } else {
            Err(SimError::Invariant {
                tick: self.tick,
                detail: detail.to_string(),
            })
        }
    }

    fn seek(&mut self, target_ms: u64) -> Result<(), SimError> {
        self.engine.seek(target_ms)?;
        self.seeks += 1;
        Ok(())
    }

    /// One clock tick, then `polls` scheduler turns for background work.
    async fn step(&mut self, polls: u32) -> Result<TickOutcome, SimError> {
        let before = self.engine.cursor_ms()?;
        self.context.advance_time(self.config.tick_period());
        let outcome = self.engine.tick()?;
        self.tick += 1;

        // The clock never waits for data
        if let TickOutcome::Advanced { time_ms } = outcome {
            let expected = before + self.engine.config().time_step_ms;
            self.ensure(time_ms == expected, &format!("cursor at {} expected {}", time_ms, expected))?;
        }

        for _ in 0..polls {
            tokio::task::yield_now().await;
        }

        self.drain_notices();
        self.check()?;
        self.capture_frame()?;
        Ok(outcome)
    }

    /// Ticks until the clock stops.
    async fn play_to_end(&mut self, polls: u32, settle: bool) -> Result<(), SimError> {
        let step = self.engine.config().time_step_ms.max(1);
        let limit = self.engine.total_ms()? / step + 2;

        for _ in 0..limit {
            let outcome = self.step(polls).await?;
            if settle {
                self.engine.settle().await?;
                self.check()?;
            }
            if matches!(outcome, TickOutcome::Finished { .. }) {
                return Ok(());
            }
        }
        Err(SimError::Invariant {
            tick: self.tick,
            detail: format!("playback did not finish within {} ticks", limit),
        })
    }

    /// Settles, waits out stray fetches, then checks the final state.
    async fn finish(&mut self) -> Result<(), SimError> {
        self.engine.settle().await?;

        let mut turns = 0;
        while self.engine.get_loading_state().is_loading {
            if turns == DRAIN_LIMIT {
                return Err(SimError::Invariant {
                    tick: self.tick,
                    detail: "fetches never completed".to_string(),
                });
            }
            tokio::task::yield_now().await;
            turns += 1;
        }
        self.drain_notices();
        self.check()?;
        self.check_union()?;

        // Every issued fetch ended in exactly one way
        let metrics = self.engine.metrics()?;
        let settled = metrics.windows_inserted + metrics.stale_discards + metrics.failures;
        self.ensure(
            metrics.fetches == settled,
            &format!("{} fetches but {} outcomes", metrics.fetches, settled),
        )?;

        // Retained windows are resident unless their last fetch failed
        let missing: Vec<usize> = self.engine.with_cache(|cache| {
            cache
                .retention()
                .indices()
                .filter(|w| !matches!(cache.state(*w), WindowState::Loaded | WindowState::Failed))
                .collect()
        })?;
        self.ensure(missing.is_empty(), &format!("retained windows {:?} not loaded", missing))
    }

    fn drain_notices(&mut self) {
        loop {
            match self.notices.try_recv() {
                Ok(EngineNotice::WindowUnavailable { window, error }) => {
                    self.unavailable += 1;
                    debug!("  window {} unavailable: {}", window, error);
                    self.pending_events.push(SimEvent {
                        message: format!("window {} unavailable: {}", window, error),
                        level: Some("warn".to_string()),
                    });
                }
                Ok(EngineNotice::WindowRecovered { window }) => {
                    self.recovered += 1;
                    self.pending_events.push(SimEvent {
                        message: format!("window {} recovered", window),
                        level: None,
                    });
                }
                Ok(EngineNotice::WindowAbandoned { window, attempts }) => {
                    self.pending_events.push(SimEvent {
                        message: format!("window {} abandoned after {} attempts", window, attempts),
                        level: Some("error".to_string()),
                    });
                }
                Err(TryRecvError::Lagged(missed)) => {
                    warn!("Missed {} notices", missed);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }

    /// Invariants that must hold after every tick.
    fn check(&self) -> Result<(), SimError> {
        if self.source.duplicate_fetches() > 0 {
            return self.ensure(false, "overlapping fetches of one window");
        }

        let budget = self.config.max_loaded_windows;
        let verdict = self.engine.with_cache(|cache| -> Result<(), String> {
            cache.verify()?;
            if cache.loaded_count() > budget {
                return Err(format!("{} windows loaded, budget {}", cache.loaded_count(), budget));
            }
            Ok(())
        })?;
        if let Err(detail) = verdict {
            return self.ensure(false, &detail);
        }

        if self.tick % UNION_CHECK_INTERVAL == 0 {
            self.check_union()?;
        }
        self.check_positions()
    }

    /// Each loaded window holds exactly the oracle's samples for it.
    fn check_union(&self) -> Result<(), SimError> {
        let oracle = self.source.oracle();
        let mismatch = self.engine.with_cache(|cache| {
            let index = cache.index();
            let mut resident: BTreeMap<usize, usize> = BTreeMap::new();
            for sample in cache.store().iter() {
                *resident.entry(index.window_of(sample.timestamp_ms)).or_insert(0) += 1;
            }

            cache.loaded_windows().into_iter().find_map(|window| {
                let (start, end) = index.window_range(window);
                let expected = oracle.count_in(start, end);
                let actual = resident.get(&window).copied().unwrap_or(0);
                (expected != actual).then(|| format!("window {} holds {} of {} samples", window, actual, expected))
            })
        })?;

        match mismatch {
            Some(detail) => self.ensure(false, &detail),
            None => Ok(()),
        }
    }

    /// Positions come from the past and match the oracle inside the
    /// current window when it is resident.
    fn check_positions(&self) -> Result<(), SimError> {
        let positions = self.engine.get_current_positions()?;
        let cursor = self.engine.cursor_ms()?;
        let oracle = self.source.oracle();

        let (timestamp, window_start, current_loaded, session_end) = self.engine.with_cache(|cache| {
            let index = cache.index();
            let window = index.window_at_offset(cursor);
            (
                index.timestamp_at(cursor),
                index.window_range(window).0,
                cache.state(window) == WindowState::Loaded,
                index.range().end_ms,
            )
        })?;

        for (entity, sample) in &positions {
            if let Some(sample) = sample {
                if sample.timestamp_ms > timestamp {
                    return self.ensure(false, &format!("{} resolved from the future", entity));
                }
            }

            if !current_loaded {
                continue;
            }
            let lookup_ms = timestamp.min(session_end - 1);
            if let Some(truth) = oracle.latest_at(*entity, lookup_ms) {
                if truth.timestamp_ms >= window_start && sample.as_ref() != Some(&truth) {
                    return self.ensure(false, &format!("{} resolved {:?}, truth {:?}", entity, sample, truth));
                }
            }
        }
        Ok(())
    }

    fn capture_frame(&mut self) -> Result<(), SimError> {
        if self.tick % self.export_interval != 0 {
            return Ok(());
        }
        let Some(export) = self.export.as_mut() else {
            return Ok(());
        };

        let positions = self.engine.get_current_positions()?;
        let loaded = self.engine.with_cache(|cache| cache.loaded_windows().into_iter().collect())?;
        let loading = self.engine.get_loading_state();
        let mut frame = SimFrame::capture(self.engine.cursor_ms()?, &positions, loaded, &loading);
        frame.events = std::mem::take(&mut self.pending_events);
        export.add_frame(frame);

        if export.bounds.is_none() && !positions.is_empty() {
            export.bounds = Some(self.engine.bounds()?);
            export.outline = self
                .engine
                .track_outline(None)?
                .iter()
                .map(|p| [p.x, p.y])
                .collect();
        }
        Ok(())
    }

    fn metrics(&self) -> ScenarioMetrics {
        let cache = self.engine.metrics().unwrap_or_default();
        ScenarioMetrics {
            fetches: cache.fetches,
            coalesced: cache.coalesced,
            windows_inserted: cache.windows_inserted,
            stale_discards: cache.stale_discards,
            windows_evicted: cache.windows_evicted,
            failures: cache.failures,
            peak_loaded_windows: cache.peak_loaded_windows,
            source_calls: self.source.calls(),
            unavailable_notices: self.unavailable,
            recovered_notices: self.recovered,
            seeks: self.seeks,
        }
    }
}
