//! Replay Engine - the consumer-facing facade.
//!
//! Wires the playback clock, prefetch scheduler and position resolver to
//! one session's window cache, and owns the background tasks.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        ReplayEngine                          │
//! │                                                              │
//! │  play/pause/seek/reset ──► PlaybackClock ──► cursor window   │
//! │        ▲                                          │          │
//! │  timer task (Timer)                      retarget + publish  │
//! │  or host tick() (External)                        ▼          │
//! │                              PrefetchScheduler task (latest  │
//! │                              wins) ──► ChunkLoader ──► fetch │
//! │                                                   │          │
//! │  get_current_positions ◄── PositionResolver ◄── WindowCache  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use trackview_core::{EngineConfig, ReplayEngine};
//! use trackview_env::TokioContext;
//!
//! let engine = ReplayEngine::new(TokioContext::shared(), source, EngineConfig::default())?;
//! engine.set_session_range(start_ms, end_ms)?;
//! engine.play()?;
//!
//! // Once per rendered frame
//! let positions = engine.get_current_positions()?;
//! ```
//!
//! Lock order: engine state, then cache, then the loader's in-flight map.
//! Background fetch tasks only ever take the latter two.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info};
use trackview_env::{EntityId, ReplayContext, Sample, SampleSource};

use crate::bounds::{self, Bounds, DEFAULT_OUTLINE_POINTS};
use crate::cache::{lock, WindowCache};
use crate::chunk_loader::{ChunkLoader, EngineNotice};
use crate::config::{EngineConfig, TickSource};
use crate::error::EngineError;
use crate::metrics::CacheMetrics;
use crate::playback::{ClockState, PlaybackClock, TickOutcome};
use crate::prefetch::{CursorTarget, PrefetchScheduler};
use crate::resolver::PositionResolver;
use crate::window_index::{SessionRange, WindowIndex};

/// Capacity of the notice channel; slow subscribers lag, never block.
const NOTICE_CAPACITY: usize = 64;

/// Snapshot answering "is anything still loading?".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadingState {
    pub is_loading: bool,
    pub loaded_window_count: usize,
    /// Windows whose last fetch failed
    pub failed_windows: Vec<usize>,
}

/// Everything tied to one session range.
struct Session<Ctx, Src>
where
    Ctx: ReplayContext,
    Src: SampleSource,
{
    index: WindowIndex,
    clock: PlaybackClock,
    scheduler: PrefetchScheduler<Ctx, Src>,
    cursor: watch::Sender<CursorTarget>,
    scheduler_task: AbortHandle,
    resolver: PositionResolver,
}

impl<Ctx, Src> Session<Ctx, Src>
where
    Ctx: ReplayContext,
    Src: SampleSource,
{
    fn current_window(&self) -> usize {
        self.index.window_at_offset(self.clock.time_ms())
    }

    /// Hands the cursor's window to the scheduler if it changed.
    ///
    /// Retention moves synchronously so in-flight completions already see
    /// the new set; the pass itself runs on the scheduler task.
    fn publish_cursor(&self, force: bool) {
        let window = self.current_window();
        if !force && self.cursor.borrow().window == window {
            return;
        }
        self.scheduler.retarget(window);
        self.cursor.send_modify(|target| {
            target.epoch += 1;
            target.window = window;
        });
    }

    fn teardown(&self) {
        self.scheduler_task.abort();
        self.scheduler.loader().abort_all();
    }
}

struct EngineState<Ctx, Src>
where
    Ctx: ReplayContext,
    Src: SampleSource,
{
    session: Option<Session<Ctx, Src>>,
    ticker: Option<AbortHandle>,
}

impl<Ctx, Src> EngineState<Ctx, Src>
where
    Ctx: ReplayContext,
    Src: SampleSource,
{
    fn session(&self) -> Result<&Session<Ctx, Src>, EngineError> {
        self.session.as_ref().ok_or(EngineError::NoSession)
    }

    fn session_mut(&mut self) -> Result<&mut Session<Ctx, Src>, EngineError> {
        self.session.as_mut().ok_or(EngineError::NoSession)
    }

    fn stop_ticker(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }
}

struct Inner<Ctx, Src>
where
    Ctx: ReplayContext,
    Src: SampleSource,
{
    context: Arc<Ctx>,
    source: Arc<Src>,
    config: EngineConfig,
    notices: broadcast::Sender<EngineNotice>,
    state: Mutex<EngineState<Ctx, Src>>,
}

impl<Ctx, Src> Drop for Inner<Ctx, Src>
where
    Ctx: ReplayContext,
    Src: SampleSource,
{
    fn drop(&mut self) {
        let state = lock(&self.state);
        if let Some(ticker) = &state.ticker {
            ticker.abort();
        }
        if let Some(session) = &state.session {
            session.teardown();
        }
    }
}

/// Windowed telemetry replay over one session range at a time.
///
/// Cheap to clone; clones share the same engine. Dropping the last
/// handle cancels the timer and every background task.
pub struct ReplayEngine<Ctx, Src>
where
    Ctx: ReplayContext,
    Src: SampleSource,
{
    inner: Arc<Inner<Ctx, Src>>,
}

impl<Ctx, Src> Clone for ReplayEngine<Ctx, Src>
where
    Ctx: ReplayContext,
    Src: SampleSource,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Ctx, Src> ReplayEngine<Ctx, Src>
where
    Ctx: ReplayContext,
    Src: SampleSource,
{
    /// Creates an engine with no session.
    ///
    /// # Errors
    /// `EngineError::Configuration` if `config` is inconsistent.
    pub fn new(context: Arc<Ctx>, source: Arc<Src>, config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);

        Ok(Self {
            inner: Arc::new(Inner {
                context,
                source,
                config,
                notices,
                state: Mutex::new(EngineState {
                    session: None,
                    ticker: None,
                }),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Subscribes to failure/recovery notices.
    pub fn notices(&self) -> broadcast::Receiver<EngineNotice> {
        self.inner.notices.subscribe()
    }

    // ========================================================================
    // SESSION
    // ========================================================================

    /// Starts a new session, discarding the previous one entirely.
    ///
    /// The cursor starts stopped at 0 and the first windows begin loading.
    ///
    /// # Errors
    /// `EngineError::InvalidRange` if `end_ms <= start_ms`; the current
    /// session is left untouched in that case.
    pub fn set_session_range(&self, start_ms: i64, end_ms: i64) -> Result<(), EngineError> {
        let range = SessionRange::new(start_ms, end_ms)?;
        let config = &self.inner.config;
        let mut state = lock(&self.inner.state);

        state.stop_ticker();
        if let Some(previous) = state.session.take() {
            previous.teardown();
        }

        let index = WindowIndex::new(range, config.window_spec());
        let cache = Arc::new(Mutex::new(WindowCache::new(
            index,
            config.lookahead_windows,
            config.max_loaded_windows,
        )));
        let loader = ChunkLoader::new(
            Arc::clone(&self.inner.context),
            Arc::clone(&self.inner.source),
            config.entity_scope.clone(),
            cache,
            self.inner.notices.clone(),
            config.max_fetch_attempts,
        );
        let scheduler = PrefetchScheduler::new(loader, config.max_fetch_attempts);
        scheduler.retarget(0);

        let (cursor, cursor_rx) = watch::channel(CursorTarget { epoch: 1, window: 0 });
        let scheduler_task = self
            .inner
            .context
            .spawn("prefetch-scheduler", scheduler.clone().run(cursor_rx));

        info!(
            "Session [{}, {}): {} windows of {}s",
            start_ms,
            end_ms,
            index.total_windows(),
            config.window_duration_secs
        );

        state.session = Some(Session {
            index,
            clock: PlaybackClock::new(range.duration_ms(), config.time_step_ms),
            scheduler,
            cursor,
            scheduler_task,
            resolver: PositionResolver::new(),
        });
        Ok(())
    }

    pub fn session_range(&self) -> Option<SessionRange> {
        lock(&self.inner.state).session.as_ref().map(|s| s.index.range())
    }

    // ========================================================================
    // PLAYBACK
    // ========================================================================

    /// Starts playback. Returns false if already playing or at the end.
    pub fn play(&self) -> Result<bool, EngineError> {
        let mut state = lock(&self.inner.state);
        let session = state.session_mut()?;
        if !session.clock.play() {
            return Ok(false);
        }
        let epoch = session.clock.epoch();

        if self.inner.config.tick_source == TickSource::Timer {
            state.stop_ticker();
            state.ticker = Some(self.spawn_ticker(epoch));
        }
        debug!("Playback started (epoch {})", epoch);
        Ok(true)
    }

    /// Stops playback and cancels the timer. Returns false if not playing.
    pub fn pause(&self) -> Result<bool, EngineError> {
        let mut state = lock(&self.inner.state);
        state.stop_ticker();
        Ok(state.session_mut()?.clock.pause())
    }

    /// Moves the cursor to `time_ms` since session start; always stops.
    ///
    /// # Errors
    /// `EngineError::SeekOutOfRange` if `time_ms` exceeds the session
    /// duration. The cursor and play state are unchanged.
    pub fn seek(&self, time_ms: u64) -> Result<u64, EngineError> {
        let mut state = lock(&self.inner.state);
        let total_ms = state.session()?.clock.total_ms();
        if time_ms > total_ms {
            return Err(EngineError::SeekOutOfRange {
                target_ms: time_ms,
                total_ms,
            });
        }

        state.stop_ticker();
        let session = state.session_mut()?;
        let position = session.clock.seek(time_ms);
        session.publish_cursor(false);
        debug!("Seek to {}ms (window {})", position, session.current_window());
        Ok(position)
    }

    /// Stops and rewinds to 0.
    pub fn reset(&self) -> Result<(), EngineError> {
        let mut state = lock(&self.inner.state);
        state.stop_ticker();
        let session = state.session_mut()?;
        session.clock.reset();
        session.publish_cursor(false);
        Ok(())
    }

    /// Advances the clock by one step.
    ///
    /// Called by the timer task, or by the host with `TickSource::External`.
    pub fn tick(&self) -> Result<TickOutcome, EngineError> {
        let mut state = lock(&self.inner.state);
        let session = state.session_mut()?;
        let outcome = session.clock.tick();
        if outcome != TickOutcome::Idle {
            session.publish_cursor(false);
        }
        if let TickOutcome::Finished { time_ms } = outcome {
            info!("Playback reached the end at {}ms", time_ms);
            state.stop_ticker();
        }
        Ok(outcome)
    }

    /// Changes playback speed without touching the tick period.
    pub fn set_time_step(&self, step_ms: u64) -> Result<(), EngineError> {
        lock(&self.inner.state).session_mut()?.clock.set_step(step_ms);
        Ok(())
    }

    /// Requests a fresh scheduling pass at the current cursor.
    ///
    /// Failed retention windows get their attempt counts reset first, so
    /// windows past `max_fetch_attempts` are requested again too.
    pub fn retry(&self) -> Result<(), EngineError> {
        let state = lock(&self.inner.state);
        let session = state.session()?;
        let reset = lock(session.scheduler.loader().cache()).clear_failures();
        if !reset.is_empty() {
            debug!("Retrying windows {:?}", reset);
        }
        session.publish_cursor(true);
        Ok(())
    }

    fn spawn_ticker(&self, epoch: u64) -> AbortHandle {
        let weak: Weak<Inner<Ctx, Src>> = Arc::downgrade(&self.inner);
        let context = Arc::clone(&self.inner.context);
        let period = self.inner.config.tick_period();

        self.inner.context.spawn("playback-timer", async move {
            loop {
                context.sleep(period).await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let engine = ReplayEngine { inner };
                if !engine.timer_tick(epoch) {
                    break;
                }
            }
        })
    }

    /// One timer tick; false once the timer should stop.
    fn timer_tick(&self, epoch: u64) -> bool {
        let mut state = lock(&self.inner.state);
        let Some(session) = state.session.as_mut() else {
            return false;
        };
        // A pause/seek/play since this timer started makes it stale
        if session.clock.epoch() != epoch {
            return false;
        }
        match session.clock.tick() {
            TickOutcome::Advanced { .. } => {
                session.publish_cursor(false);
                true
            }
            TickOutcome::Finished { time_ms } => {
                session.publish_cursor(false);
                info!("Playback reached the end at {}ms", time_ms);
                state.ticker = None;
                false
            }
            TickOutcome::Idle => false,
        }
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    /// Cursor in ms since session start.
    pub fn cursor_ms(&self) -> Result<u64, EngineError> {
        Ok(lock(&self.inner.state).session()?.clock.time_ms())
    }

    pub fn total_ms(&self) -> Result<u64, EngineError> {
        Ok(lock(&self.inner.state).session()?.clock.total_ms())
    }

    pub fn clock_state(&self) -> Result<ClockState, EngineError> {
        Ok(lock(&self.inner.state).session()?.clock.state())
    }

    /// Window under the cursor.
    pub fn current_window(&self) -> Result<usize, EngineError> {
        Ok(lock(&self.inner.state).session()?.current_window())
    }

    /// Last known position of every entity seen this session.
    ///
    /// Entities with nothing resident at or before the cursor map to `None`.
    pub fn get_current_positions(&self) -> Result<BTreeMap<EntityId, Option<Sample>>, EngineError> {
        let mut state = lock(&self.inner.state);
        let session = state.session_mut()?;
        let timestamp = session.index.timestamp_at(session.clock.time_ms());

        let cache_handle = Arc::clone(session.scheduler.loader().cache());
        let cache = lock(&cache_handle);
        let entities: Vec<EntityId> = cache.known_entities().iter().copied().collect();
        Ok(session.resolver.resolve_all(cache.store(), entities, timestamp))
    }

    /// Loading summary; empty without a session.
    pub fn get_loading_state(&self) -> LoadingState {
        self.with_cache(|cache| LoadingState {
            is_loading: cache.loading_count() > 0,
            loaded_window_count: cache.loaded_count(),
            failed_windows: cache.failed_windows(),
        })
        .unwrap_or_default()
    }

    /// Counters for the current session.
    pub fn metrics(&self) -> Result<CacheMetrics, EngineError> {
        self.with_cache(|cache| cache.metrics().clone())
    }

    /// Approximate XY bounds of resident samples.
    pub fn bounds(&self) -> Result<Bounds, EngineError> {
        let target = self.inner.config.bounds_sample_target;
        self.with_cache(|cache| bounds::estimate_bounds(cache.store(), target))
    }

    /// Downsampled path of one entity (first resident one by default).
    pub fn track_outline(&self, entity: Option<EntityId>) -> Result<Vec<Vector2<f64>>, EngineError> {
        self.with_cache(|cache| bounds::track_outline(cache.store(), entity, DEFAULT_OUTLINE_POINTS))
    }

    /// Runs `f` against the current session's cache under its lock.
    pub fn with_cache<R>(&self, f: impl FnOnce(&WindowCache) -> R) -> Result<R, EngineError> {
        let state = lock(&self.inner.state);
        let cache = lock(state.session()?.scheduler.loader().cache());
        Ok(f(&cache))
    }

    /// Waits until a scheduling pass for the latest cursor has completed.
    pub async fn settle(&self) -> Result<(), EngineError> {
        let (mut settled, target) = {
            let state = lock(&self.inner.state);
            let session = state.session()?;
            let target = session.cursor.borrow().epoch;
            (session.scheduler.subscribe_settled(), target)
        };

        settled
            .wait_for(|epoch| *epoch >= target)
            .await
            .map(|_| ())
            .map_err(|_| EngineError::NoSession)
    }

    /// Cancels the timer and every background task; drops the session.
    pub fn shutdown(&self) {
        let mut state = lock(&self.inner.state);
        state.stop_ticker();
        if let Some(session) = state.session.take() {
            session.teardown();
            info!("Engine shut down");
        }
    }
}
