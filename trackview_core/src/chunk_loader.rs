//! Chunk Loader - fetches one window at a time with request coalescing.
//!
//! At most one fetch per window is ever in flight. The first caller for a
//! window spawns the fetch as its own task; later callers subscribe to the
//! same result instead of fetching again.
//!
//! ```text
//! load(w) ──► in_flight[w]? ──yes──► await shared result (coalesced)
//!                 │
//!                 no
//!                 ▼
//!        begin_load(w), spawn fetch task ──► source.fetch_samples(w)
//!                                                   │
//!                     complete_load / fail_load ◄───┘  (under cache lock)
//!                                 │
//!                     publish result to every waiter
//! ```
//!
//! Because the fetch runs in its own task, a caller that stops waiting
//! (a superseded scheduling pass) does not cancel it. Relevance is checked
//! at completion: results for windows outside the retention set are
//! discarded instead of inserted, and waiters get `FetchError::Stale`.
//!
//! The fetch task is spawned only after both locks are released; a
//! runtime that drops the future inside `spawn` runs `FlightGuard::drop`
//! on this thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use trackview_env::{EntityScope, EnvError, ReplayContext, Sample, SampleSource};

use crate::cache::{lock, Disposition, SharedCache, WindowState};
use crate::error::FetchError;

/// What every waiter on a window receives.
pub type LoadResult = Result<Arc<[Sample]>, FetchError>;

/// Non-fatal events surfaced to the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineNotice {
    /// First failure of a window since it last loaded (stall indicator)
    WindowUnavailable { window: usize, error: EnvError },

    /// A previously failed window loaded successfully
    WindowRecovered { window: usize },

    /// The window hit the retry limit; the scheduler stops requesting it
    WindowAbandoned { window: usize, attempts: u32 },
}

/// One in-flight fetch.
struct Flight {
    /// Distinguishes successive flights of the same window
    id: u64,
    result: watch::Receiver<Option<LoadResult>>,
    /// Set once the fetch task has been spawned
    task: Option<AbortHandle>,
    /// `abort_all` ran before the task was attached
    cancelled: bool,
}

/// Lock order: cache first, then the in-flight map.
type FlightMap = Arc<Mutex<HashMap<usize, Flight>>>;

/// Fetches windows from a [`SampleSource`] into the shared cache.
pub struct ChunkLoader<Ctx, Src>
where
    Ctx: ReplayContext,
    Src: SampleSource,
{
    context: Arc<Ctx>,
    source: Arc<Src>,
    scope: EntityScope,
    cache: SharedCache,
    in_flight: FlightMap,
    next_flight: Arc<AtomicU64>,
    notices: broadcast::Sender<EngineNotice>,
    max_attempts: Option<u32>,
}

impl<Ctx, Src> Clone for ChunkLoader<Ctx, Src>
where
    Ctx: ReplayContext,
    Src: SampleSource,
{
    fn clone(&self) -> Self {
        Self {
            context: Arc::clone(&self.context),
            source: Arc::clone(&self.source),
            scope: self.scope.clone(),
            cache: Arc::clone(&self.cache),
            in_flight: Arc::clone(&self.in_flight),
            next_flight: Arc::clone(&self.next_flight),
            notices: self.notices.clone(),
            max_attempts: self.max_attempts,
        }
    }
}

impl<Ctx, Src> ChunkLoader<Ctx, Src>
where
    Ctx: ReplayContext,
    Src: SampleSource,
{
    /// Creates a loader writing into `cache`.
    ///
    /// # Arguments
    /// * `context` - Spawns the fetch tasks
    /// * `source` - Upstream telemetry
    /// * `scope` - Entities requested with every fetch
    /// * `cache` - Destination of loaded windows
    /// * `notices` - Channel for failure/recovery notices
    /// * `max_attempts` - Failures after which a window is abandoned
    pub fn new(
        context: Arc<Ctx>,
        source: Arc<Src>,
        scope: EntityScope,
        cache: SharedCache,
        notices: broadcast::Sender<EngineNotice>,
        max_attempts: Option<u32>,
    ) -> Self {
        Self {
            context,
            source,
            scope,
            cache,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_flight: Arc::new(AtomicU64::new(0)),
            notices,
            max_attempts,
        }
    }

    /// The cache this loader fills.
    pub fn cache(&self) -> &SharedCache {
        &self.cache
    }

    /// Number of fetches currently in flight.
    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Loads one window, joining an in-flight fetch if there is one.
    ///
    /// # Returns
    /// * `Ok(samples)` - The window's samples (already resident, or just fetched)
    /// * `Err(FetchError::Stale)` - Fetched, but the window was no longer retained
    /// * `Err(FetchError)` - The fetch failed or was abandoned
    pub async fn load(&self, window: usize) -> LoadResult {
        let (mut result, pending) = {
            let mut cache = lock(&self.cache);
            if window >= cache.index().total_windows() {
                return Err(FetchError::OutOfRange(window));
            }
            if cache.state(window) == WindowState::Loaded {
                return Ok(cache.window_samples(window).into());
            }

            let mut flights = lock(&self.in_flight);
            match flights.get(&window) {
                Some(flight) => {
                    cache.record_coalesced();
                    debug!("Joining in-flight fetch for window {}", window);
                    (flight.result.clone(), None)
                }
                None => {
                    cache.begin_load(window);
                    let (start_ms, end_ms) = cache.index().window_range(window);
                    let (tx, rx) = watch::channel(None);
                    let id = self.next_flight.fetch_add(1, Ordering::Relaxed);

                    let guard = FlightGuard {
                        window,
                        cache: Arc::clone(&self.cache),
                        in_flight: Arc::clone(&self.in_flight),
                        notices: self.notices.clone(),
                        max_attempts: self.max_attempts,
                        result: Some(tx),
                    };

                    debug!("Fetching window {} [{}, {})", window, start_ms, end_ms);
                    flights.insert(
                        window,
                        Flight {
                            id,
                            result: rx.clone(),
                            task: None,
                            cancelled: false,
                        },
                    );
                    (rx, Some((id, guard, start_ms, end_ms)))
                }
            }
        };

        if let Some((id, guard, start_ms, end_ms)) = pending {
            self.spawn_fetch(window, id, guard, start_ms, end_ms);
        }

        let outcome = match result.wait_for(Option::is_some).await {
            Ok(outcome) => outcome
                .clone()
                .unwrap_or(Err(FetchError::Abandoned(window))),
            Err(_) => Err(FetchError::Abandoned(window)),
        };
        outcome
    }

    /// Spawns the fetch for a flight registered by `load`. No locks held.
    fn spawn_fetch(&self, window: usize, id: u64, guard: FlightGuard, start_ms: i64, end_ms: i64) {
        let source = Arc::clone(&self.source);
        let scope = self.scope.clone();
        let task = self.context.spawn(&format!("fetch-window-{}", window), async move {
            let fetched = source.fetch_samples(&scope, start_ms, end_ms).await;
            guard.finish(fetched);
        });

        // The flight may already be gone, or replaced by a newer one
        let cancelled = {
            let mut flights = lock(&self.in_flight);
            match flights.get_mut(&window).filter(|f| f.id == id) {
                Some(flight) => {
                    flight.task = Some(task.clone());
                    flight.cancelled
                }
                None => false,
            }
        };
        if cancelled {
            task.abort();
        }
    }

    /// Aborts every in-flight fetch. Their windows roll back to `NotLoaded`.
    pub fn abort_all(&self) {
        let tasks: Vec<AbortHandle> = {
            let mut flights = lock(&self.in_flight);
            flights
                .values_mut()
                .filter_map(|flight| {
                    flight.cancelled = true;
                    flight.task.clone()
                })
                .collect()
        };
        for task in tasks {
            task.abort();
        }
    }
}

/// Owns the result sender of one fetch task.
///
/// Dropped without `finish` (task aborted or runtime torn down), it rolls
/// the window back and resolves waiters with `Abandoned`.
struct FlightGuard {
    window: usize,
    cache: SharedCache,
    in_flight: FlightMap,
    notices: broadcast::Sender<EngineNotice>,
    max_attempts: Option<u32>,
    result: Option<watch::Sender<Option<LoadResult>>>,
}

impl FlightGuard {
    fn finish(mut self, fetched: Result<Vec<Sample>, EnvError>) {
        let window = self.window;
        let outcome = {
            let mut cache = lock(&self.cache);
            lock(&self.in_flight).remove(&window);

            match fetched {
                Ok(samples) => {
                    match cache.complete_load(window, &samples) {
                        Disposition::Inserted { samples: inserted, evicted, recovered } => {
                            debug!(
                                "Window {} loaded: {} samples, evicted {:?}",
                                window, inserted, evicted
                            );
                            if recovered {
                                info!("Window {} recovered", window);
                                let _ = self.notices.send(EngineNotice::WindowRecovered { window });
                            }
                            Ok(Arc::from(samples))
                        }
                        Disposition::AlreadyResident => Ok(Arc::from(samples)),
                        Disposition::Discarded => Err(FetchError::Stale(window)),
                    }
                }
                Err(error) => {
                    let attempts = cache.fail_load(window);
                    warn!("Window {} failed (attempt {}): {}", window, attempts, error);

                    if attempts == 1 {
                        let _ = self.notices.send(EngineNotice::WindowUnavailable {
                            window,
                            error: error.clone(),
                        });
                    }
                    if self.max_attempts == Some(attempts) {
                        warn!("Giving up on window {} after {} attempts", window, attempts);
                        let _ = self.notices.send(EngineNotice::WindowAbandoned { window, attempts });
                    }
                    Err(FetchError::Source { window, source: error })
                }
            }
        };

        if let Some(tx) = self.result.take() {
            tx.send_replace(Some(outcome));
        }
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let Some(tx) = self.result.take() else {
            return;
        };
        {
            let mut cache = lock(&self.cache);
            lock(&self.in_flight).remove(&self.window);
            cache.abandon_load(self.window);
        }
        debug!("Fetch for window {} abandoned", self.window);
        tx.send_replace(Some(Err(FetchError::Abandoned(self.window))));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::WindowCache;
    use crate::window_index::{SessionRange, WindowIndex, WindowSpec};
    use async_trait::async_trait;
    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Semaphore;
    use trackview_env::{EntityId, TokioContext};

    const START: i64 = 0;

    /// Source that blocks every fetch until the gate opens.
    struct GatedSource {
        gate: Semaphore,
        calls: AtomicUsize,
        fail: bool,
    }

    impl GatedSource {
        fn new(fail: bool) -> Self {
            Self { gate: Semaphore::new(0), calls: AtomicUsize::new(0), fail }
        }

        fn open(&self) {
            self.gate.add_permits(1_000);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SampleSource for GatedSource {
        async fn fetch_samples(
            &self,
            _scope: &EntityScope,
            start_ms: i64,
            end_ms: i64,
        ) -> Result<Vec<Sample>, EnvError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _permit = self.gate.acquire().await.map_err(|e| EnvError::network(e.to_string()))?;
            if self.fail {
                return Err(EnvError::network("connection reset"));
            }
            Ok((start_ms..end_ms)
                .step_by(1000)
                .map(|t| Sample::new(t, EntityId(7), t as f64, 0.0, 0.0))
                .collect())
        }
    }

    fn setup(fail: bool) -> (ChunkLoader<TokioContext, GatedSource>, Arc<GatedSource>, broadcast::Receiver<EngineNotice>) {
        let range = SessionRange::new(START, START + 100 * 10_000).unwrap();
        let index = WindowIndex::new(range, WindowSpec { duration_secs: 10 });
        let cache = Arc::new(Mutex::new(WindowCache::new(index, 2, 5)));
        let source = Arc::new(GatedSource::new(fail));
        let (tx, rx) = broadcast::channel(16);
        let loader = ChunkLoader::new(
            TokioContext::shared(),
            Arc::clone(&source),
            EntityScope::All,
            cache,
            tx,
            Some(3),
        );
        (loader, source, rx)
    }

    #[tokio::test]
    async fn test_concurrent_loads_coalesce() {
        let (loader, source, _rx) = setup(false);

        let release = async {
            tokio::task::yield_now().await;
            source.open();
        };
        let (first, second, _) = tokio::join!(loader.load(1), loader.load(1), release);

        let first = first.unwrap();
        let second = second.unwrap();
        assert_eq!(source.calls(), 1);
        assert_eq!(first.len(), 10);
        assert_eq!(first, second);

        let cache = lock(loader.cache());
        assert_eq!(cache.state(1), WindowState::Loaded);
        assert_eq!(cache.store().len(), 10);
        assert_eq!(cache.metrics().coalesced, 1);
    }

    #[tokio::test]
    async fn test_loaded_window_not_refetched() {
        let (loader, source, _rx) = setup(false);
        source.open();

        loader.load(0).await.unwrap();
        let again = loader.load(0).await.unwrap();

        assert_eq!(source.calls(), 1);
        assert_eq!(again.len(), 10);
    }

    #[tokio::test]
    async fn test_stale_result_not_inserted() {
        let (loader, source, _rx) = setup(false);
        lock(loader.cache()).set_retention(5);

        let pending = tokio::spawn({
            let loader = loader.clone();
            async move { loader.load(5).await }
        });
        while loader.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        // Seek far away, then let the fetch resolve
        lock(loader.cache()).set_retention(80);
        source.open();
        assert_eq!(pending.await.unwrap(), Err(FetchError::Stale(5)));

        let cache = lock(loader.cache());
        assert_eq!(cache.state(5), WindowState::NotLoaded);
        assert!(cache.store().is_empty());
        assert_eq!(cache.metrics().stale_discards, 1);
    }

    #[tokio::test]
    async fn test_failure_surfaced_once() {
        let (loader, source, mut rx) = setup(true);
        source.open();

        for _ in 0..3 {
            let err = loader.load(2).await.unwrap_err();
            assert_eq!(err.window(), 2);
        }

        assert_eq!(
            rx.try_recv().unwrap(),
            EngineNotice::WindowUnavailable { window: 2, error: EnvError::network("connection reset") }
        );
        assert_eq!(rx.try_recv().unwrap(), EngineNotice::WindowAbandoned { window: 2, attempts: 3 });
        assert!(rx.try_recv().is_err());
        assert_eq!(lock(loader.cache()).state(2), WindowState::Failed);
    }

    #[tokio::test]
    async fn test_abort_rolls_back() {
        let (loader, _source, _rx) = setup(false);

        let pending = tokio::spawn({
            let loader = loader.clone();
            async move { loader.load(3).await }
        });
        while loader.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        loader.abort_all();
        assert_eq!(pending.await.unwrap(), Err(FetchError::Abandoned(3)));
        assert_eq!(lock(loader.cache()).state(3), WindowState::NotLoaded);
        assert_eq!(loader.in_flight(), 0);
    }

    #[test]
    fn test_spawn_on_closed_runtime_abandons() {
        let (loader, source, _rx) = setup(false);
        source.open();

        // A closed runtime drops spawned futures on the spot
        let closed = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let handle = closed.handle().clone();
        closed.shutdown_background();

        let driver = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let mut load = Box::pin(loader.load(1));
        let result = driver.block_on(std::future::poll_fn(|cx| {
            let _enter = handle.enter();
            load.as_mut().poll(cx)
        }));

        assert_eq!(result, Err(FetchError::Abandoned(1)));
        assert_eq!(lock(loader.cache()).state(1), WindowState::NotLoaded);
        assert_eq!(loader.in_flight(), 0);
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn test_out_of_range_window() {
        let (loader, source, _rx) = setup(false);
        assert_eq!(loader.load(100).await, Err(FetchError::OutOfRange(100)));
        assert_eq!(source.calls(), 0);
    }
}
