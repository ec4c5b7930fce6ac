//! Prefetch Scheduler - keeps the retention set resident.
//!
//! Whenever the cursor's window changes, the retention set is recomputed
//! (evicting anything it no longer covers) and the scheduler walks it in
//! ascending order, awaiting each load before starting the next. The
//! window under the cursor always goes first; a slow far window never
//! delays a near one.
//!
//! The background loop is latest-wins: a cursor change that arrives
//! mid-pass abandons the rest of that pass and starts over from the new
//! window. Fetches already issued keep running in their own tasks and
//! are discarded on arrival if no longer relevant.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, trace};
use trackview_env::{ReplayContext, SampleSource};

use crate::cache::lock;
use crate::chunk_loader::ChunkLoader;
use crate::error::FetchError;

/// Cursor position as published to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CursorTarget {
    /// Bumped on every publication so completed passes can be matched
    pub epoch: u64,
    /// Window under the cursor
    pub window: usize,
}

/// Summary of one completed scheduling pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub current: usize,
    pub loaded: Vec<usize>,
    pub failed: Vec<usize>,
    /// Windows at the retry limit
    pub skipped: Vec<usize>,
    /// Fetched but discarded; the window left the retention set mid-pass
    pub stale: Vec<usize>,
}

/// Drives the chunk loader for the current retention set.
pub struct PrefetchScheduler<Ctx, Src>
where
    Ctx: ReplayContext,
    Src: SampleSource,
{
    loader: ChunkLoader<Ctx, Src>,
    max_attempts: Option<u32>,
    settled: Arc<watch::Sender<u64>>,
}

impl<Ctx, Src> Clone for PrefetchScheduler<Ctx, Src>
where
    Ctx: ReplayContext,
    Src: SampleSource,
{
    fn clone(&self) -> Self {
        Self {
            loader: self.loader.clone(),
            max_attempts: self.max_attempts,
            settled: Arc::clone(&self.settled),
        }
    }
}

impl<Ctx, Src> PrefetchScheduler<Ctx, Src>
where
    Ctx: ReplayContext,
    Src: SampleSource,
{
    /// Creates a scheduler over `loader`.
    ///
    /// `max_attempts` caps how often a failing window is re-requested
    /// (`None` retries on every pass).
    pub fn new(loader: ChunkLoader<Ctx, Src>, max_attempts: Option<u32>) -> Self {
        let (settled, _) = watch::channel(0);
        Self {
            loader,
            max_attempts,
            settled: Arc::new(settled),
        }
    }

    pub fn loader(&self) -> &ChunkLoader<Ctx, Src> {
        &self.loader
    }

    /// Epoch of the most recent pass that ran to completion.
    pub fn subscribe_settled(&self) -> watch::Receiver<u64> {
        self.settled.subscribe()
    }

    /// Moves the retention set to `current`, evicting immediately.
    ///
    /// Called synchronously on every window change so in-flight results
    /// are judged against the new retention set.
    pub fn retarget(&self, current: usize) -> Vec<usize> {
        let evicted = lock(self.loader.cache()).set_retention(current);
        if !evicted.is_empty() {
            debug!("Retarget to window {} evicted {:?}", current, evicted);
        }
        evicted
    }

    /// Runs one full pass for `current` (not interruptible).
    pub async fn schedule(&self, current: usize) -> PassReport {
        self.retarget(current);
        let retention = lock(self.loader.cache()).retention();
        let mut report = PassReport {
            current: retention.current(),
            ..PassReport::default()
        };

        for window in retention.indices() {
            let wanted = {
                let cache = lock(self.loader.cache());
                if cache.needs_load(window, self.max_attempts) {
                    true
                } else {
                    if cache.failure_count(window) > 0 {
                        report.skipped.push(window);
                    }
                    false
                }
            };
            if !wanted {
                continue;
            }

            match self.loader.load(window).await {
                Ok(_) => report.loaded.push(window),
                Err(FetchError::Stale(window)) => report.stale.push(window),
                Err(e) => {
                    trace!("Pass for window {} continuing past failure: {}", current, e);
                    report.failed.push(window);
                }
            }

            lock(self.loader.cache()).enforce_budget();
        }

        report
    }

    /// Background loop: one pass per cursor change, latest wins.
    ///
    /// Returns when the cursor sender is dropped.
    pub async fn run(self, mut cursor: watch::Receiver<CursorTarget>) {
        loop {
            let target = *cursor.borrow_and_update();

            tokio::select! {
                biased;

                changed = cursor.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    debug!("Pass for window {} superseded", target.window);
                    continue;
                }

                report = self.schedule(target.window) => {
                    debug!(
                        "Pass for window {} done: loaded {:?}, failed {:?}",
                        report.current, report.loaded, report.failed
                    );
                    self.settled.send_replace(target.epoch);
                }
            }

            if cursor.changed().await.is_err() {
                break;
            }
        }
    }
}
