//! Simulated telemetry source with fault injection.
//!
//! Serves oracle samples through the same JSON wire format a real client
//! would parse, so payload corruption surfaces as a genuine `ParseError`.

use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use trackview_env::{parse_samples, EntityScope, EnvError, RawSample, ReplayContext, Sample, SampleSource};

use crate::context::SimContext;
use crate::oracle::TelemetryOracle;

/// Fault configuration for a [`SimSource`].
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    /// Probability a fetch fails with a transport error (0.0 - 1.0)
    pub failure_rate: f64,

    /// Probability a fetch returns a truncated payload (0.0 - 1.0)
    pub corruption_rate: f64,

    /// Simulated sleeps per fetch; each yields to the runtime once
    pub latency_polls: u32,

    /// Virtual time each of those sleeps represents
    pub latency_step: Duration,

    /// Range starts whose next N fetches fail
    pub scripted_failures: HashMap<i64, u32>,
}

impl FaultPlan {
    /// No faults, instant responses.
    pub fn healthy() -> Self {
        Self::default()
    }

    /// Fails `failure_rate` of fetches at random.
    pub fn flaky(failure_rate: f64) -> Self {
        Self {
            failure_rate: failure_rate.clamp(0.0, 1.0),
            ..Self::default()
        }
    }

    /// Every fetch takes `polls` scheduler turns.
    pub fn slow(polls: u32) -> Self {
        Self {
            latency_polls: polls,
            latency_step: Duration::from_millis(50),
            ..Self::default()
        }
    }
}

/// Fetch bookkeeping shared with the runner.
#[derive(Debug, Default)]
struct Ledger {
    /// Range starts currently being fetched
    in_flight: HashSet<i64>,
    /// Completed fetch count per range start
    per_range: HashMap<i64, u64>,
    /// Largest number of simultaneous fetches
    peak_concurrency: usize,
}

/// Oracle-backed [`SampleSource`] with injectable faults.
pub struct SimSource {
    context: Arc<SimContext>,
    oracle: Arc<TelemetryOracle>,
    faults: Mutex<FaultPlan>,
    rng: Mutex<ChaCha8Rng>,
    ledger: Mutex<Ledger>,
    calls: AtomicU64,
    failures: AtomicU64,
    /// Fetches that started while the same range was already in flight
    duplicates: AtomicU64,
}

impl SimSource {
    /// Creates a source serving `oracle` with the given faults.
    pub fn new(context: Arc<SimContext>, oracle: Arc<TelemetryOracle>, faults: FaultPlan) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(context.seed().wrapping_mul(0x2545f4914f6cdd1d));
        Self {
            context,
            oracle,
            faults: Mutex::new(faults),
            rng: Mutex::new(rng),
            ledger: Mutex::new(Ledger::default()),
            calls: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
        }
    }

    pub fn oracle(&self) -> &TelemetryOracle {
        &self.oracle
    }

    /// Replaces the fault plan (e.g. to heal a flaky source).
    pub fn set_faults(&self, faults: FaultPlan) {
        *guard(&self.faults) = faults;
    }

    /// Total fetch calls.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Fetch calls that returned an error.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    /// Overlapping fetches of one range. Coalescing keeps this at zero.
    pub fn duplicate_fetches(&self) -> u64 {
        self.duplicates.load(Ordering::SeqCst)
    }

    /// Completed fetches of the range starting at `start_ms`.
    pub fn fetches_of(&self, start_ms: i64) -> u64 {
        guard(&self.ledger).per_range.get(&start_ms).copied().unwrap_or(0)
    }

    pub fn peak_concurrency(&self) -> usize {
        guard(&self.ledger).peak_concurrency
    }

    /// Decides this fetch's fault up front so the RNG is consumed in call order.
    fn roll(&self, start_ms: i64) -> (Option<EnvError>, bool, u32, Duration) {
        let mut faults = guard(&self.faults);
        let mut rng = guard(&self.rng);

        let scripted = match faults.scripted_failures.get_mut(&start_ms) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        };
        let error = if scripted || rng.gen_bool(faults.failure_rate.clamp(0.0, 1.0)) {
            Some(EnvError::network(format!("simulated reset fetching {}", start_ms)))
        } else {
            None
        };
        let corrupt = rng.gen_bool(faults.corruption_rate.clamp(0.0, 1.0));
        (error, corrupt, faults.latency_polls, faults.latency_step)
    }

    fn enter(&self, start_ms: i64) {
        let mut ledger = guard(&self.ledger);
        if !ledger.in_flight.insert(start_ms) {
            self.duplicates.fetch_add(1, Ordering::SeqCst);
        }
        ledger.peak_concurrency = ledger.peak_concurrency.max(ledger.in_flight.len());
    }

    fn leave(&self, start_ms: i64) {
        let mut ledger = guard(&self.ledger);
        ledger.in_flight.remove(&start_ms);
        *ledger.per_range.entry(start_ms).or_insert(0) += 1;
    }
}

#[async_trait]
impl SampleSource for SimSource {
    async fn fetch_samples(
        &self,
        scope: &EntityScope,
        range_start_ms: i64,
        range_end_ms: i64,
    ) -> Result<Vec<Sample>, EnvError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (error, corrupt, polls, step) = self.roll(range_start_ms);

        self.enter(range_start_ms);
        let _exit = LedgerExit { source: self, start_ms: range_start_ms };

        for _ in 0..polls {
            self.context.sleep(step).await;
        }

        if let Some(error) = error {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(error);
        }

        let records: Vec<RawSample> = self
            .oracle
            .samples_in(range_start_ms, range_end_ms)
            .iter()
            .filter(|s| scope.includes(s.entity_id))
            .map(RawSample::from)
            .collect();
        let mut payload = serde_json::to_string(&records)?;
        if corrupt {
            payload.truncate(payload.len() / 2);
        }

        parse_samples(&payload).inspect_err(|_| {
            self.failures.fetch_add(1, Ordering::SeqCst);
        })
    }
}

/// Clears the in-flight mark even if the fetch is dropped mid-way.
struct LedgerExit<'a> {
    source: &'a SimSource,
    start_ms: i64,
}

impl Drop for LedgerExit<'_> {
    fn drop(&mut self) {
        self.source.leave(self.start_ms);
    }
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use trackview_env::EntityId;

    const ORIGIN: i64 = 1_700_000_000_000;

    fn source(faults: FaultPlan) -> SimSource {
        let context = SimContext::shared(11);
        let oracle = Arc::new(TelemetryOracle::new(11, ORIGIN, 4));
        SimSource::new(context, oracle, faults)
    }

    #[tokio::test]
    async fn test_healthy_fetch_matches_oracle() {
        let source = source(FaultPlan::healthy());
        let samples = source
            .fetch_samples(&EntityScope::All, ORIGIN, ORIGIN + 10_000)
            .await
            .unwrap();

        assert_eq!(samples, source.oracle().samples_in(ORIGIN, ORIGIN + 10_000));
        assert_eq!(source.calls(), 1);
        assert_eq!(source.fetches_of(ORIGIN), 1);
    }

    #[tokio::test]
    async fn test_scope_filters_entities() {
        let source = source(FaultPlan::healthy());
        let scope = EntityScope::Entities(vec![EntityId(2)]);
        let samples = source.fetch_samples(&scope, ORIGIN, ORIGIN + 10_000).await.unwrap();

        assert!(!samples.is_empty());
        assert!(samples.iter().all(|s| s.entity_id == EntityId(2)));
    }

    #[tokio::test]
    async fn test_scripted_failure_then_success() {
        let mut faults = FaultPlan::healthy();
        faults.scripted_failures.insert(ORIGIN, 2);
        let source = source(faults);

        for _ in 0..2 {
            let err = source.fetch_samples(&EntityScope::All, ORIGIN, ORIGIN + 1000).await;
            assert!(matches!(err, Err(EnvError::NetworkError(_))));
        }
        assert!(source.fetch_samples(&EntityScope::All, ORIGIN, ORIGIN + 1000).await.is_ok());
        assert_eq!(source.failures(), 2);
    }

    #[tokio::test]
    async fn test_corruption_is_parse_error() {
        let source = source(FaultPlan {
            corruption_rate: 1.0,
            ..FaultPlan::default()
        });
        let err = source
            .fetch_samples(&EntityScope::All, ORIGIN, ORIGIN + 10_000)
            .await
            .unwrap_err();
        assert!(matches!(err, EnvError::ParseError(_)));
    }

    #[tokio::test]
    async fn test_latency_advances_virtual_time() {
        let source = source(FaultPlan::slow(4));
        source.fetch_samples(&EntityScope::All, ORIGIN, ORIGIN + 1000).await.unwrap();
        assert_eq!(source.context.now(), Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_overlap_detected() {
        let source = Arc::new(source(FaultPlan::slow(3)));
        let a = source.fetch_samples(&EntityScope::All, ORIGIN, ORIGIN + 1000);
        let b = source.fetch_samples(&EntityScope::All, ORIGIN, ORIGIN + 1000);
        let _ = tokio::join!(a, b);

        assert_eq!(source.duplicate_fetches(), 1);
        assert_eq!(source.peak_concurrency(), 1);
    }
}
