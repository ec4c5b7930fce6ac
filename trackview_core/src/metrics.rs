//! Cache Metrics
//! =============
//!
//! Counters describing how the window cache behaved over a session:
//! - **Fetches**: underlying source calls actually issued
//! - **Coalesced**: callers that joined an in-flight fetch instead
//! - **Stale discards**: results that arrived for windows nobody needs anymore
//!
//! All counters are plain integers mutated under the cache lock.

use serde::{Deserialize, Serialize};

/// Lifetime counters for one session of the window cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetrics {
    /// Source fetches issued
    pub fetches: u64,
    /// Loads that joined an existing in-flight fetch
    pub coalesced: u64,
    /// Windows whose samples were inserted into the store
    pub windows_inserted: u64,
    /// Completed fetches discarded because the window left the retention set
    pub stale_discards: u64,
    /// Windows evicted under the budget
    pub windows_evicted: u64,
    /// Failed fetches
    pub failures: u64,
    /// Samples dropped at ingest because they belong to another window
    pub out_of_window_samples: u64,
    /// Highest number of simultaneously loaded windows observed
    pub peak_loaded_windows: usize,
}

impl CacheMetrics {
    /// Fraction of load requests served without a new fetch.
    pub fn coalescing_ratio(&self) -> f64 {
        let total = self.fetches + self.coalesced;
        if total == 0 {
            return 0.0;
        }
        self.coalesced as f64 / total as f64
    }
    
    /// Fraction of fetches whose result was thrown away.
    pub fn waste_ratio(&self) -> f64 {
        if self.fetches == 0 {
            return 0.0;
        }
        self.stale_discards as f64 / self.fetches as f64
    }
    
    pub(crate) fn observe_loaded(&mut self, loaded: usize) {
        self.peak_loaded_windows = self.peak_loaded_windows.max(loaded);
    }
}
