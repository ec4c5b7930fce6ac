//! Window arithmetic - maps timestamps to fixed-duration fetch windows.
//!
//! Pure and stateless. A session `[start, end)` is cut into windows of
//! `duration_secs`; the last window is clamped to the session end.
//!
//! ```text
//! start                                                     end
//!   |---- w0 ----|---- w1 ----|---- w2 ----| ... |-- wN-1 --|
//! ```

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// The recorded time range of a session (Unix milliseconds).
///
/// Invariant: `end_ms > start_ms`. Immutable once built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRange {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl SessionRange {
    /// Creates a range, rejecting empty or inverted ones.
    pub fn new(start_ms: i64, end_ms: i64) -> Result<Self, EngineError> {
        if end_ms <= start_ms {
            return Err(EngineError::InvalidRange { start_ms, end_ms });
        }
        Ok(Self { start_ms, end_ms })
    }
    
    /// Total session duration in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        self.end_ms.abs_diff(self.start_ms)
    }
}

/// Size of each fetch unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSpec {
    /// Window length in seconds (positive)
    pub duration_secs: u32,
}

impl Default for WindowSpec {
    fn default() -> Self {
        Self { duration_secs: 80 }
    }
}

/// Timestamp <-> window index mapping for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowIndex {
    range: SessionRange,
    window_ms: i64,
}

impl WindowIndex {
    /// Creates the mapping for a session and window size.
    pub fn new(range: SessionRange, spec: WindowSpec) -> Self {
        Self {
            range,
            window_ms: i64::from(spec.duration_secs.max(1)) * 1000,
        }
    }
    
    /// The session this index covers.
    pub fn range(&self) -> SessionRange {
        self.range
    }
    
    /// Window length in milliseconds.
    pub fn window_ms(&self) -> i64 {
        self.window_ms
    }
    
    /// Number of windows: `ceil(session_duration / window_duration)`.
    pub fn total_windows(&self) -> usize {
        let duration = self.range.duration_ms();
        let window = self.window_ms as u64;
        duration.div_ceil(window) as usize
    }
    
    /// Index of the last window.
    pub fn last_window(&self) -> usize {
        self.total_windows().saturating_sub(1)
    }
    
    /// Window owning an absolute timestamp.
    ///
    /// Timestamps before the session clamp to window 0, timestamps at or
    /// after the end clamp to the last window.
    pub fn window_of(&self, timestamp_ms: i64) -> usize {
        if timestamp_ms <= self.range.start_ms {
            return 0;
        }
        let elapsed = timestamp_ms - self.range.start_ms;
        let index = (elapsed / self.window_ms) as usize;
        index.min(self.last_window())
    }
    
    /// Window owning a cursor offset (milliseconds since session start).
    pub fn window_at_offset(&self, offset_ms: u64) -> usize {
        let offset = i64::try_from(offset_ms).unwrap_or(i64::MAX);
        self.window_of(self.range.start_ms.saturating_add(offset))
    }
    
    /// Absolute `[start, end)` bounds of a window, clamped to the session end.
    pub fn window_range(&self, index: usize) -> (i64, i64) {
        let offset = (index as i64).saturating_mul(self.window_ms);
        let start = self.range.start_ms.saturating_add(offset).min(self.range.end_ms);
        let end = start.saturating_add(self.window_ms).min(self.range.end_ms);
        (start, end)
    }
    
    /// Returns true if `timestamp_ms` falls inside the window's bounds.
    pub fn contains(&self, index: usize, timestamp_ms: i64) -> bool {
        let (start, end) = self.window_range(index);
        timestamp_ms >= start && timestamp_ms < end
    }
    
    /// Converts a cursor offset to an absolute timestamp.
    pub fn timestamp_at(&self, offset_ms: u64) -> i64 {
        let offset = i64::try_from(offset_ms).unwrap_or(i64::MAX);
        self.range.start_ms.saturating_add(offset).min(self.range.end_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    
    const START: i64 = 1_700_000_000_000;
    
    fn index(duration_ms: i64, window_secs: u32) -> WindowIndex {
        let range = SessionRange::new(START, START + duration_ms).unwrap();
        WindowIndex::new(range, WindowSpec { duration_secs: window_secs })
    }
    
    #[test]
    fn test_invalid_range_rejected() {
        assert_eq!(
            SessionRange::new(START, START),
            Err(EngineError::InvalidRange { start_ms: START, end_ms: START })
        );
        assert!(SessionRange::new(START, START - 1).is_err());
    }
    
    #[test]
    fn test_total_windows_rounds_up() {
        // 1h session, 80s windows -> 45 windows exactly
        assert_eq!(index(3_600_000, 80).total_windows(), 45);
        // One extra millisecond opens a 46th window
        assert_eq!(index(3_600_001, 80).total_windows(), 46);
        assert_eq!(index(1, 80).total_windows(), 1);
    }
    
    #[test]
    fn test_window_of_boundaries() {
        let idx = index(400_000, 80);
        assert_eq!(idx.window_of(START), 0);
        assert_eq!(idx.window_of(START + 79_999), 0);
        assert_eq!(idx.window_of(START + 80_000), 1);
        assert_eq!(idx.window_of(START + 399_999), 4);
    }
    
    #[test]
    fn test_window_of_clamps() {
        let idx = index(400_000, 80);
        assert_eq!(idx.window_of(START - 5_000), 0);
        assert_eq!(idx.window_of(i64::MIN), 0);
        assert_eq!(idx.window_of(START + 400_000), 4);
        assert_eq!(idx.window_of(i64::MAX), 4);
    }
    
    #[test]
    fn test_window_range_clamped_to_end() {
        let idx = index(250_000, 80);
        assert_eq!(idx.total_windows(), 4);
        assert_eq!(idx.window_range(0), (START, START + 80_000));
        assert_eq!(idx.window_range(3), (START + 240_000, START + 250_000));
        
        // Past the end collapses to an empty range at the session end
        let (s, e) = idx.window_range(10);
        assert_eq!(s, e);
    }
    
    #[test]
    fn test_window_at_offset() {
        let idx = index(400_000, 80);
        assert_eq!(idx.window_at_offset(0), 0);
        assert_eq!(idx.window_at_offset(160_000), 2);
        assert_eq!(idx.window_at_offset(u64::MAX), 4);
        assert_eq!(idx.timestamp_at(160_000), START + 160_000);
    }
    
    proptest! {
        #[test]
        fn window_of_is_monotonic_and_contained(
            duration in 1i64..20_000_000,
            window_secs in 1u32..600,
            a in 0i64..20_000_000,
            b in 0i64..20_000_000,
        ) {
            let idx = index(duration, window_secs);
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let (lo, hi) = (START + lo % duration, START + hi % duration);
            let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
            
            prop_assert!(idx.window_of(lo) <= idx.window_of(hi));
            prop_assert!(idx.contains(idx.window_of(lo), lo));
            prop_assert!(idx.contains(idx.window_of(hi), hi));
            prop_assert!(idx.window_of(hi) < idx.total_windows());
        }
    }
}
