//! Playback Clock - the logical replay cursor.
//!
//! A pure state machine: it never sleeps or spawns. The engine drives
//! `tick()` from a timer task (or the host calls it directly), which keeps
//! the clock deterministic under test.
//!
//! Tick period and time step are independent: the period sets the frame
//! rate, the step sets playback speed.

use serde::{Deserialize, Serialize};

/// Whether the cursor advances on tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockState {
    Stopped,
    Playing,
}

/// Result of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Clock is stopped; nothing happened
    Idle,
    /// Cursor moved to `time_ms`
    Advanced { time_ms: u64 },
    /// Cursor reached the end and the clock stopped
    Finished { time_ms: u64 },
}

/// Cursor in milliseconds since session start, within `[0, total_ms]`.
#[derive(Debug, Clone)]
pub struct PlaybackClock {
    state: ClockState,
    time_ms: u64,
    total_ms: u64,
    step_ms: u64,

    /// Bumped on every transition; lets a timer detect it is stale
    epoch: u64,
}

impl PlaybackClock {
    /// Creates a stopped clock at zero.
    ///
    /// # Arguments
    /// * `total_ms` - Session duration
    /// * `step_ms` - Cursor advance per tick
    pub fn new(total_ms: u64, step_ms: u64) -> Self {
        Self {
            state: ClockState::Stopped,
            time_ms: 0,
            total_ms,
            step_ms: step_ms.max(1),
            epoch: 0,
        }
    }

    pub fn state(&self) -> ClockState {
        self.state
    }

    pub fn is_playing(&self) -> bool {
        self.state == ClockState::Playing
    }

    pub fn time_ms(&self) -> u64 {
        self.time_ms
    }

    pub fn total_ms(&self) -> u64 {
        self.total_ms
    }

    pub fn step_ms(&self) -> u64 {
        self.step_ms
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Fraction of the session played, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.total_ms == 0 {
            return 1.0;
        }
        self.time_ms as f64 / self.total_ms as f64
    }

    /// Starts playback. Returns false if already playing or at the end.
    pub fn play(&mut self) -> bool {
        if self.is_playing() || self.time_ms >= self.total_ms {
            return false;
        }
        self.state = ClockState::Playing;
        self.epoch += 1;
        true
    }

    /// Stops playback. Returns false if already stopped.
    pub fn pause(&mut self) -> bool {
        if !self.is_playing() {
            return false;
        }
        self.state = ClockState::Stopped;
        self.epoch += 1;
        true
    }

    /// Moves the cursor, clamped to `[0, total]`. Always stops playback.
    ///
    /// Returns the cursor after clamping.
    pub fn seek(&mut self, time_ms: u64) -> u64 {
        self.time_ms = time_ms.min(self.total_ms);
        self.state = ClockState::Stopped;
        self.epoch += 1;
        self.time_ms
    }

    /// Back to zero, stopped.
    pub fn reset(&mut self) {
        self.seek(0);
    }

    /// Changes playback speed; takes effect on the next tick.
    pub fn set_step(&mut self, step_ms: u64) {
        self.step_ms = step_ms.max(1);
    }

    /// Advances one step. Reaching the end stops the clock (no looping).
    pub fn tick(&mut self) -> TickOutcome {
        if !self.is_playing() {
            return TickOutcome::Idle;
        }

        self.time_ms = self.time_ms.saturating_add(self.step_ms).min(self.total_ms);
        if self.time_ms == self.total_ms {
            self.state = ClockState::Stopped;
            self.epoch += 1;
            TickOutcome::Finished { time_ms: self.time_ms }
        } else {
            TickOutcome::Advanced { time_ms: self.time_ms }
        }
    }
}

/// Formats a duration as `m:ss`, or `h:mm:ss` from one hour up.
pub fn format_duration(ms: u64) -> String {
    let total_secs = ms / 1000;
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}
