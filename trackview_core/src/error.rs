//! Error types for the replay engine.

use thiserror::Error;
use trackview_env::EnvError;

/// Failure to bring one window into the cache.
///
/// Local to its window: the scheduler records it and moves on.
/// `Clone` because every coalesced waiter receives the same outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The source failed (transport or payload)
    #[error("window {window} unavailable: {source}")]
    Source {
        window: usize,
        #[source]
        source: EnvError,
    },
    
    /// The fetch was dropped before it resolved (teardown or abort)
    #[error("fetch for window {0} was abandoned before completing")]
    Abandoned(usize),
    
    /// The window index lies outside the session
    #[error("window {0} is outside the session")]
    OutOfRange(usize),
    
    /// Fetched, but the window had left the retention set; nothing inserted
    #[error("result for window {0} arrived after it was no longer needed")]
    Stale(usize),
}

impl FetchError {
    /// Returns the window the error refers to.
    pub fn window(&self) -> usize {
        match self {
            FetchError::Source { window, .. } => *window,
            FetchError::Abandoned(window)
            | FetchError::OutOfRange(window)
            | FetchError::Stale(window) => *window,
        }
    }
}

/// Errors raised at the engine's call boundary.
///
/// Fatal to the operation that raised them, never to the engine instance.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Session end does not lie after its start
    #[error("invalid session range: end {end_ms} must be after start {start_ms}")]
    InvalidRange { start_ms: i64, end_ms: i64 },
    
    /// Seek target outside `[0, total]`
    #[error("seek target {target_ms}ms outside [0, {total_ms}]ms")]
    SeekOutOfRange { target_ms: u64, total_ms: u64 },
    
    /// Inconsistent engine configuration
    #[error("configuration error: {0}")]
    Configuration(String),
    
    /// Operation needs a session range but none is set
    #[error("no session range has been set")]
    NoSession,
}

impl EngineError {
    /// Creates a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}
