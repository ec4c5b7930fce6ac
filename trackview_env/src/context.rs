//! Core environment context trait for the TrackView engine.

use async_trait::async_trait;
use std::future::Future;
use std::time::{Duration, SystemTime};
use tokio::task::AbortHandle;

/// The central interface for Environment Interaction.
///
/// This trait abstracts the "real world" so that the replay engine can run
/// against a wall clock in production or a virtual clock in simulation.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time` and `tokio::spawn`
/// - **Simulation**: `SimContext` - virtual clock advanced by `sleep()`
#[async_trait]
pub trait ReplayContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// In simulation, this is the virtual clock time.
    fn now(&self) -> Duration;
    
    /// Returns the wall-clock time (used for log correlation only).
    fn system_time(&self) -> SystemTime;
    
    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances the virtual clock and yields
    async fn sleep(&self, duration: Duration);
    
    /// Spawns a background task and returns a handle that cancels it.
    ///
    /// The engine aborts its tick timer and scheduler through this handle,
    /// so implementations must hand back a handle to the task they started.
    fn spawn<F>(&self, name: &str, future: F) -> AbortHandle
    where
        F: Future<Output = ()> + Send + 'static;
}
