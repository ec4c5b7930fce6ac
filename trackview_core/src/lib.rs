//! TrackView Core - Windowed Telemetry Cache and Playback Engine
//!
//! Replays a long recorded session of per-entity position samples without
//! ever holding the whole series in memory:
//! 1. **Windowing**: the session range is cut into fixed-duration windows,
//!    the unit of fetch, cache and eviction
//! 2. **Prefetch**: the window under the cursor and a short look-ahead are
//!    loaded serially, nearest first, with concurrent requests coalesced
//! 3. **Bounded residency**: a window-count budget evicts the windows
//!    furthest from the cursor, preferring just-played ones to keep
//! 4. **Last known position**: per-entity zeroth-order hold lookups

pub mod bounds;
pub mod cache;
pub mod chunk_loader;
pub mod config;
pub mod engine;
pub mod error;
pub mod eviction;
pub mod metrics;
pub mod playback;
pub mod prefetch;
pub mod resolver;
pub mod sample_store;
pub mod window_index;

// Re-export key types for convenience
pub use bounds::{estimate_bounds, track_outline, Bounds};
pub use cache::{Disposition, SharedCache, WindowCache, WindowState};
pub use chunk_loader::{ChunkLoader, EngineNotice, LoadResult};
pub use config::{EngineConfig, TickSource};
pub use engine::{LoadingState, ReplayEngine};
pub use error::{EngineError, FetchError};
pub use eviction::{EvictionPolicy, RetentionSet, TrailingEviction};
pub use metrics::CacheMetrics;
pub use playback::{format_duration, ClockState, PlaybackClock, TickOutcome};
pub use prefetch::{CursorTarget, PassReport, PrefetchScheduler};
pub use resolver::PositionResolver;
pub use sample_store::SampleStore;
pub use window_index::{SessionRange, WindowIndex, WindowSpec};
