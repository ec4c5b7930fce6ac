//! TrackView Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" seam that lets the TrackView replay
//! engine run in both **Production** (tokio, real telemetry source) and
//! **Simulation** (virtual clock, synthetic source) environments.
//!
//! # Core Concept: Injected Collaborators
//!
//! Everything non-deterministic the engine touches is reached through a
//! trait object supplied at construction:
//! - Time (`now()`, `sleep()`)
//! - Task spawning (`spawn()`)
//! - Telemetry retrieval (`fetch_samples()`)
//!
//! Tests swap in a fake source and a virtual clock; nothing in the engine
//! reaches for a global service.
//!
//! # Example
//!
//! ```ignore
//! use trackview_env::{ReplayContext, SampleSource, EntityScope};
//!
//! async fn first_window<Ctx: ReplayContext, Src: SampleSource>(ctx: &Ctx, src: &Src) {
//!     let samples = src.fetch_samples(&EntityScope::All, 0, 80_000).await;
//!     ctx.sleep(Duration::from_millis(100)).await;
//! }
//! ```

mod context;
mod source;
mod types;
mod error;
mod tokio_impl;

pub use context::ReplayContext;
pub use source::{parse_samples, SampleSource};
pub use types::{EntityId, EntityScope, RawSample, Sample};
pub use error::EnvError;
pub use tokio_impl::TokioContext;
