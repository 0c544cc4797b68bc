//! Frame Prefetch - Multi-core frame precomputation for tick-driven UI animation.
//!
//! This crate delivers a precomputed animation state for any logical tick
//! before a render deadline. Frames are computed in parallel by a worker pool,
//! kept in a bounded cache, and requested ahead of the playback position by a
//! predictive scheduler that falls back to synchronous computation on a miss.
//!
//! # Architecture
//!
//! The crate is split into two main modules:
//!
//! - `schema`: Configuration types and animation definitions
//! - `compute`: Engine contract, snapshots, cache, worker pool, scheduler
//!
//! # Example
//!
//! ```rust,no_run
//! use frame_prefetch::{
//!     compute::{FrameScheduler, TimelineEngine},
//!     schema::{PrecomputeConfig, Timeline},
//! };
//!
//! let config = PrecomputeConfig::default();
//! let scheduler = FrameScheduler::new(&config).expect("valid config");
//! scheduler.attach_engine(TimelineEngine::from_timeline(&Timeline::random(16, 42)));
//! scheduler.start_prediction().expect("prediction thread");
//!
//! for tick in 0..120 {
//!     if let Some(frame) = scheduler.get_frame(tick) {
//!         println!("tick {}: {} animations", frame.tick, frame.len());
//!     }
//! }
//!
//! println!("{}", scheduler.get_performance_summary());
//! scheduler.shutdown();
//! ```

pub mod compute;
pub mod schema;

// Re-export commonly used types
pub use compute::{
    AnimationEngine, FrameCache, FrameResult, FrameScheduler, FrameState, Tick, TimelineEngine,
    WorkerPool,
};
pub use schema::{AnimationDefinition, AnimationState, PrecomputeConfig, Timeline};
