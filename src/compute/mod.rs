//! Compute module - Frame computation, caching and delivery.

mod cache;
mod engine;
mod frame;
mod pool;
mod scheduler;
mod snapshot;
mod task;

pub use cache::*;
pub use engine::*;
pub use frame::*;
pub use pool::*;
pub use scheduler::*;
pub use snapshot::*;
pub use task::*;
