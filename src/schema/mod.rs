//! Schema module - Configuration and animation definition types.

mod config;
mod timeline;

pub use config::*;
pub use timeline::*;
