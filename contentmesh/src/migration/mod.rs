//! Content migration between schema versions.
//!
//! [transforms] holds the per-operation field transforms, [engine] drives
//! them over every content unit of the releases pinned to a version.

mod engine;
mod transforms;

pub use engine::*;
pub use transforms::*;
