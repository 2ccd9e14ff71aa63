//! Search index synchronization.
//!
//! Mutation events are expanded by the [IndexTargetResolver] into index
//! targets, which the [SyncQueue] executes against a [SearchBackend]. Search
//! documents and mappings come from the [DocumentTransformer].

mod backend;
mod dead_letter;
mod naming;
mod queue;
mod resolver;
mod transformer;

pub use backend::*;
pub use dead_letter::*;
pub use naming::*;
pub use queue::*;
pub use resolver::*;
pub use transformer::*;
