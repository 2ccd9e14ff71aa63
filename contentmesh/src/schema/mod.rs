//! Schema definitions, changes, the version chain and the schema differ.

mod chain;
pub(crate) mod change;
mod definition;
mod differ;

pub use chain::*;
pub use change::{
    Change, ChangeModel, ChangeOperation, ChangeProperties, ChangeSet, MigrationScript, ScriptFn,
};
pub use definition::*;
pub use differ::*;
