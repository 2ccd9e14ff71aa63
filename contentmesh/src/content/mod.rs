//! Content model: projects, releases, nodes and their field containers.

mod node;
mod project;

pub use node::*;
pub use project::*;

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Draft or published state of a field container slot.
///
/// Only these two states participate in search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContainerType {
    Draft,
    Published,
}

impl ContainerType {
    pub const ALL: [ContainerType; 2] = [ContainerType::Draft, ContainerType::Published];

    /// Code used in index names.
    pub fn code(&self) -> &'static str {
        match self {
            ContainerType::Draft => "draft",
            ContainerType::Published => "published",
        }
    }
}

impl Display for ContainerType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}
