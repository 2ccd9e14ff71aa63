use crate::content::ContainerType;
use crate::errors::MeshResult;
use anyhow::Error;
use basu::error::BasuError;
use basu::event::Event;
use basu::Handle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;
use uuid::Uuid;

/// Kind of element a mutation event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ElementType {
    /// A content node; targets are documents.
    Node,
    /// A release; targets are whole indices.
    Release,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationAction {
    Store,
    Delete,
}

impl Display for MutationAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MutationAction::Store => write!(f, "STORE"),
            MutationAction::Delete => write!(f, "DELETE"),
        }
    }
}

/// Partial partition tuple of a mutation. Unset parts mean "every
/// applicable value".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_type: Option<ContainerType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl IndexContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn project(mut self, project: Uuid) -> Self {
        self.project = Some(project);
        self
    }

    pub fn release(mut self, release: Uuid) -> Self {
        self.release = Some(release);
        self
    }

    pub fn schema_version(mut self, version: Uuid) -> Self {
        self.schema_version = Some(version);
        self
    }

    pub fn container_type(mut self, container_type: ContainerType) -> Self {
        self.container_type = Some(container_type);
        self
    }

    pub fn language(mut self, language: &str) -> Self {
        self.language = Some(language.to_string());
        self
    }

    pub fn is_fully_specified(&self) -> bool {
        self.project.is_some()
            && self.release.is_some()
            && self.schema_version.is_some()
            && self.container_type.is_some()
            && self.language.is_some()
    }
}

/// Notification that an element changed and its search documents must be
/// reconciled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationEvent {
    pub element_uuid: Uuid,
    pub element_type: ElementType,
    pub action: MutationAction,
    pub context: IndexContext,
    pub timestamp: DateTime<Utc>,
}

impl MutationEvent {
    pub fn new(
        element_uuid: Uuid,
        element_type: ElementType,
        action: MutationAction,
        context: IndexContext,
    ) -> Self {
        MutationEvent {
            element_uuid,
            element_type,
            action,
            context,
            timestamp: Utc::now(),
        }
    }

    pub fn store_node(node: Uuid, context: IndexContext) -> Self {
        MutationEvent::new(node, ElementType::Node, MutationAction::Store, context)
    }

    pub fn delete_node(node: Uuid, context: IndexContext) -> Self {
        MutationEvent::new(node, ElementType::Node, MutationAction::Delete, context)
    }

    pub fn store_release(release: Uuid, context: IndexContext) -> Self {
        MutationEvent::new(release, ElementType::Release, MutationAction::Store, context)
    }

    pub fn delete_release(release: Uuid, context: IndexContext) -> Self {
        MutationEvent::new(release, ElementType::Release, MutationAction::Delete, context)
    }

    /// Short human readable description for logs.
    pub fn describe(&self) -> String {
        format!("{} {:?} {}", self.action, self.element_type, self.element_uuid)
    }
}

pub trait MutationCallback: Send + Sync + Fn(MutationEvent) -> MeshResult<()> {}

impl<F> MutationCallback for F where F: Send + Sync + Fn(MutationEvent) -> MeshResult<()> {}

/// Event bus listener for mutation events.
#[derive(Clone)]
pub struct MutationListener {
    on_event: Arc<dyn MutationCallback>,
}

impl MutationListener {
    pub fn new(on_event: impl MutationCallback + 'static) -> Self {
        MutationListener {
            on_event: Arc::new(on_event),
        }
    }
}

impl Handle<MutationEvent> for MutationListener {
    fn handle(&self, event: &Event<MutationEvent>) -> Result<(), BasuError> {
        match (self.on_event)(event.data.clone()) {
            Ok(_) => Ok(()),
            Err(e) => Err(BasuError::HandlerError(Error::from(e))),
        }
    }
}

impl Debug for MutationListener {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationListener").finish()
    }
}
