use crate::content::{ContainerType, Node, Project, Release, SlotKey};
use crate::errors::{ErrorKind, MeshError, MeshResult};
use crate::event::{ElementType, IndexContext, MutationAction, MutationEvent};
use crate::search::{compose_document_id, compose_index_name, DocumentTransformer};
use crate::store::{MeshStore, StoreState};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use uuid::Uuid;

/// A concrete index, or a concrete document within an index, the search
/// backend operates on.
///
/// Targets order and compare by index name, document type and document id
/// first; the partition fields are functions of those.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexTarget {
    pub index_name: String,
    pub document_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    pub project: Uuid,
    pub release: Uuid,
    pub schema_version: Uuid,
    pub container_type: ContainerType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl IndexTarget {
    /// Target addressing a whole index.
    pub fn index(
        project: Uuid,
        release: Uuid,
        schema_version: Uuid,
        container_type: ContainerType,
        document_type: &str,
    ) -> Self {
        IndexTarget {
            index_name: compose_index_name(&project, &release, &schema_version, container_type),
            document_type: document_type.to_string(),
            document_id: None,
            project,
            release,
            schema_version,
            container_type,
            node: None,
            language: None,
        }
    }

    /// Target addressing the document of `node` in `language`.
    pub fn document(
        project: Uuid,
        release: Uuid,
        schema_version: Uuid,
        container_type: ContainerType,
        document_type: &str,
        node: Uuid,
        language: &str,
    ) -> Self {
        IndexTarget {
            document_id: Some(compose_document_id(&node, language)),
            node: Some(node),
            language: Some(language.to_string()),
            ..IndexTarget::index(project, release, schema_version, container_type, document_type)
        }
    }

    pub fn is_document(&self) -> bool {
        self.document_id.is_some()
    }

    /// The index level target this target belongs to.
    pub fn to_index(&self) -> IndexTarget {
        IndexTarget {
            document_id: None,
            node: None,
            language: None,
            ..self.clone()
        }
    }
}

/// Where the sync queue gets its targets and document bodies from.
pub trait IndexSource: Send + Sync {
    /// Expands an event into the targets it denotes. The result may contain
    /// duplicates when a target is reachable through several expansion paths.
    fn expand(&self, event: &MutationEvent) -> MeshResult<Vec<IndexTarget>>;

    /// Index level targets of a context, deduplicated.
    fn resolve(&self, context: &IndexContext) -> MeshResult<BTreeSet<IndexTarget>>;

    /// Current document body of a document target, `None` when the target
    /// does not hold content anymore.
    fn document(&self, target: &IndexTarget) -> MeshResult<Option<Value>>;

    /// Mapping of the index of `target`.
    fn mapping(&self, target: &IndexTarget) -> MeshResult<Value>;
}

/// Resolves partial index contexts against the committed store state.
///
/// Expansion goes from the narrowest to the widest part of a context: an
/// unset language expands over the languages present, an unset container
/// type over draft and published, an unset release over every release of the
/// project and an unset project over every project. Resolution only reads
/// committed state, so identical contexts over identical state always
/// resolve to identical targets.
#[derive(Clone)]
pub struct IndexTargetResolver {
    store: MeshStore,
    transformer: DocumentTransformer,
}

impl IndexTargetResolver {
    pub fn new(store: MeshStore, transformer: DocumentTransformer) -> Self {
        IndexTargetResolver { store, transformer }
    }

    pub fn document_type(&self) -> &str {
        self.transformer.document_type()
    }

    fn resolve_indices(&self, s: &StoreState, context: &IndexContext) -> BTreeSet<IndexTarget> {
        let mut targets = BTreeSet::new();
        for project in projects_in(s, context) {
            for release in releases_in(s, project, context) {
                let versions: Vec<Uuid> = match context.schema_version {
                    Some(version) if s.schema_version(&version).is_some() => vec![version],
                    Some(version) => {
                        log::warn!("Schema version {} of index context not found", version);
                        Vec::new()
                    }
                    None => release.schema_versions().values().copied().collect(),
                };
                for version in versions {
                    for container_type in container_types(context) {
                        targets.insert(IndexTarget::index(
                            project.uuid(),
                            release.uuid(),
                            version,
                            container_type,
                            self.document_type(),
                        ));
                    }
                }
            }
        }
        targets
    }

    fn expand_node(
        &self,
        s: &StoreState,
        node_uuid: &Uuid,
        action: MutationAction,
        context: &IndexContext,
    ) -> Vec<IndexTarget> {
        let node = s.node(node_uuid);
        if let (Some(node), Some(project)) = (node, context.project) {
            if node.project_uuid() != project {
                log::debug!("Node {} does not belong to project {}", node_uuid, project);
                return Vec::new();
            }
        }
        if action == MutationAction::Store && node.is_none() {
            log::warn!("Cannot index unknown node {}", node_uuid);
            return Vec::new();
        }

        let scoped = IndexContext {
            project: context.project.or(node.map(Node::project_uuid)),
            ..context.clone()
        };

        let mut targets = Vec::new();
        for project in projects_in(s, &scoped) {
            for release in releases_in(s, project, &scoped) {
                for container_type in container_types(&scoped) {
                    match (action, node) {
                        (MutationAction::Store, Some(node)) => {
                            self.store_targets(s, project, release, container_type, node, &scoped, &mut targets)
                        }
                        (MutationAction::Store, None) => {}
                        (MutationAction::Delete, node) => self.delete_targets(
                            s,
                            project,
                            release,
                            container_type,
                            node_uuid,
                            node,
                            &scoped,
                            &mut targets,
                        ),
                    }
                }
            }
        }
        targets
    }

    #[allow(clippy::too_many_arguments)]
    fn store_targets(
        &self,
        s: &StoreState,
        project: &Project,
        release: &Release,
        container_type: ContainerType,
        node: &Node,
        context: &IndexContext,
        targets: &mut Vec<IndexTarget>,
    ) {
        let languages: Vec<String> = match &context.language {
            Some(language) => vec![language.clone()],
            None => node
                .languages(release.uuid(), container_type)
                .into_iter()
                .map(str::to_string)
                .collect(),
        };

        for language in languages {
            let key = SlotKey::new(release.uuid(), &language, container_type);
            let Some(container) = s.slot_container(&node.uuid(), &key) else {
                if context.language.is_some() {
                    log::warn!(
                        "Node {} has no {} container in language {} of release {}, nothing to index",
                        node.uuid(),
                        container_type,
                        language,
                        release.uuid()
                    );
                }
                continue;
            };
            if let Some(version) = context.schema_version {
                if container.schema_version() != version {
                    log::debug!(
                        "Container of {} is on version {} instead of {}",
                        key.unit_id(&node.uuid()),
                        container.schema_version(),
                        version
                    );
                    continue;
                }
            }
            targets.push(IndexTarget::document(
                project.uuid(),
                release.uuid(),
                container.schema_version(),
                container_type,
                self.document_type(),
                node.uuid(),
                &language,
            ));
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn delete_targets(
        &self,
        s: &StoreState,
        project: &Project,
        release: &Release,
        container_type: ContainerType,
        node_uuid: &Uuid,
        node: Option<&Node>,
        context: &IndexContext,
        targets: &mut Vec<IndexTarget>,
    ) {
        // the container may already be gone, so deletes never look it up
        let versions: BTreeSet<Uuid> = match (context.schema_version, node) {
            (Some(version), _) => BTreeSet::from([version]),
            (None, Some(node)) => {
                let mut versions: BTreeSet<Uuid> = node
                    .slots_of(release.uuid(), container_type)
                    .filter_map(|(_, c)| s.container(c))
                    .map(|c| c.schema_version())
                    .collect();
                versions.extend(release.schema_version(&node.schema_container()));
                versions
            }
            (None, None) => release.schema_versions().values().copied().collect(),
        };
        let languages: Vec<String> = match &context.language {
            Some(language) => vec![language.clone()],
            None => project.languages().to_vec(),
        };

        for version in versions {
            for language in &languages {
                targets.push(IndexTarget::document(
                    project.uuid(),
                    release.uuid(),
                    version,
                    container_type,
                    self.document_type(),
                    *node_uuid,
                    language,
                ));
            }
        }
    }
}

impl IndexSource for IndexTargetResolver {
    fn expand(&self, event: &MutationEvent) -> MeshResult<Vec<IndexTarget>> {
        let targets = match event.element_type {
            ElementType::Node => self.store.read(|s| {
                self.expand_node(s, &event.element_uuid, event.action, &event.context)
            }),
            ElementType::Release => {
                let mut context = event.context.clone();
                context.release.get_or_insert(event.element_uuid);
                self.store
                    .read(|s| self.resolve_indices(s, &context))
                    .into_iter()
                    .collect()
            }
        };
        log::debug!("Event {} expanded to {} targets", event.describe(), targets.len());
        Ok(targets)
    }

    fn resolve(&self, context: &IndexContext) -> MeshResult<BTreeSet<IndexTarget>> {
        Ok(self.store.read(|s| self.resolve_indices(s, context)))
    }

    fn document(&self, target: &IndexTarget) -> MeshResult<Option<Value>> {
        let (Some(node), Some(language)) = (target.node, target.language.as_deref()) else {
            return Err(MeshError::new(
                &format!("Target {} is not a document target", target.index_name),
                ErrorKind::InvalidOperation,
            ));
        };

        self.store.read(|s| {
            let key = SlotKey::new(target.release, language, target.container_type);
            let Some(container) = s.slot_container(&node, &key) else {
                log::warn!("No container for {} anymore, skipping store", key.unit_id(&node));
                return Ok(None);
            };
            if container.schema_version() != target.schema_version {
                log::debug!(
                    "Container of {} moved to version {}, skipping store into {}",
                    key.unit_id(&node),
                    container.schema_version(),
                    target.index_name
                );
                return Ok(None);
            }

            let project = s.project(&target.project).ok_or_else(|| not_found("Project", &target.project))?;
            let release = s.release(&target.release).ok_or_else(|| not_found("Release", &target.release))?;
            let version = s
                .schema_version(&target.schema_version)
                .ok_or_else(|| not_found("Schema version", &target.schema_version))?;
            Ok(Some(self.transformer.document(project, release, version, container)))
        })
    }

    fn mapping(&self, target: &IndexTarget) -> MeshResult<Value> {
        self.store.read(|s| {
            s.schema_version(&target.schema_version)
                .map(|version| self.transformer.mapping(version.definition()))
                .ok_or_else(|| not_found("Schema version", &target.schema_version))
        })
    }
}

fn projects_in<'a>(s: &'a StoreState, context: &IndexContext) -> Vec<&'a Project> {
    match context.project {
        Some(uuid) => match s.project(&uuid) {
            Some(project) => vec![project],
            None => {
                log::warn!("Project {} of index context not found", uuid);
                Vec::new()
            }
        },
        None => s.projects().collect(),
    }
}

fn releases_in<'a>(s: &'a StoreState, project: &Project, context: &IndexContext) -> Vec<&'a Release> {
    match context.release {
        Some(uuid) => s
            .release(&uuid)
            .filter(|r| r.project_uuid() == project.uuid())
            .into_iter()
            .collect(),
        None => s.releases_of(&project.uuid()),
    }
}

fn container_types(context: &IndexContext) -> Vec<ContainerType> {
    match context.container_type {
        Some(container_type) => vec![container_type],
        None => ContainerType::ALL.to_vec(),
    }
}

fn not_found(what: &str, uuid: &Uuid) -> MeshError {
    MeshError::new(&format!("{} {} not found", what, uuid), ErrorKind::NotFound)
}
