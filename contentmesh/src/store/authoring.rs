use crate::common::FieldMap;
use crate::content::{ContainerType, FieldContainer, Node, Project, Release, SlotKey};
use crate::errors::{ErrorKind, MeshError, MeshResult};
use crate::event::{IndexContext, MutationEvent};
use crate::schema::{SchemaContainer, SchemaDefinition, VersionStatus};
use crate::store::MeshStore;
use uuid::Uuid;

/// Authoring operations of the surrounding CRUD layer.
///
/// Each operation runs in its own transaction and returns the mutation
/// events the search index must see once it committed.
impl MeshStore {
    /// Creates a project together with its initial release.
    pub fn create_project(&self, name: &str, languages: &[&str]) -> MeshResult<(Project, Release)> {
        if languages.is_empty() {
            return Err(MeshError::new(
                "A project needs at least one language",
                ErrorKind::ValidationError,
            ));
        }
        if self.read(|s| s.projects().any(|p| p.name() == name)) {
            return Err(MeshError::new(
                &format!("Project '{}' already exists", name),
                ErrorKind::ValidationError,
            ));
        }

        let mut project = Project::new(name, languages);
        let release = Release::new(project.uuid(), name);
        project.add_release(release.uuid());

        let mut tx = self.begin_tx();
        tx.put_project(project.clone());
        tx.put_release(release.clone());
        tx.commit()?;
        log::info!("Created project '{}' with initial release {}", name, release.uuid());
        Ok((project, release))
    }

    /// Creates a release that inherits schema assignments and content of the
    /// project's latest release.
    pub fn create_release(&self, project: &Uuid, name: &str) -> MeshResult<(Release, MutationEvent)> {
        let mut tx = self.begin_tx();
        let mut project_entity = tx.project(project)?;
        let mut release = Release::new(*project, name);

        if let Some(base_uuid) = project_entity.latest_release() {
            let base = tx.release(&base_uuid)?;
            release.inherit_assignments(&base);
            let nodes: Vec<Node> = self.read(|s| s.nodes_of(project).cloned().collect());
            for node in nodes {
                for (key, container) in node.slots().iter().filter(|(k, _)| k.release == base_uuid) {
                    let target = SlotKey::new(release.uuid(), &key.language, key.container_type);
                    tx.set_slot(node.uuid(), target, None, Some(*container));
                }
            }
        }

        project_entity.add_release(release.uuid());
        tx.put_project(project_entity);
        tx.put_release(release.clone());
        tx.commit()?;

        log::info!("Created release '{}' ({}) in project {}", name, release.uuid(), project);
        let event = MutationEvent::store_release(
            release.uuid(),
            IndexContext::new().project(*project).release(release.uuid()),
        );
        Ok((release, event))
    }

    /// Creates a schema container with `definition` as its first version.
    pub fn create_schema(&self, definition: SchemaDefinition) -> MeshResult<SchemaContainer> {
        if self.read(|s| s.schema_by_name(&definition.name).is_some()) {
            return Err(MeshError::new(
                &format!("Schema '{}' already exists", definition.name),
                ErrorKind::ValidationError,
            ));
        }
        let container = SchemaContainer::new(definition)?;
        let mut tx = self.begin_tx();
        tx.put_schema(container.clone());
        tx.commit()?;
        Ok(container)
    }

    /// Assigns a version of a schema container (the latest when `version` is
    /// unset) to a release.
    pub fn assign_schema(
        &self,
        release: &Uuid,
        schema: &Uuid,
        version: Option<Uuid>,
    ) -> MeshResult<MutationEvent> {
        let mut tx = self.begin_tx();
        let container = tx.schema(schema)?;
        let version = version.unwrap_or_else(|| container.latest().uuid());
        if !container.contains(&version) {
            return Err(MeshError::new(
                &format!("Version {} does not belong to schema {}", version, schema),
                ErrorKind::ValidationError,
            ));
        }

        let mut release_entity = tx.release(release)?;
        let previous = release_entity.assign(*schema, version);
        let project = release_entity.project_uuid();
        tx.put_release(release_entity);
        tx.set_version_status(*schema, version, VersionStatus::Active);
        if let Some(previous) = previous.filter(|p| *p != version) {
            tx.retire_if_unreferenced(*schema, previous);
        }
        tx.commit()?;

        Ok(MutationEvent::store_release(
            *release,
            IndexContext::new()
                .project(project)
                .release(*release)
                .schema_version(version),
        ))
    }

    /// Creates a node with a draft in `language`.
    pub fn create_node(
        &self,
        project: &Uuid,
        release: &Uuid,
        schema: &Uuid,
        language: &str,
        fields: FieldMap,
    ) -> MeshResult<(Node, Vec<MutationEvent>)> {
        let mut tx = self.begin_tx();
        let project_entity = tx.project(project)?;
        check_language(&project_entity, language)?;
        let release_entity = tx.release(release)?;
        let version = assigned_version(&release_entity, schema)?;
        let definition = self.definition_of(schema, &version)?;
        definition.validate_fields(&fields)?;

        let node = Node::new(*project, *schema);
        let container = FieldContainer::new(node.uuid(), language, *schema, version, fields);
        let key = SlotKey::new(*release, language, ContainerType::Draft);

        tx.put_new_node(node.clone());
        tx.set_slot(node.uuid(), key, None, Some(container.uuid()));
        tx.put_container(container);
        tx.commit()?;

        let event = slot_event(&node, *release, version, ContainerType::Draft, language);
        let node = self.read(|s| s.node(&node.uuid()).cloned()).unwrap_or(node);
        Ok((node, vec![event]))
    }

    /// Stores new draft values for one language of a node.
    pub fn update_node(
        &self,
        node: &Uuid,
        release: &Uuid,
        language: &str,
        fields: FieldMap,
    ) -> MeshResult<Vec<MutationEvent>> {
        let mut tx = self.begin_tx();
        let node_entity = tx.node(node)?;
        let project_entity = tx.project(&node_entity.project_uuid())?;
        check_language(&project_entity, language)?;
        let release_entity = tx.release(release)?;
        let version = assigned_version(&release_entity, &node_entity.schema_container())?;
        let definition = self.definition_of(&node_entity.schema_container(), &version)?;
        definition.validate_fields(&fields)?;

        let key = SlotKey::new(*release, language, ContainerType::Draft);
        let current = node_entity.slot(&key);
        let container = match current {
            Some(uuid) => tx.container(&uuid)?.successor(version, fields),
            None => FieldContainer::new(
                *node,
                language,
                node_entity.schema_container(),
                version,
                fields,
            ),
        };
        tx.set_slot(*node, key, current, Some(container.uuid()));
        tx.put_container(container);
        tx.commit()?;

        Ok(vec![slot_event(&node_entity, *release, version, ContainerType::Draft, language)])
    }

    /// Publishes the current draft of one language.
    pub fn publish(&self, node: &Uuid, release: &Uuid, language: &str) -> MeshResult<Vec<MutationEvent>> {
        let mut tx = self.begin_tx();
        let node_entity = tx.node(node)?;
        let draft_key = SlotKey::new(*release, language, ContainerType::Draft);
        let published_key = SlotKey::new(*release, language, ContainerType::Published);
        let draft = node_entity.slot(&draft_key).ok_or_else(|| {
            MeshError::new(
                &format!("Node {} has no {} draft in release {}", node, language, release),
                ErrorKind::NotFound,
            )
        })?;
        let version = tx.container(&draft)?.schema_version();

        // the draft must still be current when the published slot moves
        tx.set_slot(*node, draft_key, Some(draft), Some(draft));
        tx.set_slot(*node, published_key.clone(), node_entity.slot(&published_key), Some(draft));
        tx.commit()?;

        Ok(vec![slot_event(&node_entity, *release, version, ContainerType::Published, language)])
    }

    /// Removes the published container of one language.
    pub fn take_offline(&self, node: &Uuid, release: &Uuid, language: &str) -> MeshResult<Vec<MutationEvent>> {
        let mut tx = self.begin_tx();
        let node_entity = tx.node(node)?;
        let key = SlotKey::new(*release, language, ContainerType::Published);
        let Some(current) = node_entity.slot(&key) else {
            return Ok(Vec::new());
        };
        let version = tx.container(&current)?.schema_version();
        tx.set_slot(*node, key, Some(current), None);
        tx.commit()?;

        Ok(vec![delete_event(&node_entity, *release, version, ContainerType::Published, language)])
    }

    /// Deletes the content of a node in a release: one language, or every
    /// language when `language` is unset.
    pub fn delete_node_content(
        &self,
        node: &Uuid,
        release: &Uuid,
        language: Option<&str>,
    ) -> MeshResult<Vec<MutationEvent>> {
        let mut tx = self.begin_tx();
        let node_entity = tx.node(node)?;
        let mut events = Vec::new();

        let slots: Vec<(SlotKey, Uuid)> = node_entity
            .slots()
            .iter()
            .filter(|(k, _)| k.release == *release)
            .filter(|(k, _)| language.map_or(true, |l| k.language == l))
            .map(|(k, c)| (k.clone(), *c))
            .collect();

        for (key, container) in slots {
            let version = tx.container(&container)?.schema_version();
            events.push(delete_event(&node_entity, *release, version, key.container_type, &key.language));
            tx.set_slot(*node, key, Some(container), None);
        }
        tx.commit()?;
        Ok(events)
    }

    fn definition_of(&self, schema: &Uuid, version: &Uuid) -> MeshResult<SchemaDefinition> {
        self.read(|s| {
            s.schema(schema)
                .and_then(|c| c.get(version))
                .map(|v| v.definition().clone())
        })
        .ok_or_else(|| {
            MeshError::new(
                &format!("Schema version {} not found", version),
                ErrorKind::NotFound,
            )
        })
    }
}

fn check_language(project: &Project, language: &str) -> MeshResult<()> {
    if !project.has_language(language) {
        return Err(MeshError::new(
            &format!("Language '{}' is not enabled in project '{}'", language, project.name()),
            ErrorKind::ValidationError,
        ));
    }
    Ok(())
}

fn assigned_version(release: &Release, schema: &Uuid) -> MeshResult<Uuid> {
    release.schema_version(schema).ok_or_else(|| {
        MeshError::new(
            &format!("Schema {} is not assigned to release '{}'", schema, release.name()),
            ErrorKind::InvalidOperation,
        )
    })
}

fn slot_context(
    node: &Node,
    release: Uuid,
    version: Uuid,
    container_type: ContainerType,
    language: &str,
) -> IndexContext {
    IndexContext::new()
        .project(node.project_uuid())
        .release(release)
        .schema_version(version)
        .container_type(container_type)
        .language(language)
}

fn slot_event(
    node: &Node,
    release: Uuid,
    version: Uuid,
    container_type: ContainerType,
    language: &str,
) -> MutationEvent {
    MutationEvent::store_node(node.uuid(), slot_context(node, release, version, container_type, language))
}

fn delete_event(
    node: &Node,
    release: Uuid,
    version: Uuid,
    container_type: ContainerType,
    language: &str,
) -> MutationEvent {
    MutationEvent::delete_node(node.uuid(), slot_context(node, release, version, container_type, language))
}
