use crate::common::FieldMap;
use crate::content::ContainerType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Addresses one field container slot of a node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotKey {
    pub release: Uuid,
    pub language: String,
    pub container_type: ContainerType,
}

impl SlotKey {
    pub fn new(release: Uuid, language: &str, container_type: ContainerType) -> Self {
        SlotKey {
            release,
            language: language.to_string(),
            container_type,
        }
    }

    /// Identifier of the migration unit this slot forms for `node`.
    pub fn unit_id(&self, node: &Uuid) -> String {
        format!("{}/{}/{}/{}", node, self.language, self.release, self.container_type)
    }
}

/// A content node. Its slots point at the field containers that are current
/// for each release, language and container type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    uuid: Uuid,
    project_uuid: Uuid,
    schema_container: Uuid,
    slots: BTreeMap<SlotKey, Uuid>,
}

impl Node {
    pub(crate) fn new(project_uuid: Uuid, schema_container: Uuid) -> Self {
        Node {
            uuid: Uuid::new_v4(),
            project_uuid,
            schema_container,
            slots: BTreeMap::new(),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn project_uuid(&self) -> Uuid {
        self.project_uuid
    }

    pub fn schema_container(&self) -> Uuid {
        self.schema_container
    }

    pub fn slot(&self, key: &SlotKey) -> Option<Uuid> {
        self.slots.get(key).copied()
    }

    pub fn slots(&self) -> &BTreeMap<SlotKey, Uuid> {
        &self.slots
    }

    /// Slots of one release and container type, ordered by language.
    pub fn slots_of(
        &self,
        release: Uuid,
        container_type: ContainerType,
    ) -> impl Iterator<Item = (&SlotKey, &Uuid)> {
        self.slots
            .iter()
            .filter(move |(k, _)| k.release == release && k.container_type == container_type)
    }

    /// Languages that have a container in the given release and type.
    pub fn languages(&self, release: Uuid, container_type: ContainerType) -> Vec<&str> {
        self.slots_of(release, container_type)
            .map(|(k, _)| k.language.as_str())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub(crate) fn set_slot(&mut self, key: SlotKey, container: Uuid) -> Option<Uuid> {
        self.slots.insert(key, container)
    }

    pub(crate) fn remove_slot(&mut self, key: &SlotKey) -> Option<Uuid> {
        self.slots.remove(key)
    }

    /// Copies every slot of `from` into `to`.
    pub(crate) fn copy_release_slots(&mut self, from: Uuid, to: Uuid) {
        let copied: Vec<_> = self
            .slots
            .iter()
            .filter(|(k, _)| k.release == from)
            .map(|(k, c)| (SlotKey::new(to, &k.language, k.container_type), *c))
            .collect();
        self.slots.extend(copied);
    }
}

/// One language and version specific body of field values of a node.
///
/// Containers are never modified after creation; edits and migrations
/// produce new containers and repoint the node's slots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldContainer {
    uuid: Uuid,
    node_uuid: Uuid,
    language: String,
    schema_container: Uuid,
    schema_version: Uuid,
    fields: FieldMap,
    created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    previous: Option<Uuid>,
}

impl FieldContainer {
    pub(crate) fn new(
        node_uuid: Uuid,
        language: &str,
        schema_container: Uuid,
        schema_version: Uuid,
        fields: FieldMap,
    ) -> Self {
        FieldContainer {
            uuid: Uuid::new_v4(),
            node_uuid,
            language: language.to_string(),
            schema_container,
            schema_version,
            fields,
            created: Utc::now(),
            previous: None,
        }
    }

    /// Creates the successor of this container with new values on `schema_version`.
    pub(crate) fn successor(&self, schema_version: Uuid, fields: FieldMap) -> Self {
        let mut next = FieldContainer::new(
            self.node_uuid,
            &self.language,
            self.schema_container,
            schema_version,
            fields,
        );
        next.previous = Some(self.uuid);
        next
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn node_uuid(&self) -> Uuid {
        self.node_uuid
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn schema_container(&self) -> Uuid {
        self.schema_container
    }

    pub fn schema_version(&self) -> Uuid {
        self.schema_version
    }

    pub fn fields(&self) -> &FieldMap {
        &self.fields
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    /// The container this one superseded.
    pub fn previous(&self) -> Option<Uuid> {
        self.previous
    }
}
