use crate::common::INITIAL_SCHEMA_VERSION;
use crate::errors::{ErrorKind, MeshError, MeshResult};
use crate::schema::{Change, ChangeSet, MigrationScript, SchemaDefinition};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Lifecycle state of a schema version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VersionStatus {
    /// Materialized but not yet part of the chain.
    DraftDefinition,
    /// Linked into the chain.
    Linked,
    /// Assigned to at least one release.
    Active,
    /// Superseded and referenced by no release.
    Retired,
}

impl VersionStatus {
    pub fn can_transition_to(&self, next: VersionStatus) -> bool {
        use VersionStatus::*;
        matches!(
            (self, next),
            (DraftDefinition, Linked) | (Linked, Active) | (Linked, Retired) | (Active, Retired)
        ) || *self == next
    }
}

impl Display for VersionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            VersionStatus::DraftDefinition => write!(f, "DRAFT_DEFINITION"),
            VersionStatus::Linked => write!(f, "LINKED"),
            VersionStatus::Active => write!(f, "ACTIVE"),
            VersionStatus::Retired => write!(f, "RETIRED"),
        }
    }
}

/// Immutable snapshot of a schema definition within a version chain.
#[derive(Debug, Clone)]
pub struct SchemaVersion {
    uuid: Uuid,
    container_uuid: Uuid,
    version: u32,
    definition: SchemaDefinition,
    status: VersionStatus,
    created: DateTime<Utc>,
    previous: Option<Uuid>,
    next: Option<Uuid>,
    previous_change: Option<Uuid>,
    next_change: Option<Uuid>,
}

impl SchemaVersion {
    fn new(container_uuid: Uuid, version: u32, definition: SchemaDefinition) -> Self {
        SchemaVersion {
            uuid: Uuid::new_v4(),
            container_uuid,
            version,
            definition,
            status: VersionStatus::DraftDefinition,
            created: Utc::now(),
            previous: None,
            next: None,
            previous_change: None,
            next_change: None,
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn container_uuid(&self) -> Uuid {
        self.container_uuid
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn definition(&self) -> &SchemaDefinition {
        &self.definition
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn status(&self) -> VersionStatus {
        self.status
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn previous(&self) -> Option<Uuid> {
        self.previous
    }

    pub fn next(&self) -> Option<Uuid> {
        self.next
    }

    /// Last change of the transition leading to this version.
    pub fn previous_change(&self) -> Option<Uuid> {
        self.previous_change
    }

    /// First change of the transition leaving this version.
    pub fn next_change(&self) -> Option<Uuid> {
        self.next_change
    }

    pub fn is_latest(&self) -> bool {
        self.next.is_none()
    }
}

/// Stable identity of a content type, owning its version chain.
///
/// Versions and changes live in arenas keyed by uuid; every link between
/// them is an id reference and all traversal walks the arenas.
#[derive(Debug, Clone)]
pub struct SchemaContainer {
    uuid: Uuid,
    first: Uuid,
    latest: Uuid,
    versions: HashMap<Uuid, SchemaVersion>,
    changes: HashMap<Uuid, Change>,
}

impl SchemaContainer {
    /// Creates a container whose chain holds the single initial version.
    pub fn new(definition: SchemaDefinition) -> MeshResult<Self> {
        definition.validate()?;
        let uuid = Uuid::new_v4();
        let mut version = SchemaVersion::new(uuid, INITIAL_SCHEMA_VERSION, definition);
        version.status = VersionStatus::Linked;
        let version_uuid = version.uuid;

        let mut versions = HashMap::new();
        versions.insert(version_uuid, version);
        Ok(SchemaContainer {
            uuid,
            first: version_uuid,
            latest: version_uuid,
            versions,
            changes: HashMap::new(),
        })
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Name of the latest definition.
    pub fn name(&self) -> &str {
        self.latest().name()
    }

    pub fn first(&self) -> &SchemaVersion {
        // first and latest always refer to arena entries
        &self.versions[&self.first]
    }

    pub fn latest(&self) -> &SchemaVersion {
        &self.versions[&self.latest]
    }

    pub fn get(&self, version: &Uuid) -> Option<&SchemaVersion> {
        self.versions.get(version)
    }

    pub fn contains(&self, version: &Uuid) -> bool {
        self.versions.contains_key(version)
    }

    pub fn next(&self, version: &Uuid) -> Option<&SchemaVersion> {
        self.get(version)
            .and_then(|v| v.next)
            .and_then(|n| self.versions.get(&n))
    }

    pub fn previous(&self, version: &Uuid) -> Option<&SchemaVersion> {
        self.get(version)
            .and_then(|v| v.previous)
            .and_then(|p| self.versions.get(&p))
    }

    pub fn find_by_number(&self, number: u32) -> Option<&SchemaVersion> {
        self.versions.values().find(|v| v.version == number)
    }

    pub fn version_count(&self) -> usize {
        self.versions.len()
    }

    pub fn change(&self, uuid: &Uuid) -> Option<&Change> {
        self.changes.get(uuid)
    }

    /// Attaches a custom migration script to an already linked change, so
    /// that releases still pinned before it can be retried.
    pub fn attach_script(&mut self, change: &Uuid, script: MigrationScript) -> MeshResult<()> {
        let entry = self.changes.get_mut(change).ok_or_else(|| {
            MeshError::new(&format!("Change {} not found", change), ErrorKind::NotFound)
        })?;
        log::debug!("Attaching script {} to change {}", script.name(), change);
        entry.set_script(script);
        Ok(())
    }

    /// Iterates from the first version to the latest.
    pub fn iter_forward(&self) -> ChainIter<'_> {
        ChainIter {
            container: self,
            cursor: Some(self.first),
            forward: true,
        }
    }

    /// Iterates from the latest version back to the first.
    pub fn iter_backward(&self) -> ChainIter<'_> {
        ChainIter {
            container: self,
            cursor: Some(self.latest),
            forward: false,
        }
    }

    /// Changes of the transition leaving `version`, in order.
    pub fn outbound_changes(&self, version: &Uuid) -> Vec<&Change> {
        let mut result = Vec::new();
        let mut cursor = self.get(version).and_then(|v| v.next_change);
        while let Some(id) = cursor {
            match self.changes.get(&id) {
                Some(change) if change.from_version == Some(*version) => {
                    result.push(change);
                    cursor = change.next_change;
                }
                _ => break,
            }
        }
        result
    }

    /// Concatenated changes of every transition from `from` up to `to`.
    pub fn changes_between(&self, from: &Uuid, to: &Uuid) -> MeshResult<Vec<&Change>> {
        let start = self.get(from).ok_or_else(|| self.version_not_found(from))?;
        let end = self.get(to).ok_or_else(|| self.version_not_found(to))?;
        if start.version > end.version {
            return Err(MeshError::new(
                &format!("Version {} does not precede version {}", start.version, end.version),
                ErrorKind::InvalidOperation,
            ));
        }

        let mut result = Vec::new();
        let mut cursor = *from;
        while cursor != *to {
            result.extend(self.outbound_changes(&cursor));
            cursor = self
                .get(&cursor)
                .and_then(|v| v.next)
                .ok_or_else(|| {
                    MeshError::new("Version chain ends before target version", ErrorKind::InternalError)
                })?;
        }
        Ok(result)
    }

    /// Materializes a successor of `expected_latest` and links `changes`
    /// between the two versions. Returns the new version's uuid.
    ///
    /// Fails with `ConcurrentSchemaUpdate` when `expected_latest` is no longer
    /// the latest version of this container.
    pub fn link(
        &mut self,
        expected_latest: Uuid,
        changes: ChangeSet,
        definition: SchemaDefinition,
    ) -> MeshResult<Uuid> {
        if changes.is_empty() {
            return Err(MeshError::new(
                "Cannot link an empty change set",
                ErrorKind::InvalidOperation,
            ));
        }
        if self.latest != expected_latest {
            return Err(MeshError::new(
                &format!(
                    "Schema container {} was updated concurrently: latest version is no longer {}",
                    self.uuid, expected_latest
                ),
                ErrorKind::ConcurrentSchemaUpdate,
            ));
        }
        definition.validate()?;

        let old_uuid = self.latest;
        let mut version = SchemaVersion::new(self.uuid, self.latest().version + 1, definition);
        let new_uuid = version.uuid;

        let mut changes = changes.into_changes();
        let ids: Vec<Uuid> = changes.iter().map(Change::uuid).collect();
        for (i, change) in changes.iter_mut().enumerate() {
            change.from_version = Some(old_uuid);
            change.to_version = Some(new_uuid);
            change.previous_change = if i > 0 { Some(ids[i - 1]) } else { None };
            change.next_change = ids.get(i + 1).copied();
        }

        version.previous = Some(old_uuid);
        version.previous_change = ids.last().copied();
        version.status = VersionStatus::Linked;

        if let Some(old) = self.versions.get_mut(&old_uuid) {
            old.next = Some(new_uuid);
            old.next_change = ids.first().copied();
        }
        for change in changes {
            self.changes.insert(change.uuid(), change);
        }
        self.versions.insert(new_uuid, version);
        self.latest = new_uuid;

        log::debug!(
            "Linked version {} of schema container {} with {} changes",
            self.latest().version,
            self.uuid,
            ids.len()
        );
        Ok(new_uuid)
    }

    /// Moves a version to `status`, rejecting invalid transitions.
    pub fn set_status(&mut self, version: &Uuid, status: VersionStatus) -> MeshResult<()> {
        let latest = self.latest;
        let entry = self
            .versions
            .get_mut(version)
            .ok_or_else(|| MeshError::new(&format!("Schema version {} not found", version), ErrorKind::NotFound))?;

        if !entry.status.can_transition_to(status) {
            return Err(MeshError::new(
                &format!("Invalid version status transition {} -> {}", entry.status, status),
                ErrorKind::InvalidOperation,
            ));
        }
        if status == VersionStatus::Retired && entry.uuid == latest {
            return Err(MeshError::new(
                "The latest schema version cannot be retired",
                ErrorKind::InvalidOperation,
            ));
        }
        entry.status = status;
        Ok(())
    }

    /// Checks every structural invariant of the chain.
    pub fn verify(&self) -> MeshResult<()> {
        let heads: Vec<_> = self.versions.values().filter(|v| v.previous.is_none()).collect();
        let tails: Vec<_> = self.versions.values().filter(|v| v.next.is_none()).collect();
        if heads.len() != 1 || heads[0].uuid != self.first {
            return Err(self.corrupt("chain must have exactly one first version"));
        }
        if tails.len() != 1 || tails[0].uuid != self.latest {
            return Err(self.corrupt("chain must have exactly one latest version"));
        }

        let mut visited = HashSet::new();
        let mut last_number = None;
        for version in self.iter_forward() {
            if !visited.insert(version.uuid) {
                return Err(self.corrupt("chain contains a cycle"));
            }
            if let Some(last) = last_number {
                if version.version <= last {
                    return Err(self.corrupt("version numbers must strictly increase"));
                }
            }
            last_number = Some(version.version);

            if let Some(prev) = version.previous {
                let back = self.versions.get(&prev).and_then(|p| p.next);
                if back != Some(version.uuid) {
                    return Err(self.corrupt("next(prev(v)) does not return v"));
                }
                let inbound = version
                    .previous_change
                    .and_then(|c| self.changes.get(&c))
                    .ok_or_else(|| self.corrupt("linked version has no inbound change"))?;
                if inbound.to_version != Some(version.uuid) || inbound.from_version != Some(prev) {
                    return Err(self.corrupt("inbound change links the wrong versions"));
                }
            }
        }
        if visited.len() != self.versions.len() {
            return Err(self.corrupt("chain does not reach every version"));
        }
        Ok(())
    }

    fn version_not_found(&self, version: &Uuid) -> MeshError {
        MeshError::new(
            &format!("Schema version {} not found in container {}", version, self.uuid),
            ErrorKind::NotFound,
        )
    }

    fn corrupt(&self, reason: &str) -> MeshError {
        MeshError::new(
            &format!("Corrupt version chain in container {}: {}", self.uuid, reason),
            ErrorKind::InternalError,
        )
    }
}

/// Iterator over the versions of a chain.
pub struct ChainIter<'a> {
    container: &'a SchemaContainer,
    cursor: Option<Uuid>,
    forward: bool,
}

impl<'a> Iterator for ChainIter<'a> {
    type Item = &'a SchemaVersion;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.container.versions.get(&self.cursor?)?;
        self.cursor = if self.forward { current.next } else { current.previous };
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldSchema, FieldType};

    fn definition() -> SchemaDefinition {
        SchemaDefinition::new("article").with_field(FieldSchema::new("title", FieldType::String))
    }

    fn add(container: &mut SchemaContainer, field: &str) -> Uuid {
        let latest = container.latest().uuid();
        let changes = ChangeSet::from(vec![Change::add_field(
            &FieldSchema::new(field, FieldType::String),
            Some("title"),
        )]);
        let next = changes.apply_to(container.latest().definition()).unwrap();
        container.link(latest, changes, next).unwrap()
    }

    #[test]
    fn test_new_container_has_single_version() {
        let container = SchemaContainer::new(definition()).unwrap();
        assert_eq!(container.version_count(), 1);
        assert_eq!(container.first().uuid(), container.latest().uuid());
        assert_eq!(container.latest().version(), 1);
        assert_eq!(container.latest().status(), VersionStatus::Linked);
        assert!(container.verify().is_ok());
    }

    #[test]
    fn test_invalid_definition_rejected() {
        let bad = SchemaDefinition::new("article").with_field(FieldSchema::new("9x", FieldType::String));
        assert!(SchemaContainer::new(bad).is_err());
    }

    #[test]
    fn test_link_sets_prev_next_and_changes() {
        let mut container = SchemaContainer::new(definition()).unwrap();
        let v1 = container.latest().uuid();
        let v2 = add(&mut container, "teaser");

        assert_eq!(container.next(&v1).map(|v| v.uuid()), Some(v2));
        assert_eq!(container.previous(&v2).map(|v| v.uuid()), Some(v1));
        assert_eq!(container.latest().version(), 2);

        let outbound = container.outbound_changes(&v1);
        assert_eq!(outbound.len(), 1);
        assert_eq!(outbound[0].from_version(), Some(v1));
        assert_eq!(outbound[0].to_version(), Some(v2));
        assert_eq!(container.get(&v2).unwrap().previous_change(), Some(outbound[0].uuid()));
        assert!(container.verify().is_ok());
    }

    #[test]
    fn test_link_against_stale_latest_is_concurrent_update() {
        let mut container = SchemaContainer::new(definition()).unwrap();
        let v1 = container.latest().uuid();
        add(&mut container, "teaser");

        let changes = ChangeSet::from(vec![Change::remove_field("title")]);
        let err = container
            .link(v1, changes, SchemaDefinition::new("article"))
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::ConcurrentSchemaUpdate);
    }

    #[test]
    fn test_link_empty_change_set_fails() {
        let mut container = SchemaContainer::new(definition()).unwrap();
        let v1 = container.latest().uuid();
        let err = container.link(v1, ChangeSet::new(), definition()).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::InvalidOperation);
    }

    #[test]
    fn test_forward_and_backward_iteration_visit_every_version() {
        let mut container = SchemaContainer::new(definition()).unwrap();
        add(&mut container, "a");
        add(&mut container, "b");
        add(&mut container, "c");

        let forward: Vec<u32> = container.iter_forward().map(|v| v.version()).collect();
        let mut backward: Vec<u32> = container.iter_backward().map(|v| v.version()).collect();
        assert_eq!(forward, vec![1, 2, 3, 4]);
        backward.reverse();
        assert_eq!(forward, backward);
        assert!(container.latest().is_latest());
        assert_eq!(container.find_by_number(3).map(|v| v.version()), Some(3));
        assert!(container.verify().is_ok());
    }

    #[test]
    fn test_changes_between_concatenates_transitions() {
        let mut container = SchemaContainer::new(definition()).unwrap();
        let v1 = container.latest().uuid();
        add(&mut container, "a");
        let v3 = add(&mut container, "b");

        let changes = container.changes_between(&v1, &v3).unwrap();
        let names: Vec<_> = changes.iter().filter_map(|c| c.field_name()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(container.changes_between(&v3, &v1).is_err());
        assert!(container.changes_between(&v3, &v3).unwrap().is_empty());
    }

    #[test]
    fn test_status_transitions() {
        let mut container = SchemaContainer::new(definition()).unwrap();
        let v1 = container.latest().uuid();
        container.set_status(&v1, VersionStatus::Active).unwrap();
        // latest version cannot retire
        assert!(container.set_status(&v1, VersionStatus::Retired).is_err());

        let v2 = add(&mut container, "a");
        container.set_status(&v1, VersionStatus::Retired).unwrap();
        assert!(container.set_status(&v1, VersionStatus::Active).is_err());
        assert!(container.set_status(&v2, VersionStatus::DraftDefinition).is_err());
    }

    #[test]
    fn test_status_transition_table() {
        use VersionStatus::*;
        assert!(DraftDefinition.can_transition_to(Linked));
        assert!(Linked.can_transition_to(Active));
        assert!(Active.can_transition_to(Retired));
        assert!(!Retired.can_transition_to(Active));
        assert!(!DraftDefinition.can_transition_to(Active));
    }
}
