use crate::content::{FieldContainer, Node, Project, Release, SlotKey};
use crate::errors::{ErrorKind, MeshError, MeshResult};
use crate::schema::{SchemaContainer, VersionStatus};
use crate::store::{MeshStore, StoreState};
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

/// Lifecycle state of a store transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    /// Accepting reads and staged writes
    Active,
    /// All staged writes were applied
    Committed,
    /// Commit validation failed, nothing was applied
    Failed,
    /// Rolled back by the caller or dropped while active
    Aborted,
}

/// A write whose effect depends on committed state and is evaluated at
/// commit time.
#[derive(Debug, Clone)]
enum Command {
    /// Compare-and-set on a node slot; `None` means empty.
    Slot {
        node: Uuid,
        key: SlotKey,
        expected: Option<Uuid>,
        new: Option<Uuid>,
    },
    VersionStatus {
        schema: Uuid,
        version: Uuid,
        status: VersionStatus,
    },
    /// Retires `version` when no release references it anymore.
    RetireUnreferenced { schema: Uuid, version: Uuid },
}

/// A unit of work against the [MeshStore].
///
/// Reads of schema containers and releases capture their revision; commit
/// fails when any of them changed since. A conflicting schema container is
/// reported as `ConcurrentSchemaUpdate`, a conflicting release, slot or
/// release content revision as `TransactionConflict`. Reads observe the
/// transaction's own staged writes.
pub struct StoreTransaction {
    id: u64,
    store: MeshStore,
    state: TransactionState,
    schema_reads: HashMap<Uuid, u64>,
    release_reads: HashMap<Uuid, u64>,
    content_reads: HashMap<Uuid, u64>,
    projects: BTreeMap<Uuid, Project>,
    releases: BTreeMap<Uuid, Release>,
    schemas: BTreeMap<Uuid, SchemaContainer>,
    nodes: BTreeMap<Uuid, Node>,
    containers: BTreeMap<Uuid, FieldContainer>,
    commands: Vec<Command>,
}

impl StoreTransaction {
    pub(crate) fn new(id: u64, store: MeshStore) -> Self {
        StoreTransaction {
            id,
            store,
            state: TransactionState::Active,
            schema_reads: HashMap::new(),
            release_reads: HashMap::new(),
            content_reads: HashMap::new(),
            projects: BTreeMap::new(),
            releases: BTreeMap::new(),
            schemas: BTreeMap::new(),
            nodes: BTreeMap::new(),
            containers: BTreeMap::new(),
            commands: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn project(&self, uuid: &Uuid) -> MeshResult<Project> {
        if let Some(project) = self.projects.get(uuid) {
            return Ok(project.clone());
        }
        self.store
            .read(|s| s.project(uuid).cloned())
            .ok_or_else(|| not_found("Project", uuid))
    }

    /// Reads a schema container and captures its revision.
    pub fn schema(&mut self, uuid: &Uuid) -> MeshResult<SchemaContainer> {
        if let Some(schema) = self.schemas.get(uuid) {
            return Ok(schema.clone());
        }
        let (schema, revision) = self
            .store
            .read(|s| s.schema(uuid).map(|c| (c.clone(), s.schema_revision(uuid))))
            .ok_or_else(|| not_found("Schema container", uuid))?;
        self.schema_reads.entry(*uuid).or_insert(revision);
        Ok(schema)
    }

    /// Reads a release and captures its revision.
    pub fn release(&mut self, uuid: &Uuid) -> MeshResult<Release> {
        if let Some(release) = self.releases.get(uuid) {
            return Ok(release.clone());
        }
        let (release, revision) = self
            .store
            .read(|s| s.release(uuid).map(|r| (r.clone(), s.release_revision(uuid))))
            .ok_or_else(|| not_found("Release", uuid))?;
        self.release_reads.entry(*uuid).or_insert(revision);
        Ok(release)
    }

    pub fn node(&self, uuid: &Uuid) -> MeshResult<Node> {
        if let Some(node) = self.nodes.get(uuid) {
            return Ok(node.clone());
        }
        self.store
            .read(|s| s.node(uuid).cloned())
            .ok_or_else(|| not_found("Node", uuid))
    }

    pub fn container(&self, uuid: &Uuid) -> MeshResult<FieldContainer> {
        if let Some(container) = self.containers.get(uuid) {
            return Ok(container.clone());
        }
        self.store
            .read(|s| s.container(uuid).cloned())
            .ok_or_else(|| not_found("Field container", uuid))
    }

    pub fn put_project(&mut self, project: Project) {
        self.projects.insert(project.uuid(), project);
    }

    /// Stages a release. A release that was not read before is captured at
    /// its current revision.
    pub fn put_release(&mut self, release: Release) {
        let uuid = release.uuid();
        if !self.release_reads.contains_key(&uuid) {
            let revision = self.store.read(|s| s.release_revision(&uuid));
            self.release_reads.insert(uuid, revision);
        }
        self.releases.insert(uuid, release);
    }

    pub fn put_schema(&mut self, schema: SchemaContainer) {
        let uuid = schema.uuid();
        if !self.schema_reads.contains_key(&uuid) {
            let revision = self.store.read(|s| s.schema_revision(&uuid));
            self.schema_reads.insert(uuid, revision);
        }
        self.schemas.insert(uuid, schema);
    }

    /// Stages a node that does not exist yet.
    pub fn put_new_node(&mut self, node: Node) {
        self.nodes.insert(node.uuid(), node);
    }

    pub fn put_container(&mut self, container: FieldContainer) {
        self.containers.insert(container.uuid(), container);
    }

    /// Points a node slot at `new` if it still points at `expected` when
    /// the transaction commits.
    pub fn set_slot(&mut self, node: Uuid, key: SlotKey, expected: Option<Uuid>, new: Option<Uuid>) {
        self.commands.push(Command::Slot {
            node,
            key,
            expected,
            new,
        });
    }

    /// Fails the commit when any slot of `release` was written after the
    /// content revision `revision` was observed.
    pub fn expect_content_revision(&mut self, release: Uuid, revision: u64) {
        self.content_reads.insert(release, revision);
    }

    pub fn set_version_status(&mut self, schema: Uuid, version: Uuid, status: VersionStatus) {
        self.commands.push(Command::VersionStatus {
            schema,
            version,
            status,
        });
    }

    pub fn retire_if_unreferenced(&mut self, schema: Uuid, version: Uuid) {
        self.commands
            .push(Command::RetireUnreferenced { schema, version });
    }

    /// Validates and applies every staged write atomically.
    pub fn commit(mut self) -> MeshResult<()> {
        self.ensure_active()?;
        let store = self.store.clone();
        let result = store.write(|state| self.apply(state));
        self.state = match result {
            Ok(_) => TransactionState::Committed,
            Err(_) => TransactionState::Failed,
        };
        if let Err(e) = &result {
            log::debug!("Transaction {} failed to commit: {}", self.id, e);
        }
        result
    }

    /// Discards every staged write.
    pub fn rollback(mut self) {
        self.state = TransactionState::Aborted;
        log::debug!("Transaction {} rolled back", self.id);
    }

    fn ensure_active(&self) -> MeshResult<()> {
        if self.state != TransactionState::Active {
            return Err(MeshError::new(
                &format!("Transaction {} is not active", self.id),
                ErrorKind::InvalidOperation,
            ));
        }
        Ok(())
    }

    fn apply(&mut self, state: &mut StoreState) -> MeshResult<()> {
        for (uuid, revision) in &self.schema_reads {
            if state.schema_revision(uuid) != *revision {
                return Err(MeshError::new(
                    &format!("Schema container {} was modified by a concurrent transaction", uuid),
                    ErrorKind::ConcurrentSchemaUpdate,
                ));
            }
        }
        for (uuid, revision) in &self.release_reads {
            if state.release_revision(uuid) != *revision {
                return Err(MeshError::new(
                    &format!("Release {} was modified by a concurrent transaction", uuid),
                    ErrorKind::TransactionConflict,
                ));
            }
        }
        for (uuid, revision) in &self.content_reads {
            if state.content_revision(uuid) != *revision {
                return Err(MeshError::new(
                    &format!("Content of release {} was modified by a concurrent transaction", uuid),
                    ErrorKind::TransactionConflict,
                ));
            }
        }

        // evaluate commands on copies so a failure leaves the state untouched
        let mut releases = state.releases.clone();
        releases.extend(self.releases.iter().map(|(k, v)| (*k, v.clone())));
        let mut touched_nodes: BTreeMap<Uuid, Node> = self.nodes.clone();
        let mut touched_schemas: BTreeMap<Uuid, SchemaContainer> = self.schemas.clone();
        let mut touched_content: HashSet<Uuid> = HashSet::new();

        for command in &self.commands {
            match command {
                Command::Slot {
                    node,
                    key,
                    expected,
                    new,
                } => {
                    if !touched_nodes.contains_key(node) {
                        let current = state
                            .nodes
                            .get(node)
                            .cloned()
                            .ok_or_else(|| not_found("Node", node))?;
                        touched_nodes.insert(*node, current);
                    }
                    let entry = touched_nodes
                        .get_mut(node)
                        .ok_or_else(|| not_found("Node", node))?;
                    if entry.slot(key) != *expected {
                        return Err(MeshError::new(
                            &format!(
                                "Slot {} of node {} was modified by a concurrent transaction",
                                key.unit_id(node),
                                node
                            ),
                            ErrorKind::TransactionConflict,
                        ));
                    }
                    match new {
                        Some(container) => entry.set_slot(key.clone(), *container),
                        None => entry.remove_slot(key),
                    };
                    touched_content.insert(key.release);
                }
                Command::VersionStatus {
                    schema,
                    version,
                    status,
                } => {
                    let entry = touched_schema(&mut touched_schemas, state, schema)?;
                    entry.set_status(version, *status)?;
                }
                Command::RetireUnreferenced { schema, version } => {
                    let referenced = releases.values().any(|r| r.references_version(version));
                    let entry = touched_schema(&mut touched_schemas, state, schema)?;
                    let is_latest = entry.latest().uuid() == *version;
                    let retired = entry.get(version).map(|v| v.status()) == Some(VersionStatus::Retired);
                    if !referenced && !is_latest && !retired {
                        entry.set_status(version, VersionStatus::Retired)?;
                        log::info!("Schema version {} retired", version);
                    }
                }
            }
        }

        for (uuid, project) in std::mem::take(&mut self.projects) {
            state.projects.insert(uuid, project);
        }
        for (uuid, schema) in touched_schemas {
            *state.schema_revisions.entry(uuid).or_insert(0) += 1;
            state.schemas.insert(uuid, schema);
        }
        for (uuid, release) in std::mem::take(&mut self.releases) {
            *state.release_revisions.entry(uuid).or_insert(0) += 1;
            state.releases.insert(uuid, release);
        }
        for (uuid, container) in std::mem::take(&mut self.containers) {
            state.containers.insert(uuid, container);
        }
        for (uuid, node) in touched_nodes {
            state.nodes.insert(uuid, node);
        }
        for release in touched_content {
            *state.content_revisions.entry(release).or_insert(0) += 1;
        }
        Ok(())
    }
}

fn touched_schema<'a>(
    touched: &'a mut BTreeMap<Uuid, SchemaContainer>,
    state: &StoreState,
    schema: &Uuid,
) -> MeshResult<&'a mut SchemaContainer> {
    if !touched.contains_key(schema) {
        let current = state
            .schemas
            .get(schema)
            .cloned()
            .ok_or_else(|| not_found("Schema container", schema))?;
        touched.insert(*schema, current);
    }
    touched
        .get_mut(schema)
        .ok_or_else(|| not_found("Schema container", schema))
}

fn not_found(what: &str, uuid: &Uuid) -> MeshError {
    MeshError::new(&format!("{} {} not found", what, uuid), ErrorKind::NotFound)
}

impl Drop for StoreTransaction {
    fn drop(&mut self) {
        if self.state == TransactionState::Active {
            self.state = TransactionState::Aborted;
            log::debug!("Transaction {} dropped without commit, staged writes discarded", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ContainerType;
    use crate::fields;
    use crate::schema::{FieldSchema, FieldType, SchemaDefinition};

    fn schema() -> SchemaContainer {
        SchemaContainer::new(
            SchemaDefinition::new("page").with_field(FieldSchema::new("title", FieldType::String)),
        )
        .unwrap()
    }

    #[test]
    fn test_commit_applies_staged_writes() {
        let store = MeshStore::new();
        let container = schema();
        let uuid = container.uuid();

        let mut tx = store.begin_tx();
        tx.put_schema(container);
        assert!(store.read(|s| s.schema(&uuid).is_none()));
        // reads observe staged writes
        assert!(tx.schema(&uuid).is_ok());
        tx.commit().unwrap();
        assert!(store.read(|s| s.schema(&uuid).is_some()));
    }

    #[test]
    fn test_rollback_discards_writes() {
        let store = MeshStore::new();
        let container = schema();
        let uuid = container.uuid();

        let mut tx = store.begin_tx();
        tx.put_schema(container);
        assert_eq!(tx.state(), TransactionState::Active);
        tx.rollback();
        assert!(store.read(|s| s.schema(&uuid).is_none()));
    }

    #[test]
    fn test_concurrent_schema_write_is_detected() {
        let store = MeshStore::new();
        let container = schema();
        let uuid = container.uuid();
        let mut tx = store.begin_tx();
        tx.put_schema(container);
        tx.commit().unwrap();

        let mut first = store.begin_tx();
        let mut second = store.begin_tx();
        let a = first.schema(&uuid).unwrap();
        let b = second.schema(&uuid).unwrap();
        first.put_schema(a);
        second.put_schema(b);
        first.commit().unwrap();
        let err = second.commit().unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::ConcurrentSchemaUpdate);
    }

    #[test]
    fn test_concurrent_release_write_is_conflict() {
        let store = MeshStore::new();
        let release = Release::new(Uuid::new_v4(), "main");
        let uuid = release.uuid();
        let mut tx = store.begin_tx();
        tx.put_release(release);
        tx.commit().unwrap();

        let mut first = store.begin_tx();
        let mut second = store.begin_tx();
        let a = first.release(&uuid).unwrap();
        let b = second.release(&uuid).unwrap();
        first.put_release(a);
        second.put_release(b);
        first.commit().unwrap();
        assert_eq!(second.commit().unwrap_err().kind(), &ErrorKind::TransactionConflict);
    }

    #[test]
    fn test_slot_compare_and_set() {
        let store = MeshStore::new();
        let node = Node::new(Uuid::new_v4(), Uuid::new_v4());
        let node_uuid = node.uuid();
        let key = SlotKey::new(Uuid::new_v4(), "en", ContainerType::Draft);
        let content = FieldContainer::new(node_uuid, "en", Uuid::new_v4(), Uuid::new_v4(), fields! {});
        let content_uuid = content.uuid();

        let mut tx = store.begin_tx();
        tx.put_new_node(node);
        tx.put_container(content);
        tx.set_slot(node_uuid, key.clone(), None, Some(content_uuid));
        tx.commit().unwrap();
        assert_eq!(store.read(|s| s.node(&node_uuid).and_then(|n| n.slot(&key))), Some(content_uuid));

        // stale expectation fails and leaves state untouched
        let mut tx = store.begin_tx();
        tx.set_slot(node_uuid, key.clone(), None, Some(Uuid::new_v4()));
        assert_eq!(tx.commit().unwrap_err().kind(), &ErrorKind::TransactionConflict);
        assert_eq!(store.read(|s| s.node(&node_uuid).and_then(|n| n.slot(&key))), Some(content_uuid));
    }

    #[test]
    fn test_slot_write_bumps_content_revision() {
        let store = MeshStore::new();
        let release = Uuid::new_v4();
        let node = Node::new(Uuid::new_v4(), Uuid::new_v4());
        let node_uuid = node.uuid();
        let observed = store.read(|s| s.content_revision(&release));

        let mut tx = store.begin_tx();
        tx.put_new_node(node);
        tx.set_slot(node_uuid, SlotKey::new(release, "en", ContainerType::Draft), None, Some(Uuid::new_v4()));
        tx.commit().unwrap();
        assert_eq!(store.read(|s| s.content_revision(&release)), observed + 1);

        // a writer that observed the old revision loses
        let mut stale = store.begin_tx();
        stale.expect_content_revision(release, observed);
        stale.set_slot(node_uuid, SlotKey::new(release, "de", ContainerType::Draft), None, Some(Uuid::new_v4()));
        assert_eq!(stale.commit().unwrap_err().kind(), &ErrorKind::TransactionConflict);
        assert_eq!(store.read(|s| s.node(&node_uuid).unwrap().slots().len()), 1);

        // other releases are unaffected
        let mut other = store.begin_tx();
        other.expect_content_revision(Uuid::new_v4(), 0);
        other.set_slot(node_uuid, SlotKey::new(release, "de", ContainerType::Draft), None, Some(Uuid::new_v4()));
        other.commit().unwrap();
    }

    #[test]
    fn test_retire_unreferenced_version() {
        let store = MeshStore::new();
        let mut container = schema();
        let v1 = container.latest().uuid();
        let changes = crate::schema::ChangeSet::from(vec![crate::schema::Change::remove_field("title")]);
        let next = changes.apply_to(container.latest().definition()).unwrap();
        let v2 = container.link(v1, changes, next).unwrap();
        let uuid = container.uuid();

        let mut tx = store.begin_tx();
        tx.put_schema(container);
        tx.commit().unwrap();

        let mut tx = store.begin_tx();
        tx.retire_if_unreferenced(uuid, v1);
        tx.retire_if_unreferenced(uuid, v2);
        tx.commit().unwrap();

        store.read(|s| {
            let schema = s.schema(&uuid).unwrap();
            assert_eq!(schema.get(&v1).unwrap().status(), VersionStatus::Retired);
            assert_eq!(schema.get(&v2).unwrap().status(), VersionStatus::Linked);
        });
    }

    #[test]
    fn test_slot_on_missing_node_fails() {
        let store = MeshStore::new();
        let mut tx = store.begin_tx();
        let missing = Uuid::new_v4();
        tx.set_slot(missing, SlotKey::new(Uuid::new_v4(), "en", ContainerType::Draft), None, None);
        let err = tx.commit().unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::NotFound);
    }
}
