//! In-memory graph storage with optimistic transactions.
//!
//! The [MeshStore] keeps every entity in arenas keyed by uuid. Writes go
//! through a [StoreTransaction] which stages them and validates, at commit
//! time, that the schema containers and releases it read have not been
//! committed by anybody else in the meantime.

mod authoring;
mod transaction;

pub use authoring::*;
pub use transaction::*;

use crate::content::{FieldContainer, Node, Project, Release, SlotKey};
use crate::schema::{SchemaContainer, SchemaVersion};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Committed state of the store.
///
/// Obtained through [MeshStore::read]; the accessors never expose staged,
/// uncommitted data.
#[derive(Debug, Default)]
pub struct StoreState {
    projects: BTreeMap<Uuid, Project>,
    releases: HashMap<Uuid, Release>,
    schemas: BTreeMap<Uuid, SchemaContainer>,
    nodes: BTreeMap<Uuid, Node>,
    containers: HashMap<Uuid, FieldContainer>,
    schema_revisions: HashMap<Uuid, u64>,
    release_revisions: HashMap<Uuid, u64>,
    content_revisions: HashMap<Uuid, u64>,
}

impl StoreState {
    pub fn project(&self, uuid: &Uuid) -> Option<&Project> {
        self.projects.get(uuid)
    }

    /// Projects ordered by uuid.
    pub fn projects(&self) -> impl Iterator<Item = &Project> {
        self.projects.values()
    }

    pub fn release(&self, uuid: &Uuid) -> Option<&Release> {
        self.releases.get(uuid)
    }

    /// Releases of a project in creation order.
    pub fn releases_of(&self, project: &Uuid) -> Vec<&Release> {
        self.projects
            .get(project)
            .map(|p| p.releases().iter().filter_map(|r| self.releases.get(r)).collect())
            .unwrap_or_default()
    }

    pub fn schema(&self, uuid: &Uuid) -> Option<&SchemaContainer> {
        self.schemas.get(uuid)
    }

    pub fn schemas(&self) -> impl Iterator<Item = &SchemaContainer> {
        self.schemas.values()
    }

    pub fn schema_by_name(&self, name: &str) -> Option<&SchemaContainer> {
        self.schemas.values().find(|s| s.name() == name)
    }

    /// Looks a schema version up across all schema containers.
    pub fn schema_version(&self, version: &Uuid) -> Option<&SchemaVersion> {
        self.schemas.values().find_map(|s| s.get(version))
    }

    pub fn node(&self, uuid: &Uuid) -> Option<&Node> {
        self.nodes.get(uuid)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn nodes_of<'a>(&'a self, project: &'a Uuid) -> impl Iterator<Item = &'a Node> + 'a {
        self.nodes.values().filter(move |n| n.project_uuid() == *project)
    }

    pub fn container(&self, uuid: &Uuid) -> Option<&FieldContainer> {
        self.containers.get(uuid)
    }

    pub fn container_count(&self) -> usize {
        self.containers.len()
    }

    /// Field container currently in the given slot of a node.
    pub fn slot_container(&self, node: &Uuid, key: &SlotKey) -> Option<&FieldContainer> {
        self.nodes
            .get(node)
            .and_then(|n| n.slot(key))
            .and_then(|c| self.containers.get(&c))
    }

    /// Releases of the project that currently point at `version`.
    pub fn releases_on_version(&self, version: &Uuid) -> Vec<&Release> {
        let mut releases: Vec<_> = self
            .releases
            .values()
            .filter(|r| r.references_version(version))
            .collect();
        releases.sort_by_key(|r| (r.created(), r.uuid()));
        releases
    }

    pub(crate) fn schema_revision(&self, uuid: &Uuid) -> u64 {
        self.schema_revisions.get(uuid).copied().unwrap_or(0)
    }

    pub(crate) fn release_revision(&self, uuid: &Uuid) -> u64 {
        self.release_revisions.get(uuid).copied().unwrap_or(0)
    }

    /// Revision of the content of a release, bumped by every committed slot
    /// write in that release.
    pub fn content_revision(&self, release: &Uuid) -> u64 {
        self.content_revisions.get(release).copied().unwrap_or(0)
    }
}

/// Shared handle to the in-memory graph storage.
///
/// Cloning is cheap; all clones share the same state.
#[derive(Clone, Default)]
pub struct MeshStore {
    inner: Arc<MeshStoreInner>,
}

#[derive(Default)]
struct MeshStoreInner {
    state: RwLock<StoreState>,
    tx_counter: AtomicU64,
}

impl MeshStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` against the committed state under a read lock.
    pub fn read<R>(&self, f: impl FnOnce(&StoreState) -> R) -> R {
        f(&self.inner.state.read())
    }

    /// Opens a new transaction.
    pub fn begin_tx(&self) -> StoreTransaction {
        let id = self.inner.tx_counter.fetch_add(1, Ordering::Relaxed) + 1;
        StoreTransaction::new(id, self.clone())
    }

    pub(crate) fn write<R>(&self, f: impl FnOnce(&mut StoreState) -> R) -> R {
        f(&mut self.inner.state.write())
    }

    /// Removes field containers no slot references anymore and nodes
    /// without any slot. Returns the number of removed containers.
    pub fn collect_garbage(&self) -> usize {
        self.write(|state| {
            let referenced: HashSet<Uuid> = state
                .nodes
                .values()
                .flat_map(|n| n.slots().values().copied())
                .collect();
            let before = state.containers.len();
            state.containers.retain(|uuid, _| referenced.contains(uuid));
            state.nodes.retain(|_, node| !node.is_empty());
            let removed = before - state.containers.len();
            if removed > 0 {
                log::info!("Garbage collection removed {} field containers", removed);
            }
            removed
        })
    }
}
