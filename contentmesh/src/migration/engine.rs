use crate::common::{FieldMap, MeshEventBus, MIGRATION_COMMIT_ATTEMPTS};
use crate::content::{FieldContainer, SlotKey};
use crate::errors::{ErrorKind, MeshError, MeshResult};
use crate::event::{IndexContext, MutationEvent, MutationListener};
use crate::mesh_config::MeshConfig;
use crate::migration::migrate_fields;
use crate::schema::{Change, ChangeSet, VersionStatus};
use crate::store::MeshStore;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Cancellation token of a migration run.
///
/// Cancelling stops the run before the next release is repointed; releases
/// that were not repointed yet stay pinned to their old version.
#[derive(Clone, Default, Debug)]
pub struct MigrationHandle {
    cancelled: Arc<AtomicBool>,
}

impl MigrationHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Outcome of a migration run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationResult {
    pub schema_container: Uuid,
    pub from_version: Option<Uuid>,
    pub to_version: Option<Uuid>,
    pub succeeded_count: usize,
    pub failed_unit_ids: Vec<String>,
    pub repointed_releases: Vec<Uuid>,
    pub pinned_releases: Vec<Uuid>,
    /// Releases whose repoint failed for another reason than failing units.
    pub release_errors: BTreeMap<Uuid, String>,
    /// The run was cancelled before every release was handled.
    pub cancelled: bool,
    #[serde(skip)]
    pub events: Vec<MutationEvent>,
}

impl MigrationResult {
    pub fn is_complete(&self) -> bool {
        self.failed_unit_ids.is_empty() && self.pinned_releases.is_empty()
    }

    /// Turns a partial result into an error: `Cancelled` for a cancelled
    /// run, `MigrationIncomplete` when units failed and
    /// `TransactionConflict` when a release could not be repointed.
    pub fn into_result(self) -> MeshResult<MigrationResult> {
        if self.cancelled {
            return Err(cancelled());
        }
        if self.failed_unit_ids.is_empty() {
            if self.release_errors.is_empty() {
                return Ok(self);
            }
            let releases: Vec<String> = self.release_errors.keys().map(|r| r.to_string()).collect();
            return Err(MeshError::new(
                &format!(
                    "Migration of schema container {} incomplete: releases {} could not be repointed",
                    self.schema_container,
                    releases.join(", ")
                ),
                ErrorKind::TransactionConflict,
            ));
        }
        Err(MeshError::new(
            &format!(
                "Migration of schema container {} incomplete: {} units migrated, {} failed",
                self.schema_container,
                self.succeeded_count,
                self.failed_unit_ids.len()
            ),
            ErrorKind::MigrationIncomplete(self.failed_unit_ids),
        ))
    }

    /// Records the outcome of one release. Returns false when the run must
    /// stop.
    fn record(&mut self, release: Uuid, outcome: MeshResult<ReleaseOutcome>) -> bool {
        match outcome {
            Ok(outcome) => {
                self.merge(outcome);
                true
            }
            Err(e) if e.kind() == &ErrorKind::Cancelled => {
                self.cancelled = true;
                self.pinned_releases.push(release);
                false
            }
            Err(e) => {
                log::error!("Release {} stays pinned: {}", release, e);
                self.pinned_releases.push(release);
                self.release_errors.insert(release, e.to_string());
                true
            }
        }
    }

    fn merge(&mut self, outcome: ReleaseOutcome) {
        if outcome.repointed {
            self.repointed_releases.push(outcome.release);
        } else {
            self.pinned_releases.push(outcome.release);
        }
        self.succeeded_count += outcome.succeeded;
        self.failed_unit_ids.extend(outcome.failed_unit_ids);
        self.events.extend(outcome.events);
    }
}

struct ReleaseOutcome {
    release: Uuid,
    repointed: bool,
    succeeded: usize,
    failed_unit_ids: Vec<String>,
    events: Vec<MutationEvent>,
}

/// One slot whose container is on the source version.
struct MigrationUnit {
    node: Uuid,
    key: SlotKey,
    container: Uuid,
}

/// Links change sets into version chains and migrates the affected content.
///
/// Distinct content units migrate concurrently, bounded by
/// `migration_concurrency`; the changes of one unit always run in change
/// set order. A failing unit is recorded and the run continues. A release is
/// repointed to the new version only if every one of its units migrated.
#[derive(Clone)]
pub struct MigrationEngine {
    inner: Arc<MigrationEngineInner>,
}

struct MigrationEngineInner {
    store: MeshStore,
    config: MeshConfig,
    event_bus: MeshEventBus<MutationEvent, MutationListener>,
}

impl MigrationEngine {
    pub fn new(
        store: MeshStore,
        config: MeshConfig,
        event_bus: MeshEventBus<MutationEvent, MutationListener>,
    ) -> Self {
        MigrationEngine {
            inner: Arc::new(MigrationEngineInner {
                store,
                config,
                event_bus,
            }),
        }
    }

    /// Links `changes` as the successor of `source_version` and migrates
    /// every release pinned to the source version.
    ///
    /// Fails with `ConcurrentSchemaUpdate` when `source_version` is not the
    /// latest version anymore. Everything after the link is reported in the
    /// result: failed units, releases that could not be repointed and
    /// cancellation, see [MigrationResult::into_result].
    pub async fn apply_changes(
        &self,
        schema: &Uuid,
        source_version: &Uuid,
        changes: ChangeSet,
        handle: &MigrationHandle,
    ) -> MeshResult<MigrationResult> {
        self.inner
            .apply_changes(schema, source_version, changes, handle)
            .await
    }

    /// Migrates a release still pinned to an older version forward to the
    /// latest version of the schema container.
    pub async fn retry_release(
        &self,
        schema: &Uuid,
        release: &Uuid,
        handle: &MigrationHandle,
    ) -> MeshResult<MigrationResult> {
        self.inner.retry_release(schema, release, handle).await
    }
}

impl MigrationEngineInner {
    async fn apply_changes(
        &self,
        schema: &Uuid,
        source_version: &Uuid,
        changes: ChangeSet,
        handle: &MigrationHandle,
    ) -> MeshResult<MigrationResult> {
        if changes.is_empty() {
            return Err(MeshError::new(
                "Cannot apply an empty change set",
                ErrorKind::InvalidOperation,
            ));
        }

        let mut tx = self.store.begin_tx();
        let mut container = tx.schema(schema)?;
        if container.latest().uuid() != *source_version {
            log::warn!(
                "Schema update of {} based on stale version {}",
                schema,
                source_version
            );
            return Err(MeshError::new(
                &format!(
                    "Version {} is no longer the latest version of schema container {}",
                    source_version, schema
                ),
                ErrorKind::ConcurrentSchemaUpdate,
            ));
        }
        let definition = changes.apply_to(container.latest().definition())?;
        let target_version = container.link(*source_version, changes, definition)?;
        let linked: Vec<Change> = container
            .outbound_changes(source_version)
            .into_iter()
            .cloned()
            .collect();
        tx.put_schema(container);
        tx.commit()?;

        log::info!(
            "Linked version {} after {} in schema container {} with {} changes",
            target_version,
            source_version,
            schema,
            linked.len()
        );

        let mut result = MigrationResult {
            schema_container: *schema,
            from_version: Some(*source_version),
            to_version: Some(target_version),
            ..Default::default()
        };

        // releases created on the source version during the run are picked up too
        let linked = Arc::new(linked);
        let mut handled = BTreeSet::new();
        'releases: loop {
            let pending: Vec<Uuid> = self.store.read(|s| {
                s.releases_on_version(source_version)
                    .into_iter()
                    .filter(|r| r.schema_version(schema) == Some(*source_version))
                    .map(|r| r.uuid())
                    .filter(|r| !handled.contains(r))
                    .collect()
            });
            if pending.is_empty() {
                break;
            }
            for release in pending {
                handled.insert(release);
                let outcome = self
                    .migrate_release(schema, &release, source_version, &target_version, linked.clone(), handle)
                    .await;
                if !result.record(release, outcome) {
                    break 'releases;
                }
            }
        }

        self.log_result(&result);
        Ok(result)
    }

    async fn retry_release(
        &self,
        schema: &Uuid,
        release: &Uuid,
        handle: &MigrationHandle,
    ) -> MeshResult<MigrationResult> {
        let (current, latest, changes) = self.store.read(|s| {
            let container = s.schema(schema).ok_or_else(|| {
                MeshError::new(&format!("Schema container {} not found", schema), ErrorKind::NotFound)
            })?;
            let release_entity = s.release(release).ok_or_else(|| {
                MeshError::new(&format!("Release {} not found", release), ErrorKind::NotFound)
            })?;
            let current = release_entity.schema_version(schema).ok_or_else(|| {
                MeshError::new(
                    &format!("Schema {} is not assigned to release {}", schema, release),
                    ErrorKind::InvalidOperation,
                )
            })?;
            let latest = container.latest().uuid();
            let changes: Vec<Change> = container
                .changes_between(&current, &latest)?
                .into_iter()
                .cloned()
                .collect();
            Ok::<_, MeshError>((current, latest, changes))
        })?;

        let mut result = MigrationResult {
            schema_container: *schema,
            from_version: Some(current),
            to_version: Some(latest),
            ..Default::default()
        };
        if current == latest {
            log::debug!("Release {} already uses the latest version of {}", release, schema);
            return Ok(result);
        }

        let outcome = self
            .migrate_release(schema, release, &current, &latest, Arc::new(changes), handle)
            .await;
        result.record(*release, outcome);
        self.log_result(&result);
        Ok(result)
    }

    /// Migrates one release, starting over when its content changed while
    /// the units were migrating.
    async fn migrate_release(
        &self,
        schema: &Uuid,
        release: &Uuid,
        from: &Uuid,
        to: &Uuid,
        changes: Arc<Vec<Change>>,
        handle: &MigrationHandle,
    ) -> MeshResult<ReleaseOutcome> {
        let mut attempt = 1;
        loop {
            let outcome = self
                .migrate_release_once(schema, release, from, to, changes.clone(), handle)
                .await;
            match outcome {
                Err(e)
                    if e.kind() == &ErrorKind::TransactionConflict
                        && attempt < MIGRATION_COMMIT_ATTEMPTS
                        && self.is_pinned(schema, release, from) =>
                {
                    log::debug!(
                        "Content of release {} changed during migration, attempt {}: {}",
                        release,
                        attempt,
                        e
                    );
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn migrate_release_once(
        &self,
        schema: &Uuid,
        release: &Uuid,
        from: &Uuid,
        to: &Uuid,
        changes: Arc<Vec<Change>>,
        handle: &MigrationHandle,
    ) -> MeshResult<ReleaseOutcome> {
        ensure_not_cancelled(handle)?;
        let (project, revision, units, sources) = self.collect_units(schema, release, from)?;
        log::debug!(
            "Migrating {} units ({} containers) of release {} from {} to {}",
            units.len(),
            sources.len(),
            release,
            from,
            to
        );

        // containers shared by several slots migrate once
        let concurrency = self.inner_concurrency();
        let migrated: BTreeMap<Uuid, MeshResult<FieldContainer>> = stream::iter(sources.into_values())
            .map(|source| {
                let changes = changes.clone();
                let handle = handle.clone();
                let to = *to;
                async move {
                    tokio::task::yield_now().await;
                    if handle.is_cancelled() {
                        return (source.uuid(), Err(cancelled()));
                    }
                    let result = migrate_fields(changes.iter(), source.fields().clone())
                        .map(|fields: FieldMap| source.successor(to, fields));
                    (source.uuid(), result)
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        ensure_not_cancelled(handle)?;

        let mut failed_unit_ids = Vec::new();
        for unit in &units {
            if let Some(Err(e)) = migrated.get(&unit.container) {
                let unit_id = unit.key.unit_id(&unit.node);
                log::warn!("Migration of unit {} failed: {}", unit_id, e);
                failed_unit_ids.push(unit_id);
            }
        }

        if !failed_unit_ids.is_empty() {
            log::warn!(
                "Release {} stays pinned to version {}: {} of {} units failed",
                release,
                from,
                failed_unit_ids.len(),
                units.len()
            );
            return Ok(ReleaseOutcome {
                release: *release,
                repointed: false,
                succeeded: 0,
                failed_unit_ids,
                events: Vec::new(),
            });
        }

        let mut tx = self.store.begin_tx();
        let mut release_entity = tx.release(release)?;
        if release_entity.schema_version(schema) != Some(*from) {
            return Err(MeshError::new(
                &format!("Release {} was repointed concurrently", release),
                ErrorKind::TransactionConflict,
            ));
        }
        release_entity.assign(*schema, *to);
        tx.put_release(release_entity);
        tx.expect_content_revision(*release, revision);
        for container in migrated.values().filter_map(|r| r.as_ref().ok()) {
            tx.put_container(container.clone());
        }
        let mut events = Vec::with_capacity(units.len());
        for unit in &units {
            let Some(Ok(next)) = migrated.get(&unit.container) else {
                continue;
            };
            tx.set_slot(unit.node, unit.key.clone(), Some(unit.container), Some(next.uuid()));
            events.push(MutationEvent::store_node(
                unit.node,
                IndexContext::new()
                    .project(project)
                    .release(*release)
                    .schema_version(*to)
                    .container_type(unit.key.container_type)
                    .language(&unit.key.language),
            ));
        }
        tx.set_version_status(*schema, *to, VersionStatus::Active);
        tx.retire_if_unreferenced(*schema, *from);

        // last point at which the run can still be abandoned
        ensure_not_cancelled(handle)?;
        tx.commit()?;
        log::info!("Release {} repointed from {} to {}", release, from, to);

        for event in &events {
            if let Err(e) = self.event_bus.publish(event.clone()) {
                log::error!("Failed to publish mutation event {}: {}", event.describe(), e);
            }
        }

        Ok(ReleaseOutcome {
            release: *release,
            repointed: true,
            succeeded: units.len(),
            failed_unit_ids: Vec::new(),
            events,
        })
    }

    fn is_pinned(&self, schema: &Uuid, release: &Uuid, from: &Uuid) -> bool {
        self.store.read(|s| s.release(release).and_then(|r| r.schema_version(schema)) == Some(*from))
    }

    /// Collects the units of a release still on `from`, together with the
    /// content revision of the release they were read at.
    #[allow(clippy::type_complexity)]
    fn collect_units(
        &self,
        schema: &Uuid,
        release: &Uuid,
        from: &Uuid,
    ) -> MeshResult<(Uuid, u64, Vec<MigrationUnit>, BTreeMap<Uuid, FieldContainer>)> {
        self.store.read(|s| {
            let project = s
                .release(release)
                .map(|r| r.project_uuid())
                .ok_or_else(|| MeshError::new(&format!("Release {} not found", release), ErrorKind::NotFound))?;

            let mut units = Vec::new();
            let mut sources = BTreeMap::new();
            for node in s.nodes_of(&project).filter(|n| n.schema_container() == *schema) {
                for (key, container_uuid) in node.slots().iter().filter(|(k, _)| k.release == *release) {
                    let Some(container) = s.container(container_uuid) else {
                        log::warn!("Slot {} points at a missing container", key.unit_id(&node.uuid()));
                        continue;
                    };
                    if container.schema_version() != *from {
                        continue;
                    }
                    units.push(MigrationUnit {
                        node: node.uuid(),
                        key: key.clone(),
                        container: *container_uuid,
                    });
                    sources.entry(*container_uuid).or_insert_with(|| container.clone());
                }
            }
            Ok((project, s.content_revision(release), units, sources))
        })
    }

    fn inner_concurrency(&self) -> usize {
        self.config.migration_concurrency().max(1)
    }

    fn log_result(&self, result: &MigrationResult) {
        if result.is_complete() {
            log::info!(
                "Migration of schema container {} finished: {} units migrated, releases repointed: {:?}",
                result.schema_container,
                result.succeeded_count,
                result.repointed_releases
            );
        } else {
            log::warn!(
                "Migration of schema container {} incomplete: {} failed units, pinned releases: {:?}, cancelled: {}",
                result.schema_container,
                result.failed_unit_ids.len(),
                result.pinned_releases,
                result.cancelled
            );
        }
    }
}

fn cancelled() -> MeshError {
    MeshError::new("Migration was cancelled", ErrorKind::Cancelled)
}

fn ensure_not_cancelled(handle: &MigrationHandle) -> MeshResult<()> {
    if handle.is_cancelled() {
        log::info!("Migration cancelled before repointing");
        return Err(cancelled());
    }
    Ok(())
}
