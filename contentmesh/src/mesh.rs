use crate::common::{FieldMap, MeshEventBus, SubscriberRef};
use crate::content::{ContainerType, Node, Project, Release};
use crate::errors::{ErrorKind, MeshError, MeshResult};
use crate::event::{ElementType, IndexContext, MutationAction, MutationEvent, MutationListener};
use crate::mesh_builder::ContentMeshBuilder;
use crate::mesh_config::MeshConfig;
use crate::migration::{MigrationEngine, MigrationHandle, MigrationResult};
use crate::schema::{ChangeSet, SchemaContainer, SchemaDefinition, SchemaDiffer};
use crate::search::{
    DeadLetter, DeadLetterLog, DocumentTransformer, IndexSource, IndexTargetResolver, SearchBackend,
    SyncQueue,
};
use crate::store::MeshStore;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// The content mesh: versioned schemas, content, migrations and the search
/// index kept in sync with them.
///
/// All clones share the same state. Every committed content or schema
/// mutation is published on the mesh's event bus; the sync queue listens on
/// it and reconciles the search backend in the background.
///
/// # Examples
///
/// ```rust,ignore
/// let mesh = ContentMesh::builder().sync_workers(4).build()?;
/// let (project, release) = mesh.create_project("site", &["en", "de"])?;
/// let schema = mesh.create_schema(SchemaDefinition::new("page")
///     .with_field(FieldSchema::new("title", FieldType::String)))?;
/// mesh.assign_schema(&release.uuid(), &schema.uuid(), None)?;
///
/// let updated = SchemaDefinition::new("page")
///     .with_field(FieldSchema::new("title", FieldType::String))
///     .with_field(FieldSchema::new("published", FieldType::Boolean).default_value(false));
/// let result = mesh.request_schema_update(&schema.uuid(), updated).await?;
/// mesh.wait_for_sync().await;
/// mesh.close().await?;
/// ```
#[derive(Clone)]
pub struct ContentMesh {
    inner: Arc<ContentMeshInner>,
}

impl ContentMesh {
    pub fn builder() -> ContentMeshBuilder {
        ContentMeshBuilder::new()
    }

    pub(crate) fn new(
        config: MeshConfig,
        store: MeshStore,
        backend: Arc<dyn SearchBackend>,
        dead_letters: DeadLetterLog,
    ) -> MeshResult<Self> {
        let inner = ContentMeshInner::new(config, store, backend, dead_letters)?;
        Ok(ContentMesh {
            inner: Arc::new(inner),
        })
    }

    pub fn config(&self) -> MeshConfig {
        self.inner.config.clone()
    }

    /// The underlying content store, for reads and direct transactions.
    pub fn store(&self) -> MeshStore {
        self.inner.store.clone()
    }

    /// The bus all mutation events are published on.
    pub fn event_bus(&self) -> MeshEventBus<MutationEvent, MutationListener> {
        self.inner.event_bus.clone()
    }

    pub fn sync_queue(&self) -> SyncQueue {
        self.inner.queue.clone()
    }

    pub fn resolver(&self) -> &IndexTargetResolver {
        &self.inner.resolver
    }

    pub fn create_project(&self, name: &str, languages: &[&str]) -> MeshResult<(Project, Release)> {
        self.inner.check_opened()?;
        self.inner.store.create_project(name, languages)
    }

    pub fn create_release(&self, project: &Uuid, name: &str) -> MeshResult<Release> {
        self.inner.check_opened()?;
        let (release, event) = self.inner.store.create_release(project, name)?;
        self.inner.publish_all(vec![event]);
        Ok(release)
    }

    pub fn create_schema(&self, definition: SchemaDefinition) -> MeshResult<SchemaContainer> {
        self.inner.check_opened()?;
        self.inner.store.create_schema(definition)
    }

    /// Assigns a version of a schema to a release, the latest one when
    /// `version` is unset.
    pub fn assign_schema(&self, release: &Uuid, schema: &Uuid, version: Option<Uuid>) -> MeshResult<()> {
        self.inner.check_opened()?;
        let event = self.inner.store.assign_schema(release, schema, version)?;
        self.inner.publish_all(vec![event]);
        Ok(())
    }

    pub fn create_node(
        &self,
        project: &Uuid,
        release: &Uuid,
        schema: &Uuid,
        language: &str,
        fields: FieldMap,
    ) -> MeshResult<Node> {
        self.inner.check_opened()?;
        let (node, events) = self
            .inner
            .store
            .create_node(project, release, schema, language, fields)?;
        self.inner.publish_all(events);
        Ok(node)
    }

    pub fn update_node(&self, node: &Uuid, release: &Uuid, language: &str, fields: FieldMap) -> MeshResult<()> {
        self.inner.check_opened()?;
        let events = self.inner.store.update_node(node, release, language, fields)?;
        self.inner.publish_all(events);
        Ok(())
    }

    pub fn publish(&self, node: &Uuid, release: &Uuid, language: &str) -> MeshResult<()> {
        self.inner.check_opened()?;
        let events = self.inner.store.publish(node, release, language)?;
        self.inner.publish_all(events);
        Ok(())
    }

    pub fn take_offline(&self, node: &Uuid, release: &Uuid, language: &str) -> MeshResult<()> {
        self.inner.check_opened()?;
        let events = self.inner.store.take_offline(node, release, language)?;
        self.inner.publish_all(events);
        Ok(())
    }

    pub fn delete_node_content(&self, node: &Uuid, release: &Uuid, language: Option<&str>) -> MeshResult<()> {
        self.inner.check_opened()?;
        let events = self.inner.store.delete_node_content(node, release, language)?;
        self.inner.publish_all(events);
        Ok(())
    }

    /// Diffs `definition` against the latest version of `schema` and
    /// migrates all content of the releases on that version.
    ///
    /// An unchanged definition is a no-op. Fails with
    /// `ConcurrentSchemaUpdate` when another update won the race and with
    /// `MigrationIncomplete` when some content units failed to migrate; the
    /// affected releases then stay on the old version and can be retried
    /// with [retry_release](Self::retry_release).
    pub async fn request_schema_update(
        &self,
        schema: &Uuid,
        definition: SchemaDefinition,
    ) -> MeshResult<MigrationResult> {
        self.request_schema_update_with(schema, definition, &MigrationHandle::new())
            .await
    }

    /// Like [request_schema_update](Self::request_schema_update), cancellable
    /// through `handle`.
    pub async fn request_schema_update_with(
        &self,
        schema: &Uuid,
        definition: SchemaDefinition,
        handle: &MigrationHandle,
    ) -> MeshResult<MigrationResult> {
        self.inner.check_opened()?;
        definition.validate()?;
        let (latest, current) = self.inner.store.read(|s| {
            s.schema(schema)
                .map(|c| (c.latest().uuid(), c.latest().definition().clone()))
                .ok_or_else(|| {
                    MeshError::new(&format!("Schema container {} not found", schema), ErrorKind::NotFound)
                })
        })?;

        let changes = SchemaDiffer::new().diff(&current, &definition);
        if changes.is_empty() {
            log::info!("Schema {} is unchanged, nothing to migrate", current.name);
            return Ok(MigrationResult {
                schema_container: *schema,
                from_version: Some(latest),
                to_version: Some(latest),
                ..Default::default()
            });
        }
        self.apply_changes(schema, &latest, changes, handle).await
    }

    /// Links an explicit change set, for instance one carrying custom
    /// migration scripts, after `source_version` and migrates the content.
    pub async fn apply_changes(
        &self,
        schema: &Uuid,
        source_version: &Uuid,
        changes: ChangeSet,
        handle: &MigrationHandle,
    ) -> MeshResult<MigrationResult> {
        self.inner.check_opened()?;
        let result = self
            .inner
            .engine
            .apply_changes(schema, source_version, changes, handle)
            .await?;
        self.inner.maintain_indices(&result).await;
        result.into_result()
    }

    /// Migrates a release still pinned to an older version of `schema` to
    /// the latest version.
    pub async fn retry_release(&self, schema: &Uuid, release: &Uuid) -> MeshResult<MigrationResult> {
        self.inner.check_opened()?;
        let result = self
            .inner
            .engine
            .retry_release(schema, release, &MigrationHandle::new())
            .await?;
        self.inner.maintain_indices(&result).await;
        result.into_result()
    }

    /// Feeds an externally observed mutation into the sync queue.
    pub fn on_content_mutated(
        &self,
        element: Uuid,
        element_type: ElementType,
        action: MutationAction,
        context: IndexContext,
    ) -> MeshResult<()> {
        self.inner.check_opened()?;
        self.inner
            .event_bus
            .publish(MutationEvent::new(element, element_type, action, context))
    }

    /// Every index of every project, release and assigned schema version,
    /// mapped to its document type.
    pub fn get_indices(&self) -> MeshResult<BTreeMap<String, String>> {
        Ok(self
            .inner
            .resolver
            .resolve(&IndexContext::new())?
            .into_iter()
            .map(|t| (t.index_name, t.document_type))
            .collect())
    }

    /// Indices a search over `container_type` content must query. Unset
    /// project or release widen the selection.
    pub fn selected_indices(
        &self,
        project: Option<Uuid>,
        release: Option<Uuid>,
        container_type: ContainerType,
    ) -> MeshResult<Vec<String>> {
        let context = IndexContext {
            project,
            release,
            container_type: Some(container_type),
            ..Default::default()
        };
        Ok(self
            .inner
            .resolver
            .resolve(&context)?
            .into_iter()
            .map(|t| t.index_name)
            .collect())
    }

    /// Puts the mapping of every index. Returns the number of indices.
    pub async fn init_indices(&self) -> MeshResult<usize> {
        self.inner.check_opened()?;
        let targets = self.inner.resolver.resolve(&IndexContext::new())?;
        let count = self.inner.queue.update_mappings(&targets).await?;
        log::info!("Initialized {} indices", count);
        Ok(count)
    }

    /// Queues a store of every node in every partition. Returns the number
    /// of queued events.
    pub fn reindex_all(&self) -> MeshResult<usize> {
        self.inner.check_opened()?;
        let nodes: Vec<Uuid> = self.inner.store.read(|s| s.nodes().map(|n| n.uuid()).collect());
        for node in &nodes {
            self.inner
                .event_bus
                .publish(MutationEvent::store_node(*node, IndexContext::new()))?;
        }
        log::info!("Queued {} nodes for reindexing", nodes.len());
        Ok(nodes.len())
    }

    /// Waits until the sync queue has processed every queued event.
    pub async fn wait_for_sync(&self) {
        self.inner.queue.wait_idle().await
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.queue.dead_letters().entries()
    }

    pub async fn retry_dead_letters(&self) -> MeshResult<usize> {
        self.inner.check_opened()?;
        self.inner.queue.retry_dead_letters().await
    }

    /// Removes field containers and nodes no slot references anymore.
    pub fn collect_garbage(&self) -> usize {
        self.inner.store.collect_garbage()
    }

    /// Processes what is queued, then detaches the sync queue.
    pub async fn close(&self) -> MeshResult<()> {
        self.inner.close().await
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

struct ContentMeshInner {
    config: MeshConfig,
    store: MeshStore,
    event_bus: MeshEventBus<MutationEvent, MutationListener>,
    engine: MigrationEngine,
    resolver: IndexTargetResolver,
    queue: SyncQueue,
    subscriber: Mutex<Option<SubscriberRef>>,
    closed: AtomicBool,
}

impl ContentMeshInner {
    fn new(
        config: MeshConfig,
        store: MeshStore,
        backend: Arc<dyn SearchBackend>,
        dead_letters: DeadLetterLog,
    ) -> MeshResult<Self> {
        let event_bus = MeshEventBus::new();
        let engine = MigrationEngine::new(store.clone(), config.clone(), event_bus.clone());
        let resolver = IndexTargetResolver::new(
            store.clone(),
            DocumentTransformer::new(&config.document_type()),
        );
        let queue = SyncQueue::new(
            Arc::new(resolver.clone()),
            backend,
            config.clone(),
            dead_letters,
        );
        queue.start()?;
        let subscriber = event_bus.register(queue.listener())?;

        Ok(ContentMeshInner {
            config,
            store,
            event_bus,
            engine,
            resolver,
            queue,
            subscriber: Mutex::new(Some(subscriber)),
            closed: AtomicBool::new(false),
        })
    }

    fn check_opened(&self) -> MeshResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            log::error!("Content mesh is closed");
            return Err(MeshError::new("Content mesh is closed", ErrorKind::InvalidOperation));
        }
        Ok(())
    }

    // content is committed at this point; indexing failures are logged only
    fn publish_all(&self, events: Vec<MutationEvent>) {
        for event in events {
            if let Err(e) = self.event_bus.publish(event.clone()) {
                log::error!("Failed to publish {}: {}", event.describe(), e);
            }
        }
    }

    /// Puts the mappings of the new version's indices of every repointed
    /// release and drops the indices of the version it left.
    async fn maintain_indices(&self, result: &MigrationResult) {
        let (Some(from), Some(to)) = (result.from_version, result.to_version) else {
            return;
        };
        for release in &result.repointed_releases {
            let new_indices = self
                .resolver
                .resolve(&IndexContext::new().release(*release).schema_version(to));
            match new_indices {
                Ok(targets) => {
                    if let Err(e) = self.queue.update_mappings(&targets).await {
                        log::error!("Failed to update mappings of release {}: {}", release, e);
                    }
                }
                Err(e) => log::error!("Failed to resolve indices of release {}: {}", release, e),
            }

            let old_indices = self
                .resolver
                .resolve(&IndexContext::new().release(*release).schema_version(from));
            match old_indices {
                Ok(targets) => {
                    if let Err(e) = self.queue.drop_indices(&targets).await {
                        log::error!("Failed to drop indices of release {}: {}", release, e);
                    }
                }
                Err(e) => log::error!("Failed to resolve old indices of release {}: {}", release, e),
            }
        }
    }

    async fn close(&self) -> MeshResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.queue.shutdown().await;
        let subscriber = self.subscriber.lock().take();
        if let Some(subscriber) = subscriber {
            self.event_bus.deregister(subscriber)?;
        }
        self.event_bus.close()?;
        log::info!("Content mesh closed");
        Ok(())
    }
}

// Only runs once every clone is gone; queued events are still processed by
// the background drain.
impl Drop for ContentMeshInner {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            self.queue.close();
            let _ = self.event_bus.close();
        }
    }
}
