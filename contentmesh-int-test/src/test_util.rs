use contentmesh::common::FieldMap;
use contentmesh::content::{ContainerType, Node, Project, Release};
use contentmesh::errors::MeshResult;
use contentmesh::mesh::ContentMesh;
use contentmesh::mesh_builder::ContentMeshBuilder;
use contentmesh::schema::{FieldSchema, FieldType, SchemaContainer, SchemaDefinition};
use contentmesh::search::{compose_index_name, InMemorySearchBackend};
use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

pub const LANGUAGES: [&str; 3] = ["en", "de", "fr"];

/// Runs an async test on a fresh multi-threaded runtime, retrying failed
/// runs. `after` always runs once `before` succeeded.
pub fn run_test<B, T, TF, A, AF>(before: B, test: T, after: A)
where
    B: Fn() -> MeshResult<TestContext>,
    T: Fn(TestContext) -> TF,
    TF: Future<Output = MeshResult<()>>,
    A: Fn(TestContext) -> AF,
    AF: Future<Output = MeshResult<()>>,
{
    const MAX_RETRIES: u32 = 3;
    let mut last_error = String::new();

    for attempt in 1..=MAX_RETRIES {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .expect("Failed to build test runtime");

        let result = runtime.block_on(async {
            let ctx = before().map_err(|e| format!("Before run failed: {:?}", e))?;
            let test_result = test(ctx.clone()).await;
            let after_result = after(ctx).await;
            test_result.map_err(|e| format!("Test failed: {:?}", e))?;
            after_result.map_err(|e| format!("After run failed: {:?}", e))
        });

        match result {
            Ok(()) => return,
            Err(e) => {
                log::warn!("Attempt {}/{} failed: {}", attempt, MAX_RETRIES, e);
                last_error = e;
            }
        }
    }
    panic!("Test failed after {} attempts: {}", MAX_RETRIES, last_error);
}

/// A mesh over an in-memory backend with one project in three languages,
/// its initial release, and a `page` schema assigned to it.
#[derive(Clone)]
pub struct TestContext {
    mesh: ContentMesh,
    backend: InMemorySearchBackend,
    project: Project,
    release: Release,
    schema: SchemaContainer,
}

impl TestContext {
    pub fn mesh(&self) -> &ContentMesh {
        &self.mesh
    }

    pub fn backend(&self) -> &InMemorySearchBackend {
        &self.backend
    }

    pub fn project(&self) -> Uuid {
        self.project.uuid()
    }

    pub fn release(&self) -> Uuid {
        self.release.uuid()
    }

    pub fn schema(&self) -> Uuid {
        self.schema.uuid()
    }

    /// Version of `schema` the release `release` is assigned to.
    pub fn assigned_version(&self, release: &Uuid, schema: &Uuid) -> Option<Uuid> {
        self.mesh
            .store()
            .read(|s| s.release(release).and_then(|r| r.schema_version(schema)))
    }

    pub fn latest_version(&self, schema: &Uuid) -> Option<Uuid> {
        self.mesh
            .store()
            .read(|s| s.schema(schema).map(|c| c.latest().uuid()))
    }

    pub fn index_name(&self, release: &Uuid, version: &Uuid, container_type: ContainerType) -> String {
        compose_index_name(&self.project(), release, version, container_type)
    }

    /// Creates `count` nodes of `schema` in the initial release with a draft
    /// in every language of `languages`.
    pub fn create_nodes(
        &self,
        schema: &Uuid,
        count: usize,
        languages: &[&str],
        fields: impl Fn(usize, &str) -> FieldMap,
    ) -> MeshResult<Vec<Node>> {
        let mut nodes = Vec::with_capacity(count);
        for i in 0..count {
            let node = self.mesh.create_node(
                &self.project(),
                &self.release(),
                schema,
                languages[0],
                fields(i, languages[0]),
            )?;
            for language in &languages[1..] {
                self.mesh
                    .update_node(&node.uuid(), &self.release(), language, fields(i, language))?;
            }
            nodes.push(node);
        }
        Ok(nodes)
    }
}

pub fn page_schema() -> SchemaDefinition {
    SchemaDefinition::new("page")
        .with_field(FieldSchema::new("title", FieldType::String).required(true))
        .display_field("title")
}

pub fn create_test_context() -> MeshResult<TestContext> {
    create_test_context_with(ContentMesh::builder())
}

/// Creates the context on a preconfigured builder. The search backend is
/// always replaced by an in-memory one.
pub fn create_test_context_with(builder: ContentMeshBuilder) -> MeshResult<TestContext> {
    let backend = InMemorySearchBackend::new();
    let mesh = builder
        .search_backend(backend.clone())
        .sync_max_attempts(3)
        .sync_backoff(Duration::from_millis(1), Duration::from_millis(10))
        .build()?;
    let (project, release) = mesh.create_project(&format!("project-{}", Uuid::new_v4()), &LANGUAGES)?;
    let schema = mesh.create_schema(page_schema())?;
    mesh.assign_schema(&release.uuid(), &schema.uuid(), None)?;

    Ok(TestContext {
        mesh,
        backend,
        project,
        release,
        schema,
    })
}

pub async fn cleanup(ctx: TestContext) -> MeshResult<()> {
    ctx.mesh.wait_for_sync().await;
    ctx.mesh.close().await
}
