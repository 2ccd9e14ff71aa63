use contentmesh::content::ContainerType;
use contentmesh::fields;
use contentmesh::mesh::ContentMesh;
use contentmesh::schema::{FieldSchema, FieldType};
use contentmesh::search::compose_index_name;
use contentmesh_int_test::test_util::page_schema;
use contentmesh_tantivy::{TantivyConfig, TantivySearchBackend};

fn tantivy_config() -> TantivyConfig {
    TantivyConfig::new()
        .with_num_threads(1)
        .with_index_writer_heap_size(15 * 1024 * 1024)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_content_is_searchable_in_tantivy() {
    let backend = TantivySearchBackend::new(tantivy_config());
    let mesh = ContentMesh::builder()
        .search_backend(backend.clone())
        .build()
        .unwrap();
    let (project, release) = mesh.create_project("docs", &["en"]).unwrap();
    let schema = mesh.create_schema(page_schema()).unwrap();
    mesh.assign_schema(&release.uuid(), &schema.uuid(), None).unwrap();

    for title in ["Installing the mesh", "Writing migrations", "Search tuning"] {
        mesh.create_node(&project.uuid(), &release.uuid(), &schema.uuid(), "en", fields! { "title" => title })
            .unwrap();
    }
    mesh.wait_for_sync().await;

    let index = compose_index_name(&project.uuid(), &release.uuid(), &schema.latest().uuid(), ContainerType::Draft);
    assert!(backend.mapping(&index).is_some());
    let hits = backend.search(&index, "migrations").await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].source["displayField"], "Writing migrations");
    mesh.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_schema_update_rebuilds_tantivy_indices() {
    let dir = tempfile::tempdir().unwrap();
    let backend = TantivySearchBackend::new(tantivy_config().with_base_path(dir.path()));
    let mesh = ContentMesh::builder()
        .search_backend(backend.clone())
        .build()
        .unwrap();
    let (project, release) = mesh.create_project("docs", &["en", "de"]).unwrap();
    let schema = mesh.create_schema(page_schema()).unwrap();
    mesh.assign_schema(&release.uuid(), &schema.uuid(), None).unwrap();
    let node = mesh
        .create_node(&project.uuid(), &release.uuid(), &schema.uuid(), "de", fields! { "title" => "Handbuch" })
        .unwrap();
    mesh.wait_for_sync().await;
    let old_index = compose_index_name(&project.uuid(), &release.uuid(), &schema.latest().uuid(), ContainerType::Draft);
    assert!(dir.path().join(&old_index).exists());

    let updated = page_schema().with_field(FieldSchema::new("summary", FieldType::String).default_value("kurz"));
    let result = mesh.request_schema_update(&schema.uuid(), updated).await.unwrap();
    mesh.wait_for_sync().await;

    let new_index = compose_index_name(
        &project.uuid(),
        &release.uuid(),
        &result.to_version.unwrap(),
        ContainerType::Draft,
    );
    assert!(!backend.has_index(&old_index));
    assert!(!dir.path().join(&old_index).exists());
    let hits = backend.search(&new_index, "kurz").await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].source["uuid"], node.uuid().to_string());
    mesh.close().await.unwrap();
}
