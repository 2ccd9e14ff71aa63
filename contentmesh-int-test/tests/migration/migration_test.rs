use contentmesh::common::FieldValue;
use contentmesh::content::{ContainerType, SlotKey};
use contentmesh::errors::{ErrorKind, MeshResult};
use contentmesh::fields;
use contentmesh::migration::MigrationHandle;
use contentmesh::schema::{FieldSchema, FieldType, MigrationScript, SchemaDefinition, SchemaDiffer, VersionStatus};
use contentmesh::search::compose_document_id;
use contentmesh_int_test::test_util::{cleanup, create_test_context, run_test, TestContext};
use std::collections::HashSet;
use uuid::Uuid;

fn draft_field(ctx: &TestContext, node: &Uuid, release: &Uuid, language: &str, field: &str) -> Option<FieldValue> {
    ctx.mesh().store().read(|s| {
        s.slot_container(node, &SlotKey::new(*release, language, ContainerType::Draft))
            .and_then(|c| c.fields().get(field).cloned())
    })
}

#[test]
fn test_add_field_with_default() {
    run_test(create_test_context, add_field_with_default, cleanup)
}

async fn add_field_with_default(ctx: TestContext) -> MeshResult<()> {
    let nodes = ctx.create_nodes(&ctx.schema(), 3, &["en", "de"], |i, lang| {
        fields! { "title" => format!("page {} {}", i, lang) }
    })?;
    let old_version = ctx.latest_version(&ctx.schema()).unwrap();

    let updated = contentmesh_int_test::test_util::page_schema()
        .with_field(FieldSchema::new("published", FieldType::Boolean).default_value(false));
    let result = ctx.mesh().request_schema_update(&ctx.schema(), updated).await?;

    let new_version = result.to_version.unwrap();
    assert_ne!(new_version, old_version);
    assert_eq!(result.succeeded_count, 6);
    assert_eq!(result.events.len(), 6);
    assert!(result.is_complete());
    assert_eq!(ctx.assigned_version(&ctx.release(), &ctx.schema()), Some(new_version));

    for node in &nodes {
        for lang in ["en", "de"] {
            assert_eq!(
                draft_field(&ctx, &node.uuid(), &ctx.release(), lang, "published"),
                Some(FieldValue::Boolean(false))
            );
        }
    }

    // old version is retired once no release references it
    let status = ctx.mesh().store().read(|s| {
        s.schema(&ctx.schema()).and_then(|c| c.get(&old_version)).map(|v| v.status())
    });
    assert_eq!(status, Some(VersionStatus::Retired));

    ctx.mesh().wait_for_sync().await;
    let index = ctx.index_name(&ctx.release(), &new_version, ContainerType::Draft);
    let document = ctx
        .backend()
        .searchable_document(&index, &compose_document_id(&nodes[0].uuid(), "de"))
        .unwrap();
    assert_eq!(document["fields"]["published"], false);
    assert_eq!(document["schema"]["version"], 2);
    Ok(())
}

#[test]
fn test_remove_field_across_releases() {
    run_test(create_test_context, remove_field_across_releases, cleanup)
}

async fn remove_field_across_releases(ctx: TestContext) -> MeshResult<()> {
    let mesh = ctx.mesh();
    let article = mesh.create_schema(
        SchemaDefinition::new("article")
            .with_field(FieldSchema::new("title", FieldType::String))
            .with_field(FieldSchema::new("subtitle", FieldType::String)),
    )?;
    let v1 = article.latest().uuid();
    let v1_definition = article.latest().definition().clone();
    let v2_definition = v1_definition
        .clone()
        .with_field(FieldSchema::new("teaser", FieldType::String));
    let v2 = mesh
        .request_schema_update(&article.uuid(), v2_definition)
        .await?
        .to_version
        .unwrap();

    // a release of another project stays on the first version
    let (legacy_project, legacy_release) = mesh.create_project("legacy", &["en"])?;
    mesh.assign_schema(&legacy_release.uuid(), &article.uuid(), Some(v1))?;
    let legacy_node = mesh.create_node(
        &legacy_project.uuid(),
        &legacy_release.uuid(),
        &article.uuid(),
        "en",
        fields! { "title" => "old", "subtitle" => "kept" },
    )?;

    mesh.assign_schema(&ctx.release(), &article.uuid(), None)?;
    ctx.create_nodes(&article.uuid(), 50, &["en", "de"], |i, lang| {
        fields! { "title" => format!("a{} {}", i, lang), "subtitle" => "sub" }
    })?;
    let second = mesh.create_release(&ctx.project(), "second")?;
    assert_eq!(ctx.assigned_version(&second.uuid(), &article.uuid()), Some(v2));
    mesh.wait_for_sync().await;

    let v3_definition = SchemaDefinition::new("article")
        .with_field(FieldSchema::new("title", FieldType::String))
        .with_field(FieldSchema::new("teaser", FieldType::String));
    let result = mesh.request_schema_update(&article.uuid(), v3_definition).await?;
    let v3 = result.to_version.unwrap();

    assert_eq!(result.from_version, Some(v2));
    assert_eq!(result.succeeded_count, 200);
    assert_eq!(result.events.len(), 200);
    let units: HashSet<_> = result
        .events
        .iter()
        .map(|e| (e.element_uuid, e.context.release, e.context.language.clone()))
        .collect();
    assert_eq!(units.len(), 200);
    let mut repointed = result.repointed_releases.clone();
    repointed.sort();
    let mut expected = vec![ctx.release(), second.uuid()];
    expected.sort();
    assert_eq!(repointed, expected);

    for release in [ctx.release(), second.uuid()] {
        assert_eq!(ctx.assigned_version(&release, &article.uuid()), Some(v3));
    }
    assert_eq!(ctx.assigned_version(&legacy_release.uuid(), &article.uuid()), Some(v1));
    assert_eq!(
        draft_field(&ctx, &legacy_node.uuid(), &legacy_release.uuid(), "en", "subtitle"),
        Some(FieldValue::from("kept"))
    );
    Ok(())
}

#[test]
fn test_failed_units_pin_release_until_retry() {
    run_test(create_test_context, failed_units_pin_release_until_retry, cleanup)
}

async fn failed_units_pin_release_until_retry(ctx: TestContext) -> MeshResult<()> {
    let nodes = ctx.create_nodes(&ctx.schema(), 4, &["en"], |i, _| {
        fields! { "title" => format!("page {}", i) }
    })?;
    let v1 = ctx.latest_version(&ctx.schema()).unwrap();

    let current = contentmesh_int_test::test_util::page_schema();
    let updated = current
        .clone()
        .with_field(FieldSchema::new("rank", FieldType::Number));
    let mut changes = SchemaDiffer::new().diff(&current, &updated);
    let poisoned = compose_document_id(&nodes[2].uuid(), "en");
    changes.attach_script(
        "rank",
        MigrationScript::new("rank-from-title", |_, mut fields| {
            let title = fields.get("title").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            if title == "page 2" {
                return Err("title cannot be ranked".into());
            }
            fields.insert("rank".to_string(), FieldValue::Number(title.len() as f64));
            Ok(fields)
        }),
    )?;

    let err = ctx
        .mesh()
        .apply_changes(&ctx.schema(), &v1, changes, &MigrationHandle::new())
        .await
        .unwrap_err();
    match err.kind() {
        ErrorKind::MigrationIncomplete(units) => {
            assert_eq!(units.len(), 1);
            assert!(units[0].starts_with(&nodes[2].uuid().to_string()));
        }
        other => panic!("unexpected error kind {:?} for {}", other, poisoned),
    }
    assert_eq!(ctx.assigned_version(&ctx.release(), &ctx.schema()), Some(v1));
    assert_eq!(
        draft_field(&ctx, &nodes[0].uuid(), &ctx.release(), "en", "rank"),
        None
    );

    // the broken unit is fixed through the content API, then retried
    ctx.mesh()
        .update_node(&nodes[2].uuid(), &ctx.release(), "en", fields! { "title" => "page two" })?;
    let result = ctx.mesh().retry_release(&ctx.schema(), &ctx.release()).await?;
    assert_eq!(result.succeeded_count, 4);
    assert_eq!(
        draft_field(&ctx, &nodes[2].uuid(), &ctx.release(), "en", "rank"),
        Some(FieldValue::Number(8.0))
    );
    Ok(())
}
