use contentmesh::errors::{ErrorKind, MeshResult};
use contentmesh::fields;
use contentmesh::migration::MigrationHandle;
use contentmesh::schema::{FieldSchema, FieldType, SchemaDiffer};
use contentmesh_int_test::test_util::{cleanup, create_test_context, page_schema, run_test, TestContext};

#[test]
fn test_stale_source_version_is_rejected() {
    run_test(create_test_context, stale_source_version_is_rejected, cleanup)
}

async fn stale_source_version_is_rejected(ctx: TestContext) -> MeshResult<()> {
    ctx.create_nodes(&ctx.schema(), 2, &["en"], |i, _| fields! { "title" => format!("p{}", i) })?;
    let v1 = ctx.latest_version(&ctx.schema()).unwrap();

    let first = page_schema().with_field(FieldSchema::new("a", FieldType::String));
    ctx.mesh().request_schema_update(&ctx.schema(), first).await?;

    // computed against v1 after another update already moved past it
    let second = page_schema().with_field(FieldSchema::new("b", FieldType::String));
    let changes = SchemaDiffer::new().diff(&page_schema(), &second);
    let err = ctx
        .mesh()
        .apply_changes(&ctx.schema(), &v1, changes, &MigrationHandle::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), &ErrorKind::ConcurrentSchemaUpdate);

    let count = ctx
        .mesh()
        .store()
        .read(|s| s.schema(&ctx.schema()).map(|c| c.version_count()));
    assert_eq!(count, Some(2));
    Ok(())
}

#[test]
fn test_racing_updates_keep_chain_linear() {
    run_test(create_test_context, racing_updates_keep_chain_linear, cleanup)
}

async fn racing_updates_keep_chain_linear(ctx: TestContext) -> MeshResult<()> {
    ctx.create_nodes(&ctx.schema(), 5, &["en", "de"], |i, _| fields! { "title" => format!("p{}", i) })?;
    let source = ctx.latest_version(&ctx.schema()).unwrap();

    let mut tasks = Vec::new();
    for i in 0..8 {
        let mesh = ctx.mesh().clone();
        let schema = ctx.schema();
        tasks.push(tokio::spawn(async move {
            let target = page_schema().with_field(FieldSchema::new(&format!("extra{}", i), FieldType::String));
            let changes = SchemaDiffer::new().diff(&page_schema(), &target);
            mesh.apply_changes(&schema, &source, changes, &MigrationHandle::new())
                .await
        }));
    }

    let mut winners = 0;
    for result in futures::future::join_all(tasks).await {
        match result.expect("update task panicked") {
            Ok(_) => winners += 1,
            Err(e) => assert_eq!(e.kind(), &ErrorKind::ConcurrentSchemaUpdate),
        }
    }
    assert_eq!(winners, 1);

    ctx.mesh().store().read(|s| {
        let container = s.schema(&ctx.schema()).unwrap();
        assert_eq!(container.version_count(), 2);
        assert!(container.verify().is_ok());
    });
    Ok(())
}
