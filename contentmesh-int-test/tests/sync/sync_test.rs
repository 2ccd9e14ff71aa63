use contentmesh::content::ContainerType;
use contentmesh::errors::MeshResult;
use contentmesh::event::{ElementType, IndexContext, MutationAction, MutationEvent};
use contentmesh::fields;
use contentmesh::search::{compose_document_id, BackendOperation};
use contentmesh_int_test::test_util::{cleanup, create_test_context, run_test, TestContext, LANGUAGES};
use std::collections::BTreeSet;
use std::time::Duration;
use test_retry::retry;

#[test]
fn test_partial_context_expands_to_every_release_and_language() {
    run_test(create_test_context, partial_context_expands, cleanup)
}

async fn partial_context_expands(ctx: TestContext) -> MeshResult<()> {
    let node = ctx
        .create_nodes(&ctx.schema(), 1, &LANGUAGES, |_, lang| fields! { "title" => format!("home {}", lang) })?
        .remove(0);
    let second = ctx.mesh().create_release(&ctx.project(), "second")?;
    ctx.mesh().wait_for_sync().await;
    let version = ctx.latest_version(&ctx.schema()).unwrap();
    ctx.backend().clear_operations();

    let event = MutationEvent::store_node(
        node.uuid(),
        IndexContext::new()
            .project(ctx.project())
            .schema_version(version)
            .container_type(ContainerType::Draft),
    );
    let report = ctx.mesh().sync_queue().process(&event).await?;
    assert_eq!(report.stored, 6);
    assert!(report.is_complete());
    assert_eq!(report.refreshed.len(), 2);

    let operations = ctx.backend().operations();
    for release in [ctx.release(), second.uuid()] {
        let index = ctx.index_name(&release, &version, ContainerType::Draft);
        let upserts: BTreeSet<_> = operations
            .iter()
            .filter_map(|op| match op {
                BackendOperation::Upsert { index: i, document_id } if *i == index => Some(document_id.clone()),
                _ => None,
            })
            .collect();
        let expected: BTreeSet<_> = LANGUAGES.iter().map(|l| compose_document_id(&node.uuid(), l)).collect();
        assert_eq!(upserts, expected);

        let refresh = BackendOperation::Refresh { index: index.clone() };
        assert_eq!(ctx.backend().count(&refresh), 1);
        let refresh_at = operations.iter().position(|op| *op == refresh).unwrap();
        let last_write = operations
            .iter()
            .rposition(|op| op.is_write() && op.index() == index)
            .unwrap();
        assert!(last_write < refresh_at);
    }
    Ok(())
}

#[test]
fn test_publish_lifecycle_reaches_search() {
    run_test(create_test_context, publish_lifecycle_reaches_search, cleanup)
}

async fn publish_lifecycle_reaches_search(ctx: TestContext) -> MeshResult<()> {
    let mesh = ctx.mesh();
    let node = mesh.create_node(&ctx.project(), &ctx.release(), &ctx.schema(), "fr", fields! { "title" => "Bonjour" })?;
    mesh.publish(&node.uuid(), &ctx.release(), "fr")?;
    mesh.wait_for_sync().await;

    let version = ctx.latest_version(&ctx.schema()).unwrap();
    let draft = ctx.index_name(&ctx.release(), &version, ContainerType::Draft);
    let published = ctx.index_name(&ctx.release(), &version, ContainerType::Published);
    let id = compose_document_id(&node.uuid(), "fr");
    assert!(ctx.backend().searchable_document(&draft, &id).is_some());
    assert!(ctx.backend().searchable_document(&published, &id).is_some());

    mesh.update_node(&node.uuid(), &ctx.release(), "fr", fields! { "title" => "Salut" })?;
    mesh.wait_for_sync().await;
    assert_eq!(ctx.backend().searchable_document(&draft, &id).unwrap()["displayField"], "Salut");
    assert_eq!(ctx.backend().searchable_document(&published, &id).unwrap()["displayField"], "Bonjour");

    mesh.delete_node_content(&node.uuid(), &ctx.release(), Some("fr"))?;
    mesh.wait_for_sync().await;
    assert!(ctx.backend().searchable_document(&draft, &id).is_none());
    assert!(ctx.backend().searchable_document(&published, &id).is_none());
    Ok(())
}

#[test]
fn test_external_events_are_deduplicated_per_document() {
    run_test(create_test_context, external_events_are_deduplicated, cleanup)
}

async fn external_events_are_deduplicated(ctx: TestContext) -> MeshResult<()> {
    let node = ctx
        .create_nodes(&ctx.schema(), 1, &["en"], |_, _| fields! { "title" => "x" })?
        .remove(0);
    ctx.mesh().wait_for_sync().await;
    ctx.backend().clear_operations();

    // the same fully specified target three times in one burst
    for _ in 0..3 {
        ctx.mesh().on_content_mutated(
            node.uuid(),
            ElementType::Node,
            MutationAction::Store,
            IndexContext::new()
                .project(ctx.project())
                .release(ctx.release())
                .container_type(ContainerType::Draft)
                .language("en"),
        )?;
    }
    ctx.mesh().wait_for_sync().await;

    let version = ctx.latest_version(&ctx.schema()).unwrap();
    let index = ctx.index_name(&ctx.release(), &version, ContainerType::Draft);
    let upsert = BackendOperation::Upsert {
        index: index.clone(),
        document_id: compose_document_id(&node.uuid(), "en"),
    };
    // events may be merged or not, but never more writes than events
    let writes = ctx.backend().count(&upsert);
    assert!((1..=3).contains(&writes));
    assert_eq!(ctx.backend().document_count(&index), 1);
    Ok(())
}

#[test]
#[retry]
fn test_slow_backend_is_drained_on_close() {
    run_test(create_test_context, slow_backend_is_drained_on_close, cleanup)
}

async fn slow_backend_is_drained_on_close(ctx: TestContext) -> MeshResult<()> {
    ctx.backend().set_latency(Duration::from_millis(20));
    let nodes = ctx.create_nodes(&ctx.schema(), 10, &["en"], |i, _| fields! { "title" => format!("n{}", i) })?;
    assert!(ctx.mesh().sync_queue().pending() > 0);

    ctx.mesh().close().await?;
    assert!(ctx.mesh().sync_queue().pending() == 0);
    let version = ctx.latest_version(&ctx.schema()).unwrap();
    let index = ctx.index_name(&ctx.release(), &version, ContainerType::Draft);
    for node in &nodes {
        let id = compose_document_id(&node.uuid(), "en");
        assert!(ctx.backend().searchable_document(&index, &id).is_some());
    }
    Ok(())
}
