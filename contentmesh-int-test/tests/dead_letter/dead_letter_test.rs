use contentmesh::content::ContainerType;
use contentmesh::errors::MeshResult;
use contentmesh::fields;
use contentmesh::mesh::ContentMesh;
use contentmesh::search::{compose_document_id, DeadLetterLog};
use contentmesh_int_test::test_util::{cleanup, create_test_context, create_test_context_with, run_test, TestContext};
use std::time::Duration;

#[test]
fn test_unavailable_index_is_dead_lettered_and_recovered() {
    run_test(create_test_context, unavailable_index_is_recovered, cleanup)
}

async fn unavailable_index_is_recovered(ctx: TestContext) -> MeshResult<()> {
    let version = ctx.latest_version(&ctx.schema()).unwrap();
    let index = ctx.index_name(&ctx.release(), &version, ContainerType::Draft);
    ctx.backend().fail_index(&index);

    let node = ctx
        .create_nodes(&ctx.schema(), 1, &["de"], |_, _| fields! { "title" => "Hallo" })?
        .remove(0);
    ctx.mesh().wait_for_sync().await;

    let letters = ctx.mesh().dead_letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].event.element_uuid, node.uuid());
    assert_eq!(letters[0].attempts, 3);
    assert_eq!(letters[0].failed_targets.len(), 1);
    assert_eq!(letters[0].failed_targets[0].index_name, index);

    // content stays committed while search is down
    let stored = ctx.mesh().store().read(|s| s.node(&node.uuid()).is_some());
    assert!(stored);

    ctx.backend().heal_index(&index);
    assert_eq!(ctx.mesh().retry_dead_letters().await?, 1);
    assert!(ctx.mesh().dead_letters().is_empty());
    let id = compose_document_id(&node.uuid(), "de");
    assert!(ctx.backend().searchable_document(&index, &id).is_some());
    Ok(())
}

#[test]
fn test_still_failing_letters_stay_in_log() {
    run_test(create_test_context, still_failing_letters_stay, cleanup)
}

async fn still_failing_letters_stay(ctx: TestContext) -> MeshResult<()> {
    let version = ctx.latest_version(&ctx.schema()).unwrap();
    let index = ctx.index_name(&ctx.release(), &version, ContainerType::Draft);
    ctx.backend().fail_index(&index);
    ctx.create_nodes(&ctx.schema(), 2, &["en"], |i, _| fields! { "title" => format!("t{}", i) })?;
    ctx.mesh().wait_for_sync().await;
    assert_eq!(ctx.mesh().dead_letters().len(), 2);

    assert_eq!(ctx.mesh().retry_dead_letters().await?, 0);
    assert_eq!(ctx.mesh().dead_letters().len(), 2);

    // a failing backend never blocks authoring
    let other = ctx.mesh().create_release(&ctx.project(), "next")?;
    awaitility::at_most(Duration::from_secs(5)).until(|| ctx.mesh().sync_queue().pending() == 0);
    assert!(ctx.assigned_version(&other.uuid(), &ctx.schema()).is_some());
    Ok(())
}

#[test]
fn test_dead_letters_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dead-letters.jsonl");
    let before_path = path.clone();
    run_test(
        move || create_test_context_with(ContentMesh::builder().dead_letter_path(&before_path)),
        |ctx| dead_letter_journal_written(ctx, path.clone()),
        cleanup,
    )
}

async fn dead_letter_journal_written(ctx: TestContext, path: std::path::PathBuf) -> MeshResult<()> {
    let version = ctx.latest_version(&ctx.schema()).unwrap();
    let index = ctx.index_name(&ctx.release(), &version, ContainerType::Draft);
    ctx.backend().fail_index(&index);
    ctx.create_nodes(&ctx.schema(), 1, &["fr"], |_, _| fields! { "title" => "Salut" })?;
    ctx.mesh().wait_for_sync().await;

    let reopened = DeadLetterLog::open(&path)?;
    assert_eq!(reopened.entries(), ctx.mesh().dead_letters());
    assert_eq!(reopened.len(), 1);
    Ok(())
}
