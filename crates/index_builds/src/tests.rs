use std::sync::Arc;

use errors::{
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};
use proptest::prelude::*;
use serde_json::json;

use crate::{
    builder::{
        collection_lock_resource,
        MultiIndexBuilder,
    },
    catalog::Catalog,
    context::{
        LockMode,
        OperationContext,
    },
    storage::SortedIndex,
    test_helpers::TestDatabase,
    types::{
        BuildPhase,
        CollectionId,
        DrainYieldPolicy,
        IndexBuildMethod,
        IndexKey,
        IndexKeyEntry,
        IndexSpec,
        InitMode,
        KeyValue,
        RecordId,
        RetrySkippedRecordMode,
    },
};

fn builder_for(db: &TestDatabase, collection: CollectionId) -> MultiIndexBuilder {
    MultiIndexBuilder::new(
        Arc::new(db.engine.clone()),
        Arc::new(db.catalog.clone()),
        collection,
    )
}

/// Run `init` under the exclusive collection lock it requires.
fn init_build(
    ctx: &mut OperationContext,
    builder: &mut MultiIndexBuilder,
    collection: CollectionId,
    specs: Vec<IndexSpec>,
    mode: InitMode,
) -> anyhow::Result<Vec<crate::types::IndexIdent>> {
    let resource = collection_lock_resource(collection);
    ctx.lock(&resource, LockMode::Exclusive);
    let result = builder.init(ctx, specs, mode);
    ctx.unlock(&resource, LockMode::Exclusive);
    result
}

/// Drive a builder from post-init through commit the way the real build
/// procedure does: scan and first drains under the intent lock, the final
/// drain and commit under the exclusive lock.
fn finish_build(
    ctx: &mut OperationContext,
    builder: &mut MultiIndexBuilder,
    collection: CollectionId,
) -> anyhow::Result<()> {
    let resource = collection_lock_resource(collection);
    ctx.lock(&resource, LockMode::Intent);
    let phase1 = (|| {
        builder.scan_collection(ctx)?;
        builder.dump_inserts(ctx)?;
        builder.drain_background_writes(ctx, DrainYieldPolicy::Yield)
    })();
    ctx.unlock(&resource, LockMode::Intent);
    phase1?;
    ctx.lock(&resource, LockMode::Exclusive);
    let phase2 = (|| {
        builder.drain_background_writes(ctx, DrainYieldPolicy::None)?;
        builder.retry_skipped_records(ctx, RetrySkippedRecordMode::KeyGenerationAndInsertion)?;
        builder.check_constraints(ctx)?;
        builder.commit(ctx)
    })();
    ctx.unlock(&resource, LockMode::Exclusive);
    phase2
}

#[test]
fn test_hybrid_build_with_concurrent_writes() -> anyhow::Result<()> {
    let db = TestDatabase::new();
    let collection = db.create_collection();
    let mut ctx = db.ctx("writer");
    for n in 0..10 {
        db.insert(&mut ctx, collection, json!({"a": n, "b": "x"}))?;
    }

    let mut builder = builder_for(&db, collection);
    let mut build_ctx = db.ctx("index_build");
    let idents = init_build(
        &mut build_ctx,
        &mut builder,
        collection,
        vec![IndexSpec::ordered("a", vec!["a".into()])],
        InitMode::SteadyState,
    )?;
    assert_eq!(builder.phase(), Some(BuildPhase::Initialized));
    assert!(builder.is_background_building());

    // Writes that land after init are captured as side writes.
    let during = db.insert(&mut ctx, collection, json!({"a": 100, "b": "y"}))?;
    db.delete(&mut ctx, collection, RecordId(0))?;

    finish_build(&mut build_ctx, &mut builder, collection)?;
    assert_eq!(builder.phase(), Some(BuildPhase::Committed));
    assert!(!builder.is_background_building());

    let entry = db.catalog.entry(collection, idents[0])?;
    assert!(entry.ready);
    assert!(!entry.multikey);

    // 10 initial + 1 concurrent insert - 1 concurrent delete.
    let index = db.engine.sorted_index_data(idents[0]);
    assert_eq!(index.num_entries(), 10);
    assert!(index.contains(&IndexKeyEntry::new(
        IndexKey(vec![KeyValue::Int(100)]),
        during,
    )));
    assert!(!index.contains(&IndexKeyEntry::new(IndexKey(vec![KeyValue::Int(0)]), RecordId(0))));

    // Temp tables are gone after commit, and the interceptor's counters
    // agree once every side write has drained.
    let interceptor = builder.interceptor(idents[0]).unwrap();
    assert_eq!(
        interceptor.num_side_writes_recorded(),
        interceptor.num_side_writes_applied(),
    );
    for ident in interceptor.temporary_table_idents() {
        assert!(!db.engine.has_temp_table(ident));
    }
    Ok(())
}

#[test]
fn test_foreground_build_of_two_indexes() -> anyhow::Result<()> {
    let db = TestDatabase::new();
    let collection = db.create_collection();
    let mut ctx = db.ctx("writer");
    for n in 0..100 {
        db.insert(&mut ctx, collection, json!({"a": n, "b": n * 2}))?;
    }

    let mut builder = builder_for(&db, collection);
    builder.set_index_build_method(IndexBuildMethod::Foreground);
    let mut build_ctx = db.ctx("index_build");
    let idents = init_build(
        &mut build_ctx,
        &mut builder,
        collection,
        vec![
            IndexSpec::ordered("a", vec!["a".into()]),
            IndexSpec::ordered("b", vec!["b".into()]),
        ],
        InitMode::SteadyState,
    )?;
    assert_eq!(builder.index_build_method(), IndexBuildMethod::Foreground);
    assert!(!builder.is_background_building());

    // Foreground builds run start to finish under the exclusive lock, with
    // no interceptor on the write path and no drain phase.
    let resource = collection_lock_resource(collection);
    build_ctx.lock(&resource, LockMode::Exclusive);
    let finish = (|| {
        builder.scan_collection(&mut build_ctx)?;
        builder.dump_inserts(&mut build_ctx)?;
        builder.check_constraints(&mut build_ctx)?;
        builder.commit(&mut build_ctx)
    })();
    build_ctx.unlock(&resource, LockMode::Exclusive);
    finish?;

    assert_eq!(builder.phase(), Some(BuildPhase::Committed));
    for ident in idents {
        assert!(db.catalog.entry(collection, ident)?.ready);
        assert_eq!(db.engine.sorted_index_data(ident).num_entries(), 100);
    }
    Ok(())
}

#[test]
fn test_unique_index_duplicate_resolved_before_commit() -> anyhow::Result<()> {
    let db = TestDatabase::new();
    let collection = db.create_collection();
    let mut ctx = db.ctx("writer");
    db.insert(&mut ctx, collection, json!({"u": 1}))?;
    let dup = db.insert(&mut ctx, collection, json!({"u": 1}))?;
    db.insert(&mut ctx, collection, json!({"u": 2}))?;

    let mut builder = builder_for(&db, collection);
    let mut build_ctx = db.ctx("index_build");
    let idents = init_build(
        &mut build_ctx,
        &mut builder,
        collection,
        vec![IndexSpec::ordered("u", vec!["u".into()]).unique()],
        InitMode::SteadyState,
    )?;

    let resource = collection_lock_resource(collection);
    build_ctx.lock(&resource, LockMode::Intent);
    builder.scan_collection(&mut build_ctx)?;
    builder.dump_inserts(&mut build_ctx)?;
    build_ctx.unlock(&resource, LockMode::Intent);
    let interceptor = builder.interceptor(idents[0]).unwrap();
    assert!(interceptor.num_duplicates_recorded() > 0);

    // The duplicate goes away before the constraint check runs.
    db.delete(&mut ctx, collection, dup)?;

    build_ctx.lock(&resource, LockMode::Exclusive);
    builder.drain_background_writes(&mut build_ctx, DrainYieldPolicy::None)?;
    builder.check_constraints(&mut build_ctx)?;
    builder.commit(&mut build_ctx)?;
    build_ctx.unlock(&resource, LockMode::Exclusive);
    Ok(())
}

#[test]
fn test_unique_index_unresolved_duplicate_fails_and_aborts() -> anyhow::Result<()> {
    let db = TestDatabase::new();
    let collection = db.create_collection();
    let mut ctx = db.ctx("writer");
    db.insert(&mut ctx, collection, json!({"u": 1}))?;
    db.insert(&mut ctx, collection, json!({"u": 1}))?;

    let mut builder = builder_for(&db, collection);
    let mut build_ctx = db.ctx("index_build");
    init_build(
        &mut build_ctx,
        &mut builder,
        collection,
        vec![IndexSpec::ordered("u", vec!["u".into()]).unique()],
        InitMode::SteadyState,
    )?;
    let err = finish_build(&mut build_ctx, &mut builder, collection).unwrap_err();
    assert!(err.is_duplicate_key());

    builder.abort(&mut build_ctx, "duplicate key");
    assert_eq!(builder.phase(), Some(BuildPhase::Aborted));
    assert_eq!(db.catalog.num_indexes(collection), 0);
    Ok(())
}

#[test]
fn test_scan_restarts_on_snapshot_invalidation() -> anyhow::Result<()> {
    let db = TestDatabase::new();
    let collection = db.create_collection();
    let mut ctx = db.ctx("writer");
    for n in 0..5 {
        db.insert(&mut ctx, collection, json!({"a": n}))?;
    }

    let mut builder = builder_for(&db, collection);
    let mut build_ctx = db.ctx("index_build");
    let idents = init_build(
        &mut build_ctx,
        &mut builder,
        collection,
        vec![IndexSpec::ordered("a", vec!["a".into()])],
        InitMode::SteadyState,
    )?;
    db.engine
        .inject_scan_fault(ErrorMetadata::snapshot_unavailable().into());
    db.engine
        .inject_scan_fault(ErrorMetadata::cursor_invalidated().into());

    finish_build(&mut build_ctx, &mut builder, collection)?;

    // Both restarts reset the bulk loaders, so nothing was double-counted.
    let index = db.engine.sorted_index_data(idents[0]);
    assert_eq!(index.num_entries(), 5);
    Ok(())
}

#[test]
fn test_resumable_build_round_trip() -> anyhow::Result<()> {
    let db = TestDatabase::new();
    let collection = db.create_collection();
    let mut ctx = db.ctx("writer");
    for n in 0..4 {
        db.insert(&mut ctx, collection, json!({"a": n}))?;
    }

    let mut builder = builder_for(&db, collection);
    let mut build_ctx = db.ctx("index_build");
    let idents = init_build(
        &mut build_ctx,
        &mut builder,
        collection,
        vec![IndexSpec::ordered("a", vec!["a".into()])],
        InitMode::SteadyState,
    )?;
    let build_id = builder.build_id();
    let resource = collection_lock_resource(collection);
    build_ctx.lock(&resource, LockMode::Intent);
    builder.scan_collection(&mut build_ctx)?;
    builder.dump_inserts(&mut build_ctx)?;
    build_ctx.unlock(&resource, LockMode::Intent);

    // A write captured before shutdown must survive into the resumed build.
    let late = db.insert(&mut ctx, collection, json!({"a": 99}))?;

    builder.abort_without_cleanup(&mut build_ctx, true);
    let side_writes_table = builder
        .interceptor(idents[0])
        .unwrap()
        .side_writes_table_ident();
    drop(builder);
    assert!(db.engine.has_temp_table(side_writes_table));

    let mut resumed = MultiIndexBuilder::resume(
        Arc::new(db.engine.clone()),
        Arc::new(db.catalog.clone()),
        build_id,
    )?;
    // The build stopped after its bulk load, so the resumed build picks up
    // at the drain phase.
    let mut resume_ctx = db.ctx("index_build_resume");
    resume_ctx.lock(&resource, LockMode::Exclusive);
    let finish = (|| {
        resumed.drain_background_writes(&mut resume_ctx, DrainYieldPolicy::None)?;
        resumed.retry_skipped_records(
            &mut resume_ctx,
            RetrySkippedRecordMode::KeyGenerationAndInsertion,
        )?;
        resumed.check_constraints(&mut resume_ctx)?;
        resumed.commit(&mut resume_ctx)
    })();
    resume_ctx.unlock(&resource, LockMode::Exclusive);
    finish?;

    let index = db.engine.sorted_index_data(idents[0]);
    assert_eq!(index.num_entries(), 5);
    assert!(index.contains(&IndexKeyEntry::new(IndexKey(vec![KeyValue::Int(99)]), late)));

    // Resume state is consumed once.
    let second = MultiIndexBuilder::resume(
        Arc::new(db.engine.clone()),
        Arc::new(db.catalog.clone()),
        build_id,
    );
    assert!(second.err().unwrap().is_not_found());
    Ok(())
}

#[test]
fn test_resume_mid_scan_rescans_from_the_start() -> anyhow::Result<()> {
    let db = TestDatabase::new();
    let collection = db.create_collection();
    let mut ctx = db.ctx("writer");
    for n in 0..600 {
        db.insert(&mut ctx, collection, json!({"a": n}))?;
    }

    let mut builder = builder_for(&db, collection);
    let mut build_ctx = db.ctx("index_build");
    let idents = init_build(
        &mut build_ctx,
        &mut builder,
        collection,
        vec![IndexSpec::ordered("a", vec!["a".into()])],
        InitMode::SteadyState,
    )?;
    let build_id = builder.build_id();

    // Shut the build down partway through the scan, at its first yield
    // point. The keys accumulated so far live only in the in-memory bulk
    // loaders and die with the process.
    build_ctx.interrupt_handle().interrupt();
    let err = builder.scan_collection(&mut build_ctx).unwrap_err();
    assert_eq!(err.short_msg(), "Interrupted");
    builder.abort_without_cleanup(&mut build_ctx, true);
    drop(builder);

    let mut resumed = MultiIndexBuilder::resume(
        Arc::new(db.engine.clone()),
        Arc::new(db.catalog.clone()),
        build_id,
    )?;
    assert_eq!(resumed.phase(), Some(BuildPhase::CollectionScan));
    let mut resume_ctx = db.ctx("index_build_resume");
    finish_build(&mut resume_ctx, &mut resumed, collection)?;

    // Every record reaches the committed index, including the ones scanned
    // before the shutdown.
    let index = db.engine.sorted_index_data(idents[0]);
    assert_eq!(index.num_entries(), 600);
    Ok(())
}

#[test]
fn test_skipped_records_block_commit_until_retried() -> anyhow::Result<()> {
    let db = TestDatabase::new();
    let collection = db.create_collection();
    let mut ctx = db.ctx("writer");
    db.insert(&mut ctx, collection, json!({"a": 1}))?;
    // Non-integer numbers cannot be indexed; under relaxed constraints the
    // record is skipped rather than failing the build.
    let bad = db.insert(&mut ctx, collection, json!({"a": 1.5}))?;

    let mut builder = builder_for(&db, collection);
    let mut build_ctx = db.ctx("index_build");
    let idents = init_build(
        &mut build_ctx,
        &mut builder,
        collection,
        vec![IndexSpec::ordered("a", vec!["a".into()])],
        InitMode::InitialSync,
    )?;
    let resource = collection_lock_resource(collection);
    build_ctx.lock(&resource, LockMode::Intent);
    builder.scan_collection(&mut build_ctx)?;
    builder.dump_inserts(&mut build_ctx)?;
    builder.drain_background_writes(&mut build_ctx, DrainYieldPolicy::None)?;
    build_ctx.unlock(&resource, LockMode::Intent);
    let interceptor = builder.interceptor(idents[0]).unwrap();
    assert_eq!(interceptor.num_records_skipped(), 1);

    build_ctx.lock(&resource, LockMode::Exclusive);
    let err = builder.commit(&mut build_ctx).unwrap_err();
    assert_eq!(err.short_msg(), "SkippedRecordsRemain");
    build_ctx.unlock(&resource, LockMode::Exclusive);

    // Fix the document, settle the skipped record, and commit.
    db.update(&mut ctx, collection, bad, json!({"a": 2}))?;
    build_ctx.lock(&resource, LockMode::Exclusive);
    builder.drain_background_writes(&mut build_ctx, DrainYieldPolicy::None)?;
    builder.retry_skipped_records(
        &mut build_ctx,
        RetrySkippedRecordMode::KeyGenerationAndInsertion,
    )?;
    builder.check_constraints(&mut build_ctx)?;
    builder.commit(&mut build_ctx)?;
    build_ctx.unlock(&resource, LockMode::Exclusive);

    let index = db.engine.sorted_index_data(idents[0]);
    assert!(index.contains(&IndexKeyEntry::new(IndexKey(vec![KeyValue::Int(2)]), bad)));
    Ok(())
}

#[test]
fn test_identical_in_progress_build_is_rejected() -> anyhow::Result<()> {
    let db = TestDatabase::new();
    let collection = db.create_collection();
    let spec = IndexSpec::ordered("a", vec!["a".into()]);

    let mut first = builder_for(&db, collection);
    let mut ctx1 = db.ctx("build_1");
    init_build(
        &mut ctx1,
        &mut first,
        collection,
        vec![spec.clone()],
        InitMode::SteadyState,
    )?;

    let mut second = builder_for(&db, collection);
    let mut ctx2 = db.ctx("build_2");
    let err = init_build(
        &mut ctx2,
        &mut second,
        collection,
        vec![spec],
        InitMode::SteadyState,
    )
    .unwrap_err();
    assert!(err.is_operation_failed());
    assert!(err.msg().contains("cannot build two identical indexes"));

    first.abort(&mut ctx1, "test teardown");
    Ok(())
}

#[test]
fn test_failed_init_registers_nothing() -> anyhow::Result<()> {
    let db = TestDatabase::new();
    let collection = db.create_collection();
    let good = IndexSpec::ordered("a", vec!["a".into()]);
    let bad = IndexSpec {
        kind: crate::types::IndexKind::Hashed,
        ..IndexSpec::ordered("h", vec!["b".into()])
    }
    .unique();

    let mut builder = builder_for(&db, collection);
    let mut ctx = db.ctx("index_build");
    let err = init_build(
        &mut ctx,
        &mut builder,
        collection,
        vec![good, bad],
        InitMode::SteadyState,
    )
    .unwrap_err();
    assert!(err.is_bad_request());
    // The first index's registration rolled back with the failed unit of
    // work.
    assert_eq!(db.catalog.num_indexes(collection), 0);
    Ok(())
}

#[test]
fn test_dropping_unfinished_builder_is_fatal() {
    let result = std::panic::catch_unwind(|| {
        let db = TestDatabase::new();
        let collection = db.create_collection();
        let mut builder = builder_for(&db, collection);
        let mut ctx = db.ctx("index_build");
        init_build(
            &mut ctx,
            &mut builder,
            collection,
            vec![IndexSpec::ordered("a", vec!["a".into()])],
            InitMode::SteadyState,
        )
        .unwrap();
        drop(builder);
    });
    assert!(result.is_err());
}

#[test]
fn test_abort_cleanup_hitting_unrelated_error_is_fatal() {
    let db = TestDatabase::new();
    let collection = db.create_collection();
    let mut builder = builder_for(&db, collection);
    let mut ctx = db.ctx("index_build");
    init_build(
        &mut ctx,
        &mut builder,
        collection,
        vec![IndexSpec::ordered("a", vec!["a".into()])],
        InitMode::SteadyState,
    )
    .unwrap();

    // Transient errors retry without bound; anything else during cleanup
    // means the catalog and storage may disagree and must take the process
    // down.
    db.catalog
        .inject_unregister_fault(anyhow::anyhow!("catalog out of sync with storage"));
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        builder.abort(&mut ctx, "shutting down");
    }));
    assert!(result.is_err());

    // With the fault gone the retried abort cleans up normally.
    builder.abort(&mut ctx, "shutting down");
    assert_eq!(builder.phase(), Some(BuildPhase::Aborted));
    assert_eq!(db.catalog.num_indexes(collection), 0);
}

#[test]
fn test_interrupt_surfaces_during_scan() -> anyhow::Result<()> {
    let db = TestDatabase::new();
    let collection = db.create_collection();
    let mut ctx = db.ctx("writer");
    for n in 0..600 {
        db.insert(&mut ctx, collection, json!({"a": n}))?;
    }

    let mut builder = builder_for(&db, collection);
    let mut build_ctx = db.ctx("index_build");
    init_build(
        &mut build_ctx,
        &mut builder,
        collection,
        vec![IndexSpec::ordered("a", vec!["a".into()])],
        InitMode::SteadyState,
    )?;
    // Trips at the scan's next yield point.
    build_ctx.interrupt_handle().interrupt();
    let err = builder.scan_collection(&mut build_ctx).unwrap_err();
    assert_eq!(err.short_msg(), "Interrupted");

    builder.abort(&mut build_ctx, "interrupted");
    Ok(())
}

#[test]
fn test_multikey_and_partial_filter_at_commit() -> anyhow::Result<()> {
    let db = TestDatabase::new();
    let collection = db.create_collection();
    let mut ctx = db.ctx("writer");
    db.insert(&mut ctx, collection, json!({"tags": ["x", "y"], "kind": "user"}))?;
    db.insert(&mut ctx, collection, json!({"tags": "plain", "kind": "system"}))?;

    let mut spec = IndexSpec::ordered("tags", vec!["tags".into()]);
    spec.partial_filter = Some(crate::types::FilterExpression {
        field: "kind".into(),
        equals: json!("user"),
    });
    let mut builder = builder_for(&db, collection);
    let mut build_ctx = db.ctx("index_build");
    let idents = init_build(
        &mut build_ctx,
        &mut builder,
        collection,
        vec![spec],
        InitMode::SteadyState,
    )?;
    finish_build(&mut build_ctx, &mut builder, collection)?;

    let entry = db.catalog.entry(collection, idents[0])?;
    assert!(entry.ready);
    assert!(entry.multikey);
    assert_eq!(
        entry.multikey_paths.0[0],
        std::collections::BTreeSet::from([0])
    );
    // The system document failed the filter and contributed nothing.
    let index = db.engine.sorted_index_data(idents[0]);
    assert_eq!(index.num_entries(), 2);
    Ok(())
}

#[test]
fn test_mixed_schema_flag_cleared_by_clean_build() -> anyhow::Result<()> {
    let db = TestDatabase::new();
    let collection = db.create_collection();
    db.catalog.set_mixed_schema_flag(collection);
    let mut ctx = db.ctx("writer");
    db.insert(&mut ctx, collection, json!({"vals": [1, 2]}))?;

    let mut builder = builder_for(&db, collection);
    let mut build_ctx = db.ctx("index_build");
    init_build(
        &mut build_ctx,
        &mut builder,
        collection,
        vec![IndexSpec::ordered("vals", vec!["vals".into()])],
        InitMode::SteadyState,
    )?;
    finish_build(&mut build_ctx, &mut builder, collection)?;
    assert!(!db.catalog.may_contain_mixed_schema(collection)?);
    Ok(())
}

#[test]
fn test_mixed_schema_flag_survives_when_seen() -> anyhow::Result<()> {
    let db = TestDatabase::new();
    let collection = db.create_collection();
    db.catalog.set_mixed_schema_flag(collection);
    let mut ctx = db.ctx("writer");
    db.insert(&mut ctx, collection, json!({"vals": [1, "x"]}))?;

    let mut builder = builder_for(&db, collection);
    let mut build_ctx = db.ctx("index_build");
    init_build(
        &mut build_ctx,
        &mut builder,
        collection,
        vec![IndexSpec::ordered("vals", vec!["vals".into()])],
        InitMode::SteadyState,
    )?;
    finish_build(&mut build_ctx, &mut builder, collection)?;
    assert!(db.catalog.may_contain_mixed_schema(collection)?);
    Ok(())
}

#[test]
fn test_insert_single_document_for_initial_sync() -> anyhow::Result<()> {
    let db = TestDatabase::new();
    let collection = db.create_collection();

    let mut builder = builder_for(&db, collection);
    let mut build_ctx = db.ctx("initial_sync");
    let idents = init_build(
        &mut build_ctx,
        &mut builder,
        collection,
        vec![IndexSpec::ordered("a", vec!["a".into()])],
        InitMode::InitialSync,
    )?;
    builder.ignore_unique_constraint();

    // Initial sync applies replicated documents straight into the indexes.
    let mut ctx = db.ctx("writer");
    let record = db.insert(&mut ctx, collection, json!({"a": 7}))?;
    let doc = json!({"a": 7}).as_object().cloned().unwrap();
    builder.insert_single_document(&mut build_ctx, record, &doc)?;

    let index = db.engine.sorted_index_data(idents[0]);
    assert!(index.contains(&IndexKeyEntry::new(IndexKey(vec![KeyValue::Int(7)]), record)));
    builder.abort(&mut build_ctx, "test teardown");
    Ok(())
}

#[test]
fn test_drain_fails_when_index_dropped_at_yield() -> anyhow::Result<()> {
    let db = TestDatabase::new();
    let collection = db.create_collection();
    let mut ctx = db.ctx("writer");
    db.insert(&mut ctx, collection, json!({"a": 1}))?;

    let mut builder = builder_for(&db, collection);
    let mut build_ctx = db.ctx("index_build");
    let idents = init_build(
        &mut build_ctx,
        &mut builder,
        collection,
        vec![IndexSpec::ordered("a", vec!["a".into()])],
        InitMode::SteadyState,
    )?;
    builder.scan_collection(&mut build_ctx)?;
    builder.dump_inserts(&mut build_ctx)?;
    db.insert(&mut ctx, collection, json!({"a": 2}))?;

    // Someone drops the index while the drain has its locks down.
    db.catalog.drop_index(collection, idents[0]);
    let err = builder
        .drain_background_writes(&mut build_ctx, DrainYieldPolicy::Yield)
        .unwrap_err();
    assert!(err.is_not_found());

    builder.abort(&mut build_ctx, "index dropped");
    Ok(())
}

#[test]
fn test_side_write_rolls_back_with_unit_of_work() -> anyhow::Result<()> {
    let db = TestDatabase::new();
    let collection = db.create_collection();
    let mut builder = builder_for(&db, collection);
    let mut build_ctx = db.ctx("index_build");
    let idents = init_build(
        &mut build_ctx,
        &mut builder,
        collection,
        vec![IndexSpec::ordered("a", vec!["a".into()])],
        InitMode::SteadyState,
    )?;
    let interceptor = builder.interceptor(idents[0]).unwrap();

    let mut ctx = db.ctx("writer");
    let doc = json!({"a": 1}).as_object().cloned().unwrap();
    let result: anyhow::Result<()> = ctx.run_in_unit_of_work(|ctx| {
        interceptor.side_write(
            ctx,
            crate::types::SideWriteOp::Insert,
            RecordId(0),
            &doc,
        )?;
        anyhow::bail!("write failed after the capture")
    });
    assert!(result.is_err());
    assert_eq!(interceptor.num_side_writes_recorded(), 0);
    assert!(interceptor.are_all_writes_applied());

    builder.abort(&mut build_ctx, "test teardown");
    Ok(())
}

#[test]
fn test_build_yields_to_concurrent_writer_at_pause_point() -> anyhow::Result<()> {
    use crate::pause::PauseController;

    let db = Arc::new(TestDatabase::new());
    let collection = db.create_collection();
    let mut ctx = db.ctx("writer");
    for n in 0..600 {
        db.insert(&mut ctx, collection, json!({"a": n}))?;
    }

    let (mut controller, pause_client) = PauseController::new(["index_build_scan"]);
    let db_ = db.clone();
    let build_thread = std::thread::spawn(move || -> anyhow::Result<u64> {
        let mut builder = builder_for(&db_, collection);
        let mut build_ctx = db_.ctx("index_build").with_pause_client(pause_client);
        let idents = init_build(
            &mut build_ctx,
            &mut builder,
            collection,
            vec![IndexSpec::ordered("a", vec!["a".into()])],
            InitMode::SteadyState,
        )?;
        finish_build(&mut build_ctx, &mut builder, collection)?;
        Ok(db_.engine.sorted_index_data(idents[0]).num_entries())
    });

    // While the scan is parked at its yield point it holds no locks, so a
    // writer gets through; the side write is drained before commit.
    let guard = controller
        .wait_for_blocked("index_build_scan")
        .expect("scan never reached its yield point");
    db.insert(&mut ctx, collection, json!({"a": 1000}))?;
    drop(guard);
    // Wave the scan through its remaining yield points until the build
    // thread exits.
    while let Some(mut guard) = controller.wait_for_blocked("index_build_scan") {
        guard.unpause();
    }

    let num_entries = build_thread.join().unwrap()?;
    assert_eq!(num_entries, 601);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig { failure_persistence: None, cases: 32, ..ProptestConfig::default() })]

    /// Whatever interleaving of writes happens during a build, the committed
    /// index holds exactly the keys of the final collection state.
    #[test]
    fn proptest_drain_converges_to_final_state(
        initial in prop::collection::vec(0i64..20, 1..20),
        ops in prop::collection::vec((prop::bool::ANY, 0i64..20, 0usize..40), 0..30),
    ) {
        let db = TestDatabase::new();
        let collection = db.create_collection();
        let mut ctx = db.ctx("writer");
        let mut live: Vec<RecordId> = Vec::new();
        for value in &initial {
            live.push(db.insert(&mut ctx, collection, json!({"a": value})).unwrap());
        }

        let mut builder = builder_for(&db, collection);
        let mut build_ctx = db.ctx("index_build");
        let idents = init_build(
            &mut build_ctx,
            &mut builder,
            collection,
            vec![IndexSpec::ordered("a", vec!["a".into()])],
            InitMode::SteadyState,
        )
        .unwrap();
        builder.scan_collection(&mut build_ctx).unwrap();
        builder.dump_inserts(&mut build_ctx).unwrap();

        // Concurrent inserts and deletes while the build drains.
        for (is_insert, value, target) in &ops {
            if *is_insert || live.is_empty() {
                live.push(db.insert(&mut ctx, collection, json!({"a": value})).unwrap());
            } else {
                let record = live.remove(target % live.len());
                db.delete(&mut ctx, collection, record).unwrap();
            }
        }

        let resource = collection_lock_resource(collection);
        build_ctx.lock(&resource, LockMode::Exclusive);
        builder
            .drain_background_writes(&mut build_ctx, DrainYieldPolicy::None)
            .unwrap();
        builder.check_constraints(&mut build_ctx).unwrap();
        builder.commit(&mut build_ctx).unwrap();
        build_ctx.unlock(&resource, LockMode::Exclusive);

        let index = db.engine.sorted_index_data(idents[0]);
        prop_assert_eq!(index.num_entries() as usize, db.num_records(collection));
    }
}
