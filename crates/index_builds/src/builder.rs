//! Orchestrates building one or more indexes on a collection: catalog
//! registration, the restartable collection scan, bulk load, side-write
//! drains, constraint resolution, and the final commit or abort.

use std::sync::{
    atomic::{
        AtomicBool,
        Ordering,
    },
    Arc,
};

use errors::{
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};
use itertools::Itertools;
use tracing::{
    info,
    warn,
};

use crate::{
    access::IndexAccessMethod,
    backoff::Backoff,
    bulk::BulkLoader,
    catalog::Catalog,
    context::{
        LockMode,
        OperationContext,
    },
    fatal::fatal,
    interceptor::IndexBuildInterceptor,
    keys::{
        document_has_mixed_schema,
        filter_matches,
        generate_keys,
    },
    knobs::{
        MAX_INDEX_BUILD_MEMORY_BYTES,
        SCAN_RESTART_INITIAL_BACKOFF,
        SCAN_RESTART_MAX_BACKOFF,
        SCAN_YIELD_PERIOD,
    },
    resume::{
        ResumableIndexState,
        ResumableSnapshot,
    },
    storage::StorageEngine,
    types::{
        BuildPhase,
        CollectionId,
        Document,
        DrainYieldPolicy,
        IndexBuildId,
        IndexBuildMethod,
        IndexIdent,
        IndexSpec,
        InitMode,
        MultikeyPaths,
        ReadSource,
        RecordId,
        RetrySkippedRecordMode,
        TrackDuplicates,
    },
};

pub fn collection_lock_resource(collection: CollectionId) -> String {
    format!("collection/{collection}")
}

struct BuildIndex {
    ident: IndexIdent,
    interceptor: Arc<IndexBuildInterceptor>,
    bulk: Option<BulkLoader>,
}

/// Builds a batch of indexes on one collection.
///
/// The caller drives the phases in order: `init`, `scan_collection`,
/// `dump_inserts`, one or more `drain_background_writes` passes,
/// `retry_skipped_records`, `check_constraints`, then `commit` under an
/// exclusive collection lock. Any failure must end in exactly one of
/// `abort` or `abort_without_cleanup`; dropping a builder that is neither
/// committed nor aborted takes the process down.
pub struct MultiIndexBuilder {
    build_id: IndexBuildId,
    collection: CollectionId,
    engine: Arc<dyn StorageEngine>,
    catalog: Arc<dyn Catalog>,
    method: IndexBuildMethod,
    phase: Option<BuildPhase>,
    indexes: Vec<BuildIndex>,
    last_record_scanned: Option<RecordId>,
    scan_restarts: u32,
    relaxed_constraints: bool,
    ignore_unique: bool,
    cleaned_up: Arc<AtomicBool>,
}

impl MultiIndexBuilder {
    pub fn new(
        engine: Arc<dyn StorageEngine>,
        catalog: Arc<dyn Catalog>,
        collection: CollectionId,
    ) -> Self {
        Self {
            build_id: IndexBuildId::new(),
            collection,
            engine,
            catalog,
            method: IndexBuildMethod::Hybrid,
            phase: None,
            indexes: Vec::new(),
            last_record_scanned: None,
            scan_restarts: 0,
            relaxed_constraints: false,
            ignore_unique: false,
            cleaned_up: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn build_id(&self) -> IndexBuildId {
        self.build_id
    }

    pub fn phase(&self) -> Option<BuildPhase> {
        self.phase
    }

    pub fn set_index_build_method(&mut self, method: IndexBuildMethod) {
        assert!(self.phase.is_none(), "method is fixed once init has run");
        self.method = method;
    }

    pub fn index_build_method(&self) -> IndexBuildMethod {
        self.method
    }

    /// True while collection writes are expected to flow through the
    /// interceptors rather than block on the build.
    pub fn is_background_building(&self) -> bool {
        self.method != IndexBuildMethod::Foreground
            && matches!(
                self.phase,
                Some(
                    BuildPhase::Initialized
                        | BuildPhase::CollectionScan
                        | BuildPhase::BulkLoad
                        | BuildPhase::DrainWrites
                )
            )
    }

    /// Skip the duplicate-constraint check at commit. Initial sync does
    /// this: the sync source already enforced uniqueness.
    pub fn ignore_unique_constraint(&mut self) {
        self.ignore_unique = true;
    }

    /// Register the indexes in the catalog and attach their interceptors,
    /// all in one unit of work. On any failure nothing is left registered.
    /// The caller must hold the exclusive collection lock.
    pub fn init(
        &mut self,
        ctx: &mut OperationContext,
        specs: Vec<IndexSpec>,
        mode: InitMode,
    ) -> anyhow::Result<Vec<IndexIdent>> {
        assert!(self.phase.is_none(), "init may only run once");
        if !ctx.holds_lock(
            &collection_lock_resource(self.collection),
            LockMode::Exclusive,
        ) {
            fatal("init requires the exclusive collection lock");
        }
        if !self.catalog.collection_exists(self.collection) {
            anyhow::bail!(ErrorMetadata::not_found(
                "CollectionNotFound",
                format!("collection {} does not exist", self.collection),
            ));
        }
        let num_unique_names = specs.iter().map(|spec| &spec.name).unique().count();
        anyhow::ensure!(
            num_unique_names == specs.len(),
            ErrorMetadata::bad_request(
                "DuplicateIndexSpec",
                "the same index was specified more than once",
            )
        );
        self.relaxed_constraints = mode != InitMode::SteadyState;

        let memory_budget = if specs.is_empty() {
            *MAX_INDEX_BUILD_MEMORY_BYTES
        } else {
            *MAX_INDEX_BUILD_MEMORY_BYTES / specs.len()
        };
        let engine = self.engine.clone();
        let catalog = self.catalog.clone();
        let collection = self.collection;
        let method = self.method;
        let indexes = ctx.run_in_unit_of_work(|ctx| {
            let mut indexes = Vec::with_capacity(specs.len());
            for spec in &specs {
                let ident = catalog.register_index(ctx, collection, spec).map_err(|e| {
                    if e.is_index_build_already_in_progress() {
                        e.map_error_metadata(|metadata| {
                            ErrorMetadata::operation_failed(
                                "IndexBuildAlreadyInProgress",
                                format!(
                                    "cannot build two identical indexes: {}",
                                    metadata.msg
                                ),
                            )
                        })
                    } else {
                        e
                    }
                })?;
                let access =
                    IndexAccessMethod::new(spec.clone(), engine.sorted_index(ident)?)?;
                let track = if spec.unique {
                    TrackDuplicates::Track
                } else {
                    TrackDuplicates::NoTrack
                };
                let interceptor =
                    Arc::new(IndexBuildInterceptor::new(ctx, engine.as_ref(), access, track)?);
                if method != IndexBuildMethod::Foreground {
                    catalog.attach_interceptor(collection, ident, interceptor.clone())?;
                }
                indexes.push(BuildIndex {
                    ident,
                    interceptor,
                    bulk: Some(BulkLoader::new(memory_budget)),
                });
            }
            Ok(indexes)
        })?;
        let idents = indexes.iter().map(|index| index.ident).collect();
        self.indexes = indexes;
        self.phase = Some(BuildPhase::Initialized);
        self.cleaned_up.store(false, Ordering::SeqCst);
        info!(
            "starting index build {} on collection {}: {} indexes, method {:?}, mode {:?}",
            self.build_id,
            self.collection,
            self.indexes.len(),
            self.method,
            mode,
        );
        Ok(idents)
    }

    /// Reconstruct a builder from state saved by `abort_without_cleanup`.
    /// The saved state is consumed; a second resume for the same build finds
    /// nothing.
    pub fn resume(
        engine: Arc<dyn StorageEngine>,
        catalog: Arc<dyn Catalog>,
        build_id: IndexBuildId,
    ) -> anyhow::Result<Self> {
        let snapshot = engine.take_resume_state(build_id)?.ok_or_else(|| {
            ErrorMetadata::not_found(
                "NoSuchIndexBuild",
                format!("no resumable state for index build {build_id}"),
            )
        })?;
        let mut indexes = Vec::with_capacity(snapshot.indexes.len());
        for state in &snapshot.indexes {
            let access = IndexAccessMethod::new(
                state.spec.clone(),
                engine.sorted_index(state.ident)?,
            )?;
            let interceptor = Arc::new(IndexBuildInterceptor::resume(
                engine.as_ref(),
                access,
                state.side_writes_table,
                state.duplicate_key_table,
                state.skipped_record_table,
                state.multikey_paths.clone(),
            )?);
            catalog.attach_interceptor(snapshot.collection, state.ident, interceptor.clone())?;
            let budget = *MAX_INDEX_BUILD_MEMORY_BYTES / snapshot.indexes.len().max(1);
            let bulk = (snapshot.phase == BuildPhase::CollectionScan)
                .then(|| BulkLoader::new(budget));
            indexes.push(BuildIndex {
                ident: state.ident,
                interceptor,
                bulk,
            });
        }
        info!(
            "resuming index build {} on collection {} in phase {}",
            snapshot.build_id, snapshot.collection, snapshot.phase,
        );
        Ok(Self {
            build_id: snapshot.build_id,
            collection: snapshot.collection,
            engine,
            catalog,
            method: IndexBuildMethod::Hybrid,
            phase: Some(snapshot.phase),
            indexes,
            // A build stopped mid-scan lost its in-memory bulk runs with the
            // process; the scan starts over, like the snapshot-restart path.
            last_record_scanned: None,
            scan_restarts: 0,
            relaxed_constraints: true,
            ignore_unique: false,
            cleaned_up: Arc::new(AtomicBool::new(false)),
        })
    }

    fn expect_phase(&self, allowed: &[BuildPhase], operation: &str) {
        let Some(phase) = self.phase else {
            fatal(&format!("{operation} called before init"));
        };
        if !allowed.contains(&phase) {
            fatal(&format!("{operation} called in phase {phase}"));
        }
    }

    /// Scan every record in the collection and queue its keys into the bulk
    /// loaders. The scan yields periodically; if the storage snapshot or
    /// cursor is invalidated while the locks are down, the whole scan
    /// restarts from the beginning with fresh bulk loaders.
    pub fn scan_collection(&mut self, ctx: &mut OperationContext) -> anyhow::Result<()> {
        self.expect_phase(
            &[BuildPhase::Initialized, BuildPhase::CollectionScan],
            "scan_collection",
        );
        self.phase = Some(BuildPhase::CollectionScan);
        let read_source = match self.method {
            IndexBuildMethod::Hybrid => ReadSource::MajorityCommitted,
            IndexBuildMethod::Foreground | IndexBuildMethod::Background => ReadSource::Latest,
        };
        let mut restart_backoff =
            Backoff::new(*SCAN_RESTART_INITIAL_BACKOFF, *SCAN_RESTART_MAX_BACKOFF);
        let mut num_scanned = 0u64;
        loop {
            match self.scan_attempt(ctx, read_source, &mut num_scanned) {
                Ok(()) => break,
                Err(e) if e.is_scan_invalidation() => {
                    self.scan_restarts += 1;
                    warn!(
                        "index build {}: collection scan restarting (restart {}): {e:#}",
                        self.build_id, self.scan_restarts,
                    );
                    // Everything accumulated so far is suspect; start over.
                    for index in &mut self.indexes {
                        if let Some(bulk) = &mut index.bulk {
                            bulk.reset();
                        }
                    }
                    self.last_record_scanned = None;
                    num_scanned = 0;
                    ctx.check_for_interrupt()?;
                    restart_backoff.fail_and_sleep();
                },
                Err(e) => return Err(e),
            }
        }
        info!(
            "index build {}: collection scan finished, {num_scanned} records, {} restarts",
            self.build_id, self.scan_restarts,
        );
        Ok(())
    }

    fn scan_attempt(
        &mut self,
        ctx: &mut OperationContext,
        read_source: ReadSource,
        num_scanned: &mut u64,
    ) -> anyhow::Result<()> {
        let engine = self.engine.clone();
        let mut cursor =
            engine.open_scan(ctx, self.collection, read_source, self.last_record_scanned)?;
        while let Some((record_id, doc)) = cursor.next(ctx)? {
            let doc = doc
                .as_object()
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("record {} is not an object", record_id.0))?;
            self.ingest_scanned_document(ctx, record_id, &doc)?;
            self.last_record_scanned = Some(record_id);
            *num_scanned += 1;
            if *num_scanned % *SCAN_YIELD_PERIOD as u64 == 0 {
                ctx.yield_resources("index_build_scan")?;
            }
        }
        Ok(())
    }

    fn ingest_scanned_document(
        &mut self,
        ctx: &mut OperationContext,
        record_id: RecordId,
        doc: &Document,
    ) -> anyhow::Result<()> {
        let relaxed = self.relaxed_constraints;
        for index in &mut self.indexes {
            let spec = index.interceptor.access().spec().clone();
            if let Some(filter) = &spec.partial_filter {
                if !filter_matches(filter, doc) {
                    continue;
                }
            }
            if document_has_mixed_schema(doc, &spec.fields) {
                index.interceptor.note_mixed_schema();
            }
            let generated = match generate_keys(&spec, doc) {
                Ok(generated) => generated,
                Err(e) if relaxed => {
                    index.interceptor.record_skipped(ctx, record_id, &e)?;
                    continue;
                },
                Err(e) => return Err(e),
            };
            index.interceptor.merge_multikey_paths(&generated.multikey_paths);
            let stored = generated
                .keys
                .iter()
                .map(|key| index.interceptor.access().stored_key(key))
                .collect();
            let bulk = index
                .bulk
                .as_mut()
                .unwrap_or_else(|| fatal("scan running without bulk loaders"));
            bulk.add_document(&stored, record_id);
        }
        Ok(())
    }

    /// Insert one document's keys directly into the indexes, bypassing the
    /// bulk loaders. Initial sync applies replicated inserts this way while
    /// the build is in progress.
    pub fn insert_single_document(
        &mut self,
        ctx: &mut OperationContext,
        record_id: RecordId,
        doc: &Document,
    ) -> anyhow::Result<()> {
        self.expect_phase(
            &[BuildPhase::Initialized, BuildPhase::CollectionScan],
            "insert_single_document",
        );
        for index in &self.indexes {
            let access = index.interceptor.access();
            let spec = access.spec();
            if let Some(filter) = &spec.partial_filter {
                if !filter_matches(filter, doc) {
                    continue;
                }
            }
            let generated = match generate_keys(spec, doc) {
                Ok(generated) => generated,
                Err(e) if self.relaxed_constraints => {
                    index.interceptor.record_skipped(ctx, record_id, &e)?;
                    continue;
                },
                Err(e) => return Err(e),
            };
            index.interceptor.merge_multikey_paths(&generated.multikey_paths);
            let stored = generated
                .keys
                .iter()
                .map(|key| access.stored_key(key))
                .collect();
            let mut duplicates = Vec::new();
            access.insert_keys(ctx, &stored, record_id, true, &mut |key| {
                duplicates.push(key.clone())
            })?;
            if spec.unique {
                for key in duplicates {
                    index.interceptor.record_duplicate_key(ctx, &key)?;
                }
            }
        }
        Ok(())
    }

    /// Sort and merge every bulk loader into its index.
    pub fn dump_inserts(&mut self, ctx: &mut OperationContext) -> anyhow::Result<()> {
        self.expect_phase(&[BuildPhase::CollectionScan], "dump_inserts");
        self.phase = Some(BuildPhase::BulkLoad);
        for index in &mut self.indexes {
            let access = index.interceptor.access().clone();
            let bulk = index
                .bulk
                .take()
                .unwrap_or_else(|| fatal("dump_inserts found no bulk loader"));
            // Unique indexes in a background build insert with duplicates
            // tolerated and recorded; the commit-time constraint check
            // settles them. Foreground builds enforce at insert.
            let dups_allowed = !access.spec().unique
                || self.relaxed_constraints
                || self.method != IndexBuildMethod::Foreground;
            info!(
                "index build {}: bulk loading {} keys into index {}",
                self.build_id,
                bulk.num_keys(),
                access.spec().name,
            );
            let duplicates = bulk.dump_into_index(ctx, &access, dups_allowed)?;
            if access.spec().unique {
                for key in duplicates {
                    index.interceptor.record_duplicate_key(ctx, &key)?;
                }
            }
        }
        Ok(())
    }

    /// One drain pass over every index's side-writes table. Callers run this
    /// repeatedly with progressively stronger lock modes; the final pass
    /// before commit runs under the exclusive lock with yields disabled.
    pub fn drain_background_writes(
        &mut self,
        ctx: &mut OperationContext,
        yield_policy: DrainYieldPolicy,
    ) -> anyhow::Result<()> {
        self.expect_phase(
            &[BuildPhase::BulkLoad, BuildPhase::DrainWrites],
            "drain_background_writes",
        );
        self.phase = Some(BuildPhase::DrainWrites);
        let catalog = self.catalog.clone();
        for index in &self.indexes {
            index.interceptor.drain_writes_into_index(
                ctx,
                catalog.as_ref(),
                self.collection,
                index.ident,
                TrackDuplicates::Track,
                yield_policy,
            )?;
        }
        Ok(())
    }

    /// Settle every record whose key generation was deferred during the
    /// build. Must reach a clean state before commit.
    pub fn retry_skipped_records(
        &mut self,
        ctx: &mut OperationContext,
        mode: RetrySkippedRecordMode,
    ) -> anyhow::Result<()> {
        self.expect_phase(
            &[BuildPhase::BulkLoad, BuildPhase::DrainWrites],
            "retry_skipped_records",
        );
        let engine = self.engine.clone();
        for index in &self.indexes {
            index
                .interceptor
                .retry_skipped_records(ctx, engine.as_ref(), self.collection, mode)?;
        }
        Ok(())
    }

    /// Confirm every duplicate tolerated during the build has been resolved.
    /// A key still duplicated in the live index fails with `DuplicateKey`.
    pub fn check_constraints(&mut self, ctx: &mut OperationContext) -> anyhow::Result<()> {
        self.expect_phase(
            &[BuildPhase::BulkLoad, BuildPhase::DrainWrites],
            "check_constraints",
        );
        if self.ignore_unique {
            return Ok(());
        }
        for index in &self.indexes {
            index.interceptor.check_duplicate_key_constraints(ctx)?;
        }
        Ok(())
    }

    /// Flip every index to ready in one unit of work. The caller must hold
    /// the exclusive collection lock, every side write must already be
    /// drained, and every skipped record settled.
    pub fn commit(&mut self, ctx: &mut OperationContext) -> anyhow::Result<()> {
        self.expect_phase(&[BuildPhase::BulkLoad, BuildPhase::DrainWrites], "commit");
        if !ctx.holds_lock(
            &collection_lock_resource(self.collection),
            LockMode::Exclusive,
        ) {
            fatal("commit requires the exclusive collection lock");
        }
        for index in &self.indexes {
            index.interceptor.invariant_all_writes_applied();
        }
        for index in &self.indexes {
            let skipped = index.interceptor.num_records_skipped();
            if skipped > 0 {
                anyhow::bail!(ErrorMetadata::operation_failed(
                    "SkippedRecordsRemain",
                    format!(
                        "index {} still has {skipped} unresolved skipped records",
                        index.interceptor.access().spec().name,
                    ),
                ));
            }
        }
        let catalog = self.catalog.clone();
        let collection = self.collection;
        let saw_mixed_schema = self
            .indexes
            .iter()
            .any(|index| index.interceptor.saw_mixed_schema());
        let cleaned_up = self.cleaned_up.clone();
        ctx.run_in_unit_of_work(|ctx| {
            for index in &self.indexes {
                let paths = index.interceptor.multikey_paths();
                if paths.is_multikey() {
                    catalog.set_multikey(ctx, collection, index.ident, &paths)?;
                }
                catalog.mark_ready(ctx, collection, index.ident)?;
                catalog.detach_interceptor(collection, index.ident)?;
            }
            // The scan saw every document; if none of them had mixed-schema
            // arrays the collection-level flag can finally come down.
            if !saw_mixed_schema && catalog.may_contain_mixed_schema(collection)? {
                catalog.clear_mixed_schema_flag(ctx, collection)?;
            }
            ctx.recovery_unit.on_commit(move || {
                cleaned_up.store(true, Ordering::SeqCst);
            });
            Ok(())
        })?;
        self.phase = Some(BuildPhase::Committed);
        for index in &self.indexes {
            if let Err(e) = index
                .interceptor
                .drop_temporary_tables(ctx, self.engine.as_ref())
            {
                warn!(
                    "index build {}: failed to drop temporary tables: {e:#}",
                    self.build_id
                );
            }
        }
        info!(
            "index build {} committed: {} indexes now ready on collection {}",
            self.build_id,
            self.indexes.len(),
            self.collection,
        );
        Ok(())
    }

    /// Tear the build down: unregister the half-built indexes and drop the
    /// temporary tables. Never fails: transient errors retry without bound,
    /// anything else means the catalog and storage may disagree, and the
    /// process aborts rather than run with that.
    pub fn abort(&mut self, ctx: &mut OperationContext, reason: &str) {
        if self.phase.is_none() || self.phase == Some(BuildPhase::Committed) {
            return;
        }
        info!("aborting index build {}: {reason}", self.build_id);
        let mut backoff = Backoff::new(*SCAN_RESTART_INITIAL_BACKOFF, *SCAN_RESTART_MAX_BACKOFF);
        loop {
            match self.try_abort(ctx) {
                Ok(()) => break,
                Err(e) if e.is_retryable_during_cleanup() => {
                    warn!(
                        "index build {}: abort hit a transient error (attempt {}), retrying: \
                         {e:#}",
                        self.build_id,
                        backoff.failures() + 1,
                    );
                    ctx.recovery_unit.abandon_snapshot();
                    backoff.fail_and_sleep();
                },
                Err(e) => {
                    fatal(&format!(
                        "index build {} failed to abort: {e:#}",
                        self.build_id
                    ));
                },
            }
        }
        self.phase = Some(BuildPhase::Aborted);
        self.cleaned_up.store(true, Ordering::SeqCst);
    }

    fn try_abort(&self, ctx: &mut OperationContext) -> anyhow::Result<()> {
        let catalog = self.catalog.clone();
        let collection = self.collection;
        ctx.run_in_unit_of_work(|ctx| {
            for index in &self.indexes {
                if self.method != IndexBuildMethod::Foreground {
                    catalog.detach_interceptor(collection, index.ident)?;
                }
                catalog.unregister_index(ctx, collection, index.ident)?;
            }
            Ok(())
        })?;
        for index in &self.indexes {
            index
                .interceptor
                .drop_temporary_tables(ctx, self.engine.as_ref())?;
        }
        Ok(())
    }

    /// Stop the build without tearing anything down, for clean shutdown.
    /// When `resumable`, the side-writes tables and trackers are kept and a
    /// snapshot of the build state is saved so `resume` can pick it up.
    /// Never fails: if the snapshot cannot be persisted the build falls
    /// back to a from-scratch restart on the next startup.
    pub fn abort_without_cleanup(&mut self, _ctx: &mut OperationContext, resumable: bool) {
        if self.phase.is_none() || self.phase == Some(BuildPhase::Committed) {
            return;
        }
        if resumable {
            let snapshot = ResumableSnapshot {
                build_id: self.build_id,
                collection: self.collection,
                phase: self.phase.unwrap_or_else(|| fatal("build has no phase")),
                indexes: self
                    .indexes
                    .iter()
                    .map(|index| ResumableIndexState {
                        spec: index.interceptor.access().spec().clone(),
                        ident: index.ident,
                        side_writes_table: index.interceptor.side_writes_table_ident(),
                        duplicate_key_table: index.interceptor.duplicate_key_table_ident(),
                        skipped_record_table: index.interceptor.skipped_record_table_ident(),
                        multikey_paths: index.interceptor.multikey_paths(),
                        is_multikey: index.interceptor.is_multikey(),
                    })
                    .collect(),
            };
            match self.engine.save_resume_state(&snapshot) {
                Ok(()) => {
                    // Only a persisted snapshot earns keeping the tables.
                    for index in &self.indexes {
                        index.interceptor.keep_temporary_tables();
                    }
                    info!(
                        "index build {}: saved resumable state in phase {}",
                        self.build_id, snapshot.phase,
                    );
                },
                Err(e) => {
                    warn!(
                        "index build {}: failed to save resumable state, the build will \
                         restart from scratch: {e:#}",
                        self.build_id,
                    );
                },
            }
        }
        if self.method != IndexBuildMethod::Foreground {
            for index in &self.indexes {
                if let Err(e) = self.catalog.detach_interceptor(self.collection, index.ident) {
                    warn!(
                        "index build {}: failed to detach interceptor for index {}: {e:#}",
                        self.build_id, index.ident,
                    );
                }
            }
        }
        self.cleaned_up.store(true, Ordering::SeqCst);
    }

    pub fn get_multikey_paths(&self, ident: IndexIdent) -> Option<MultikeyPaths> {
        self.indexes
            .iter()
            .find(|index| index.ident == ident)
            .map(|index| index.interceptor.multikey_paths())
    }

    pub fn interceptor(&self, ident: IndexIdent) -> Option<Arc<IndexBuildInterceptor>> {
        self.indexes
            .iter()
            .find(|index| index.ident == ident)
            .map(|index| index.interceptor.clone())
    }
}

impl Drop for MultiIndexBuilder {
    fn drop(&mut self) {
        if !self.cleaned_up.load(Ordering::SeqCst) {
            fatal(&format!(
                "index build {} dropped without commit or abort",
                self.build_id
            ));
        }
    }
}
