//! Write interceptor for one in-progress index. While a build is in flight,
//! the collection write path routes every document write here; the keys the
//! write would touch are captured in a durable side-writes table instead of
//! the half-built index, and the drain phases replay them later.

use std::sync::{
    atomic::{
        AtomicBool,
        AtomicI64,
        Ordering,
    },
    Arc,
};

use parking_lot::Mutex;
use tracing::{
    debug,
    warn,
};

use crate::{
    access::IndexAccessMethod,
    catalog::Catalog,
    context::OperationContext,
    duplicate_key_tracker::DuplicateKeyTracker,
    keys::{
        document_has_mixed_schema,
        filter_matches,
        generate_keys,
    },
    knobs::{
        MAX_DRAIN_BATCH_BYTES,
        MAX_DRAIN_BATCH_ROWS,
    },
    skipped_record_tracker::SkippedRecordTracker,
    storage::{
        StorageEngine,
        TempTable,
    },
    types::{
        CollectionId,
        Document,
        DrainYieldPolicy,
        IndexIdent,
        IndexKeyEntry,
        MultikeyPaths,
        RecordId,
        RetrySkippedRecordMode,
        SideWriteOp,
        SideWriteRecord,
        TableIdent,
        TrackDuplicates,
    },
};

pub struct IndexBuildInterceptor {
    access: IndexAccessMethod,
    side_writes: Arc<dyn TempTable>,
    side_writes_ident: TableIdent,
    duplicate_key_tracker: Option<DuplicateKeyTracker>,
    skipped_record_tracker: SkippedRecordTracker,
    multikey_paths: Mutex<MultikeyPaths>,
    saw_mixed_schema: AtomicBool,
    // In an Arc so rollback hooks can decrement it after the interceptor
    // borrow ends.
    side_writes_recorded: Arc<AtomicI64>,
    side_writes_applied: AtomicI64,
    keep_temporary_tables: AtomicBool,
}

impl IndexBuildInterceptor {
    pub fn new(
        ctx: &mut OperationContext,
        engine: &dyn StorageEngine,
        access: IndexAccessMethod,
        track_duplicates: TrackDuplicates,
    ) -> anyhow::Result<Self> {
        let side_writes_ident = engine.create_temp_table(ctx)?;
        let skipped_ident = engine.create_temp_table(ctx)?;
        let duplicate_key_tracker = match track_duplicates {
            TrackDuplicates::Track => {
                let ident = engine.create_temp_table(ctx)?;
                Some(DuplicateKeyTracker::new(engine.temp_table(ident)?, ident))
            },
            TrackDuplicates::NoTrack => None,
        };
        let num_fields = access.spec().fields.len();
        Ok(Self {
            access,
            side_writes: engine.temp_table(side_writes_ident)?,
            side_writes_ident,
            duplicate_key_tracker,
            skipped_record_tracker: SkippedRecordTracker::new(
                engine.temp_table(skipped_ident)?,
                skipped_ident,
            ),
            multikey_paths: Mutex::new(MultikeyPaths::new(num_fields)),
            saw_mixed_schema: AtomicBool::new(false),
            side_writes_recorded: Arc::new(AtomicI64::new(0)),
            side_writes_applied: AtomicI64::new(0),
            keep_temporary_tables: AtomicBool::new(false),
        })
    }

    /// Rebuild an interceptor from tables kept across a shutdown.
    pub fn resume(
        engine: &dyn StorageEngine,
        access: IndexAccessMethod,
        side_writes_ident: TableIdent,
        duplicate_key_ident: Option<TableIdent>,
        skipped_ident: TableIdent,
        multikey_paths: MultikeyPaths,
    ) -> anyhow::Result<Self> {
        let duplicate_key_tracker = duplicate_key_ident
            .map(|ident| {
                anyhow::Ok(DuplicateKeyTracker::new(engine.temp_table(ident)?, ident))
            })
            .transpose()?;
        let side_writes = engine.temp_table(side_writes_ident)?;
        let recorded = side_writes.num_rows() as i64;
        Ok(Self {
            access,
            side_writes,
            side_writes_ident,
            duplicate_key_tracker,
            skipped_record_tracker: SkippedRecordTracker::new(
                engine.temp_table(skipped_ident)?,
                skipped_ident,
            ),
            multikey_paths: Mutex::new(multikey_paths),
            saw_mixed_schema: AtomicBool::new(false),
            side_writes_recorded: Arc::new(AtomicI64::new(recorded)),
            side_writes_applied: AtomicI64::new(0),
            keep_temporary_tables: AtomicBool::new(false),
        })
    }

    pub fn access(&self) -> &IndexAccessMethod {
        &self.access
    }

    pub fn side_writes_table_ident(&self) -> TableIdent {
        self.side_writes_ident
    }

    pub fn duplicate_key_table_ident(&self) -> Option<TableIdent> {
        self.duplicate_key_tracker
            .as_ref()
            .map(|tracker| tracker.table_ident())
    }

    pub fn skipped_record_table_ident(&self) -> TableIdent {
        self.skipped_record_tracker.table_ident()
    }

    pub fn temporary_table_idents(&self) -> Vec<TableIdent> {
        let mut idents = vec![self.side_writes_ident, self.skipped_record_table_ident()];
        idents.extend(self.duplicate_key_table_ident());
        idents
    }

    /// Keep the side-writes table and trackers alive past cleanup so a
    /// resumable build can find them after restart.
    pub fn keep_temporary_tables(&self) {
        self.keep_temporary_tables.store(true, Ordering::SeqCst);
    }

    pub fn temporary_tables_kept(&self) -> bool {
        self.keep_temporary_tables.load(Ordering::SeqCst)
    }

    /// Capture one document write. Must run inside the unit of work doing
    /// the collection write; the recorded rows roll back with it.
    pub fn side_write(
        &self,
        ctx: &mut OperationContext,
        op: SideWriteOp,
        record_id: RecordId,
        doc: &Document,
    ) -> anyhow::Result<()> {
        let spec = self.access.spec();
        if let Some(filter) = &spec.partial_filter {
            if !filter_matches(filter, doc) {
                return Ok(());
            }
        }
        if document_has_mixed_schema(doc, &spec.fields) {
            self.saw_mixed_schema.store(true, Ordering::SeqCst);
        }
        let generated = match generate_keys(spec, doc) {
            Ok(generated) => generated,
            Err(e) => {
                // A write we cannot generate keys for gets the same
                // treatment as a scanned record: remember it and settle up
                // before commit.
                return self.skipped_record_tracker.record(ctx, record_id, &e);
            },
        };
        if op == SideWriteOp::Insert {
            self.multikey_paths.lock().merge(&generated.multikey_paths);
        }
        let mut recorded = 0i64;
        for key in &generated.keys {
            let record = SideWriteRecord {
                op,
                entry: IndexKeyEntry::new(self.access.stored_key(key), record_id),
            };
            self.side_writes.append(ctx, serde_json::to_value(&record)?)?;
            recorded += 1;
        }
        self.side_writes_recorded.fetch_add(recorded, Ordering::SeqCst);
        // The table rows roll back through the temp table's own undo hooks;
        // the counter needs its own.
        if ctx.recovery_unit.in_unit_of_work() {
            let side_writes_recorded = self.side_writes_recorded.clone();
            ctx.recovery_unit.on_rollback(move || {
                side_writes_recorded.fetch_sub(recorded, Ordering::SeqCst);
            });
        }
        Ok(())
    }

    pub fn num_side_writes_recorded(&self) -> i64 {
        self.side_writes_recorded.load(Ordering::SeqCst)
    }

    pub fn num_side_writes_applied(&self) -> i64 {
        self.side_writes_applied.load(Ordering::SeqCst)
    }

    /// True when every captured side write has been drained into the index.
    /// Only trustworthy while the caller excludes new writers.
    pub fn are_all_writes_applied(&self) -> bool {
        let recorded = self.side_writes_recorded.load(Ordering::SeqCst);
        let applied = self.side_writes_applied.load(Ordering::SeqCst);
        if recorded != applied {
            // The table is the source of truth; a counter skew is a
            // diagnostic worth surfacing but not grounds to fail the build.
            warn!(
                "index {}: {recorded} side writes recorded but {applied} applied",
                self.access.spec().name,
            );
        }
        self.side_writes.is_empty()
    }

    pub fn invariant_all_writes_applied(&self) {
        if !self.are_all_writes_applied() {
            crate::fatal::fatal(&format!(
                "index {} committed with {} undrained side writes",
                self.access.spec().name,
                self.side_writes.num_rows(),
            ));
        }
    }

    /// Replay captured side writes into the index in bounded batches, each
    /// in its own unit of work. With `DrainYieldPolicy::Yield` the operation
    /// yields its locks between batches and re-resolves the index through
    /// the catalog afterwards, failing with `NotFound` if the index was
    /// dropped while the locks were down.
    ///
    /// Stops when the side-writes table is empty at the moment of a check;
    /// writes that land after that are the next drain pass's problem.
    pub fn drain_writes_into_index(
        &self,
        ctx: &mut OperationContext,
        catalog: &dyn Catalog,
        collection: CollectionId,
        ident: IndexIdent,
        track_duplicates: TrackDuplicates,
        yield_policy: DrainYieldPolicy,
    ) -> anyhow::Result<()> {
        // Unique indexes tolerate duplicates here as long as we track them;
        // `check_duplicate_key_constraints` settles the score before commit.
        let dups_allowed = !self.access.spec().unique
            || (track_duplicates == TrackDuplicates::Track && self.duplicate_key_tracker.is_some());
        let mut total_applied = 0u64;
        loop {
            let batch = self.next_batch(ctx)?;
            if batch.is_empty() {
                break;
            }
            let applied = batch.len() as i64;
            ctx.run_in_unit_of_work(|ctx| {
                let mut seqs = Vec::with_capacity(batch.len());
                for (seq, record) in &batch {
                    let duplicate = self.access.apply_side_write(ctx, record, dups_allowed)?;
                    if let Some(key) = duplicate {
                        if track_duplicates == TrackDuplicates::Track {
                            if let Some(tracker) = &self.duplicate_key_tracker {
                                tracker.record_key(ctx, &key)?;
                            }
                        }
                    }
                    seqs.push(*seq);
                }
                self.side_writes.delete(ctx, &seqs)
            })?;
            self.side_writes_applied.fetch_add(applied, Ordering::SeqCst);
            total_applied += applied as u64;
            ctx.check_for_interrupt()?;
            if yield_policy == DrainYieldPolicy::Yield {
                ctx.yield_resources("index_build_drain")?;
                // The catalog may have changed while the locks were down.
                catalog.entry(collection, ident)?;
            }
        }
        if total_applied > 0 {
            debug!(
                "index build: drained {total_applied} side writes into index {}",
                self.access.spec().name
            );
        }
        Ok(())
    }

    /// One drain batch: up to the row and byte caps, then extended so a run
    /// of records for the same key never splits across batches.
    fn next_batch(
        &self,
        ctx: &mut OperationContext,
    ) -> anyhow::Result<Vec<(u64, SideWriteRecord)>> {
        // Overscan so the same-key extension below has rows to extend into.
        let rows = self
            .side_writes
            .scan_from(ctx, None, *MAX_DRAIN_BATCH_ROWS * 2)?;
        let mut batch: Vec<(u64, SideWriteRecord)> = Vec::with_capacity(rows.len());
        let mut batch_bytes = 0usize;
        for (seq, row) in rows {
            let record: SideWriteRecord = serde_json::from_value(row)?;
            let over_budget =
                batch.len() >= *MAX_DRAIN_BATCH_ROWS || batch_bytes >= *MAX_DRAIN_BATCH_BYTES;
            if over_budget {
                let same_key_as_last = batch
                    .last()
                    .map(|(_, last)| last.entry.key == record.entry.key)
                    .unwrap_or(false);
                if !same_key_as_last {
                    break;
                }
            }
            batch_bytes += record.entry.approximate_size();
            batch.push((seq, record));
        }
        Ok(batch)
    }

    pub fn record_duplicate_key(
        &self,
        ctx: &mut OperationContext,
        key: &crate::types::IndexKey,
    ) -> anyhow::Result<()> {
        match &self.duplicate_key_tracker {
            Some(tracker) => tracker.record_key(ctx, key),
            None => anyhow::bail!(
                "index {} is not tracking duplicates",
                self.access.spec().name
            ),
        }
    }

    pub fn num_duplicates_recorded(&self) -> u64 {
        self.duplicate_key_tracker
            .as_ref()
            .map(|tracker| tracker.num_recorded())
            .unwrap_or(0)
    }

    /// Confirm every tolerated duplicate has since been resolved.
    pub fn check_duplicate_key_constraints(
        &self,
        ctx: &mut OperationContext,
    ) -> anyhow::Result<()> {
        match &self.duplicate_key_tracker {
            Some(tracker) => tracker.check_constraints(ctx, &self.access),
            None => Ok(()),
        }
    }

    pub fn record_skipped(
        &self,
        ctx: &mut OperationContext,
        record_id: RecordId,
        error: &anyhow::Error,
    ) -> anyhow::Result<()> {
        self.skipped_record_tracker.record(ctx, record_id, error)
    }

    pub fn num_records_skipped(&self) -> u64 {
        self.skipped_record_tracker.num_skipped()
    }

    pub fn retry_skipped_records(
        &self,
        ctx: &mut OperationContext,
        engine: &dyn StorageEngine,
        collection: CollectionId,
        mode: RetrySkippedRecordMode,
    ) -> anyhow::Result<()> {
        let contributed = self.skipped_record_tracker.retry_skipped_records(
            ctx,
            engine,
            collection,
            &self.access,
            mode,
        )?;
        self.multikey_paths.lock().merge(&contributed);
        Ok(())
    }

    pub fn note_mixed_schema(&self) {
        self.saw_mixed_schema.store(true, Ordering::SeqCst);
    }

    pub fn saw_mixed_schema(&self) -> bool {
        self.saw_mixed_schema.load(Ordering::SeqCst)
    }

    pub fn merge_multikey_paths(&self, paths: &MultikeyPaths) {
        self.multikey_paths.lock().merge(paths);
    }

    pub fn multikey_paths(&self) -> MultikeyPaths {
        self.multikey_paths.lock().clone()
    }

    pub fn is_multikey(&self) -> bool {
        self.multikey_paths.lock().is_multikey()
    }

    pub fn drop_temporary_tables(
        &self,
        ctx: &mut OperationContext,
        engine: &dyn StorageEngine,
    ) -> anyhow::Result<()> {
        if self.temporary_tables_kept() {
            return Ok(());
        }
        for ident in self.temporary_table_idents() {
            engine.drop_temp_table(ctx, ident)?;
        }
        Ok(())
    }
}
