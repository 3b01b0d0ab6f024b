//! Records documents whose key generation failed during a
//! relaxed-constraints build. Before the build can commit, every skipped
//! record must either generate keys cleanly against its current version or
//! have been deleted.

use std::sync::Arc;

use tracing::{
    info,
    warn,
};

use crate::{
    access::IndexAccessMethod,
    context::OperationContext,
    keys::generate_keys,
    knobs::MAX_DRAIN_BATCH_ROWS,
    storage::{
        StorageEngine,
        TempTable,
    },
    types::{
        CollectionId,
        MultikeyPaths,
        RecordId,
        RetrySkippedRecordMode,
        TableIdent,
    },
};

pub struct SkippedRecordTracker {
    table: Arc<dyn TempTable>,
    ident: TableIdent,
}

impl SkippedRecordTracker {
    pub fn new(table: Arc<dyn TempTable>, ident: TableIdent) -> Self {
        Self { table, ident }
    }

    pub fn table_ident(&self) -> TableIdent {
        self.ident
    }

    pub fn record(
        &self,
        ctx: &mut OperationContext,
        record_id: RecordId,
        error: &anyhow::Error,
    ) -> anyhow::Result<()> {
        warn!("index build: skipping record {}: {error:#}", record_id.0);
        let row = serde_json::to_value(record_id)?;
        self.table.append(ctx, row)?;
        Ok(())
    }

    pub fn num_skipped(&self) -> u64 {
        self.table.num_rows()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Re-fetch every skipped record and regenerate its keys against the
    /// current document version. Deleted records are forgiven; a record that
    /// still fails key generation fails the whole retry. In
    /// `KeyGenerationAndInsertion` mode the regenerated keys are also
    /// inserted into the index; `KeyGeneration` only proves generation now
    /// succeeds. Returns the multikey paths contributed by the retried
    /// records.
    pub fn retry_skipped_records(
        &self,
        ctx: &mut OperationContext,
        engine: &dyn StorageEngine,
        collection: CollectionId,
        access: &IndexAccessMethod,
        mode: RetrySkippedRecordMode,
    ) -> anyhow::Result<MultikeyPaths> {
        let mut multikey_paths = MultikeyPaths::new(access.spec().fields.len());
        let mut resolved = 0u64;
        loop {
            let rows = self.table.scan_from(ctx, None, *MAX_DRAIN_BATCH_ROWS)?;
            if rows.is_empty() {
                break;
            }
            for (seq, row) in rows {
                let record_id: RecordId = serde_json::from_value(row)?;
                let multikey_paths = &mut multikey_paths;
                ctx.run_in_unit_of_work(|ctx| {
                    if let Some(doc) = engine.lookup_record(ctx, collection, record_id)? {
                        let doc = doc
                            .as_object()
                            .cloned()
                            .ok_or_else(|| anyhow::anyhow!("record {} is not an object", record_id.0))?;
                        let generated = generate_keys(access.spec(), &doc)?;
                        multikey_paths.merge(&generated.multikey_paths);
                        if mode == RetrySkippedRecordMode::KeyGenerationAndInsertion {
                            let stored = generated
                                .keys
                                .iter()
                                .map(|key| access.stored_key(key))
                                .collect();
                            // Uniqueness violations surface here as
                            // DuplicateKey; the retry runs with constraints
                            // enforced.
                            access.insert_keys(
                                ctx,
                                &stored,
                                record_id,
                                false,
                                &mut |_| {},
                            )?;
                        }
                    }
                    self.table.delete(ctx, &[seq])
                })?;
                resolved += 1;
            }
            ctx.check_for_interrupt()?;
        }
        if resolved > 0 {
            info!(
                "index build: retried {resolved} skipped records for index {}",
                access.spec().name
            );
        }
        Ok(multikey_paths)
    }
}
