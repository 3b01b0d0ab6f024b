//! Records duplicate keys tolerated during a relaxed-constraints build so
//! the final constraint check can confirm each one was since resolved.

use std::sync::Arc;

use errors::ErrorMetadata;
use tracing::info;

use crate::{
    access::IndexAccessMethod,
    context::OperationContext,
    knobs::MAX_DRAIN_BATCH_ROWS,
    storage::TempTable,
    types::{
        IndexKey,
        TableIdent,
    },
};

pub struct DuplicateKeyTracker {
    table: Arc<dyn TempTable>,
    ident: TableIdent,
}

impl DuplicateKeyTracker {
    pub fn new(table: Arc<dyn TempTable>, ident: TableIdent) -> Self {
        Self { table, ident }
    }

    pub fn table_ident(&self) -> TableIdent {
        self.ident
    }

    /// Record a key, in stored form, that was inserted despite an existing
    /// entry under the same key.
    pub fn record_key(&self, ctx: &mut OperationContext, key: &IndexKey) -> anyhow::Result<()> {
        let row = serde_json::to_value(key)?;
        self.table.append(ctx, row)?;
        Ok(())
    }

    pub fn num_recorded(&self) -> u64 {
        self.table.num_rows()
    }

    /// Re-probe every recorded key against the live index. A key still held
    /// by two or more records fails with `DuplicateKey`; keys whose extra
    /// entries were deleted in the meantime pass, and checked rows are
    /// removed as we go.
    pub fn check_constraints(
        &self,
        ctx: &mut OperationContext,
        access: &IndexAccessMethod,
    ) -> anyhow::Result<()> {
        let mut checked = 0u64;
        loop {
            let rows = self.table.scan_from(ctx, None, *MAX_DRAIN_BATCH_ROWS)?;
            if rows.is_empty() {
                break;
            }
            let mut seqs = Vec::with_capacity(rows.len());
            for (seq, row) in rows {
                let key: IndexKey = serde_json::from_value(row)?;
                if access.key_is_duplicated(ctx, &key)? {
                    anyhow::bail!(ErrorMetadata::duplicate_key(format!(
                        "duplicate key constraint violation in index {}: {:?}",
                        access.spec().name,
                        key,
                    )));
                }
                seqs.push(seq);
                checked += 1;
            }
            ctx.run_in_unit_of_work(|ctx| self.table.delete(ctx, &seqs))?;
            ctx.check_for_interrupt()?;
        }
        if checked > 0 {
            info!(
                "index build: {checked} tolerated duplicates in index {} all resolved",
                access.spec().name
            );
        }
        Ok(())
    }
}
