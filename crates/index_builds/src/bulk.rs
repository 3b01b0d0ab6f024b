//! Bulk loader for the collection-scan phase. Keys accumulate in memory up
//! to a per-index budget; full buffers are sorted and set aside as runs, and
//! the final dump merges all runs into the index in key order.

use std::collections::BTreeSet;

use itertools::Itertools;
use tracing::debug;

use crate::{
    access::IndexAccessMethod,
    context::OperationContext,
    knobs::BULK_LOAD_YIELD_PERIOD,
    types::{
        IndexKey,
        IndexKeyEntry,
        RecordId,
    },
};

pub struct BulkLoader {
    buffer: Vec<IndexKeyEntry>,
    sorted_runs: Vec<Vec<IndexKeyEntry>>,
    buffered_bytes: usize,
    max_buffered_bytes: usize,
    num_documents: u64,
    num_keys: u64,
}

impl BulkLoader {
    pub fn new(max_buffered_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            sorted_runs: Vec::new(),
            buffered_bytes: 0,
            max_buffered_bytes,
            num_documents: 0,
            num_keys: 0,
        }
    }

    /// Queue one document's keys, already in stored form for the target
    /// index.
    pub fn add_document(&mut self, keys: &BTreeSet<IndexKey>, record_id: RecordId) {
        self.num_documents += 1;
        for key in keys {
            let entry = IndexKeyEntry::new(key.clone(), record_id);
            self.buffered_bytes += entry.approximate_size();
            self.num_keys += 1;
            self.buffer.push(entry);
        }
        if self.buffered_bytes > self.max_buffered_bytes {
            self.spill();
        }
    }

    fn spill(&mut self) {
        let mut run = std::mem::take(&mut self.buffer);
        run.sort_unstable();
        debug!(
            "bulk loader spilling run of {} keys ({} bytes)",
            run.len(),
            self.buffered_bytes
        );
        self.sorted_runs.push(run);
        self.buffered_bytes = 0;
    }

    /// Discard all accumulated state. Used when the collection scan restarts
    /// from the beginning.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.sorted_runs.clear();
        self.buffered_bytes = 0;
        self.num_documents = 0;
        self.num_keys = 0;
    }

    pub fn num_documents(&self) -> u64 {
        self.num_documents
    }

    pub fn num_keys(&self) -> u64 {
        self.num_keys
    }

    /// Merge every run into the index in key order. Inserts run in units of
    /// work of `BULK_LOAD_YIELD_PERIOD` entries with an interrupt check in
    /// between. Returns the keys that landed on duplicates; only non-empty
    /// when `dups_allowed`.
    pub fn dump_into_index(
        mut self,
        ctx: &mut OperationContext,
        access: &IndexAccessMethod,
        dups_allowed: bool,
    ) -> anyhow::Result<Vec<IndexKey>> {
        if !self.buffer.is_empty() {
            self.spill();
        }
        let merged: Vec<IndexKeyEntry> = self.sorted_runs.into_iter().kmerge().collect();
        let mut duplicates = Vec::new();
        for chunk in merged.chunks(*BULK_LOAD_YIELD_PERIOD) {
            ctx.run_in_unit_of_work(|ctx| {
                for entry in chunk {
                    let keys = BTreeSet::from([entry.key.clone()]);
                    access.insert_keys(ctx, &keys, entry.record_id, dups_allowed, &mut |key| {
                        duplicates.push(key.clone())
                    })?;
                }
                Ok(())
            })?;
            ctx.check_for_interrupt()?;
        }
        Ok(duplicates)
    }
}
