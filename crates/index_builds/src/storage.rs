//! Storage engine seam. The build engine talks to record stores, sorted
//! index tables, and durable temporary tables only through these traits;
//! tests plug in the in-memory engine from `test_helpers`.
//!
//! Mutating methods take the operation context so implementations can apply
//! the write immediately and register an undo hook on the recovery unit,
//! giving units of work their all-or-nothing behavior.

use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::{
    context::OperationContext,
    resume::ResumableSnapshot,
    types::{
        CollectionId,
        IndexBuildId,
        IndexIdent,
        IndexKey,
        IndexKeyEntry,
        ReadSource,
        RecordId,
        TableIdent,
    },
};

/// A forward scan over a collection's records in `RecordId` order.
///
/// `next` may fail with a `SnapshotUnavailable` or `CursorInvalidated` error
/// when the storage snapshot the cursor was opened against is gone; the
/// collection-scan loop restarts the whole scan in that case.
pub trait RecordCursor {
    fn next(
        &mut self,
        ctx: &mut OperationContext,
    ) -> anyhow::Result<Option<(RecordId, JsonValue)>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertResult {
    Inserted,
    /// The key was already present for a different record. Only reported
    /// when the insert runs with `dups_allowed`; otherwise the insert fails
    /// with a `DuplicateKey` error.
    Duplicate,
}

/// One sorted on-disk index table.
pub trait SortedIndex: Send + Sync {
    /// Insert a (key, record id) entry. With `dups_allowed` a second record
    /// under the same key is stored and reported as `Duplicate`; without it
    /// the insert fails with a `DuplicateKey` error and writes nothing.
    fn insert_key(
        &self,
        ctx: &mut OperationContext,
        entry: &IndexKeyEntry,
        dups_allowed: bool,
    ) -> anyhow::Result<InsertResult>;

    /// Remove an entry. Returns false when the entry was not present.
    fn remove_key(&self, ctx: &mut OperationContext, entry: &IndexKeyEntry)
        -> anyhow::Result<bool>;

    /// True when two or more records currently share `key`.
    fn has_duplicate(&self, ctx: &mut OperationContext, key: &IndexKey) -> anyhow::Result<bool>;

    fn num_entries(&self) -> u64;
}

/// A durable temporary table of JSON rows keyed by an append sequence
/// number. Backs the side-writes table and both trackers; survives restarts
/// when the build keeps it for resume.
pub trait TempTable: Send + Sync {
    /// Append a row, returning its sequence number.
    fn append(&self, ctx: &mut OperationContext, row: JsonValue) -> anyhow::Result<u64>;

    /// Up to `max_rows` rows with sequence numbers strictly greater than
    /// `after`, in sequence order.
    fn scan_from(
        &self,
        ctx: &mut OperationContext,
        after: Option<u64>,
        max_rows: usize,
    ) -> anyhow::Result<Vec<(u64, JsonValue)>>;

    fn delete(&self, ctx: &mut OperationContext, seqs: &[u64]) -> anyhow::Result<()>;

    fn num_rows(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.num_rows() == 0
    }
}

pub trait StorageEngine: Send + Sync {
    /// Open a full scan of the collection, starting after `resume_after`
    /// when given.
    fn open_scan<'a>(
        &'a self,
        ctx: &mut OperationContext,
        collection: CollectionId,
        read_source: ReadSource,
        resume_after: Option<RecordId>,
    ) -> anyhow::Result<Box<dyn RecordCursor + 'a>>;

    /// Fetch the current version of one record, or `None` if it has been
    /// deleted.
    fn lookup_record(
        &self,
        ctx: &mut OperationContext,
        collection: CollectionId,
        record_id: RecordId,
    ) -> anyhow::Result<Option<JsonValue>>;

    fn create_temp_table(&self, ctx: &mut OperationContext) -> anyhow::Result<TableIdent>;

    fn temp_table(&self, ident: TableIdent) -> anyhow::Result<Arc<dyn TempTable>>;

    fn drop_temp_table(&self, ctx: &mut OperationContext, ident: TableIdent)
        -> anyhow::Result<()>;

    fn sorted_index(&self, ident: IndexIdent) -> anyhow::Result<Arc<dyn SortedIndex>>;

    fn save_resume_state(&self, snapshot: &ResumableSnapshot) -> anyhow::Result<()>;

    /// Load and consume the saved state for `build_id`. A second load for
    /// the same build returns `None`.
    fn take_resume_state(
        &self,
        build_id: IndexBuildId,
    ) -> anyhow::Result<Option<ResumableSnapshot>>;
}
