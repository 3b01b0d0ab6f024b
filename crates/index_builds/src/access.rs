//! Access method for one index: maps generated document keys onto entries in
//! the underlying sorted table. Ordered indexes store keys verbatim; hashed
//! indexes store a 64-bit FNV hash of the key, which is why they cannot
//! enforce uniqueness.

use std::{
    collections::BTreeSet,
    hash::Hasher,
    sync::Arc,
};

use errors::ErrorMetadata;
use fnv::FnvHasher;

use crate::{
    context::OperationContext,
    storage::{
        InsertResult,
        SortedIndex,
    },
    types::{
        IndexKey,
        IndexKeyEntry,
        IndexKind,
        IndexSpec,
        KeyValue,
        RecordId,
        SideWriteOp,
        SideWriteRecord,
    },
};

#[derive(Clone)]
pub struct IndexAccessMethod {
    spec: IndexSpec,
    index: Arc<dyn SortedIndex>,
}

impl IndexAccessMethod {
    pub fn new(spec: IndexSpec, index: Arc<dyn SortedIndex>) -> anyhow::Result<Self> {
        if spec.kind == IndexKind::Hashed && spec.unique {
            anyhow::bail!(ErrorMetadata::bad_request(
                "HashedIndexesCannotBeUnique",
                format!("hashed index {} cannot guarantee uniqueness", spec.name),
            ));
        }
        Ok(Self { spec, index })
    }

    pub fn spec(&self) -> &IndexSpec {
        &self.spec
    }

    pub fn stored_key(&self, key: &IndexKey) -> IndexKey {
        match self.spec.kind {
            IndexKind::Ordered => key.clone(),
            IndexKind::Hashed => {
                let mut hasher = FnvHasher::default();
                for value in &key.0 {
                    let serialized =
                        serde_json::to_vec(value).expect("key values always serialize");
                    hasher.write(&serialized);
                }
                IndexKey(vec![KeyValue::Int(hasher.finish() as i64)])
            },
        }
    }

    /// Insert one document's keys, already in stored form. With
    /// `dups_allowed`, keys already held by another record are stored anyway
    /// and reported through `on_duplicate`; otherwise the first duplicate
    /// fails the insert with a `DuplicateKey` error.
    pub fn insert_keys(
        &self,
        ctx: &mut OperationContext,
        keys: &BTreeSet<IndexKey>,
        record_id: RecordId,
        dups_allowed: bool,
        on_duplicate: &mut dyn FnMut(&IndexKey),
    ) -> anyhow::Result<()> {
        for key in keys {
            let entry = IndexKeyEntry::new(key.clone(), record_id);
            if self.index.insert_key(ctx, &entry, dups_allowed)? == InsertResult::Duplicate {
                on_duplicate(&entry.key);
            }
        }
        Ok(())
    }

    /// Apply one drained side write. The entry's key is already in stored
    /// form, written by the interceptor at capture time. Returns the key
    /// when an insert landed on a duplicate.
    pub fn apply_side_write(
        &self,
        ctx: &mut OperationContext,
        record: &SideWriteRecord,
        dups_allowed: bool,
    ) -> anyhow::Result<Option<IndexKey>> {
        match record.op {
            SideWriteOp::Insert => {
                let result = self.index.insert_key(ctx, &record.entry, dups_allowed)?;
                Ok((result == InsertResult::Duplicate).then(|| record.entry.key.clone()))
            },
            SideWriteOp::Delete => {
                // A miss is expected when the scan never saw the deleted
                // document version in the first place.
                if !self.index.remove_key(ctx, &record.entry)? {
                    tracing::debug!(
                        "side write delete for index {} found no entry for record {}",
                        self.spec.name,
                        record.entry.record_id.0,
                    );
                }
                Ok(None)
            },
        }
    }

    /// True when two or more records currently share `key` in the live
    /// index. Used by the duplicate-constraint check, which must observe a
    /// later delete clearing a recorded violation.
    pub fn key_is_duplicated(
        &self,
        ctx: &mut OperationContext,
        key: &IndexKey,
    ) -> anyhow::Result<bool> {
        self.index.has_duplicate(ctx, key)
    }

    pub fn num_entries(&self) -> u64 {
        self.index.num_entries()
    }
}
