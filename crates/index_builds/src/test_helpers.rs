//! In-memory storage engine, catalog, and collection write path for tests.
//! Writes apply immediately and register undo hooks on the recovery unit, so
//! units of work behave like real transactions; faults can be injected into
//! the collection scan to exercise the restart paths.

use std::{
    collections::{
        BTreeMap,
        BTreeSet,
        VecDeque,
    },
    sync::Arc,
};

use errors::ErrorMetadata;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;

use crate::{
    catalog::{
        Catalog,
        IndexCatalogEntry,
    },
    context::{
        LockManager,
        LockMode,
        OperationContext,
    },
    interceptor::IndexBuildInterceptor,
    resume::ResumableSnapshot,
    storage::{
        InsertResult,
        RecordCursor,
        SortedIndex,
        StorageEngine,
        TempTable,
    },
    types::{
        CollectionId,
        Document,
        IndexBuildId,
        IndexIdent,
        IndexKey,
        IndexKeyEntry,
        IndexSpec,
        MultikeyPaths,
        ReadSource,
        RecordId,
        SideWriteOp,
        TableIdent,
    },
};

#[derive(Default)]
struct CollectionData {
    records: BTreeMap<RecordId, JsonValue>,
    next_record_id: u64,
}

#[derive(Default)]
pub struct TestSortedIndex {
    entries: Mutex<BTreeSet<IndexKeyEntry>>,
}

impl TestSortedIndex {
    fn entries_for_key(&self, key: &IndexKey) -> Vec<IndexKeyEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.key == *key)
            .cloned()
            .collect()
    }

    pub fn contains(&self, entry: &IndexKeyEntry) -> bool {
        self.entries.lock().contains(entry)
    }
}

impl SortedIndex for Arc<TestSortedIndex> {
    fn insert_key(
        &self,
        ctx: &mut OperationContext,
        entry: &IndexKeyEntry,
        dups_allowed: bool,
    ) -> anyhow::Result<InsertResult> {
        let duplicate = self
            .entries_for_key(&entry.key)
            .iter()
            .any(|existing| existing.record_id != entry.record_id);
        if duplicate && !dups_allowed {
            anyhow::bail!(ErrorMetadata::duplicate_key(format!(
                "duplicate key {:?} for record {}",
                entry.key, entry.record_id.0,
            )));
        }
        let inserted = self.entries.lock().insert(entry.clone());
        if inserted && ctx.recovery_unit.in_unit_of_work() {
            let index = self.clone();
            let entry = entry.clone();
            ctx.recovery_unit.on_rollback(move || {
                index.entries.lock().remove(&entry);
            });
        }
        Ok(if duplicate {
            InsertResult::Duplicate
        } else {
            InsertResult::Inserted
        })
    }

    fn remove_key(
        &self,
        ctx: &mut OperationContext,
        entry: &IndexKeyEntry,
    ) -> anyhow::Result<bool> {
        let removed = self.entries.lock().remove(entry);
        if removed && ctx.recovery_unit.in_unit_of_work() {
            let index = self.clone();
            let entry = entry.clone();
            ctx.recovery_unit.on_rollback(move || {
                index.entries.lock().insert(entry);
            });
        }
        Ok(removed)
    }

    fn has_duplicate(
        &self,
        _ctx: &mut OperationContext,
        key: &IndexKey,
    ) -> anyhow::Result<bool> {
        Ok(self.entries_for_key(key).len() >= 2)
    }

    fn num_entries(&self) -> u64 {
        self.entries.lock().len() as u64
    }
}

#[derive(Default)]
struct TempTableData {
    rows: BTreeMap<u64, JsonValue>,
    next_seq: u64,
}

#[derive(Default)]
pub struct TestTempTable {
    data: Mutex<TempTableData>,
}

impl TempTable for Arc<TestTempTable> {
    fn append(&self, ctx: &mut OperationContext, row: JsonValue) -> anyhow::Result<u64> {
        let mut data = self.data.lock();
        let seq = data.next_seq;
        data.next_seq += 1;
        data.rows.insert(seq, row);
        drop(data);
        if ctx.recovery_unit.in_unit_of_work() {
            let table = self.clone();
            ctx.recovery_unit.on_rollback(move || {
                table.data.lock().rows.remove(&seq);
            });
        }
        Ok(seq)
    }

    fn scan_from(
        &self,
        _ctx: &mut OperationContext,
        after: Option<u64>,
        max_rows: usize,
    ) -> anyhow::Result<Vec<(u64, JsonValue)>> {
        let data = self.data.lock();
        let start = after.map(|seq| seq + 1).unwrap_or(0);
        Ok(data
            .rows
            .range(start..)
            .take(max_rows)
            .map(|(seq, row)| (*seq, row.clone()))
            .collect())
    }

    fn delete(&self, ctx: &mut OperationContext, seqs: &[u64]) -> anyhow::Result<()> {
        let mut removed = Vec::new();
        {
            let mut data = self.data.lock();
            for seq in seqs {
                if let Some(row) = data.rows.remove(seq) {
                    removed.push((*seq, row));
                }
            }
        }
        if !removed.is_empty() && ctx.recovery_unit.in_unit_of_work() {
            let table = self.clone();
            ctx.recovery_unit.on_rollback(move || {
                let mut data = table.data.lock();
                for (seq, row) in removed {
                    data.rows.insert(seq, row);
                }
            });
        }
        Ok(())
    }

    fn num_rows(&self) -> u64 {
        self.data.lock().rows.len() as u64
    }
}

#[derive(Default)]
struct EngineState {
    collections: BTreeMap<CollectionId, CollectionData>,
    indexes: BTreeMap<IndexIdent, Arc<TestSortedIndex>>,
    temp_tables: BTreeMap<TableIdent, Arc<TestTempTable>>,
    resume_states: BTreeMap<IndexBuildId, ResumableSnapshot>,
}

#[derive(Default)]
pub struct TestEngine {
    state: Arc<Mutex<EngineState>>,
    scan_faults: Mutex<VecDeque<anyhow::Error>>,
}

impl TestEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next `RecordCursor::next` call fails with `error`. Queued faults
    /// fire in order, one per call.
    pub fn inject_scan_fault(&self, error: anyhow::Error) {
        self.scan_faults.lock().push_back(error);
    }

    pub fn create_collection(&self) -> CollectionId {
        let id = CollectionId::new();
        self.state
            .lock()
            .collections
            .insert(id, CollectionData::default());
        id
    }

    pub fn sorted_index_data(&self, ident: IndexIdent) -> Arc<TestSortedIndex> {
        self.state
            .lock()
            .indexes
            .entry(ident)
            .or_default()
            .clone()
    }

    pub fn has_temp_table(&self, ident: TableIdent) -> bool {
        self.state.lock().temp_tables.contains_key(&ident)
    }

    fn insert_record(
        &self,
        ctx: &mut OperationContext,
        collection: CollectionId,
        doc: JsonValue,
    ) -> anyhow::Result<RecordId> {
        let record_id = {
            let mut state = self.state.lock();
            let data = state
                .collections
                .get_mut(&collection)
                .ok_or_else(|| anyhow::anyhow!("no such collection {collection}"))?;
            let record_id = RecordId(data.next_record_id);
            data.next_record_id += 1;
            data.records.insert(record_id, doc);
            record_id
        };
        if ctx.recovery_unit.in_unit_of_work() {
            let state = self.state.clone();
            ctx.recovery_unit.on_rollback(move || {
                if let Some(data) = state.lock().collections.get_mut(&collection) {
                    data.records.remove(&record_id);
                }
            });
        }
        Ok(record_id)
    }

    /// Reinsert a document under an existing record id, for updates.
    fn insert_record_at(
        &self,
        ctx: &mut OperationContext,
        collection: CollectionId,
        record_id: RecordId,
        doc: JsonValue,
    ) -> anyhow::Result<()> {
        {
            let mut state = self.state.lock();
            let data = state
                .collections
                .get_mut(&collection)
                .ok_or_else(|| anyhow::anyhow!("no such collection {collection}"))?;
            data.records.insert(record_id, doc);
        }
        if ctx.recovery_unit.in_unit_of_work() {
            let state = self.state.clone();
            ctx.recovery_unit.on_rollback(move || {
                if let Some(data) = state.lock().collections.get_mut(&collection) {
                    data.records.remove(&record_id);
                }
            });
        }
        Ok(())
    }

    fn remove_record(
        &self,
        ctx: &mut OperationContext,
        collection: CollectionId,
        record_id: RecordId,
    ) -> anyhow::Result<JsonValue> {
        let old = {
            let mut state = self.state.lock();
            let data = state
                .collections
                .get_mut(&collection)
                .ok_or_else(|| anyhow::anyhow!("no such collection {collection}"))?;
            data.records
                .remove(&record_id)
                .ok_or_else(|| anyhow::anyhow!("no such record {}", record_id.0))?
        };
        if ctx.recovery_unit.in_unit_of_work() {
            let state = self.state.clone();
            let old = old.clone();
            ctx.recovery_unit.on_rollback(move || {
                if let Some(data) = state.lock().collections.get_mut(&collection) {
                    data.records.insert(record_id, old);
                }
            });
        }
        Ok(old)
    }
}

struct TestCursor {
    engine: Arc<TestEngine>,
    collection: CollectionId,
    last: Option<RecordId>,
}

impl RecordCursor for TestCursor {
    fn next(
        &mut self,
        _ctx: &mut OperationContext,
    ) -> anyhow::Result<Option<(RecordId, JsonValue)>> {
        if let Some(fault) = self.engine.scan_faults.lock().pop_front() {
            return Err(fault);
        }
        let state = self.engine.state.lock();
        let data = state
            .collections
            .get(&self.collection)
            .ok_or_else(|| anyhow::anyhow!("no such collection {}", self.collection))?;
        let start = self.last.map(|id| RecordId(id.0 + 1)).unwrap_or(RecordId(0));
        match data.records.range(start..).next() {
            Some((record_id, doc)) => {
                self.last = Some(*record_id);
                Ok(Some((*record_id, doc.clone())))
            },
            None => Ok(None),
        }
    }
}

impl StorageEngine for Arc<TestEngine> {
    fn open_scan<'a>(
        &'a self,
        _ctx: &mut OperationContext,
        collection: CollectionId,
        _read_source: ReadSource,
        resume_after: Option<RecordId>,
    ) -> anyhow::Result<Box<dyn RecordCursor + 'a>> {
        anyhow::ensure!(
            self.state.lock().collections.contains_key(&collection),
            "no such collection {collection}"
        );
        Ok(Box::new(TestCursor {
            engine: self.clone(),
            collection,
            last: resume_after,
        }))
    }

    fn lookup_record(
        &self,
        _ctx: &mut OperationContext,
        collection: CollectionId,
        record_id: RecordId,
    ) -> anyhow::Result<Option<JsonValue>> {
        let state = self.state.lock();
        let data = state
            .collections
            .get(&collection)
            .ok_or_else(|| anyhow::anyhow!("no such collection {collection}"))?;
        Ok(data.records.get(&record_id).cloned())
    }

    fn create_temp_table(&self, ctx: &mut OperationContext) -> anyhow::Result<TableIdent> {
        let ident = TableIdent::new();
        self.state
            .lock()
            .temp_tables
            .insert(ident, Arc::new(TestTempTable::default()));
        if ctx.recovery_unit.in_unit_of_work() {
            let state = self.state.clone();
            ctx.recovery_unit.on_rollback(move || {
                state.lock().temp_tables.remove(&ident);
            });
        }
        Ok(ident)
    }

    fn temp_table(&self, ident: TableIdent) -> anyhow::Result<Arc<dyn TempTable>> {
        let table = self
            .state
            .lock()
            .temp_tables
            .get(&ident)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such temp table {ident}"))?;
        Ok(Arc::new(table))
    }

    fn drop_temp_table(
        &self,
        _ctx: &mut OperationContext,
        ident: TableIdent,
    ) -> anyhow::Result<()> {
        self.state.lock().temp_tables.remove(&ident);
        Ok(())
    }

    fn sorted_index(&self, ident: IndexIdent) -> anyhow::Result<Arc<dyn SortedIndex>> {
        let index = self.state.lock().indexes.entry(ident).or_default().clone();
        Ok(Arc::new(index))
    }

    fn save_resume_state(&self, snapshot: &ResumableSnapshot) -> anyhow::Result<()> {
        self.state
            .lock()
            .resume_states
            .insert(snapshot.build_id, snapshot.clone());
        Ok(())
    }

    fn take_resume_state(
        &self,
        build_id: IndexBuildId,
    ) -> anyhow::Result<Option<ResumableSnapshot>> {
        Ok(self.state.lock().resume_states.remove(&build_id))
    }
}

struct EntryState {
    spec: IndexSpec,
    ready: bool,
    multikey: bool,
    multikey_paths: MultikeyPaths,
    interceptor: Option<Arc<IndexBuildInterceptor>>,
}

#[derive(Default)]
struct CatalogState {
    collections: BTreeSet<CollectionId>,
    entries: BTreeMap<(CollectionId, IndexIdent), EntryState>,
    mixed_schema: BTreeSet<CollectionId>,
}

#[derive(Default)]
pub struct TestCatalog {
    state: Mutex<CatalogState>,
    unregister_faults: Mutex<VecDeque<anyhow::Error>>,
}

impl TestCatalog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next `unregister_index` call fails with `error`. Queued faults
    /// are consumed in order.
    pub fn inject_unregister_fault(&self, error: anyhow::Error) {
        self.unregister_faults.lock().push_back(error);
    }

    pub fn add_collection(&self, collection: CollectionId) {
        self.state.lock().collections.insert(collection);
    }

    pub fn set_mixed_schema_flag(&self, collection: CollectionId) {
        self.state.lock().mixed_schema.insert(collection);
    }

    pub fn drop_index(&self, collection: CollectionId, ident: IndexIdent) {
        self.state.lock().entries.remove(&(collection, ident));
    }

    pub fn num_indexes(&self, collection: CollectionId) -> usize {
        self.state
            .lock()
            .entries
            .keys()
            .filter(|(c, _)| *c == collection)
            .count()
    }
}

impl Catalog for Arc<TestCatalog> {
    fn collection_exists(&self, collection: CollectionId) -> bool {
        self.state.lock().collections.contains(&collection)
    }

    fn register_index(
        &self,
        ctx: &mut OperationContext,
        collection: CollectionId,
        spec: &IndexSpec,
    ) -> anyhow::Result<IndexIdent> {
        let ident = IndexIdent::new();
        {
            let mut state = self.state.lock();
            anyhow::ensure!(
                state.collections.contains(&collection),
                ErrorMetadata::not_found(
                    "CollectionNotFound",
                    format!("collection {collection} does not exist"),
                )
            );
            for ((c, _), entry) in state.entries.iter() {
                if *c != collection {
                    continue;
                }
                let same = entry.spec.name == spec.name || entry.spec == *spec;
                if !same {
                    continue;
                }
                if entry.ready {
                    anyhow::bail!(ErrorMetadata::bad_request(
                        "IndexAlreadyExists",
                        format!("index {} already exists", spec.name),
                    ));
                }
                anyhow::bail!(ErrorMetadata::index_build_already_in_progress(format!(
                    "index {} is already being built",
                    spec.name
                )));
            }
            state.entries.insert(
                (collection, ident),
                EntryState {
                    spec: spec.clone(),
                    ready: false,
                    multikey: false,
                    multikey_paths: MultikeyPaths::new(spec.fields.len()),
                    interceptor: None,
                },
            );
        }
        if ctx.recovery_unit.in_unit_of_work() {
            let catalog = self.clone();
            ctx.recovery_unit.on_rollback(move || {
                catalog.state.lock().entries.remove(&(collection, ident));
            });
        }
        Ok(ident)
    }

    fn unregister_index(
        &self,
        ctx: &mut OperationContext,
        collection: CollectionId,
        ident: IndexIdent,
    ) -> anyhow::Result<()> {
        if let Some(fault) = self.unregister_faults.lock().pop_front() {
            return Err(fault);
        }
        let removed = self.state.lock().entries.remove(&(collection, ident));
        if let Some(entry) = removed {
            if ctx.recovery_unit.in_unit_of_work() {
                let catalog = self.clone();
                ctx.recovery_unit.on_rollback(move || {
                    catalog.state.lock().entries.insert((collection, ident), entry);
                });
            }
        }
        Ok(())
    }

    fn entry(
        &self,
        collection: CollectionId,
        ident: IndexIdent,
    ) -> anyhow::Result<IndexCatalogEntry> {
        let state = self.state.lock();
        let entry = state.entries.get(&(collection, ident)).ok_or_else(|| {
            ErrorMetadata::not_found(
                "IndexNotFound",
                format!("index {ident} on collection {collection} does not exist"),
            )
        })?;
        Ok(IndexCatalogEntry {
            ident,
            spec: entry.spec.clone(),
            ready: entry.ready,
            multikey: entry.multikey,
            multikey_paths: entry.multikey_paths.clone(),
        })
    }

    fn attach_interceptor(
        &self,
        collection: CollectionId,
        ident: IndexIdent,
        interceptor: Arc<IndexBuildInterceptor>,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .entries
            .get_mut(&(collection, ident))
            .ok_or_else(|| anyhow::anyhow!("no such index {ident}"))?;
        entry.interceptor = Some(interceptor);
        Ok(())
    }

    fn detach_interceptor(
        &self,
        collection: CollectionId,
        ident: IndexIdent,
    ) -> anyhow::Result<()> {
        if let Some(entry) = self.state.lock().entries.get_mut(&(collection, ident)) {
            entry.interceptor = None;
        }
        Ok(())
    }

    fn interceptors(
        &self,
        collection: CollectionId,
    ) -> Vec<(IndexIdent, Arc<IndexBuildInterceptor>)> {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|((c, _), _)| *c == collection)
            .filter_map(|((_, ident), entry)| {
                entry
                    .interceptor
                    .as_ref()
                    .map(|interceptor| (*ident, interceptor.clone()))
            })
            .collect()
    }

    fn mark_ready(
        &self,
        ctx: &mut OperationContext,
        collection: CollectionId,
        ident: IndexIdent,
    ) -> anyhow::Result<()> {
        {
            let mut state = self.state.lock();
            let entry = state
                .entries
                .get_mut(&(collection, ident))
                .ok_or_else(|| anyhow::anyhow!("no such index {ident}"))?;
            entry.ready = true;
        }
        if ctx.recovery_unit.in_unit_of_work() {
            let catalog = self.clone();
            ctx.recovery_unit.on_rollback(move || {
                if let Some(entry) = catalog.state.lock().entries.get_mut(&(collection, ident)) {
                    entry.ready = false;
                }
            });
        }
        Ok(())
    }

    fn set_multikey(
        &self,
        _ctx: &mut OperationContext,
        collection: CollectionId,
        ident: IndexIdent,
        paths: &MultikeyPaths,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .entries
            .get_mut(&(collection, ident))
            .ok_or_else(|| anyhow::anyhow!("no such index {ident}"))?;
        entry.multikey = true;
        entry.multikey_paths.merge(paths);
        Ok(())
    }

    fn may_contain_mixed_schema(&self, collection: CollectionId) -> anyhow::Result<bool> {
        Ok(self.state.lock().mixed_schema.contains(&collection))
    }

    fn clear_mixed_schema_flag(
        &self,
        ctx: &mut OperationContext,
        collection: CollectionId,
    ) -> anyhow::Result<()> {
        let was_set = self.state.lock().mixed_schema.remove(&collection);
        if was_set && ctx.recovery_unit.in_unit_of_work() {
            let catalog = self.clone();
            ctx.recovery_unit.on_rollback(move || {
                catalog.state.lock().mixed_schema.insert(collection);
            });
        }
        Ok(())
    }
}

/// Ties the engine, catalog, and lock manager together and routes collection
/// writes through any attached interceptors, the way the real write path
/// does.
pub struct TestDatabase {
    pub engine: Arc<TestEngine>,
    pub catalog: Arc<TestCatalog>,
    pub lock_manager: LockManager,
}

impl TestDatabase {
    pub fn new() -> Self {
        Self {
            engine: TestEngine::new(),
            catalog: TestCatalog::new(),
            lock_manager: LockManager::new(),
        }
    }

    pub fn create_collection(&self) -> CollectionId {
        let id = self.engine.create_collection();
        self.catalog.add_collection(id);
        id
    }

    pub fn ctx(&self, name: &str) -> OperationContext {
        OperationContext::new(name, self.lock_manager.clone())
    }

    /// Insert a document, capturing side writes for every in-progress
    /// index. Takes the intent lock for the duration of the write.
    pub fn insert(
        &self,
        ctx: &mut OperationContext,
        collection: CollectionId,
        doc: JsonValue,
    ) -> anyhow::Result<RecordId> {
        let resource = crate::builder::collection_lock_resource(collection);
        ctx.lock(&resource, LockMode::Intent);
        let result = ctx.run_in_unit_of_work(|ctx| {
            let record_id = self.engine.insert_record(ctx, collection, doc.clone())?;
            let document = as_document(&doc)?;
            for (_, interceptor) in self.catalog.interceptors(collection) {
                interceptor.side_write(ctx, SideWriteOp::Insert, record_id, &document)?;
            }
            Ok(record_id)
        });
        ctx.unlock(&resource, LockMode::Intent);
        result
    }

    /// Delete a document; side writes carry the keys of the version being
    /// removed.
    pub fn delete(
        &self,
        ctx: &mut OperationContext,
        collection: CollectionId,
        record_id: RecordId,
    ) -> anyhow::Result<()> {
        let resource = crate::builder::collection_lock_resource(collection);
        ctx.lock(&resource, LockMode::Intent);
        let result = ctx.run_in_unit_of_work(|ctx| {
            let old = self.engine.remove_record(ctx, collection, record_id)?;
            let document = as_document(&old)?;
            for (_, interceptor) in self.catalog.interceptors(collection) {
                interceptor.side_write(ctx, SideWriteOp::Delete, record_id, &document)?;
            }
            Ok(())
        });
        ctx.unlock(&resource, LockMode::Intent);
        result
    }

    /// Replace a document: a delete of the old version and an insert of the
    /// new one under the same record id, in one unit of work.
    pub fn update(
        &self,
        ctx: &mut OperationContext,
        collection: CollectionId,
        record_id: RecordId,
        new_doc: JsonValue,
    ) -> anyhow::Result<()> {
        let resource = crate::builder::collection_lock_resource(collection);
        ctx.lock(&resource, LockMode::Intent);
        let result = ctx.run_in_unit_of_work(|ctx| {
            let old = self.engine.remove_record(ctx, collection, record_id)?;
            self.engine
                .insert_record_at(ctx, collection, record_id, new_doc.clone())?;
            let old_document = as_document(&old)?;
            let new_document = as_document(&new_doc)?;
            for (_, interceptor) in self.catalog.interceptors(collection) {
                interceptor.side_write(ctx, SideWriteOp::Delete, record_id, &old_document)?;
                interceptor.side_write(ctx, SideWriteOp::Insert, record_id, &new_document)?;
            }
            Ok(())
        });
        ctx.unlock(&resource, LockMode::Intent);
        result
    }

    pub fn num_records(&self, collection: CollectionId) -> usize {
        self.engine
            .state
            .lock()
            .collections
            .get(&collection)
            .map(|data| data.records.len())
            .unwrap_or(0)
    }
}

impl Default for TestDatabase {
    fn default() -> Self {
        Self::new()
    }
}

fn as_document(value: &JsonValue) -> anyhow::Result<Document> {
    value
        .as_object()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("documents must be JSON objects"))
}
