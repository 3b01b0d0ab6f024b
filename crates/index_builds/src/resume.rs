//! Serialized build state for resuming an index build after a clean
//! shutdown. Written by `abort_without_cleanup`, consumed (at most once) by
//! `MultiIndexBuilder::resume`.

use serde::{
    Deserialize,
    Serialize,
};

use crate::types::{
    BuildPhase,
    CollectionId,
    IndexBuildId,
    IndexIdent,
    IndexSpec,
    MultikeyPaths,
    TableIdent,
};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResumableIndexState {
    pub spec: IndexSpec,
    pub ident: IndexIdent,
    pub side_writes_table: TableIdent,
    pub duplicate_key_table: Option<TableIdent>,
    pub skipped_record_table: TableIdent,
    pub multikey_paths: MultikeyPaths,
    pub is_multikey: bool,
}

/// Everything needed to pick a build back up: the phase it stopped in and
/// the idents of the temporary tables that were deliberately kept alive
/// across the shutdown. Scan progress is not recorded: the bulk runs behind
/// it live only in memory, so a build stopped mid-scan rescans from the
/// start.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResumableSnapshot {
    pub build_id: IndexBuildId,
    pub collection: CollectionId,
    pub phase: BuildPhase,
    pub indexes: Vec<ResumableIndexState>,
}
