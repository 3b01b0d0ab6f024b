use std::{
    collections::BTreeSet,
    fmt::{
        self,
        Display,
    },
};

use serde::{
    Deserialize,
    Serialize,
};
use uuid::Uuid;

/// Documents are JSON objects; the binary encoding of a full document store
/// is a storage-engine concern and out of scope here.
pub type Document = serde_json::Map<String, serde_json::Value>;

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(Uuid);

        impl $name {
            #[allow(clippy::new_without_default)]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(CollectionId);
uuid_id!(IndexBuildId);
/// Stable identifier for a catalog entry. Raw entry handles must not be held
/// across a yield; re-resolve through the catalog with this instead.
uuid_id!(IndexIdent);
/// Identifier of a durable temporary table (side-writes table or tracker).
uuid_id!(TableIdent);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(pub u64);

impl Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordId({})", self.0)
    }
}

/// One element of an index key. The variant order defines the cross-type
/// sort order used by ordered indexes.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyValue {
    Null,
    Bool(bool),
    Int(i64),
    String(String),
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IndexKey(pub Vec<KeyValue>);

impl IndexKey {
    /// Rough serialized size, used for byte-bounding drain batches and bulk
    /// memory accounting.
    pub fn approximate_size(&self) -> usize {
        self.0
            .iter()
            .map(|v| match v {
                KeyValue::Null | KeyValue::Bool(_) => 1,
                KeyValue::Int(_) => 8,
                KeyValue::String(s) => s.len() + 1,
            })
            .sum()
    }
}

impl Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// An index key paired with the record that produced it: the unit actually
/// stored in a sorted index.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexKeyEntry {
    pub key: IndexKey,
    pub record_id: RecordId,
}

impl IndexKeyEntry {
    pub fn new(key: IndexKey, record_id: RecordId) -> Self {
        Self { key, record_id }
    }

    pub fn approximate_size(&self) -> usize {
        self.key.approximate_size() + 8
    }
}

/// A dotted path into a document, eg `address.city`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FieldPath(pub String);

impl FieldPath {
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }
}

impl From<&str> for FieldPath {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    Ordered,
    Hashed,
}

/// A single equality predicate limiting which documents an index covers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterExpression {
    pub field: FieldPath,
    pub equals: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub fields: Vec<FieldPath>,
    pub kind: IndexKind,
    pub unique: bool,
    pub partial_filter: Option<FilterExpression>,
}

impl IndexSpec {
    pub fn ordered(name: &str, fields: Vec<FieldPath>) -> Self {
        Self {
            name: name.to_string(),
            fields,
            kind: IndexKind::Ordered,
            unique: false,
            partial_filter: None,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexBuildMethod {
    /// Blocks collection writes for the duration; uniqueness is enforced
    /// inline during the scan.
    Foreground,
    /// Writes continue; constraint violations are deferred to commit.
    Background,
    /// Background scan plus side-write capture and drain. The default.
    Hybrid,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildPhase {
    Initialized,
    CollectionScan,
    BulkLoad,
    DrainWrites,
    Committed,
    Aborted,
}

impl BuildPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

impl Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initialized => "initialized",
            Self::CollectionScan => "collection scan",
            Self::BulkLoad => "bulk load",
            Self::DrainWrites => "drain writes",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
        };
        write!(f, "{s}")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SideWriteOp {
    Insert,
    Delete,
}

/// One durable row in a side-writes table: a single key mutation deferred
/// until drain. Rows are keyed by an engine-assigned sequence id and
/// consumed strictly in insertion order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideWriteRecord {
    pub op: SideWriteOp,
    pub entry: IndexKeyEntry,
}

/// Which document fields produced multiple index entries for a single
/// document. One component set per key-pattern field; a component is the
/// index of the path element that held an array.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultikeyPaths(pub Vec<BTreeSet<usize>>);

impl MultikeyPaths {
    pub fn new(num_fields: usize) -> Self {
        Self(vec![BTreeSet::new(); num_fields])
    }

    pub fn is_multikey(&self) -> bool {
        self.0.iter().any(|components| !components.is_empty())
    }

    pub fn merge(&mut self, other: &Self) {
        if self.0.len() < other.0.len() {
            self.0.resize(other.0.len(), BTreeSet::new());
        }
        for (mine, theirs) in self.0.iter_mut().zip(other.0.iter()) {
            mine.extend(theirs.iter().copied());
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainYieldPolicy {
    None,
    Yield,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackDuplicates {
    Track,
    NoTrack,
}

/// Which snapshot the drain reads side-write rows at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadSource {
    Latest,
    MajorityCommitted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitMode {
    SteadyState,
    InitialSync,
    /// Rebuilding unfinished indexes during startup recovery. Constraints
    /// are relaxed the same way initial sync relaxes them.
    Recovery,
}

/// Governs `retry_skipped_records`: whether a record that still fails key
/// generation is kept for a later retry or surfaced as an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetrySkippedRecordMode {
    KeyGeneration,
    KeyGenerationAndInsertion,
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::{
        IndexKey,
        KeyValue,
        MultikeyPaths,
    };

    #[test]
    fn test_key_cross_type_ordering() {
        let null = IndexKey(vec![KeyValue::Null]);
        let boolean = IndexKey(vec![KeyValue::Bool(false)]);
        let int = IndexKey(vec![KeyValue::Int(i64::MIN)]);
        let string = IndexKey(vec![KeyValue::String(String::new())]);
        assert!(null < boolean);
        assert!(boolean < int);
        assert!(int < string);
    }

    #[test]
    fn test_multikey_merge_unions_components() {
        let mut a = MultikeyPaths(vec![BTreeSet::from([0]), BTreeSet::new()]);
        let b = MultikeyPaths(vec![BTreeSet::from([1]), BTreeSet::from([0])]);
        a.merge(&b);
        assert_eq!(a.0[0], BTreeSet::from([0, 1]));
        assert_eq!(a.0[1], BTreeSet::from([0]));
        assert!(a.is_multikey());
    }
}
