//! A concurrent, resumable, crash-safe engine for building secondary indexes
//! over a live collection while reads and writes continue against it.
//!
//! The engine interleaves a bulk historical scan with an unbounded stream of
//! concurrent foreign writes. Writes that race with the build are captured in
//! a durable side table by a per-index [`IndexBuildInterceptor`] and replayed
//! ("drained") into the real index in order. The [`MultiIndexBuilder`] drives
//! the overall state machine to commit or abort, and
//! [`retry::write_conflict_retry`] is the optimistic-concurrency retry
//! primitive both lean on.

pub mod access;
pub mod backoff;
pub mod bulk;
pub mod builder;
pub mod catalog;
pub mod context;
pub mod duplicate_key_tracker;
mod fatal;
pub mod interceptor;
pub mod keys;
pub mod knobs;
pub mod pause;
pub mod resume;
pub mod retry;
pub mod skipped_record_tracker;
pub mod storage;
#[cfg(any(test, feature = "testing"))]
pub mod test_helpers;
#[cfg(test)]
mod tests;
pub mod types;

pub use crate::{
    builder::MultiIndexBuilder,
    interceptor::IndexBuildInterceptor,
    retry::{
        write_conflict_retry,
        RetryOptions,
    },
    types::{
        BuildPhase,
        IndexBuildMethod,
        IndexSpec,
    },
};
