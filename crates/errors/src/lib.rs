use std::borrow::Cow;

/// ErrorMetadata can be attached to an anyhow error chain via
/// `.context(e /*ErrorMetadata*/)`. It is a generic object used across the
/// codebase to tag errors with information used to classify them, most
/// importantly whether an error is transient (and therefore retryable) or
/// terminal.
///
/// The msg is conveyed as the operator-facing message if it surfaces out of
/// the engine.
///
/// The short_msg is used as a tag - available for tests and for log
/// matching - to have a message that is resilient to changes in copy.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    /// The error code associated with this ErrorMetadata
    pub code: ErrorCode,
    /// short ScreamingCamelCase. Usable in tests for string matching.
    /// Eg IndexBuildAlreadyInProgress
    pub short_msg: Cow<'static, str>,
    /// human readable - developer facing. Should be longer and descriptive.
    pub msg: Cow<'static, str>,
}

#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BadRequest,
    NotFound,
    OperationFailed,

    WriteConflict,
    TemporarilyUnavailable,
    SnapshotUnavailable,
    CursorInvalidated,

    ResourceExhausted,
    DuplicateKey,
    IndexBuildAlreadyInProgress,
}

impl ErrorMetadata {
    /// Bad request: the caller handed us something malformed.
    ///
    /// The short_msg should be a CapitalCamelCased tag describing the error.
    /// The msg should be a descriptive message targeted toward the developer.
    pub fn bad_request(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::BadRequest,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Resource not found (eg a catalog entry that has gone away).
    pub fn not_found(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::NotFound,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// A request-level failure that is neither transient nor the caller's
    /// input being malformed, eg two identical index specs in one build.
    pub fn operation_failed(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::OperationFailed,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Optimistic concurrency / commit race. Internal callers retry these
    /// without bound via `write_conflict_retry`.
    pub fn write_conflict() -> Self {
        Self {
            code: ErrorCode::WriteConflict,
            short_msg: WRITE_CONFLICT.into(),
            msg: WRITE_CONFLICT_MSG.into(),
        }
    }

    /// The storage engine cannot service the operation right now (eg cache
    /// pressure). Retried a bounded number of times before being surfaced.
    pub fn temporarily_unavailable(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::TemporarilyUnavailable,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// The read snapshot backing a collection scan was discarded underneath
    /// it. The scan restarts from the beginning.
    pub fn snapshot_unavailable() -> Self {
        Self {
            code: ErrorCode::SnapshotUnavailable,
            short_msg: "SnapshotUnavailable".into(),
            msg: "The read snapshot is no longer available".into(),
        }
    }

    /// A scan cursor was invalidated (eg the record it was positioned on was
    /// truncated away). The scan restarts from the beginning.
    pub fn cursor_invalidated() -> Self {
        Self {
            code: ErrorCode::CursorInvalidated,
            short_msg: "CursorInvalidated".into(),
            msg: "The scan cursor position is no longer valid".into(),
        }
    }

    /// The operation's resource requirement exceeds system capacity. Never
    /// retried.
    pub fn resource_exhausted(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::ResourceExhausted,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// A unique index constraint violation.
    pub fn duplicate_key(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::DuplicateKey,
            short_msg: DUPLICATE_KEY.into(),
            msg: msg.into(),
        }
    }

    /// An identical index is already being built (or is ready) on this
    /// collection. Distinct from generic failures so `init` callers can
    /// react to the overlap specifically.
    pub fn index_build_already_in_progress(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::IndexBuildAlreadyInProgress,
            short_msg: INDEX_BUILD_ALREADY_IN_PROGRESS.into(),
            msg: msg.into(),
        }
    }

    pub fn is_bad_request(&self) -> bool {
        self.code == ErrorCode::BadRequest
    }

    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::NotFound
    }

    pub fn is_operation_failed(&self) -> bool {
        self.code == ErrorCode::OperationFailed
    }

    pub fn is_write_conflict(&self) -> bool {
        self.code == ErrorCode::WriteConflict
    }

    pub fn is_temporarily_unavailable(&self) -> bool {
        self.code == ErrorCode::TemporarilyUnavailable
    }

    /// True for the transient storage races that force a collection scan to
    /// restart from the beginning rather than being retried in place.
    pub fn is_scan_invalidation(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::SnapshotUnavailable | ErrorCode::CursorInvalidated
        )
    }

    pub fn is_resource_exhausted(&self) -> bool {
        self.code == ErrorCode::ResourceExhausted
    }

    pub fn is_duplicate_key(&self) -> bool {
        self.code == ErrorCode::DuplicateKey
    }

    pub fn is_index_build_already_in_progress(&self) -> bool {
        self.code == ErrorCode::IndexBuildAlreadyInProgress
    }

    /// True if the abort-cleanup path may retry this error rather than
    /// treating it as fatal: the transient storage signals plus memory
    /// pressure, which clears as other operations drain.
    pub fn is_retryable_during_cleanup(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::WriteConflict
                | ErrorCode::TemporarilyUnavailable
                | ErrorCode::SnapshotUnavailable
                | ErrorCode::ResourceExhausted
        )
    }
}

pub trait ErrorMetadataAnyhowExt {
    fn is_bad_request(&self) -> bool;
    fn is_not_found(&self) -> bool;
    fn is_operation_failed(&self) -> bool;
    fn is_write_conflict(&self) -> bool;
    fn is_temporarily_unavailable(&self) -> bool;
    fn is_scan_invalidation(&self) -> bool;
    fn is_resource_exhausted(&self) -> bool;
    fn is_duplicate_key(&self) -> bool;
    fn is_index_build_already_in_progress(&self) -> bool;
    fn is_retryable_during_cleanup(&self) -> bool;
    fn short_msg(&self) -> &str;
    fn msg(&self) -> &str;
    fn map_error_metadata<F: FnOnce(ErrorMetadata) -> ErrorMetadata>(self, f: F) -> Self;
}

impl ErrorMetadataAnyhowExt for anyhow::Error {
    /// Returns true if error is tagged as BadRequest
    fn is_bad_request(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_bad_request();
        }
        false
    }

    /// Returns true if error is tagged as NotFound
    fn is_not_found(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_not_found();
        }
        false
    }

    /// Returns true if error is tagged as OperationFailed
    fn is_operation_failed(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_operation_failed();
        }
        false
    }

    /// Returns true if error is tagged as WriteConflict
    fn is_write_conflict(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_write_conflict();
        }
        false
    }

    /// Returns true if error is tagged as TemporarilyUnavailable
    fn is_temporarily_unavailable(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_temporarily_unavailable();
        }
        false
    }

    /// Returns true if error is tagged as one of the scan-invalidation races
    fn is_scan_invalidation(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_scan_invalidation();
        }
        false
    }

    /// Returns true if error is tagged as ResourceExhausted
    fn is_resource_exhausted(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_resource_exhausted();
        }
        false
    }

    /// Returns true if error is tagged as DuplicateKey
    fn is_duplicate_key(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_duplicate_key();
        }
        false
    }

    /// Returns true if error is tagged as IndexBuildAlreadyInProgress
    fn is_index_build_already_in_progress(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_index_build_already_in_progress();
        }
        false
    }

    /// Returns true if the abort-cleanup path may retry this error
    fn is_retryable_during_cleanup(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_retryable_during_cleanup();
        }
        false
    }

    /// Return the short_msg associated with this Error
    fn short_msg(&self) -> &str {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return &e.short_msg;
        }
        INTERNAL_ERROR
    }

    /// Return the descriptive msg associated with this Error
    fn msg(&self) -> &str {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return &e.msg;
        }
        INTERNAL_ERROR_MSG
    }

    fn map_error_metadata<F>(self, f: F) -> Self
    where
        F: FnOnce(ErrorMetadata) -> ErrorMetadata,
    {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>().cloned() {
            return self.context(f(e));
        }
        self
    }
}

pub const INTERNAL_ERROR: &str = "InternalError";
pub const INTERNAL_ERROR_MSG: &str = "The operation couldn't be completed. Try again later.";
pub const WRITE_CONFLICT: &str = "WriteConflict";
pub const WRITE_CONFLICT_MSG: &str =
    "Another transaction modified the same data while this operation was running.";
pub const DUPLICATE_KEY: &str = "DuplicateKey";
pub const INDEX_BUILD_ALREADY_IN_PROGRESS: &str = "IndexBuildAlreadyInProgress";

#[cfg(any(test, feature = "testing"))]
mod proptest_impls {
    use proptest::prelude::*;

    use super::{
        ErrorCode,
        ErrorMetadata,
    };

    impl Arbitrary for ErrorMetadata {
        type Parameters = ();

        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with((): Self::Parameters) -> Self::Strategy {
            any::<ErrorCode>()
                .prop_map(|ec| match ec {
                    ErrorCode::BadRequest => ErrorMetadata::bad_request("bad", "request"),
                    ErrorCode::NotFound => ErrorMetadata::not_found("not", "found"),
                    ErrorCode::OperationFailed => {
                        ErrorMetadata::operation_failed("operation", "failed")
                    },
                    ErrorCode::WriteConflict => ErrorMetadata::write_conflict(),
                    ErrorCode::TemporarilyUnavailable => {
                        ErrorMetadata::temporarily_unavailable("temporarily", "unavailable")
                    },
                    ErrorCode::SnapshotUnavailable => ErrorMetadata::snapshot_unavailable(),
                    ErrorCode::CursorInvalidated => ErrorMetadata::cursor_invalidated(),
                    ErrorCode::ResourceExhausted => {
                        ErrorMetadata::resource_exhausted("resource", "exhausted")
                    },
                    ErrorCode::DuplicateKey => ErrorMetadata::duplicate_key("duplicate"),
                    ErrorCode::IndexBuildAlreadyInProgress => {
                        ErrorMetadata::index_build_already_in_progress("in progress")
                    },
                })
                .boxed()
        }
    }
}
