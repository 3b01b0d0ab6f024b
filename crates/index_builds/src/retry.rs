//! The write-conflict retry primitive. Wraps a storage operation and
//! re-runs it when optimistic concurrency control loses a race.

use std::time::Duration;

use errors::ErrorMetadataAnyhowExt;
use tracing::{
    info,
    warn,
};

use crate::{
    backoff::Backoff,
    context::OperationContext,
    fatal::fatal,
    knobs::{
        TEMPORARILY_UNAVAILABLE_BACKOFF,
        TEMPORARILY_UNAVAILABLE_MAX_RETRIES,
        WRITE_CONFLICT_INITIAL_BACKOFF,
        WRITE_CONFLICT_MAX_BACKOFF,
    },
};

#[derive(Clone, Debug)]
pub struct RetryOptions {
    /// Write conflicts seen past this count abort the process: the caller
    /// asserted the operation cannot keep conflicting forever. `None` means
    /// retry without bound.
    pub conflict_retry_limit: Option<u32>,
    pub conflict_initial_backoff: Duration,
    pub conflict_max_backoff: Duration,
    pub unavailable_initial_backoff: Duration,
    pub unavailable_max_retries: u32,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            conflict_retry_limit: None,
            conflict_initial_backoff: *WRITE_CONFLICT_INITIAL_BACKOFF,
            conflict_max_backoff: *WRITE_CONFLICT_MAX_BACKOFF,
            unavailable_initial_backoff: *TEMPORARILY_UNAVAILABLE_BACKOFF,
            unavailable_max_retries: *TEMPORARILY_UNAVAILABLE_MAX_RETRIES,
        }
    }
}

impl RetryOptions {
    pub fn with_conflict_retry_limit(mut self, limit: u32) -> Self {
        self.conflict_retry_limit = Some(limit);
        self
    }
}

/// Run `f`, retrying on transient storage errors.
///
/// Write conflicts retry without bound by default: the operation backs off
/// with jitter, abandons its snapshot so the next attempt reads fresh data,
/// and tries again.
///
/// `TemporarilyUnavailable` retries a bounded number of times and then
/// surfaces, except inside a multi-document transaction, where it converts
/// to a write conflict immediately so the whole transaction retries.
/// `ResourceExhausted` never retries.
///
/// Scopes do not nest: inside an enclosing retry scope `f` runs exactly once
/// and any error propagates to the outer scope.
pub fn write_conflict_retry<T>(
    ctx: &mut OperationContext,
    op_name: &'static str,
    options: RetryOptions,
    mut f: impl FnMut(&mut OperationContext) -> anyhow::Result<T>,
) -> anyhow::Result<T> {
    if ctx.in_write_conflict_retry() {
        return f(ctx);
    }
    ctx.set_in_write_conflict_retry(true);
    let result = retry_loop(ctx, op_name, &options, &mut f);
    ctx.set_in_write_conflict_retry(false);
    result
}

fn retry_loop<T>(
    ctx: &mut OperationContext,
    op_name: &'static str,
    options: &RetryOptions,
    f: &mut impl FnMut(&mut OperationContext) -> anyhow::Result<T>,
) -> anyhow::Result<T> {
    let mut conflict_backoff = Backoff::new(
        options.conflict_initial_backoff,
        options.conflict_max_backoff,
    );
    let mut unavailable_backoff = Backoff::new(
        options.unavailable_initial_backoff,
        options.unavailable_initial_backoff * 32,
    );
    loop {
        let e = match f(ctx) {
            Ok(value) => {
                if conflict_backoff.failures() > 0 {
                    info!(
                        "{op_name} succeeded after {} write conflicts",
                        conflict_backoff.failures()
                    );
                }
                return Ok(value);
            },
            Err(e) => e,
        };
        if e.is_write_conflict() {
            if let Some(limit) = options.conflict_retry_limit {
                if conflict_backoff.failures() >= limit {
                    fatal(&format!(
                        "{op_name} exceeded its write conflict retry limit of {limit}"
                    ));
                }
            }
            warn!(
                "{op_name} hit a write conflict (attempt {}), retrying: {e:#}",
                conflict_backoff.failures() + 1
            );
            ctx.recovery_unit.abandon_snapshot();
            conflict_backoff.fail_and_sleep();
        } else if e.is_temporarily_unavailable() {
            if ctx.in_multi_document_transaction() {
                // Inside a transaction there is no safe way to wait; convert
                // so the whole transaction retries at its own level.
                return Err(e.map_error_metadata(|_| errors::ErrorMetadata::write_conflict()));
            }
            if unavailable_backoff.failures() >= options.unavailable_max_retries {
                return Err(e);
            }
            warn!(
                "{op_name} temporarily unavailable (attempt {}), retrying: {e:#}",
                unavailable_backoff.failures() + 1
            );
            ctx.recovery_unit.abandon_snapshot();
            unavailable_backoff.fail_and_sleep();
        } else {
            return Err(e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use errors::{
        ErrorMetadata,
        ErrorMetadataAnyhowExt,
    };

    use super::{
        write_conflict_retry,
        RetryOptions,
    };
    use crate::context::{
        LockManager,
        OperationContext,
    };

    fn ctx() -> OperationContext {
        OperationContext::new("test", LockManager::new())
    }

    fn fast_options() -> RetryOptions {
        RetryOptions {
            conflict_retry_limit: None,
            conflict_initial_backoff: Duration::from_micros(10),
            conflict_max_backoff: Duration::from_micros(100),
            unavailable_initial_backoff: Duration::from_micros(10),
            unavailable_max_retries: 4,
        }
    }

    #[test]
    fn test_write_conflicts_retry_until_success() {
        let mut ctx = ctx();
        let mut attempts = 0;
        let abandons_before = ctx.recovery_unit.snapshot_abandons();
        let value = write_conflict_retry(&mut ctx, "test_op", fast_options(), |_ctx| {
            attempts += 1;
            if attempts < 3 {
                anyhow::bail!(ErrorMetadata::write_conflict());
            }
            Ok(42)
        })
        .unwrap();
        assert_eq!(value, 42);
        assert_eq!(attempts, 3);
        // Each failed attempt abandons the snapshot before retrying.
        assert_eq!(ctx.recovery_unit.snapshot_abandons(), abandons_before + 2);
    }

    #[test]
    fn test_resource_exhausted_is_not_retried() {
        let mut ctx = ctx();
        let mut attempts = 0;
        let err = write_conflict_retry(&mut ctx, "test_op", fast_options(), |_ctx| {
            attempts += 1;
            anyhow::bail!(ErrorMetadata::resource_exhausted(
                "DiskFull",
                "out of disk space"
            ));
            #[allow(unreachable_code)]
            Ok(())
        })
        .unwrap_err();
        assert_eq!(attempts, 1);
        assert!(err.is_resource_exhausted());
    }

    #[test]
    fn test_temporarily_unavailable_surfaces_after_bounded_retries() {
        let mut ctx = ctx();
        let mut attempts = 0u32;
        let err = write_conflict_retry(&mut ctx, "test_op", fast_options(), |_ctx| {
            attempts += 1;
            anyhow::bail!(ErrorMetadata::temporarily_unavailable(
                "CacheFull",
                "storage engine cache is full"
            ));
            #[allow(unreachable_code)]
            Ok(())
        })
        .unwrap_err();
        assert!(err.is_temporarily_unavailable());
        assert_eq!(attempts, fast_options().unavailable_max_retries + 1);
    }

    #[test]
    fn test_temporarily_unavailable_converts_inside_transaction() {
        let mut ctx = ctx();
        ctx.set_in_multi_document_transaction(true);
        let mut attempts = 0;
        let err = write_conflict_retry(&mut ctx, "test_op", fast_options(), |_ctx| {
            attempts += 1;
            anyhow::bail!(ErrorMetadata::temporarily_unavailable(
                "CacheFull",
                "storage engine cache is full"
            ));
            #[allow(unreachable_code)]
            Ok(())
        })
        .unwrap_err();
        assert_eq!(attempts, 1);
        assert!(err.is_write_conflict());
    }

    #[test]
    fn test_nested_scope_runs_once_and_propagates() {
        let mut ctx = ctx();
        let mut inner_attempts = 0;
        let mut outer_attempts = 0;
        let value = write_conflict_retry(&mut ctx, "outer", fast_options(), |ctx| {
            outer_attempts += 1;
            let inner: anyhow::Result<()> =
                write_conflict_retry(ctx, "inner", fast_options(), |_ctx| {
                    inner_attempts += 1;
                    if outer_attempts < 2 {
                        anyhow::bail!(ErrorMetadata::write_conflict());
                    }
                    Ok(())
                });
            inner?;
            Ok(7)
        })
        .unwrap();
        assert_eq!(value, 7);
        // The inner scope never retried on its own; the outer scope did.
        assert_eq!(outer_attempts, 2);
        assert_eq!(inner_attempts, 2);
    }
}
