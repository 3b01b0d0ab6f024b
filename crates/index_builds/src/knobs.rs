//! Environment-overridable tunables.

use std::{
    env,
    fmt::Debug,
    str::FromStr,
    sync::LazyLock,
    time::Duration,
};

pub fn env_config<T: Debug + FromStr>(name: &str, default: T) -> T
where
    <T as FromStr>::Err: Debug,
{
    let var_s = match env::var(name) {
        Ok(s) => s,
        Err(env::VarError::NotPresent) => return default,
        Err(env::VarError::NotUnicode(..)) => {
            tracing::warn!("Invalid value for {name}, falling back to {default:?}.");
            return default;
        },
    };
    match T::from_str(&var_s) {
        Ok(v) => {
            tracing::info!("Overriding {name} to {v:?} from environment");
            v
        },
        Err(e) => {
            tracing::warn!("Invalid value {var_s} for {name}, falling back to {default:?}: {e:?}");
            default
        },
    }
}

/// Total memory budget for the bulk loaders of one build, split evenly
/// across the index specs in the build.
pub static MAX_INDEX_BUILD_MEMORY_BYTES: LazyLock<usize> =
    LazyLock::new(|| env_config("MAX_INDEX_BUILD_MEMORY_BYTES", 200 * 1024 * 1024));

/// Maximum number of side-write rows applied in one atomic drain batch.
pub static MAX_DRAIN_BATCH_ROWS: LazyLock<usize> =
    LazyLock::new(|| env_config("INDEX_BUILD_DRAIN_BATCH_ROWS", 1000));

/// Maximum total serialized size of one atomic drain batch.
pub static MAX_DRAIN_BATCH_BYTES: LazyLock<usize> =
    LazyLock::new(|| env_config("INDEX_BUILD_DRAIN_BATCH_BYTES", 16 * 1024 * 1024));

/// The collection scan yields its locks and snapshot after this many
/// records to bound interference with concurrent traffic.
pub static SCAN_YIELD_PERIOD: LazyLock<usize> =
    LazyLock::new(|| env_config("INDEX_BUILD_SCAN_YIELD_PERIOD", 128));

/// Bulk-load commit yields after this many inserted keys when the build
/// method permits yielding. Zero disables yielding.
pub static BULK_LOAD_YIELD_PERIOD: LazyLock<usize> =
    LazyLock::new(|| env_config("INDEX_BUILD_BULK_LOAD_YIELD_PERIOD", 4096));

/// How many times a temporarily-unavailable error is retried before being
/// surfaced to the caller.
pub static TEMPORARILY_UNAVAILABLE_MAX_RETRIES: LazyLock<u32> =
    LazyLock::new(|| env_config("TEMPORARILY_UNAVAILABLE_MAX_RETRIES", 10));

/// Base backoff between temporarily-unavailable retries; attempt N sleeps
/// N times this long.
pub static TEMPORARILY_UNAVAILABLE_BACKOFF: LazyLock<Duration> = LazyLock::new(|| {
    Duration::from_millis(env_config("TEMPORARILY_UNAVAILABLE_BACKOFF_MS", 100))
});

/// Initial backoff after a write conflict.
pub static WRITE_CONFLICT_INITIAL_BACKOFF: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("WRITE_CONFLICT_INITIAL_BACKOFF_MS", 1)));

/// Cap on write-conflict backoff.
pub static WRITE_CONFLICT_MAX_BACKOFF: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("WRITE_CONFLICT_MAX_BACKOFF_MS", 100)));

/// Initial backoff when the collection scan restarts after a storage race.
pub static SCAN_RESTART_INITIAL_BACKOFF: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("SCAN_RESTART_INITIAL_BACKOFF_MS", 10)));

/// Cap on scan-restart backoff.
pub static SCAN_RESTART_MAX_BACKOFF: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("SCAN_RESTART_MAX_BACKOFF_MS", 1000)));
