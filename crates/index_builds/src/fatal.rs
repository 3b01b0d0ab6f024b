//! Process-fatal invariant failures.
//!
//! Once an abort decision has been made, a failure while tearing down
//! partially built indexes would leave the catalog half-cleaned; the process
//! must terminate instead. Under the `testing` feature this panics with a
//! recognizable message so tests can observe the termination on a spawned
//! thread.

pub(crate) const FATAL_PREFIX: &str = "fatal index build invariant violation";

#[cfg(any(test, feature = "testing"))]
pub(crate) fn fatal(msg: &str) -> ! {
    panic!("{FATAL_PREFIX}: {msg}");
}

#[cfg(not(any(test, feature = "testing")))]
pub(crate) fn fatal(msg: &str) -> ! {
    tracing::error!("{FATAL_PREFIX}: {msg}");
    std::process::abort();
}
