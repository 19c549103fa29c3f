//! Typed, user-visible failures.
//!
//! Internal CAS retries are never surfaced here — only the outcomes a caller
//! needs to branch on.

use thiserror::Error;

/// Error kinds exposed at the map's public boundary.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum MapError {
    /// Lookup failure when no default was supplied, or a delete of a
    /// missing key.
    #[error("key not found")]
    KeyNotFound,

    /// A `compare_and_set` predicate did not match the installed value.
    #[error("expectation failed")]
    ExpectationFailed,

    /// An `AtomicInt64` operation would overflow signed 64-bit range.
    #[error("integer overflow")]
    Overflow,

    /// A caller-supplied argument is out of range (e.g. `partitions < 1`,
    /// `this_partition` out of `[0, partitions)`, an inconsistent
    /// `min_size`).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Report and abort on a broken internal invariant (a generation pointer
/// observed null, a migration link missing where one was just established,
/// and similar states that indicate a bug rather than contention). Debug
/// builds panic immediately via `debug_assert!`; release builds log the
/// violation through `tracing::error!` first, since a release panic here
/// otherwise gives an operator nothing to go on before the process aborts.
#[cold]
#[track_caller]
pub(crate) fn invariant_violation(what: &str) -> ! {
    if cfg!(debug_assertions) {
        panic!("internal invariant violated: {what}");
    }
    tracing::error!(invariant = what, "internal invariant violated");
    panic!("internal invariant violated: {what}");
}
