//! The crate's error taxonomy (§7).
//!
//! Three kinds of failure exist in the source design, and only one of them is an `Err` value:
//!
//! 1. Transient contention (CAS loss, a busy lock) is never surfaced as an error; it is recovered
//!    locally by retrying, or reported through a plain status enum such as [`crate::cache::PutOutcome`].
//! 2. Capacity exhaustion on [`crate::gcset::LLGCSet::lookup`] is the one recoverable error this
//!    crate returns: [`CoreError::TableFull`]. The caller's contract is to call `gc` and retry
//!    once; a second failure is a contract violation, not a recoverable error.
//! 3. Contract violations (double-free, oversized task payload, calling a task macro off a
//!    worker thread) are fatal. They panic with a diagnostic rather than returning `Result`,
//!    because the source design forbids partial retries across the API boundary for these.

use thiserror::Error;

/// The single recoverable error this crate returns.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CoreError {
    /// `LLGCSet::lookup` exhausted its rehash budget (`threshold` rounds) without finding an
    /// empty slot, a matching key, or a reusable tombstone. The caller's contract is to invoke
    /// `gc` and retry once; a `TableFull` on that retry should be treated as fatal by the caller.
    #[error("gc-set is full after exhausting {rounds} rehash rounds (capacity = {capacity})")]
    TableFull { rounds: u32, capacity: u64 },
}

/// Panics with a formatted contract-violation diagnostic, matching §7 kind 3.
///
/// This exists purely so every contract violation in the crate panics with the same message
/// shape (`"bdd-core contract violation: ..."`), which makes them easy to `grep` for in a
/// panic=abort crash log.
#[inline]
#[track_caller]
pub(crate) fn contract_violation(message: &str) -> ! {
    panic!("bdd-core contract violation: {message}");
}
