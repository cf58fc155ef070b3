//! Concurrency substrate and shared hash-table engines for a parallel BDD package (§1, §2).
//!
//! This crate provides three tightly-coupled primitives, leaves first:
//!
//! - [`fingerprint`] — pluggable 32/64-bit hash families.
//! - [`cache`] — [`cache::LLCache`], a bounded lock-less memoization cache.
//! - [`gcset`] — [`gcset::LLGCSet`], a garbage-collected, reference-counted unique set.
//! - [`scheduler`] — a fixed-pool work-stealing fork-join [`scheduler::Scheduler`].
//!
//! The BDD algorithms themselves (apply/ite/exists/serialization) are an external collaborator
//! built on top of these primitives and are not part of this crate (§1).

pub mod cache;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod gcset;
pub mod numa;
pub mod scheduler;
mod util;

pub use error::CoreError;
pub use fingerprint::{Fingerprint32, Fingerprint64};
