//! # rhindex
//!
//! A concurrent, almost-lock-free hash map with Robin-Hood probing, a
//! reservation protocol for safe concurrent key installation, cooperative
//! grow/shrink migration, and a partitionable live-entry iterator.
//!
//! ## Module organization
//!
//! ### Foundation
//! - [`mod@backoff`] - exponential backoff for CAS retry loops
//! - [`bits`] - slot-word bit packing (entry index / tag / probe distance)
//! - [`error`] - [`error::MapError`], the typed outcomes of every fallible
//!   public operation
//!
//! ### Core primitives
//! - [`atomic`] - `AtomicInt64`, `AtomicCell<T>`, `AtomicEvent`
//!
//! ### Storage
//! - [`entry`] - the append-only entry store (`EntryStore`, `Entry`)
//! - [`index`] - the power-of-two slot-word index (`Index`)
//!
//! ### Engine
//! - [`map`] - [`map::ConcurrentMap`], the crate's primary type
//! - [`migration`] - grow/shrink state machine and help-migrate protocol
//! - [`iter`] - [`iter::PartitionIter`], the partitioned live-entry iterator
//!
//! ### Layered on the engine
//! - [`latch`] - `CountDownLatch`
//! - [`cache`] - `AtomicCache`, a memoizing decorator over `ConcurrentMap`
//!
//! ### Diagnostics
//! - [`debug_introspection`] - invariant checks for test/`introspect` builds

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod atomic;
pub mod backoff;
pub mod bits;
pub mod cache;
#[cfg(any(test, feature = "introspect"))]
pub mod debug_introspection;
pub mod entry;
pub mod error;
pub mod index;
pub mod iter;
pub mod latch;
pub mod map;
pub mod migration;

pub use cache::AtomicCache;
pub use error::MapError;
pub use iter::PartitionIter;
pub use latch::CountDownLatch;
pub use map::{ConcurrentMap, Expected, ShrinkPolicy};
