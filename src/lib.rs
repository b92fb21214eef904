#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Non-blocking concurrent containers.
//!
//! # [`HashMap`]
//! A lock-free concurrent open-addressing hash map. Lookups never write to shared memory.
//! Updates are single compare-and-swap operations on a bucket, and a full bucket array is
//! migrated to a larger one incrementally by every thread that touches it.
//!
//! # [`LongHashMap`]
//! A [`HashMap`] specialized for `u64` keys stored inline in the bucket array.
//!
//! # [`HashSet`]
//! A concurrent set backed by a [`HashMap`].
//!
//! # [`BitSet`]
//! A concurrent set of integers in a fixed range.
//!
//! # [`StripedCounter`]
//! A counter that scales under contention by spreading updates over a growing array of cells.
//!
//! # Memory reclamation
//! Values are handed out as [`Shared`] pointers or as references bound to a [`Guard`], and are
//! released by the [`sdd`](https://crates.io/crates/sdd) epoch-based collector once no thread can
//! observe them.

pub mod bit_set;
pub use bit_set::BitSet;

pub mod counter;
pub use counter::StripedCounter;

pub mod hash_map;
pub use hash_map::HashMap;

pub mod hash_set;
pub use hash_set::HashSet;

pub mod long_hash_map;
pub use long_hash_map::LongHashMap;

mod table;

#[cfg(not(feature = "equivalent"))]
mod equivalent;
pub use equivalent::Equivalent;

#[cfg(feature = "serde")]
mod serde;

pub use sdd::{Guard, Shared};

#[cfg(test)]
mod tests;
