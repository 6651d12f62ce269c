//! A read-optimised, lock-free concurrent hash map.
//!
//! [`HashMap`] keeps every entry in a singly-linked list sorted by hash and
//! accelerates lookups with a sparse index: an array of atomic pointers in
//! which slot `i` anchors the smallest-hash live entry whose top hash bits
//! equal `i`. Readers never lock, never spin on other operations, and never
//! CAS; writers coordinate with short CAS loops; a per-map coordinator
//! thread rebuilds the index in the background when it fills past 50%,
//! while reads and writes continue against the old index.
//!
//! Keys belong to a closed set of kinds (fixed-width integers, floats,
//! complex pairs, and strings) described by the sealed [`Hashable`] trait.
//! Values are arbitrary.
//!
//! # Usage
//!
//! Operations take a [`Guard`], which keeps retired entries alive for as
//! long as the operation can observe them. The easiest way to hold one is
//! [`HashMap::pin`]:
//!
//! ```
//! let map = loquat::HashMap::new();
//!
//! let m = map.pin();
//! m.insert(1_u64, "a");
//! m.insert(2_u64, "b");
//! assert_eq!(m.get(&1), Some(&"a"));
//! m.remove(&2);
//! assert_eq!(m.get(&2), None);
//! ```
//!
//! Guards can also be managed explicitly, which amortizes their cost across
//! operations and pins the lifetime of returned references:
//!
//! ```
//! let map = loquat::HashMap::new();
//!
//! let guard = map.guard();
//! map.insert(1_u64, String::from("a"), &guard);
//! let value: &String = map.get(&1, &guard).unwrap();
//! assert_eq!(value, "a");
//! ```
//!
//! The map is unordered except by hash: iteration visits live entries in
//! ascending hash order, which is stable but meaningless to the caller.

mod hash;
mod map;
mod raw;

#[cfg(feature = "serde")]
mod serde_impls;

pub use hash::Hashable;
pub use map::{HashMap, HashMapRef, Iter};
pub use seize::{Guard, LocalGuard, OwnedGuard};
