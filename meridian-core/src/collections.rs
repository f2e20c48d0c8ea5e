//! Collection aliases used across the workspace.
//!
//! Hash containers are `hashbrown` seeded with `foldhash`; keys in the hot
//! paths (framebuffer keys, resource identities) hash every lookup, so the
//! hasher choice is fixed here rather than left to call sites.

pub mod hashmap;
pub mod hashset;

pub use smallvec::SmallVec;
