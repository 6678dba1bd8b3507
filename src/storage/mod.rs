//! Store implementations.
//!
//! Only the in-memory reference stores live in the core; SQL/document/KV
//! drivers implement the [`crate::interfaces::store`] contracts externally.

#[cfg(feature = "standalone")]
mod memory;

#[cfg(feature = "standalone")]
pub use memory::{InMemorySagaStore, InMemoryTimeoutStore};
