//! Store implementations.
//!
//! Production deployments implement the traits in [`crate::limit::backend`]
//! over their own key-value client; [`MemoryStore`] is the in-process one.

mod memory;

pub use memory::MemoryStore;
