//! Capabilities consumed by the Tessera transport engine.
//!
//! The engine itself never parses files or allocates operating system shared memory. It reads
//! through a [`DatasetSource`], which hands each worker its own [`Dataset`] handle, and it
//! places blocks and staged results into regions handed out by a [`SharedArena`].
//!
//! This crate defines both capabilities together with a handful of back ends: in-memory
//! datasets for tests and embedding, memory-mapped raw row files, and anonymous or file-backed
//! shared-memory arenas.

pub use dataset::*;
pub use layout::*;
pub use memory::*;
pub use raw::*;
pub use shm::*;

mod dataset;
mod layout;
mod memory;
mod raw;
mod shm;

/// Target size of a default block, in bytes, for datasets that carry no chunk geometry.
pub const DEFAULT_BLOCK_NBYTES: usize = 128 << 10;
