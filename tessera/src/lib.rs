//! Concurrent transport of row datasets from storage into shared memory.
//!
//! Two access patterns are served, both over pools of OS threads in the calling process, each
//! thread owning its own dataset handle:
//!
//! * Streaming: a [`StreamQueue`] cuts a dataset into fixed-size blocks, has its workers read
//!   them into a bounded ring of shared-memory slots and hands each filled slot to the consumer
//!   as a [`SlotGuard`]. A [`RowGenerator`] flattens the blocks into single rows.
//! * Random access: a [`Reader`] serves [`Request`]s for arbitrary row selections, writing each
//!   result into a [`Stage`] or a [`StagePool`] and resolving the [`RequestFuture`] returned at
//!   scheduling time. A [`RequestPool`] hands futures back in submission order.
//!
//! Datasets and shared memory are reached through the capabilities of [`tessera_io`]. Slots and
//! stages are allocated from a [`SharedArena`](tessera_io::SharedArena). An
//! [`AnonymousArena`](tessera_io::AnonymousArena) keeps them private to this process. A
//! [`FileArena`](tessera_io::FileArena) backs each one with a named file that another process can
//! map through its [`ShmHandle`](tessera_io::ShmHandle), as returned by [`Stage::handle`].

pub use future::*;
pub use handle::*;
pub use plan::*;
pub use reader::*;
pub use request::*;
pub use request_pool::*;
pub use rows::*;
pub use slot::*;
pub use stage::*;
pub use stream::*;
pub use streamer::*;
pub use view::*;
pub use worker::*;

#[cfg(test)]
mod fixtures;
mod future;
mod handle;
mod plan;
mod reader;
mod request;
mod request_pool;
mod rows;
mod slot;
mod stage;
mod stream;
mod streamer;
mod view;
mod worker;
