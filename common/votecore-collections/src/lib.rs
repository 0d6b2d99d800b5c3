//! Context-backed collections: a growable array and an open-addressing hash
//! map, both allocating their storage from a [`votecore_context::Context`]
//! instead of the global allocator directly, so a whole collection can be
//! freed in one shot along with the rest of its owning context.

mod map;
mod vec;

pub use map::ContextMap;
pub use vec::ContextVec;
