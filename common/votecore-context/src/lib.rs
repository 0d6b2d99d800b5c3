//! A hierarchical region allocator: contexts carve fixed-size blocks out of
//! buffers they grow on demand, and free a whole subtree in one call.
//!
//! This is a fairly direct translation of a small arena allocator originally
//! written in C, where a `Memory_context` holds a sorted free list and a
//! sorted used list over a handful of buffers obtained from its parent (or
//! `malloc` at the root). The registries here work the same way, just typed:
//! see [`inner::Inner`] for the block bookkeeping and [`Context`] for where
//! that turns into real memory.

mod block;
mod inner;

#[cfg(test)]
mod tests;

use inner::Inner;
use parking_lot::Mutex;
use std::alloc::{self, Layout};
use std::fmt;
use std::sync::Arc;

/// A child context keeps its parent alive and hands blocks it can't satisfy
/// locally up the chain; the parent never reaches back down.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    parent: Option<Context>,
    state: Mutex<Inner>,
}

// `ContextInner` only ever touches raw addresses through the `Mutex`-guarded
// `Inner`, and the memory those addresses describe is owned by this context
// (or leased from its parent, who agrees not to touch it). Safe to move and
// share across threads.
unsafe impl Send for ContextInner {}
unsafe impl Sync for ContextInner {}

/// Every buffer is allocated at this alignment regardless of what a single
/// allocation inside it needs; `alloc_from_free`'s padding carves out the
/// rest, the same as the original context never bothering to align its
/// `malloc`'d buffers beyond what `malloc` already guarantees.
const BUFFER_ALIGNMENT: usize = std::mem::align_of::<usize>();

/// Why an allocation, resize or buffer grow failed.
#[derive(thiserror::Error, Debug)]
pub enum ContextError {
    #[error("out of memory requesting a buffer of {requested} bytes")]
    OutOfMemory { requested: usize },
    #[error("allocation size overflowed a buffer boundary")]
    Overflow,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.inner.state.lock();
        f.debug_struct("Context")
            .field("buffers", &guard.buffers.len())
            .field("used_blocks", &guard.used_blocks.len())
            .field("free_blocks", &guard.free_blocks.len())
            .finish()
    }
}

impl Context {
    /// Create a new context with no parent. Its buffers come straight from
    /// the global allocator.
    pub fn new_root() -> Self {
        Context {
            inner: Arc::new(ContextInner {
                parent: None,
                state: Mutex::new(Inner::new()),
            }),
        }
    }

    /// Create a child of this context. The child grows its own buffers by
    /// allocating from `self`, so freeing `self` invalidates every child
    /// transitively (nothing enforces that statically; see module docs).
    pub fn new_child(&self) -> Self {
        Context {
            inner: Arc::new(ContextInner {
                parent: Some(self.clone()),
                state: Mutex::new(Inner::new()),
            }),
        }
    }

    /// Allocate `size` bytes aligned to `alignment`, which must be a power
    /// of two. Returns the address as a `usize`; callers at the real-memory
    /// boundary are expected to turn it into a pointer with
    /// [`Context::as_ptr`].
    pub fn alloc_raw(&self, size: usize, alignment: usize) -> Result<usize, ContextError> {
        debug_assert!(alignment.is_power_of_two());
        if size == 0 {
            // A zero-size allocation still needs a unique, non-dangling
            // address; satisfy it with the smallest real block.
            return self.alloc_raw(1, alignment);
        }

        {
            let mut guard = self.inner.state.lock();
            if let Some(used) = guard.try_alloc(size, alignment) {
                let block = guard.used_blocks[used];
                return Ok(block.data);
            }
        }

        self.grow_for(size, alignment)?;

        let mut guard = self.inner.state.lock();
        let used = guard
            .try_alloc(size, alignment)
            .expect("buffer just grown to fit this allocation");
        Ok(guard.used_blocks[used].data)
    }

    /// Allocate space for a single `T`, without initialising it.
    pub fn alloc<T>(&self) -> Result<*mut T, ContextError> {
        let layout = Layout::new::<T>();
        let addr = self.alloc_raw(layout.size().max(1), layout.align())?;
        Ok(addr as *mut T)
    }

    /// Allocate space for `len` contiguous `T`s, without initialising them.
    pub fn alloc_slice<T>(&self, len: usize) -> Result<*mut T, ContextError> {
        let layout = Layout::array::<T>(len).map_err(|_| ContextError::Overflow)?;
        let addr = self.alloc_raw(layout.size().max(1), layout.align())?;
        Ok(addr as *mut T)
    }

    /// Allocate `size` zeroed bytes.
    pub fn zero_alloc_raw(&self, size: usize, alignment: usize) -> Result<usize, ContextError> {
        let addr = self.alloc_raw(size, alignment)?;
        unsafe {
            std::ptr::write_bytes(addr as *mut u8, 0, size);
        }
        Ok(addr)
    }

    /// Grow or shrink a previous allocation at `data`, in place when
    /// possible. `data` must be the address returned by an earlier
    /// `alloc`/`resize` call on this exact context.
    pub fn resize_raw(
        &self,
        data: usize,
        new_size: usize,
        alignment: usize,
    ) -> Result<usize, ContextError> {
        if new_size == 0 {
            self.dealloc_raw(data);
            return self.alloc_raw(0, alignment);
        }

        {
            let mut guard = self.inner.state.lock();
            let used_index = guard
                .find_used_block(data)
                .expect("resize_raw called with an address this context didn't allocate");
            // Shrinking is a no-op by design (spec: "Shrinking is a no-op by
            // design"): the block keeps its original size so the freed tail
            // stays covered by exactly the same used block, not by nothing.
            if new_size <= guard.used_blocks[used_index].size {
                return Ok(data);
            }
            if guard.try_resize_in_place(used_index, new_size) {
                return Ok(data);
            }
        }

        // Can't grow in place: allocate fresh, copy, free the old block.
        let old_size = {
            let guard = self.inner.state.lock();
            let used_index = guard.find_used_block(data).unwrap();
            guard.used_blocks[used_index].size
        };
        let new_addr = self.alloc_raw(new_size, alignment)?;
        unsafe {
            std::ptr::copy_nonoverlapping(data as *const u8, new_addr as *mut u8, old_size);
        }
        self.dealloc_raw(data);
        Ok(new_addr)
    }

    /// Free a single allocation, coalescing it into the surrounding free
    /// list. `data` must have come from this exact context.
    pub fn dealloc_raw(&self, data: usize) {
        let mut guard = self.inner.state.lock();
        let used_index = match guard.find_used_block(data) {
            Some(i) => i,
            None => return,
        };
        guard.dealloc_used(used_index);
    }

    /// Free every allocation this context has ever made, without freeing the
    /// buffers themselves, so the context can be reused from scratch.
    pub fn reset(&self) {
        let mut guard = self.inner.state.lock();
        let buffers: Vec<_> = guard
            .buffers
            .iter()
            .map(|b| (b.data, b.size))
            .collect();
        guard.used_blocks.clear();
        guard.free_blocks.clear();
        for (data, size) in buffers {
            guard.add_used(data, 0);
            guard.add_used(data + size, 0);
            guard.add_free(data, size);
        }
    }

    /// Copy `s` into a fresh nul-terminated allocation in this context and
    /// return its address, mirroring the original's `copy_string` helper.
    pub fn copy_string(&self, s: &str) -> Result<usize, ContextError> {
        let bytes = s.as_bytes();
        let addr = self.alloc_raw(bytes.len() + 1, 1)?;
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
            *((addr + bytes.len()) as *mut u8) = 0;
        }
        Ok(addr)
    }

    fn grow_for(&self, size: usize, alignment: usize) -> Result<(), ContextError> {
        let needed = {
            let guard = self.inner.state.lock();
            guard.next_buffer_size(size.max(alignment))
        };

        let data = match &self.inner.parent {
            Some(parent) => parent.alloc_raw(needed, BUFFER_ALIGNMENT)?,
            None => {
                let layout = Layout::from_size_align(needed, BUFFER_ALIGNMENT)
                    .map_err(|_| ContextError::Overflow)?;
                let ptr = unsafe { alloc::alloc(layout) };
                if ptr.is_null() {
                    return Err(ContextError::OutOfMemory { requested: needed });
                }
                ptr as usize
            }
        };

        let mut guard = self.inner.state.lock();
        guard.install_buffer(data, needed);
        Ok(())
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        let guard = self.state.lock();
        match &self.parent {
            // A root context owns its buffers outright; give them back to
            // the global allocator.
            None => {
                for buffer in &guard.buffers {
                    let layout =
                        Layout::from_size_align(buffer.size, BUFFER_ALIGNMENT).unwrap();
                    unsafe {
                        alloc::dealloc(buffer.data as *mut u8, layout);
                    }
                }
            }
            // A child's buffers are allocations out of the parent's own
            // registry; hand them back the same way any other allocation
            // would be freed.
            Some(parent) => {
                for buffer in &guard.buffers {
                    parent.dealloc_raw(buffer.data);
                }
            }
        }
    }
}
