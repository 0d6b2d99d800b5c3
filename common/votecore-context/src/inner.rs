//! The actual free-list allocator algorithm, ported from `context.c`'s
//! `add_block`/`alloc_block`/`resize_block`/`dealloc_block`/`grow_context`.
//!
//! Everything in this module works in terms of plain `usize` addresses.
//! [`crate::Context`] is the thing that turns those into real memory by
//! calling the parent context (or the global allocator) and is the only
//! place that does anything `unsafe`.

use crate::block::{Block, Buffer};

/// How many buffers/used-blocks/free-blocks to make room for to begin with.
const INITIAL_LIMIT: usize = 4;

/// The first buffer a fresh context grows is this many bytes, same as the
/// original's use of libc's `BUFSIZ`.
pub(crate) const FIRST_BUFFER_SIZE: usize = 8192;

pub(crate) struct Inner {
    pub buffers: Vec<Buffer>,
    pub free_blocks: Vec<Block>,
    pub used_blocks: Vec<Block>,
}

impl Inner {
    pub fn new() -> Self {
        Inner {
            buffers: Vec::with_capacity(INITIAL_LIMIT),
            free_blocks: Vec::with_capacity(INITIAL_LIMIT),
            used_blocks: Vec::with_capacity(INITIAL_LIMIT),
        }
    }

    /// Binary search for where a free block of `size`/`data` is, or would be
    /// inserted, in the `(size, address)`-ordered free registry.
    pub fn free_block_index(&self, size: usize, data: usize) -> usize {
        let mut i = 0usize;
        let mut j = self.free_blocks.len();
        while i < j {
            let mid = i + (j - i) / 2;
            let block = &self.free_blocks[mid];
            match size.cmp(&block.size) {
                std::cmp::Ordering::Equal => match data.cmp(&block.data) {
                    std::cmp::Ordering::Equal => return mid,
                    std::cmp::Ordering::Less => j = mid,
                    std::cmp::Ordering::Greater => i = mid + 1,
                },
                std::cmp::Ordering::Less => j = mid,
                std::cmp::Ordering::Greater => i = mid + 1,
            }
        }
        i
    }

    /// Binary search the address-ordered used registry. If `data` lands on a
    /// sentinel, skip forward past it (and past a second sentinel at the same
    /// address, which happens when two buffers are contiguous).
    pub fn used_block_index(&self, data: usize) -> usize {
        let mut i = 0usize;
        let mut j = self.used_blocks.len();
        while i < j {
            let mid = i + (j - i) / 2;
            let block = &self.used_blocks[mid];
            match data.cmp(&block.data) {
                std::cmp::Ordering::Equal => {
                    let mut idx = mid;
                    if block.is_sentinel() {
                        idx += 1;
                        if idx < self.used_blocks.len() {
                            let next = &self.used_blocks[idx];
                            if next.data == data && next.is_sentinel() {
                                idx += 1;
                            }
                        }
                    }
                    return idx;
                }
                std::cmp::Ordering::Less => j = mid,
                std::cmp::Ordering::Greater => i = mid + 1,
            }
        }
        i
    }

    pub fn find_free_block(&self, size: usize, data: usize) -> Option<usize> {
        let index = self.free_block_index(size, data);
        let block = self.free_blocks.get(index)?;
        (block.data == data && block.size == size).then_some(index)
    }

    pub fn find_used_block(&self, data: usize) -> Option<usize> {
        let index = self.used_block_index(data);
        let block = self.used_blocks.get(index)?;
        (block.data == data).then_some(index)
    }

    fn is_sentinel_for_buffer(&self, data: usize, size: usize) -> bool {
        if size != 0 {
            return false;
        }
        self.buffers
            .iter()
            .any(|b| data == b.data || data == b.data + b.size)
    }

    pub fn add_free(&mut self, data: usize, size: usize) -> usize {
        debug_assert!(size > 0);
        let index = self.free_block_index(size, data);
        self.free_blocks.insert(index, Block { data, size });
        index
    }

    pub fn add_used(&mut self, data: usize, size: usize) -> usize {
        debug_assert!(size > 0 || self.is_sentinel_for_buffer(data, size));
        let index = self.used_block_index(data);
        self.used_blocks.insert(index, Block { data, size });
        index
    }

    pub fn add_buffer(&mut self, data: usize, size: usize) {
        self.buffers.push(Buffer { data, size });
    }

    /// How large the next buffer should be to service an allocation of at
    /// least `size` bytes: double the previous buffer (or start at
    /// [`FIRST_BUFFER_SIZE`]), then keep doubling until it's big enough.
    pub fn next_buffer_size(&self, size: usize) -> usize {
        let mut buffer_size = match self.buffers.last() {
            None => FIRST_BUFFER_SIZE,
            Some(last) => last.size * 2,
        };
        while buffer_size < size {
            buffer_size *= 2;
        }
        buffer_size
    }

    /// Record a freshly-obtained buffer: bracket it with zero-size used
    /// sentinels and register the rest as one free block. Returns the index
    /// of that free block.
    pub fn install_buffer(&mut self, data: usize, size: usize) -> usize {
        self.add_buffer(data, size);
        self.add_used(data, 0);
        self.add_used(data + size, 0);
        self.add_free(data, size)
    }

    /// Try to carve `size` bytes (aligned to `alignment`) out of the free
    /// block at `free_index`. Returns the index of the new used block.
    pub fn alloc_from_free(
        &mut self,
        free_index: usize,
        size: usize,
        alignment: usize,
    ) -> Option<usize> {
        let free_block = self.free_blocks[free_index];
        debug_assert!(free_block.size >= size);

        let gap = free_block.data % alignment;
        let padding = if gap == 0 { 0 } else { alignment - gap };

        if free_block.size < padding || free_block.size - padding < size {
            return None;
        }
        let remaining = free_block.size - padding - size;

        self.free_blocks.remove(free_index);

        if padding > 0 {
            self.add_free(free_block.data, padding);
        }

        let used_data = free_block.data + padding;
        let used_index = self.add_used(used_data, size);

        if remaining > 0 {
            self.add_free(used_data + size, remaining);
        }

        Some(used_index)
    }

    /// Search the free registry for the first block able to hold `size`
    /// bytes aligned to `alignment`, and carve it. Does not grow the context.
    pub fn try_alloc(&mut self, size: usize, alignment: usize) -> Option<usize> {
        let mut i = self.free_block_index(size, 0);
        while i < self.free_blocks.len() {
            if let Some(used) = self.alloc_from_free(i, size, alignment) {
                return Some(used);
            }
            i += 1;
        }
        None
    }

    /// Try to grow the used block at `used_index` in place by consuming the
    /// free block that immediately follows it. Returns `true` on success.
    pub fn try_resize_in_place(&mut self, used_index: usize, new_size: usize) -> bool {
        let used_block = self.used_blocks[used_index];
        if new_size <= used_block.size {
            return true;
        }

        let next_used = self.used_blocks[used_index + 1];
        let size_avail_after = next_used.data - used_block.end();
        if used_block.size + size_avail_after < new_size {
            return false;
        }

        let free_index = self
            .find_free_block(size_avail_after, used_block.end())
            .expect("gap between used blocks must be covered by exactly one free block");

        let extra_needed = new_size - used_block.size;
        let free_block = self.free_blocks[free_index];
        let remaining_after = free_block.size - extra_needed;

        self.used_blocks[used_index].size = new_size;
        self.free_blocks.remove(free_index);

        if remaining_after > 0 {
            self.add_free(used_block.data + new_size, remaining_after);
        }

        true
    }

    /// Remove the used block at `used_index`, coalescing with its free
    /// neighbours across any gap. Returns `(data, size)` of the resulting
    /// free block.
    pub fn dealloc_used(&mut self, used_index: usize) -> (usize, usize) {
        let used_block = self.used_blocks[used_index];
        debug_assert!(used_block.size > 0);
        debug_assert!(used_index > 0);
        debug_assert!(used_index < self.used_blocks.len() - 1);

        let mut freed_data = used_block.data;
        let mut freed_size = used_block.size;

        let prev_used = self.used_blocks[used_index - 1];
        let prev_end = prev_used.end();
        let left_distance = used_block.data - prev_end;
        if left_distance > 0 {
            let left_index = self
                .find_free_block(left_distance, prev_end)
                .expect("left gap must be a free block");
            let left = self.free_blocks[left_index];
            freed_data -= left.size;
            freed_size += left.size;
            self.free_blocks.remove(left_index);
        }

        // Re-find the used block; removing a free block to the left never
        // moves used-block indices, but we look it up explicitly rather than
        // trust stale indices, the way a safe re-lookup should.
        let used_index = self
            .find_used_block(used_block.data)
            .expect("used block must still be registered");
        let next_used = self.used_blocks[used_index + 1];
        let used_end = used_block.end();
        let right_distance = next_used.data - used_end;
        if right_distance > 0 {
            let right_index = self
                .find_free_block(right_distance, used_end)
                .expect("right gap must be a free block");
            freed_size += self.free_blocks[right_index].size;
            self.free_blocks.remove(right_index);
        }

        self.used_blocks.remove(used_index);
        self.add_free(freed_data, freed_size);

        (freed_data, freed_size)
    }
}
