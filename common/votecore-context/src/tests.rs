use crate::Context;
use proptest::prelude::*;

#[test]
fn allocates_distinct_non_overlapping_blocks() {
    let ctx = Context::new_root();
    let a = ctx.alloc_raw(64, 8).unwrap();
    let b = ctx.alloc_raw(64, 8).unwrap();
    assert_ne!(a, b);
    assert!(a + 64 <= b || b + 64 <= a);
}

#[test]
fn writes_survive_through_the_returned_address() {
    let ctx = Context::new_root();
    let addr = ctx.alloc_raw(32, 8).unwrap();
    unsafe {
        let ptr = addr as *mut u8;
        for i in 0..32u8 {
            *ptr.add(i as usize) = i;
        }
        for i in 0..32u8 {
            assert_eq!(*ptr.add(i as usize), i);
        }
    }
}

#[test]
fn dealloc_lets_the_space_be_reused() {
    let ctx = Context::new_root();
    let a = ctx.alloc_raw(4096, 8).unwrap();
    ctx.dealloc_raw(a);
    let b = ctx.alloc_raw(4096, 8).unwrap();
    assert_eq!(a, b);
}

#[test]
fn resize_grows_in_place_when_the_tail_is_free() {
    let ctx = Context::new_root();
    let a = ctx.alloc_raw(64, 8).unwrap();
    let b = ctx.alloc_raw(64, 8).unwrap();
    ctx.dealloc_raw(b);
    let grown = ctx.resize_raw(a, 128, 8).unwrap();
    assert_eq!(grown, a);
}

#[test]
fn shrinking_resize_is_a_true_no_op() {
    let ctx = Context::new_root();
    let a = ctx.alloc_raw(128, 8).unwrap();
    let shrunk = ctx.resize_raw(a, 16, 8).unwrap();
    assert_eq!(shrunk, a, "shrink must return the same address");
    // The block must still cover its original 128 bytes, not just the
    // requested 16 — otherwise the "freed" tail is covered by no block at
    // all, and a later dealloc of `a` would find no free block to coalesce
    // with across that gap.
    ctx.dealloc_raw(a);
    let b = ctx.alloc_raw(128, 8).unwrap();
    assert_eq!(b, a, "the whole original block must be reusable after dealloc");
}

#[test]
fn resize_preserves_bytes_when_it_has_to_move() {
    let ctx = Context::new_root();
    let a = ctx.alloc_raw(16, 8).unwrap();
    unsafe {
        std::ptr::write_bytes(a as *mut u8, 0xab, 16);
    }
    // Force a move by keeping the neighbouring space occupied.
    let _pin = ctx.alloc_raw(16, 8).unwrap();
    let grown = ctx.resize_raw(a, 4096, 8).unwrap();
    unsafe {
        for i in 0..16 {
            assert_eq!(*((grown + i) as *const u8), 0xab);
        }
    }
}

#[test]
fn child_context_grows_by_allocating_from_its_parent() {
    let parent = Context::new_root();
    let child = parent.new_child();
    let _addr = child.alloc_raw(64, 8).unwrap();
}

#[test]
fn reset_frees_everything_but_keeps_buffers_reusable() {
    let ctx = Context::new_root();
    let a = ctx.alloc_raw(128, 8).unwrap();
    ctx.reset();
    let b = ctx.alloc_raw(128, 8).unwrap();
    assert_eq!(a, b);
}

#[test]
fn copy_string_round_trips_and_is_nul_terminated() {
    let ctx = Context::new_root();
    let addr = ctx.copy_string("hello").unwrap();
    unsafe {
        let slice = std::slice::from_raw_parts(addr as *const u8, 6);
        assert_eq!(&slice[..5], b"hello");
        assert_eq!(slice[5], 0);
    }
}

#[test]
fn many_allocations_force_the_context_to_grow_multiple_buffers() {
    let ctx = Context::new_root();
    let mut addrs = Vec::new();
    for _ in 0..2000 {
        addrs.push(ctx.alloc_raw(64, 8).unwrap());
    }
    addrs.sort_unstable();
    addrs.dedup();
    assert_eq!(addrs.len(), 2000);
}

proptest! {
    #[test]
    fn alloc_dealloc_sequence_never_corrupts_the_registry(
        ops in prop::collection::vec((0usize..4096, any::<bool>()), 1..200)
    ) {
        let ctx = Context::new_root();
        let mut live = Vec::new();
        for (size, should_free) in ops {
            let size = size.max(1);
            let addr = ctx.alloc_raw(size, 8).unwrap();
            live.push(addr);
            if should_free && !live.is_empty() {
                let victim = live.swap_remove(size % live.len());
                ctx.dealloc_raw(victim);
            }
        }
    }

    #[test]
    fn resized_block_always_keeps_its_prefix(
        initial in 1usize..256,
        grown in 1usize..8192,
    ) {
        let ctx = Context::new_root();
        let addr = ctx.alloc_raw(initial, 8).unwrap();
        unsafe { std::ptr::write_bytes(addr as *mut u8, 0x5a, initial); }
        let new_addr = ctx.resize_raw(addr, grown, 8).unwrap();
        let check_len = initial.min(grown);
        unsafe {
            for i in 0..check_len {
                prop_assert_eq!(*((new_addr + i) as *const u8), 0x5a);
            }
        }
    }
}
