//! An open-addressing hash map backed by a [`Context`], replacing the
//! original's `map.c` (not in the filtered source set, but implied by its
//! use sites in `http.c` for `string_dict` and the client-id lookup table).
//!
//! Collisions are resolved with linear probing and Robin Hood backward-shift
//! deletion (Knuth 6.4, algorithm R): on insert, an entry that has probed
//! further than the one it collides with steals that slot and keeps
//! probing with the displaced entry; on remove, later entries slide back
//! one slot at a time until the probe sequence is restored.

use std::hash::{Hash, Hasher};
use std::mem;
use std::ptr::NonNull;
use votecore_context::Context;

enum Slot<K, V> {
    Empty,
    Occupied(u64, K, V),
}

const INITIAL_CAPACITY: usize = 8;

pub struct ContextMap<K, V> {
    ctx: Context,
    ptr: NonNull<Slot<K, V>>,
    cap: usize,
    len: usize,
    default: Option<V>,
}

unsafe impl<K: Send, V: Send> Send for ContextMap<K, V> {}
unsafe impl<K: Sync, V: Sync> Sync for ContextMap<K, V> {}

fn hash_of<K: Hash>(key: &K) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    // The map's "empty" sentinel is hash == 0; force real hashes off it,
    // matching the rule that the hash function must never return zero.
    hasher.finish() | 1
}

impl<K: Hash + Eq + Clone, V> ContextMap<K, V> {
    pub fn new(ctx: Context) -> Self {
        ContextMap {
            ctx,
            ptr: NonNull::dangling(),
            cap: 0,
            len: 0,
            default: None,
        }
    }

    pub fn with_default(ctx: Context, default: V) -> Self {
        let mut map = Self::new(ctx);
        map.default = Some(default);
        map
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn slots(&self) -> &[Slot<K, V>] {
        if self.cap == 0 {
            &[]
        } else {
            unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.cap) }
        }
    }

    fn slots_mut(&mut self) -> &mut [Slot<K, V>] {
        if self.cap == 0 {
            &mut []
        } else {
            unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.cap) }
        }
    }

    #[inline]
    fn home(hash: u64, cap: usize) -> usize {
        (hash as usize) & (cap - 1)
    }

    #[inline]
    fn distance(&self, slot_index: usize, hash: u64) -> usize {
        slot_index.wrapping_sub(Self::home(hash, self.cap)) & (self.cap - 1)
    }

    fn needs_grow(&self) -> bool {
        // Load factor <= 3/4.
        self.cap == 0 || (self.len + 1) * 4 > self.cap * 3
    }

    fn grow(&mut self) {
        let new_cap = if self.cap == 0 {
            INITIAL_CAPACITY
        } else {
            self.cap * 2
        };
        tracing::trace!(old_cap = self.cap, new_cap, "growing ContextMap");

        let raw = self
            .ctx
            .alloc_slice::<Slot<K, V>>(new_cap)
            .expect("context allocation failed");
        let new_ptr = NonNull::new(raw).expect("non-null allocation");
        unsafe {
            for i in 0..new_cap {
                new_ptr.as_ptr().add(i).write(Slot::Empty);
            }
        }

        let old_ptr = self.ptr;
        let old_cap = self.cap;
        self.ptr = new_ptr;
        self.cap = new_cap;
        self.len = 0;

        if old_cap > 0 {
            unsafe {
                for i in 0..old_cap {
                    let slot = old_ptr.as_ptr().add(i).read();
                    if let Slot::Occupied(hash, key, value) = slot {
                        self.insert_slot(hash, key, value);
                    }
                }
            }
            self.ctx.dealloc_raw(old_ptr.as_ptr() as usize);
        }
    }

    /// Robin Hood insertion of an already-hashed entry; used both by
    /// `insert` and by `grow`'s rehashing pass.
    fn insert_slot(&mut self, mut hash: u64, mut key: K, mut value: V) -> Option<V> {
        let mask = self.cap - 1;
        let mut index = Self::home(hash, self.cap);
        loop {
            let occupied = match &self.slots()[index] {
                Slot::Empty => None,
                Slot::Occupied(h, k, _) => Some((*h, k.clone())),
            };

            let (existing_hash, existing_key) = match occupied {
                None => {
                    self.slots_mut()[index] = Slot::Occupied(hash, key, value);
                    self.len += 1;
                    return None;
                }
                Some(pair) => pair,
            };

            if existing_hash == hash && existing_key == key {
                if let Slot::Occupied(_, _, v) = &mut self.slots_mut()[index] {
                    return Some(mem::replace(v, value));
                }
                unreachable!()
            }

            let existing_dist = self.distance(index, existing_hash);
            let incoming_dist = self.distance(index, hash);
            if incoming_dist > existing_dist {
                if let Slot::Occupied(eh, ek, ev) = &mut self.slots_mut()[index] {
                    mem::swap(eh, &mut hash);
                    mem::swap(ek, &mut key);
                    mem::swap(ev, &mut value);
                }
            }

            index = (index + 1) & mask;
        }
    }

    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        if self.needs_grow() {
            self.grow();
        }
        let hash = hash_of(&key);
        self.insert_slot(hash, key, value)
    }

    fn find_index(&self, key: &K) -> Option<usize> {
        if self.cap == 0 {
            return None;
        }
        let hash = hash_of(key);
        let mut index = Self::home(hash, self.cap);
        let mut dist = 0;
        loop {
            match &self.slots()[index] {
                Slot::Empty => return None,
                Slot::Occupied(h, k, _) => {
                    if *h == hash && k == key {
                        return Some(index);
                    }
                    let existing_dist = self.distance(index, *h);
                    if existing_dist < dist {
                        return None;
                    }
                }
            }
            index = (index + 1) & (self.cap - 1);
            dist += 1;
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        let index = self.find_index(key)?;
        match &self.slots()[index] {
            Slot::Occupied(_, _, v) => Some(v),
            Slot::Empty => unreachable!(),
        }
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let index = self.find_index(key)?;
        match &mut self.slots_mut()[index] {
            Slot::Occupied(_, _, v) => Some(v),
            Slot::Empty => unreachable!(),
        }
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.find_index(key).is_some()
    }

    /// Mirrors the original `map[-1]` default-slot trick with an explicit
    /// field: looks the key up, falling back to the map's stored default.
    pub fn get_or_default(&self, key: &K) -> &V
    where
        V: Sized,
    {
        self.get(key)
            .or(self.default.as_ref())
            .expect("get_or_default called on a map with no default configured")
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let index = self.find_index(key)?;
        let removed = match mem::replace(&mut self.slots_mut()[index], Slot::Empty) {
            Slot::Occupied(_, _, v) => v,
            Slot::Empty => unreachable!(),
        };
        self.len -= 1;
        self.backward_shift(index);
        Some(removed)
    }

    /// After clearing `hole`, slide every following run of entries back one
    /// slot as long as doing so doesn't increase their probe distance past
    /// zero, restoring the invariant that no entry sits further from home
    /// than it has to.
    fn backward_shift(&mut self, mut hole: usize) {
        let mask = self.cap - 1;
        loop {
            let next = (hole + 1) & mask;
            let should_move = match &self.slots()[next] {
                Slot::Empty => false,
                Slot::Occupied(h, _, _) => self.distance(next, *h) > 0,
            };
            if !should_move {
                break;
            }
            let moved = mem::replace(&mut self.slots_mut()[next], Slot::Empty);
            self.slots_mut()[hole] = moved;
            hole = next;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.slots().iter().filter_map(|slot| match slot {
            Slot::Occupied(_, k, v) => Some((k, v)),
            Slot::Empty => None,
        })
    }
}

impl<K, V> Drop for ContextMap<K, V> {
    fn drop(&mut self) {
        if self.cap > 0 {
            if mem::needs_drop::<Slot<K, V>>() {
                for slot in self.slots_mut() {
                    unsafe {
                        std::ptr::drop_in_place(slot);
                    }
                }
            }
            self.ctx.dealloc_raw(self.ptr.as_ptr() as usize);
        }
    }
}
