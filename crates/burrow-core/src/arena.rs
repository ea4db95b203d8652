//! Chunked slab arena with stable indices.
//!
//! Trie nodes are linked by `u32` indices rather than pointers, so the
//! backing storage must never move. The arena grows by appending chunks of
//! doubling size and hands out indices from a lock-free bump counter plus a
//! free list of reclaimed slots.
//!
//! Reuse discipline: a slot may be released only once nothing can reach its
//! index — for the store that means the node was unhooked from the trie
//! under the writer lock and has left both maintenance lists. Under that
//! rule a released index cannot resurface at the top of the free list while
//! a concurrent allocation is mid-pop, so the plain compare-exchange pop is
//! ABA-free.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::OnceLock;

/// Nil index sentinel.
pub const NIL: u32 = u32::MAX;

/// Capacity of the first chunk; chunk `c` holds `CHUNK_BASE << c` slots.
const CHUNK_BASE: usize = 64;

/// Upper bound on chunk count (caps the arena at ~2 billion slots).
const MAX_CHUNKS: usize = 25;

/// Total slot capacity across all chunks.
const MAX_SLOTS: u32 = (CHUNK_BASE * ((1 << MAX_CHUNKS) - 1)) as u32;

/// A type that can live in an [`Arena`]. The free link is an atomic the
/// arena may use to thread the slot onto its free list while released.
pub trait Slot: Default {
    fn free_link(&self) -> &AtomicU32;
}

/// Append-only chunked slab. Slots are never moved or dropped before the
/// arena itself is dropped; `release` only recycles the index.
pub struct Arena<T: Slot> {
    chunks: [OnceLock<Box<[T]>>; MAX_CHUNKS],
    /// Bump high-water mark
    len: AtomicU32,
    /// Free-list head (NIL when empty)
    free: AtomicU32,
    /// Live slot count, for introspection
    in_use: AtomicUsize,
}

impl<T: Slot> Arena<T> {
    pub fn new() -> Self {
        Self {
            chunks: std::array::from_fn(|_| OnceLock::new()),
            len: AtomicU32::new(0),
            free: AtomicU32::new(NIL),
            in_use: AtomicUsize::new(0),
        }
    }

    /// Allocate a slot index, reusing a released one when available.
    /// Returns `None` once the arena is exhausted.
    pub fn alloc(&self) -> Option<u32> {
        loop {
            let head = self.free.load(Ordering::Acquire);
            if head == NIL {
                break;
            }
            let next = self.get(head).free_link().load(Ordering::Relaxed);
            if self
                .free
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.in_use.fetch_add(1, Ordering::Relaxed);
                return Some(head);
            }
        }

        let index = self.len.fetch_add(1, Ordering::Relaxed);
        if index >= MAX_SLOTS {
            self.len.fetch_sub(1, Ordering::Relaxed);
            return None;
        }
        // Touch the owning chunk so the slot exists before the index leaks.
        let (chunk, _) = Self::locate(index);
        self.chunk(chunk);
        self.in_use.fetch_add(1, Ordering::Relaxed);
        Some(index)
    }

    /// Recycle a slot index. The caller guarantees the index is unreachable.
    pub fn release(&self, index: u32) {
        let slot = self.get(index);
        loop {
            let head = self.free.load(Ordering::Acquire);
            slot.free_link().store(head, Ordering::Relaxed);
            if self
                .free
                .compare_exchange(head, index, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        self.in_use.fetch_sub(1, Ordering::Relaxed);
    }

    /// Access a slot by index.
    pub fn get(&self, index: u32) -> &T {
        let (chunk, offset) = Self::locate(index);
        &self.chunk(chunk)[offset]
    }

    /// Number of slots currently allocated.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    fn chunk(&self, chunk: usize) -> &[T] {
        self.chunks[chunk].get_or_init(|| {
            let capacity = CHUNK_BASE << chunk;
            (0..capacity).map(|_| T::default()).collect()
        })
    }

    /// Map a flat index to (chunk, offset) for geometrically growing chunks.
    fn locate(index: u32) -> (usize, usize) {
        let index = index as usize;
        let chunk = (index / CHUNK_BASE + 1).ilog2() as usize;
        let start = CHUNK_BASE * ((1 << chunk) - 1);
        (chunk, index - start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[derive(Default)]
    struct TestSlot {
        link: AtomicU32,
    }

    impl Slot for TestSlot {
        fn free_link(&self) -> &AtomicU32 {
            &self.link
        }
    }

    #[test]
    fn test_locate_geometry() {
        assert_eq!(Arena::<TestSlot>::locate(0), (0, 0));
        assert_eq!(Arena::<TestSlot>::locate(63), (0, 63));
        assert_eq!(Arena::<TestSlot>::locate(64), (1, 0));
        assert_eq!(Arena::<TestSlot>::locate(191), (1, 127));
        assert_eq!(Arena::<TestSlot>::locate(192), (2, 0));
    }

    #[test]
    fn test_alloc_monotonic_without_release() {
        let arena = Arena::<TestSlot>::new();
        for expected in 0..200u32 {
            assert_eq!(arena.alloc(), Some(expected));
        }
        assert_eq!(arena.in_use(), 200);
    }

    #[test]
    fn test_release_reuses_slot() {
        let arena = Arena::<TestSlot>::new();
        let a = arena.alloc().unwrap();
        let b = arena.alloc().unwrap();
        arena.release(a);
        assert_eq!(arena.alloc(), Some(a));
        arena.release(b);
        arena.release(a);
        // LIFO reuse.
        assert_eq!(arena.alloc(), Some(a));
        assert_eq!(arena.alloc(), Some(b));
    }

    #[test]
    fn test_concurrent_alloc_unique_indices() {
        let arena = Arc::new(Arena::<TestSlot>::new());
        let mut handles = vec![];
        for _ in 0..4 {
            let arena = Arc::clone(&arena);
            handles.push(std::thread::spawn(move || {
                (0..500).map(|_| arena.alloc().unwrap()).collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for index in handle.join().unwrap() {
                assert!(seen.insert(index), "index {} handed out twice", index);
            }
        }
        assert_eq!(seen.len(), 2000);
    }
}
