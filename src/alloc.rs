//! The segregated free-list allocator.
//!
//! [`Allocator`] manages a [`HeapSource`] as a run of boundary-tagged
//! blocks (see [`crate::block`]) and keeps free blocks on thirteen
//! doubly-linked lists segregated by size class. Allocation is
//! first-fit within a class, escalating to larger classes; blocks are
//! split when the surplus can stand alone as a block, and freed blocks
//! are coalesced with both neighbors immediately.
//!
//! The heap layout is fixed at construction:
//!
//! ```text
//! [13 list roots][pad][prologue hdr|ftr][blocks ...][epilogue hdr]
//! ```
//!
//! The prologue and epilogue are permanently allocated sentinels so
//! boundary-tag lookups at the heap edges never need a special case.
//!
//! The allocator is single-threaded by design: no locking, no
//! reentrancy. [`SharedAllocator`] wraps one in a spin lock for callers
//! that need to serialize access from several threads.

use log::debug;

use crate::block::{
    adjust_size, class_index, get_link, get_word, pack, put_link, put_word, tag_alloc, tag_size,
    CHUNKSIZE, DSIZE, MIN_BLOCK, NUM_CLASSES, OVERHEAD, ROOTS_BYTES, WSIZE,
};
use crate::heap::{HeapError, HeapSource};

/// Offset of the prologue block's payload; the anchor for heap walks.
pub(crate) const BASE_BP: usize = ROOTS_BYTES + DSIZE;

/// A segregated free-list allocator over a growable heap region.
///
/// All operations take and return *heap offsets* (the address of a
/// block's payload); 0 stands for null. Offsets stay valid until the
/// block is freed. Payload bytes are reached through [`payload`] and
/// [`payload_mut`](Allocator::payload_mut), since callers cannot
/// dereference an offset themselves.
///
/// [`payload`]: Allocator::payload
pub struct Allocator<H> {
    pub(crate) heap: H,
}

impl<H: HeapSource> Allocator<H> {
    /// Initialize an allocator over a fresh heap: lay down the list
    /// roots, the prologue and epilogue sentinels, and one initial free
    /// block of [`CHUNKSIZE`] bytes.
    ///
    /// Panics if the heap is not empty; the root area must sit at
    /// offset 0.
    pub fn new(mut heap: H) -> Result<Allocator<H>, HeapError> {
        assert!(heap.size() == 0, "Allocator requires an empty heap");

        // Root area first; extend zeroes it, which nulls every list.
        heap.extend(ROOTS_BYTES)?;
        let base = heap.extend(4 * WSIZE)?;

        let mut alloc = Allocator { heap };
        alloc.set_word(base, 0); // alignment padding
        alloc.set_word(base + WSIZE, pack(DSIZE, true)); // prologue header
        alloc.set_word(base + 2 * WSIZE, pack(DSIZE, true)); // prologue footer
        alloc.set_word(base + 3 * WSIZE, pack(0, true)); // epilogue header

        alloc.extend_heap(CHUNKSIZE / WSIZE)?;

        #[cfg(feature = "selfcheck")]
        alloc.check_heap(0);

        Ok(alloc)
    }

    /// Allocate a block with room for `size` payload bytes. Returns the
    /// payload offset, or `None` if `size` is 0 or the heap cannot grow.
    pub fn alloc(&mut self, size: usize) -> Option<usize> {
        if size == 0 {
            return None;
        }

        let a_size = adjust_size(size);

        let bp = match self.find_fit(a_size) {
            Some(bp) => bp,
            None => {
                // No fit anywhere; grow the heap and place there.
                let words = a_size.max(CHUNKSIZE) / WSIZE;
                match self.extend_heap(words) {
                    Ok(bp) => bp,
                    Err(err) => {
                        debug!("alloc({}) failed to extend heap: {}", size, err);
                        return None;
                    }
                }
            }
        };

        self.place(bp, a_size);
        debug!("alloc({}) -> block of {} at {}", size, a_size, bp);

        #[cfg(feature = "selfcheck")]
        self.check_heap(0);

        Some(bp)
    }

    /// Free the block at `bp`. Freeing 0 is a no-op. The block is
    /// coalesced with any free neighbor and reinserted into its list.
    ///
    /// `bp` must be an offset returned by [`alloc`](Allocator::alloc),
    /// [`realloc`](Allocator::realloc) or [`calloc`](Allocator::calloc)
    /// and not freed since.
    pub fn free(&mut self, bp: usize) {
        if bp == 0 {
            return;
        }

        let size = self.block_size(bp);
        self.set_word(self.hdr(bp), pack(size, false));
        self.set_word(bp + size - DSIZE, pack(size, false));
        self.coalesce(bp);
        debug!("free({}) released {} bytes", bp, size);

        #[cfg(feature = "selfcheck")]
        self.check_heap(0);
    }

    /// Resize the block at `bp` to hold `size` payload bytes.
    ///
    /// Shrinks in place when the surplus can stand alone; grows in
    /// place when the next block is free and large enough; otherwise
    /// allocates fresh, copies the payload, and frees the old block.
    /// `realloc(0, size)` is `alloc(size)`; `realloc(bp, 0)` frees and
    /// returns `None`. On allocation failure the old block is left
    /// untouched and `None` is returned.
    pub fn realloc(&mut self, bp: usize, size: usize) -> Option<usize> {
        if size == 0 {
            self.free(bp);
            return None;
        }
        if bp == 0 {
            return self.alloc(size);
        }

        let old_size = self.block_size(bp);
        let new_size = adjust_size(size);

        if new_size == old_size {
            return Some(bp);
        }

        if new_size < old_size {
            // Shrink in place, splitting off the tail when it is big
            // enough to be a block of its own.
            if old_size - new_size >= MIN_BLOCK {
                self.set_word(self.hdr(bp), pack(new_size, true));
                self.set_word(bp + new_size - DSIZE, pack(new_size, true));

                let rest = bp + new_size;
                self.set_word(self.hdr(rest), pack(old_size - new_size, false));
                self.set_word(rest + (old_size - new_size) - DSIZE, pack(old_size - new_size, false));
                self.coalesce(rest);
            }

            #[cfg(feature = "selfcheck")]
            self.check_heap(0);

            return Some(bp);
        }

        // Growing. Try to absorb the next block before falling back to
        // allocate-copy-free.
        let next = self.next_bp(bp);
        let next_alloc = self.block_alloc(next);
        let next_size = self.block_size(next);
        let growth = new_size - old_size;

        if !next_alloc && next_size > growth {
            self.remove_free_block(next);

            if next_size - growth >= MIN_BLOCK {
                // Take what we need and re-emit the remainder as free.
                self.set_word(self.hdr(bp), pack(new_size, true));
                self.set_word(bp + new_size - DSIZE, pack(new_size, true));

                let rest = bp + new_size;
                self.set_word(self.hdr(rest), pack(next_size - growth, false));
                self.set_word(rest + (next_size - growth) - DSIZE, pack(next_size - growth, false));
                self.coalesce(rest);
            } else {
                // Too small to split; absorb the whole successor.
                self.set_word(self.hdr(bp), pack(old_size + next_size, true));
                self.set_word(bp + (old_size + next_size) - DSIZE, pack(old_size + next_size, true));
            }

            #[cfg(feature = "selfcheck")]
            self.check_heap(0);

            return Some(bp);
        }

        // No room to grow in place; move.
        let new_bp = self.alloc(size)?;
        let payload = old_size - OVERHEAD;
        self.heap.bytes_mut().copy_within(bp..bp + payload, new_bp);
        self.free(bp);

        #[cfg(feature = "selfcheck")]
        self.check_heap(0);

        Some(new_bp)
    }

    /// Allocate room for `n * size` payload bytes and zero them.
    /// Returns `None` on overflow, a zero-byte request, or heap
    /// exhaustion.
    pub fn calloc(&mut self, n: usize, size: usize) -> Option<usize> {
        let total = n.checked_mul(size)?;
        let bp = self.alloc(total)?;
        self.heap.bytes_mut()[bp..bp + total].fill(0);
        Some(bp)
    }

    /// The payload bytes of the allocated block at `bp`.
    pub fn payload(&self, bp: usize) -> &[u8] {
        let n = self.block_size(bp) - OVERHEAD;
        &self.heap.bytes()[bp..bp + n]
    }

    /// The payload bytes of the allocated block at `bp`, mutably.
    pub fn payload_mut(&mut self, bp: usize) -> &mut [u8] {
        let n = self.block_size(bp) - OVERHEAD;
        &mut self.heap.bytes_mut()[bp..bp + n]
    }

    /// Total heap size in bytes, sentinels and roots included.
    pub fn heap_size(&self) -> usize {
        self.heap.size()
    }

    /// The block size recorded in the header at `bp`.
    pub fn block_size(&self, bp: usize) -> usize {
        tag_size(self.word(self.hdr(bp)))
    }

    /// The allocated bit recorded in the header at `bp`.
    pub fn block_alloc(&self, bp: usize) -> bool {
        tag_alloc(self.word(self.hdr(bp)))
    }

    ////////////////////////////////////////////////////////////
    // Heap growth, placement, coalescing

    /// Extend the heap by `words` 4-byte words, rounded up to keep the
    /// payload alignment, and fold the new region in as one free block.
    fn extend_heap(&mut self, words: usize) -> Result<usize, HeapError> {
        let mut size = if words % 2 == 1 {
            (words + 1) * WSIZE
        } else {
            words * WSIZE
        };
        if size < MIN_BLOCK {
            size = MIN_BLOCK;
        }

        let bp = self.heap.extend(size)?;
        debug!("extend_heap: {} bytes at {}", size, bp);

        // The new block's header lands where the old epilogue sat; a
        // fresh epilogue closes off the new end of the heap.
        self.set_word(self.hdr(bp), pack(size, false));
        self.set_word(bp + size - DSIZE, pack(size, false));
        self.set_word(self.hdr(bp + size), pack(0, true));

        // The old tail block may have been free.
        Ok(self.coalesce(bp))
    }

    /// Mark the free block at `bp` allocated with `a_size` bytes,
    /// splitting off the surplus when it can stand alone as a block.
    fn place(&mut self, bp: usize, a_size: usize) {
        let csize = self.block_size(bp);
        self.remove_free_block(bp);

        if csize - a_size >= MIN_BLOCK {
            self.set_word(self.hdr(bp), pack(a_size, true));
            self.set_word(bp + a_size - DSIZE, pack(a_size, true));

            let rest = bp + a_size;
            self.set_word(self.hdr(rest), pack(csize - a_size, false));
            self.set_word(rest + (csize - a_size) - DSIZE, pack(csize - a_size, false));
            debug!("place: split {} into {} + {}", csize, a_size, csize - a_size);
            self.coalesce(rest);
        } else {
            self.set_word(self.hdr(bp), pack(csize, true));
            self.set_word(bp + csize - DSIZE, pack(csize, true));
        }
    }

    /// Merge the free block at `bp` with whichever neighbors are free,
    /// insert the result into its list, and return its offset.
    fn coalesce(&mut self, mut bp: usize) -> usize {
        // The previous block's footer sits just under our header.
        let prev_is_free = !tag_alloc(self.word(bp - DSIZE));
        let next = self.next_bp(bp);
        let next_is_free = !self.block_alloc(next);
        let mut size = self.block_size(bp);

        match (prev_is_free, next_is_free) {
            (false, false) => {}
            (false, true) => {
                self.remove_free_block(next);
                size += self.block_size(next);
                self.set_word(self.hdr(bp), pack(size, false));
                self.set_word(bp + size - DSIZE, pack(size, false));
            }
            (true, false) => {
                let prev = self.prev_bp(bp);
                self.remove_free_block(prev);
                size += self.block_size(prev);
                // Our footer stays put; the merged header moves to prev.
                let ftr = bp + self.block_size(bp) - DSIZE;
                self.set_word(ftr, pack(size, false));
                self.set_word(self.hdr(prev), pack(size, false));
                bp = prev;
            }
            (true, true) => {
                let prev = self.prev_bp(bp);
                self.remove_free_block(prev);
                self.remove_free_block(next);
                size += self.block_size(prev) + self.block_size(next);
                let ftr = next + self.block_size(next) - DSIZE;
                self.set_word(self.hdr(prev), pack(size, false));
                self.set_word(ftr, pack(size, false));
                bp = prev;
            }
        }

        self.insert_free_block(bp);
        bp
    }

    ////////////////////////////////////////////////////////////
    // Free-list management

    /// First-fit search: scan the list for the adjusted size's class,
    /// then every larger class, head to tail.
    fn find_fit(&self, a_size: usize) -> Option<usize> {
        for class in class_index(a_size)..=NUM_CLASSES {
            let mut bp = self.root(class);
            while bp != 0 {
                if self.block_size(bp) >= a_size {
                    return Some(bp);
                }
                bp = self.next_free(bp);
            }
        }
        None
    }

    /// Push the free block at `bp` onto the head of its class's list.
    fn insert_free_block(&mut self, bp: usize) {
        let class = class_index(self.block_size(bp));
        let head = self.root(class);

        self.set_prev_free(bp, 0);
        self.set_next_free(bp, head);
        if head != 0 {
            self.set_prev_free(head, bp);
        }
        self.set_root(class, bp);
    }

    /// Unlink the free block at `bp` from its class's list.
    fn remove_free_block(&mut self, bp: usize) {
        let class = class_index(self.block_size(bp));
        let prev = self.prev_free(bp);
        let next = self.next_free(bp);

        if prev == 0 {
            self.set_root(class, next);
        } else {
            self.set_next_free(prev, next);
        }
        if next != 0 {
            self.set_prev_free(next, prev);
        }
    }

    ////////////////////////////////////////////////////////////
    // Raw block arithmetic and encoding. The checker shares these.

    pub(crate) fn word(&self, at: usize) -> u32 {
        get_word(self.heap.bytes(), at)
    }

    pub(crate) fn set_word(&mut self, at: usize, word: u32) {
        put_word(self.heap.bytes_mut(), at, word)
    }

    /// Header offset of the block whose payload is at `bp`.
    pub(crate) fn hdr(&self, bp: usize) -> usize {
        bp - WSIZE
    }

    /// Footer offset of the block at `bp`.
    pub(crate) fn ftr(&self, bp: usize) -> usize {
        bp + self.block_size(bp) - DSIZE
    }

    /// Payload offset of the block physically after `bp`.
    pub(crate) fn next_bp(&self, bp: usize) -> usize {
        bp + self.block_size(bp)
    }

    /// Payload offset of the block physically before `bp`, via its
    /// boundary tag.
    pub(crate) fn prev_bp(&self, bp: usize) -> usize {
        bp - tag_size(self.word(bp - DSIZE))
    }

    /// The previous link embedded in the free block at `bp`.
    pub(crate) fn prev_free(&self, bp: usize) -> usize {
        get_link(self.heap.bytes(), bp)
    }

    /// The next link embedded in the free block at `bp`.
    pub(crate) fn next_free(&self, bp: usize) -> usize {
        get_link(self.heap.bytes(), bp + DSIZE)
    }

    pub(crate) fn set_prev_free(&mut self, bp: usize, link: usize) {
        put_link(self.heap.bytes_mut(), bp, link)
    }

    pub(crate) fn set_next_free(&mut self, bp: usize, link: usize) {
        put_link(self.heap.bytes_mut(), bp + DSIZE, link)
    }

    /// The head of the free list for 1-based `class`.
    pub(crate) fn root(&self, class: usize) -> usize {
        get_link(self.heap.bytes(), (class - 1) * DSIZE)
    }

    pub(crate) fn set_root(&mut self, class: usize, bp: usize) {
        put_link(self.heap.bytes_mut(), (class - 1) * DSIZE, bp)
    }
}

/// A spin-locked [`Allocator`] for use from several threads.
///
/// The core allocator does no locking of its own; this wrapper
/// serializes every entry point behind one [`spin::Mutex`].
pub struct SharedAllocator<H> {
    inner: spin::Mutex<Allocator<H>>,
}

impl<H: HeapSource> SharedAllocator<H> {
    pub fn new(alloc: Allocator<H>) -> SharedAllocator<H> {
        SharedAllocator {
            inner: spin::Mutex::new(alloc),
        }
    }

    /// Lock the allocator for a sequence of operations.
    pub fn lock(&self) -> spin::MutexGuard<'_, Allocator<H>> {
        self.inner.lock()
    }

    pub fn alloc(&self, size: usize) -> Option<usize> {
        self.inner.lock().alloc(size)
    }

    pub fn free(&self, bp: usize) {
        self.inner.lock().free(bp)
    }

    pub fn realloc(&self, bp: usize, size: usize) -> Option<usize> {
        self.inner.lock().realloc(bp, size)
    }

    pub fn calloc(&self, n: usize, size: usize) -> Option<usize> {
        self.inner.lock().calloc(n, size)
    }
}
