//! Heap integrity checking.
//!
//! Two surfaces over the same sweep:
//!
//! - [`Allocator::validate`] returns a [`Validity`] tallying every
//!   violation it can find, plus [`HeapStats`] gathered along the way.
//!   It never panics; a cyclic free list is recorded and the list walk
//!   skipped.
//! - [`Allocator::check_heap`] is the assertive form: it logs each
//!   violation through the `log` facade and panics if anything is
//!   wrong. Heap corruption is a programming bug in the allocator (or
//!   in a caller writing out of bounds), not a runtime condition.
//!
//! The sweep order matters: sentinels, then an address-ordered walk
//! over every block, then cycle detection over the free lists with the
//! two-pointer algorithm, and only once the lists are known to be
//! acyclic, the full list walk. A cyclic list would otherwise hang the
//! checker.
//!
//! With the `selfcheck` feature enabled, every allocator entry point
//! runs `check_heap(0)` before returning.

use log::{error, info};

use crate::alloc::{Allocator, BASE_BP};
use crate::block::{class_bracket, class_index, tag_alloc, tag_size, DSIZE, MIN_BLOCK, MIN_PAYLOAD, NUM_CLASSES, OVERHEAD, ROOTS_BYTES, WSIZE};
use crate::heap::HeapSource;

/// A tally of every invariant violation found in one sweep.
///
/// All zeroes means the heap is structurally sound.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Validity {
    /// Blocks or links pointing outside the heap.
    pub out_of_heap: usize,
    /// Payload offsets that are not 8-byte aligned.
    pub misaligned: usize,
    /// Blocks whose header and footer disagree.
    pub tag_mismatches: usize,
    /// Non-sentinel blocks smaller than the minimum block size, or
    /// with a misaligned payload span.
    pub undersized: usize,
    /// Free blocks with a free neighbor (coalescing missed).
    pub uncoalesced: usize,
    /// Broken prev/next symmetry, or a root with a non-null prev.
    pub bad_links: usize,
    /// Free blocks filed in a list whose bracket excludes their size.
    pub misfiled: usize,
    /// Allocated blocks found on a free list.
    pub allocated_in_list: usize,
    /// Malformed prologue or epilogue.
    pub bad_sentinels: usize,
    /// Free lists containing a cycle.
    pub cycles: usize,
    /// Free-block count disagreement between the heap walk and the
    /// list walk (dead free blocks, or doubly-listed ones).
    pub count_mismatches: usize,
}

impl Validity {
    /// True if no violations were recorded.
    pub fn is_valid(&self) -> bool {
        *self == Validity::default()
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

/// Totals gathered during the heap walk.
#[derive(Default, Debug, Clone, Copy)]
pub struct HeapStats {
    /// Regular blocks between the sentinels.
    pub blocks: usize,
    /// How many of them are free.
    pub free_blocks: usize,
    /// Total bytes held in free blocks, overhead included.
    pub free_bytes: usize,
    /// Size of the largest free block.
    pub largest_free: usize,
}

impl<H: HeapSource> Allocator<H> {
    /// Sweep the heap and report, without panicking.
    pub fn validate(&self) -> (Validity, HeapStats) {
        let mut validity = Validity::default();
        let mut stats = HeapStats::default();

        self.check_prefix(&mut validity);
        let heap_free = self.walk_heap(0, &mut validity, &mut stats);

        let cycles = self.cyclic_lists();
        if !cycles.is_empty() {
            validity.cycles = cycles.len();
            // Walking a cyclic list would never terminate.
            return (validity, stats);
        }

        let list_free = self.walk_free_lists(0, &mut validity);
        if heap_free != list_free {
            error!(
                "free-block count mismatch: {} in heap walk, {} in list walk",
                heap_free, list_free
            );
            validity.count_mismatches += 1;
        }

        (validity, stats)
    }

    /// Check the heap and panic on any violation.
    ///
    /// Verbosity 1 logs phase banners; 2 also dumps each block. A
    /// free-list cycle panics as soon as it is detected, before any
    /// full list traversal.
    pub fn check_heap(&self, verbosity: u32) {
        if verbosity > 0 {
            info!("check_heap: start");
        }

        let mut validity = Validity::default();
        let mut stats = HeapStats::default();

        self.check_prefix(&mut validity);
        let heap_free = self.walk_heap(verbosity, &mut validity, &mut stats);

        let cycles = self.cyclic_lists();
        if let Some(&class) = cycles.first() {
            error!("cycle detected in free list {}", class);
            panic!("cycle detected in free list {}", class);
        }
        if verbosity > 0 {
            info!("check_heap: no cycle in any free list");
        }

        let list_free = self.walk_free_lists(verbosity, &mut validity);
        if heap_free != list_free {
            error!(
                "free-block count mismatch: {} in heap walk, {} in list walk",
                heap_free, list_free
            );
            validity.count_mismatches += 1;
        }

        if !validity.is_valid() {
            panic!("heap check failed: {:?}", validity);
        }
        if verbosity > 0 {
            info!(
                "check_heap: ok ({} blocks, {} free)",
                stats.blocks, stats.free_blocks
            );
        }
    }

    /// Is `bp` a plausible payload offset: inside the heap, past the
    /// root area, with room to read its links?
    fn in_heap(&self, bp: usize) -> bool {
        bp >= BASE_BP && bp + MIN_PAYLOAD <= self.heap.size()
    }

    /// The list-root region and the sentinel blocks.
    fn check_prefix(&self, validity: &mut Validity) {
        // The prefix must have been laid down in full.
        if self.heap.size() < BASE_BP + DSIZE {
            error!("heap smaller than its own prefix");
            validity.bad_sentinels += 1;
            return;
        }

        // Root area: 13 links, then one pad word up to the prologue.
        if BASE_BP - ROOTS_BYTES != DSIZE || BASE_BP % DSIZE != 0 {
            error!("list-root area is not aligned with the prologue");
            validity.misaligned += 1;
        }

        let prologue = self.word(self.hdr(BASE_BP));
        if tag_size(prologue) != DSIZE || !tag_alloc(prologue) {
            error!("bad prologue header at {}", self.hdr(BASE_BP));
            validity.bad_sentinels += 1;
        }
        if self.word(self.hdr(BASE_BP)) != self.word(self.ftr(BASE_BP)) {
            error!("prologue header does not match its footer");
            validity.bad_sentinels += 1;
        }
    }

    /// Walk every block by address, checking each; returns how many
    /// free blocks were seen.
    fn walk_heap(&self, verbosity: u32, validity: &mut Validity, stats: &mut HeapStats) -> usize {
        let mut free_seen = 0;
        let mut bp = self.next_bp(BASE_BP);

        loop {
            // A corrupt size can send the walk anywhere; stop rather
            // than index out of the heap. The epilogue itself sits at
            // bp == heap size, its header in the last word.
            if bp < BASE_BP || bp > self.heap.size() {
                error!("heap walk left the heap at {}", bp);
                validity.out_of_heap += 1;
                return free_seen;
            }

            let size = self.block_size(bp);
            if size == 0 {
                break; // epilogue
            }
            if bp + size > self.heap.size() {
                error!("block {} of size {} runs off the heap", bp, size);
                validity.out_of_heap += 1;
                return free_seen;
            }

            if verbosity > 1 {
                self.log_block(bp);
            }

            self.check_block(bp, validity);
            self.check_coalesced(bp, validity);

            stats.blocks += 1;
            if !self.block_alloc(bp) {
                free_seen += 1;
                stats.free_blocks += 1;
                stats.free_bytes += size;
                stats.largest_free = stats.largest_free.max(size);
            }

            bp = self.next_bp(bp);
        }

        // The walk ends at the epilogue: size 0, allocated, flush with
        // the end of the heap.
        if !self.block_alloc(bp) || self.hdr(bp) + WSIZE != self.heap.size() {
            error!("bad epilogue header at {}", self.hdr(bp));
            validity.bad_sentinels += 1;
        }

        free_seen
    }

    /// Structural checks on a single regular block.
    fn check_block(&self, bp: usize, validity: &mut Validity) {
        if !self.in_heap(bp) {
            error!("block {} is not in the heap", bp);
            validity.out_of_heap += 1;
            return;
        }
        if bp % DSIZE != 0 {
            error!("block {} payload is not 8-byte aligned", bp);
            validity.misaligned += 1;
        }

        let size = self.block_size(bp);
        if self.ftr(bp) + WSIZE > self.heap.size() {
            error!("block {} footer lies outside the heap", bp);
            validity.out_of_heap += 1;
            return;
        }
        if self.word(self.hdr(bp)) != self.word(self.ftr(bp)) {
            error!("block {} header does not match footer", bp);
            validity.tag_mismatches += 1;
        }
        if (size - OVERHEAD) % DSIZE != 0 {
            error!("block {} payload span is not aligned", bp);
            validity.undersized += 1;
        }
        if size < MIN_BLOCK {
            error!("block {} is smaller than the minimum block", bp);
            validity.undersized += 1;
        }
    }

    /// A free block must have two allocated neighbors.
    fn check_coalesced(&self, bp: usize, validity: &mut Validity) {
        if self.block_alloc(bp) {
            return;
        }
        let next = self.next_bp(bp);
        if next > self.heap.size() {
            return; // the size itself is bad; the heap walk reports it
        }
        let prev_alloc = tag_alloc(self.word(bp - DSIZE));
        let next_alloc = self.block_alloc(next);
        if !prev_alloc || !next_alloc {
            error!("free block {} has a free neighbor", bp);
            validity.uncoalesced += 1;
        }
    }

    /// Find cyclic free lists with the two-pointer algorithm; the hare
    /// takes two hops for the tortoise's one, and they can only meet
    /// again on a cycle. Out-of-heap links end the scan of that list
    /// (the list walk reports them).
    fn cyclic_lists(&self) -> Vec<usize> {
        let mut cyclic = Vec::new();

        for class in 1..=NUM_CLASSES {
            let mut tortoise = self.root(class);
            let mut hare = self.root(class);

            while hare != 0 && self.in_heap(hare) {
                let hop = self.next_free(hare);
                if hop == 0 || !self.in_heap(hop) {
                    break;
                }
                hare = self.next_free(hop);

                tortoise = self.next_free(tortoise);
                if hare != 0 && hare == tortoise {
                    cyclic.push(class);
                    break;
                }
            }
        }

        cyclic
    }

    /// Walk every free list, checking membership invariants; returns
    /// how many blocks the lists hold. Must only run on acyclic lists.
    fn walk_free_lists(&self, verbosity: u32, validity: &mut Validity) -> usize {
        let mut listed = 0;

        for class in 1..=NUM_CLASSES {
            let root = self.root(class);
            if verbosity > 1 && root == 0 {
                info!("free list {} is empty", class);
            }

            let mut bp = root;
            while bp != 0 {
                if !self.in_heap(bp) {
                    error!("free list {} links to {} outside the heap", class, bp);
                    validity.out_of_heap += 1;
                    break; // cannot follow further
                }
                if bp % DSIZE != 0 {
                    error!("listed block {} is not aligned", bp);
                    validity.misaligned += 1;
                }
                if self.block_alloc(bp) {
                    error!("allocated block {} is on free list {}", bp, class);
                    validity.allocated_in_list += 1;
                }

                // Link symmetry, and a null prev at the root.
                let prev = self.prev_free(bp);
                let next = self.next_free(bp);
                if bp == root && prev != 0 {
                    error!("root block {} of list {} has a non-null prev", bp, class);
                    validity.bad_links += 1;
                }
                if next != 0 && self.in_heap(next) && self.prev_free(next) != bp {
                    error!("link mismatch between {} and {} in list {}", bp, next, class);
                    validity.bad_links += 1;
                }
                if prev != 0 && self.in_heap(prev) && self.next_free(prev) != bp {
                    error!("link mismatch between {} and {} in list {}", prev, bp, class);
                    validity.bad_links += 1;
                }

                // The block must be filed under its own size class.
                let size = self.block_size(bp);
                let (min, max) = class_bracket(class);
                if size <= min || max.is_some_and(|max| size > max) {
                    error!(
                        "block {} of size {} is misfiled in list {} (class {})",
                        bp,
                        size,
                        class,
                        class_index(size)
                    );
                    validity.misfiled += 1;
                }

                self.check_coalesced(bp, validity);

                if verbosity > 1 {
                    self.log_block(bp);
                }

                listed += 1;
                bp = next;
            }
        }

        listed
    }

    /// Dump one block through the log facade.
    fn log_block(&self, bp: usize) {
        let size = self.block_size(bp);
        let state = if self.block_alloc(bp) { 'a' } else { 'f' };
        if self.block_alloc(bp) {
            info!("  block {}: [{}:{}]", bp, size, state);
        } else {
            info!(
                "  block {}: [{}:{}] prev_free {} next_free {}",
                bp,
                size,
                state,
                self.prev_free(bp),
                self.next_free(bp)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::VecHeap;

    use test_log::test;

    fn fresh() -> Allocator<VecHeap> {
        Allocator::new(VecHeap::new()).unwrap()
    }

    /// Free three same-class blocks separated by live spacers, and
    /// return their offsets (in free-list order: last freed first).
    fn three_listed_blocks(a: &mut Allocator<VecHeap>) -> [usize; 3] {
        let mut listed = [0; 3];
        let mut spacers = Vec::new();
        for slot in listed.iter_mut() {
            *slot = a.alloc(100).unwrap();
            spacers.push(a.alloc(100).unwrap());
        }
        for &bp in &listed {
            a.free(bp);
        }
        listed.reverse();
        listed
    }

    #[test]
    fn fresh_heap_passes_verbose_check() {
        let a = fresh();
        a.check_heap(2);
        let (validity, stats) = a.validate();
        assert!(validity.is_valid(), "{:?}", validity);
        assert_eq!(stats.free_blocks, 1);
    }

    #[test]
    fn busy_heap_passes_check() {
        let mut a = fresh();
        let p = a.alloc(500).unwrap();
        let q = a.alloc(64).unwrap();
        a.free(p);
        let r = a.realloc(q, 2000).unwrap();
        a.calloc(16, 16).unwrap();
        a.free(r);
        a.check_heap(1);
    }

    #[test]
    fn validate_reports_a_cycle_without_hanging() {
        let mut a = fresh();
        let [first, _, third] = three_listed_blocks(&mut a);

        // Tie the tail of the class-4 list back to its head.
        a.set_next_free(third, first);

        let (validity, _) = a.validate();
        assert_eq!(validity.cycles, 1);
    }

    #[test]
    #[should_panic(expected = "cycle detected")]
    fn check_heap_panics_on_cycle() {
        let mut a = fresh();
        let [first, _, third] = three_listed_blocks(&mut a);
        a.set_next_free(third, first);
        a.check_heap(0);
    }

    #[test]
    fn validate_reports_tag_mismatch() {
        let mut a = fresh();
        let p = a.alloc(100).unwrap();

        // Clobber the footer's allocated bit.
        let ftr = a.ftr(p);
        let tag = a.word(ftr);
        a.set_word(ftr, tag & !1);

        let (validity, _) = a.validate();
        assert!(!validity.is_valid());
        assert!(validity.tag_mismatches > 0);
    }

    #[test]
    #[should_panic(expected = "heap check failed")]
    fn check_heap_panics_on_dead_free_block() {
        let mut a = fresh();
        let p = a.alloc(100).unwrap();
        let _spacer = a.alloc(100).unwrap();
        a.free(p);

        // Rip the block out of its list but leave it marked free: the
        // heap walk and the list walk now disagree.
        let size = a.block_size(p);
        let class = class_index(size);
        a.set_root(class, a.next_free(p));

        a.check_heap(0);
    }
}
