use rand::distributions::{Distribution, Uniform};
use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};
use test_log::test;

use segalloc::block::{adjust_size, ALIGNMENT};
use segalloc::{Allocator, VecHeap};

/// Bytes of heap taken up by the list roots, the alignment pad, the
/// prologue, and the epilogue.
const PREFIX: usize = 13 * 8 + 16;

/// One live allocation: its offset, its requested size, and the byte
/// it was filled with.
#[derive(Clone, Copy)]
struct Live {
    bp: usize,
    requested: usize,
    fill: u8,
}

fn validate(allocator: &Allocator<VecHeap>, live: &[Option<Live>]) {
    let (validity, stats) = allocator.validate();
    assert!(validity.is_valid(), "corrupt heap: {:?}", validity);

    let mut live_bytes = 0;
    for entry in live.iter().flatten() {
        // Every outstanding allocation is aligned, big enough, and
        // still allocated.
        assert_eq!(entry.bp % ALIGNMENT, 0);
        assert!(allocator.block_alloc(entry.bp));
        assert!(allocator.block_size(entry.bp) >= adjust_size(entry.requested));

        // Its payload is untouched: any overlap between allocations
        // would scribble over another entry's fill byte.
        let payload = &allocator.payload(entry.bp)[..entry.requested];
        assert!(
            payload.iter().all(|&b| b == entry.fill),
            "payload of block at {} was clobbered",
            entry.bp
        );

        live_bytes += allocator.block_size(entry.bp);
    }

    // Every heap byte is accounted for: prefix, live blocks, free
    // blocks.
    assert_eq!(
        live_bytes + stats.free_bytes + PREFIX,
        allocator.heap_size(),
        "space leaked or double-counted"
    );
}

#[test]
fn random_workload_stays_consistent() {
    let seed: u64 = rand::thread_rng().next_u64();
    log::info!("Using seed {}", seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let sizes = Uniform::new_inclusive(1usize, 768);

    let mut allocator = Allocator::new(VecHeap::new()).unwrap();
    let mut live: [Option<Live>; 64] = [None; 64];
    let mut fill: u8 = 0;

    for round in 0..2048 {
        let slot = rng.gen_range(0..live.len());

        match live[slot] {
            None => {
                let requested = sizes.sample(&mut rng);
                fill = fill.wrapping_add(1);

                let bp = allocator
                    .alloc(requested)
                    .expect("an unbounded heap never runs out");
                allocator.payload_mut(bp)[..requested].fill(fill);
                live[slot] = Some(Live {
                    bp,
                    requested,
                    fill,
                });
            }
            Some(entry) if rng.gen_bool(0.3) => {
                // Resize instead of freeing, a third of the time.
                let requested = sizes.sample(&mut rng);
                let bp = allocator
                    .realloc(entry.bp, requested)
                    .expect("an unbounded heap never runs out");

                // The surviving prefix must be byte-identical.
                let kept = requested.min(entry.requested);
                assert!(allocator.payload(bp)[..kept].iter().all(|&b| b == entry.fill));

                fill = fill.wrapping_add(1);
                allocator.payload_mut(bp)[..requested].fill(fill);
                live[slot] = Some(Live {
                    bp,
                    requested,
                    fill,
                });
            }
            Some(entry) => {
                allocator.free(entry.bp);
                live[slot] = None;
            }
        }

        validate(&allocator, &live);

        if round % 512 == 0 {
            let (_, stats) = allocator.validate();
            log::info!(
                "round {}: heap {} bytes, {} free blocks ({} bytes, largest {})",
                round,
                allocator.heap_size(),
                stats.free_blocks,
                stats.free_bytes,
                stats.largest_free
            );
        }
    }
}

#[test]
fn drain_everything_and_refill() {
    let seed: u64 = rand::thread_rng().next_u64();
    log::info!("Using seed {}", seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let sizes = Uniform::new_inclusive(1usize, 256);

    let mut allocator = Allocator::new(VecHeap::new()).unwrap();

    for _ in 0..8 {
        let mut live: Vec<usize> = (0..128)
            .map(|_| allocator.alloc(sizes.sample(&mut rng)).unwrap())
            .collect();
        live.shuffle(&mut rng);
        for bp in live {
            allocator.free(bp);
        }

        // With everything freed, full coalescing leaves exactly one
        // free block spanning the whole heap past the prefix.
        let (validity, stats) = allocator.validate();
        assert!(validity.is_valid(), "{:?}", validity);
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.free_bytes, allocator.heap_size() - PREFIX);
    }
}

#[test]
fn bounded_heap_recovers_from_exhaustion() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let sizes = Uniform::new_inclusive(1usize, 128);

    let mut allocator = Allocator::new(VecHeap::with_limit(8 * 1024)).unwrap();
    let mut live = Vec::new();

    // Fill to the brim.
    loop {
        match allocator.alloc(sizes.sample(&mut rng)) {
            Some(bp) => live.push(bp),
            None => break,
        }
    }
    assert!(!live.is_empty());

    let (validity, _) = allocator.validate();
    assert!(validity.is_valid(), "{:?}", validity);

    // Free half, and allocation works again.
    let half = live.len() / 2;
    for bp in live.drain(..half) {
        allocator.free(bp);
    }
    assert!(allocator.alloc(64).is_some());

    let (validity, _) = allocator.validate();
    assert!(validity.is_valid(), "{:?}", validity);
}
