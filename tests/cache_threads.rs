use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use test_log::test;

use segalloc::Cache;

/// The payload for a key is derived from the key alone, so a reader
/// can verify that what it copied out is one writer's object, whole,
/// and not a mix of two writers' critical sections.
fn body_for(uri_index: usize) -> Vec<u8> {
    let byte = b'a' + (uri_index % 26) as u8;
    vec![byte; 64 + uri_index % 128]
}

fn uri_for(uri_index: usize) -> String {
    format!("/object/{}", uri_index)
}

#[test]
fn readers_and_writers_contend() {
    const KEYS: usize = 24;
    const READERS: usize = 5;
    const WRITERS: usize = 2;
    const ROUNDS: usize = 300;

    let cache = Arc::new(Cache::new(16 * 1024, 1024));
    let hits = Arc::new(AtomicUsize::new(0));

    // Seed a few keys so readers have something to hit immediately.
    for i in 0..KEYS / 2 {
        cache.write("origin", &uri_for(i), &body_for(i)).unwrap();
    }

    let mut handles = Vec::new();

    for reader in 0..READERS {
        let cache = Arc::clone(&cache);
        let hits = Arc::clone(&hits);
        handles.push(thread::spawn(move || {
            let mut buf = vec![0u8; 1024];
            for round in 0..ROUNDS {
                let i = (reader + round * 7) % KEYS;
                if let Some(len) = cache.read("origin", &uri_for(i), &mut buf) {
                    // A torn copy would show as a wrong length or a
                    // mixed fill byte.
                    let expected = body_for(i);
                    assert_eq!(len, expected.len(), "torn read on key {}", i);
                    assert_eq!(&buf[..len], &expected[..], "torn read on key {}", i);
                    hits.fetch_add(1, Ordering::Relaxed);
                }
            }
        }));
    }

    for writer in 0..WRITERS {
        let cache = Arc::clone(&cache);
        handles.push(thread::spawn(move || {
            for round in 0..ROUNDS {
                let i = (writer + round * 5) % KEYS;
                cache.write("origin", &uri_for(i), &body_for(i)).unwrap();
            }
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }

    assert!(hits.load(Ordering::Relaxed) > 0, "readers never hit");
    assert!(cache.validate(), "ledger or links corrupted by the run");
}

#[test]
fn promotion_races_eviction_safely() {
    // A cache so small that every write evicts, to hammer the window
    // between a reader's copy-out and its LRU touch.
    let cache = Arc::new(Cache::new(256, 128));
    cache.write("h", "/hot", &[7; 100]).unwrap();

    let reader = {
        let cache = Arc::clone(&cache);
        thread::spawn(move || {
            let mut buf = [0u8; 128];
            let mut hits = 0;
            for _ in 0..2000 {
                if let Some(len) = cache.read("h", "/hot", &mut buf) {
                    assert_eq!(len, 100);
                    assert!(buf[..len].iter().all(|&b| b == 7));
                    hits += 1;
                }
            }
            hits
        })
    };

    let writer = {
        let cache = Arc::clone(&cache);
        thread::spawn(move || {
            for round in 0..2000 {
                let uri = format!("/churn/{}", round % 3);
                cache.write("h", &uri, &[1; 100]).unwrap();
                // Keep the hot key reappearing so the reader's re-find
                // sometimes succeeds and sometimes finds it evicted.
                if round % 5 == 0 {
                    cache.write("h", "/hot", &[7; 100]).unwrap();
                }
            }
        })
    };

    let hits = reader.join().unwrap();
    writer.join().unwrap();

    log::info!("reader hit {} times against the churn", hits);
    assert!(cache.validate());
    assert!(cache.remaining_space() <= cache.capacity());
}

#[test]
fn concurrent_readers_share_the_store() {
    let cache = Arc::new(Cache::new(4096, 512));
    for i in 0..8 {
        cache.write("h", &uri_for(i), &body_for(i)).unwrap();
    }

    let handles: Vec<_> = (0..8)
        .map(|reader| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                let mut buf = vec![0u8; 512];
                for round in 0..500 {
                    let i = (reader + round) % 8;
                    let len = cache
                        .read("h", &uri_for(i), &mut buf)
                        .expect("nothing evicts in a read-only run");
                    assert_eq!(&buf[..len], &body_for(i)[..]);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    // Reads only reorder; the ledger is untouched.
    assert_eq!(cache.len(), 8);
    assert!(cache.validate());
}
