//! The reader/writer protocol around the entry store.
//!
//! Readers are preferred: a binary `write_lock` is held by the *group*
//! of concurrent readers, taken by the first reader in and released by
//! the last one out, with the handoff serialized by a second mutex
//! around the reader counter. Writers take `write_lock` directly, so a
//! writer runs only when no reader is inside, and a steady stream of
//! readers can starve writers indefinitely. That is the intended
//! policy for a read-heavy proxy; do not replace this with a fair or
//! writer-preferring lock.
//!
//! Entry payloads are immutable while linked. Readers only scan keys
//! and copy bytes out; every link mutation (insert, evict, promote)
//! happens under `write_lock`. The LRU touch on a read hit is therefore
//! a write-phase operation, performed after the read phase ends.

use core::cell::UnsafeCell;
use core::mem;

use log::debug;
use spin::Mutex;
use thiserror::Error;

use super::store::EntryStore;

/// Why a write was refused. Reads have no error case; a miss is `None`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The object is bigger than the per-object limit.
    #[error("object of {size} bytes exceeds the {limit}-byte limit")]
    TooLarge { size: usize, limit: usize },
    /// Evicting every entry still left too little room.
    #[error("cache emptied without making enough room")]
    Exhausted,
}

/// A bounded, concurrent, LRU object cache keyed by `(host, uri)`.
///
/// [`read`](Cache::read) and [`write`](Cache::write) are the only
/// entry points and may be called freely from any number of threads.
pub struct Cache {
    store: UnsafeCell<EntryStore>,
    /// Guards `reader_count` and the group handoff of `write_lock`.
    reader_gate: Mutex<usize>,
    /// Held by the writer, or collectively by the group of readers.
    write_lock: Mutex<()>,
    max_object: usize,
}

// Safety: the store is only reached through the reader/writer protocol
// below. Readers share `&EntryStore` while `write_lock` is held on the
// reader group's behalf; writers get `&mut EntryStore` while holding
// `write_lock` themselves.
unsafe impl Send for Cache {}
unsafe impl Sync for Cache {}

impl Cache {
    /// A cache holding at most `capacity` payload bytes, refusing any
    /// single object larger than `max_object`.
    pub fn new(capacity: usize, max_object: usize) -> Cache {
        Cache {
            store: UnsafeCell::new(EntryStore::new(capacity)),
            reader_gate: Mutex::new(0),
            write_lock: Mutex::new(()),
            max_object,
        }
    }

    /// Look up `(host, uri)`; on a hit, copy the payload into `out`
    /// and return its length, promoting the entry to most recently
    /// used. `None` is a miss.
    ///
    /// `out` must have room for `max_object` bytes; the caller sizes
    /// it once and reuses it.
    pub fn read(&self, host: &str, uri: &str, out: &mut [u8]) -> Option<usize> {
        self.begin_read();
        let store = unsafe { &*self.store.get() };

        let copied = match store.find(host, uri) {
            None => None,
            Some(entry) => {
                let payload = unsafe { entry.as_ref() }.payload();
                out[..payload.len()].copy_from_slice(payload);
                Some(payload.len())
            }
        };
        self.end_read();

        let len = match copied {
            None => {
                debug!("miss: {} {}", host, uri);
                return None;
            }
            Some(len) => len,
        };

        // The LRU touch mutates links, so it needs the write lock. A
        // writer may have slipped in and evicted the entry between the
        // phases, so find it again rather than trusting the reference
        // across the gap; if it is gone there is nothing to promote.
        {
            let _write = self.write_lock.lock();
            let store = unsafe { &mut *self.store.get() };
            match store.find(host, uri) {
                Some(entry) => unsafe { store.promote(entry) },
                None => debug!("{} {} evicted before promotion", host, uri),
            }
        }

        debug!("hit: {} {} ({} bytes)", host, uri, len);
        Some(len)
    }

    /// Admit `body` under `(host, uri)`, evicting least recently used
    /// entries until it fits. An entry already holding the key is
    /// replaced. Oversized objects and a cache that cannot make room
    /// are rejected.
    pub fn write(&self, host: &str, uri: &str, body: &[u8]) -> Result<(), RejectReason> {
        if body.len() > self.max_object {
            return Err(RejectReason::TooLarge {
                size: body.len(),
                limit: self.max_object,
            });
        }

        let _write = self.write_lock.lock();
        let store = unsafe { &mut *self.store.get() };

        if let Some(existing) = store.find(host, uri) {
            // Replace-on-insert keeps keys unique.
            unsafe { store.discard(existing) };
        }

        while store.remaining() < body.len() {
            if !store.evict_lru() {
                return Err(RejectReason::Exhausted);
            }
        }

        store.insert_mru(host, uri, body);
        debug!("stored: {} {} ({} bytes)", host, uri, body.len());
        Ok(())
    }

    /// Number of cached objects right now.
    pub fn len(&self) -> usize {
        let _write = self.write_lock.lock();
        unsafe { &*self.store.get() }.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unspent payload budget right now.
    pub fn remaining_space(&self) -> usize {
        let _write = self.write_lock.lock();
        unsafe { &*self.store.get() }.remaining()
    }

    /// Total payload budget.
    pub fn capacity(&self) -> usize {
        // Immutable after construction; no lock needed.
        unsafe { &*self.store.get() }.capacity()
    }

    /// Verify the store's invariants under the write lock: the space
    /// ledger, key uniqueness, link symmetry, and the object limit.
    pub fn validate(&self) -> bool {
        let _write = self.write_lock.lock();
        unsafe { &*self.store.get() }.consistent(self.max_object)
    }

    /// First reader in takes the write lock for the whole group.
    fn begin_read(&self) {
        let mut readers = self.reader_gate.lock();
        *readers += 1;
        if *readers == 1 {
            // The guard is deliberately leaked: the lock belongs to
            // the reader group now, and whichever reader leaves last
            // releases it in end_read.
            mem::forget(self.write_lock.lock());
        }
    }

    /// Last reader out releases the write lock for the group.
    fn end_read(&self) {
        let mut readers = self.reader_gate.lock();
        *readers -= 1;
        if *readers == 0 {
            // Safety: the group holds write_lock (taken by the first
            // reader and forgotten), and `reader_gate` makes this
            // thread the unique last reader, so the release is ours
            // to perform.
            unsafe { self.write_lock.force_unlock() };
        }
    }
}
