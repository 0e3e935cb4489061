//! The entry store: an intrusive doubly-linked list of cached objects
//! in most-recently-used-first order, with byte-count accounting.
//!
//! The store is deliberately dumb about synchronization. Every method
//! assumes the caller holds the right side of the reader/writer
//! protocol in [`crate::cache::rw`]; module privacy keeps anyone else
//! from reaching it.

use core::ptr::NonNull;

use log::debug;

/// One cached object, keyed by `(host, uri)`.
///
/// The payload bytes are immutable for the entry's lifetime; only the
/// link fields ever change, and only under the write lock.
pub(crate) struct Entry {
    host: String,
    uri: String,
    payload: Box<[u8]>,
    prev: Option<NonNull<Entry>>,
    next: Option<NonNull<Entry>>,
}

impl Entry {
    /// Allocate an entry on the heap and leak it to the store's care.
    fn new(host: &str, uri: &str, body: &[u8]) -> NonNull<Entry> {
        let entry = Box::new(Entry {
            host: host.to_owned(),
            uri: uri.to_owned(),
            payload: body.into(),
            prev: None,
            next: None,
        });
        NonNull::from(Box::leak(entry))
    }

    pub(crate) fn matches(&self, host: &str, uri: &str) -> bool {
        self.host == host && self.uri == uri
    }

    pub(crate) fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// The MRU-first list of entries and the space ledger.
///
/// Invariants, between operations:
///
/// - the sum of payload sizes plus `remaining` equals `capacity`;
/// - no two entries share a key;
/// - the head is the most recently used entry, the tail the least;
/// - links are symmetric, and the head's prev is null.
pub(crate) struct EntryStore {
    head: Option<NonNull<Entry>>,
    capacity: usize,
    remaining: usize,
    len: usize,
}

// Entries are owned by the store; moving the store moves them all.
unsafe impl Send for EntryStore {}

impl EntryStore {
    pub(crate) fn new(capacity: usize) -> EntryStore {
        EntryStore {
            head: None,
            capacity,
            remaining: capacity,
            len: 0,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn remaining(&self) -> usize {
        self.remaining
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Linear scan from the head for a byte-exact key match.
    pub(crate) fn find(&self, host: &str, uri: &str) -> Option<NonNull<Entry>> {
        let mut cursor = self.head;
        while let Some(entry) = cursor {
            let entry_ref = unsafe { entry.as_ref() };
            if entry_ref.matches(host, uri) {
                return Some(entry);
            }
            cursor = entry_ref.next;
        }
        None
    }

    /// Build an entry for `body` and prepend it as the new MRU,
    /// debiting the ledger.
    pub(crate) fn insert_mru(&mut self, host: &str, uri: &str, body: &[u8]) {
        debug_assert!(body.len() <= self.remaining, "admission must be pre-checked");

        let mut entry = Entry::new(host, uri, body);
        unsafe {
            let entry_mut = entry.as_mut();
            entry_mut.prev = None;
            entry_mut.next = self.head;
            if let Some(mut head) = self.head {
                head.as_mut().prev = Some(entry);
            }
        }
        self.head = Some(entry);
        self.remaining -= body.len();
        self.len += 1;
    }

    /// Unlink `entry` from the list and credit the ledger. The entry
    /// itself is not freed; the caller re-links it or destroys it.
    ///
    /// # Safety
    ///
    /// `entry` must currently be linked into this store.
    unsafe fn unlink(&mut self, entry: NonNull<Entry>) {
        let entry_ref = entry.as_ref();

        match entry_ref.prev {
            None => self.head = entry_ref.next,
            Some(mut prev) => prev.as_mut().next = entry_ref.next,
        }
        if let Some(mut next) = entry_ref.next {
            next.as_mut().prev = entry_ref.prev;
        }

        self.remaining += entry_ref.payload.len();
        self.len -= 1;
    }

    /// Unlink `entry` and free it.
    ///
    /// # Safety
    ///
    /// `entry` must currently be linked into this store, and no other
    /// reference to it may be live.
    pub(crate) unsafe fn discard(&mut self, entry: NonNull<Entry>) {
        self.unlink(entry);
        drop(Box::from_raw(entry.as_ptr()));
    }

    /// Walk to the least recently used entry. O(n), like the reference;
    /// eviction is rare enough not to earn a tail pointer.
    pub(crate) fn tail(&self) -> Option<NonNull<Entry>> {
        let mut cursor = self.head?;
        while let Some(next) = unsafe { cursor.as_ref() }.next {
            cursor = next;
        }
        Some(cursor)
    }

    /// Drop the least recently used entry. Returns false if the store
    /// was already empty.
    pub(crate) fn evict_lru(&mut self) -> bool {
        match self.tail() {
            None => false,
            Some(entry) => {
                let entry_ref = unsafe { entry.as_ref() };
                debug!(
                    "evicting {} {} ({} bytes)",
                    entry_ref.host,
                    entry_ref.uri,
                    entry_ref.payload.len()
                );
                unsafe { self.discard(entry) };
                true
            }
        }
    }

    /// Move `entry` to the head: the LRU touch on a read hit.
    ///
    /// # Safety
    ///
    /// `entry` must currently be linked into this store.
    pub(crate) unsafe fn promote(&mut self, mut entry: NonNull<Entry>) {
        self.unlink(entry);
        let payload_len = entry.as_ref().payload.len();

        let entry_mut = entry.as_mut();
        entry_mut.prev = None;
        entry_mut.next = self.head;
        if let Some(mut head) = self.head {
            head.as_mut().prev = Some(entry);
        }
        self.head = Some(entry);

        self.remaining -= payload_len;
        self.len += 1;
    }

    /// Verify the store's own invariants; logs and returns false on
    /// the first sign of corruption.
    pub(crate) fn consistent(&self, max_object: usize) -> bool {
        let mut seen_bytes = 0;
        let mut seen = 0;
        let mut prev: Option<NonNull<Entry>> = None;
        let mut cursor = self.head;

        while let Some(entry) = cursor {
            let entry_ref = unsafe { entry.as_ref() };

            if entry_ref.prev != prev {
                log::error!("asymmetric links at {} {}", entry_ref.host, entry_ref.uri);
                return false;
            }
            if entry_ref.payload.len() > max_object {
                log::error!("oversized entry {} {}", entry_ref.host, entry_ref.uri);
                return false;
            }

            // Unique keys: no later entry may repeat this one.
            let mut rest = entry_ref.next;
            while let Some(other) = rest {
                let other_ref = unsafe { other.as_ref() };
                if other_ref.matches(&entry_ref.host, &entry_ref.uri) {
                    log::error!("duplicate key {} {}", entry_ref.host, entry_ref.uri);
                    return false;
                }
                rest = other_ref.next;
            }

            seen_bytes += entry_ref.payload.len();
            seen += 1;
            prev = cursor;
            cursor = entry_ref.next;
        }

        if seen != self.len {
            log::error!("length ledger disagrees: {} linked, {} recorded", seen, self.len);
            return false;
        }
        if seen_bytes + self.remaining != self.capacity {
            log::error!(
                "space ledger disagrees: {} cached + {} remaining != {} capacity",
                seen_bytes,
                self.remaining,
                self.capacity
            );
            return false;
        }
        true
    }

    /// The uris of every entry, head to tail.
    #[cfg(test)]
    pub(crate) fn uris(&self) -> Vec<String> {
        let mut uris = Vec::new();
        let mut cursor = self.head;
        while let Some(entry) = cursor {
            let entry_ref = unsafe { entry.as_ref() };
            uris.push(entry_ref.uri.clone());
            cursor = entry_ref.next;
        }
        uris
    }
}

impl Drop for EntryStore {
    fn drop(&mut self) {
        let mut cursor = self.head.take();
        while let Some(entry) = cursor {
            let owned = unsafe { Box::from_raw(entry.as_ptr()) };
            cursor = owned.next;
        }
    }
}
