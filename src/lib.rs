//! Two systems cores: a general-purpose heap allocator and a
//! concurrent object cache.
//!
//! ## The allocator
//!
//! [`Allocator`] is a segregated free-list allocator over an abstract,
//! `sbrk`-style heap region (the [`HeapSource`] trait, usually a
//! [`VecHeap`]). Blocks carry boundary tags (a 4-byte header repeated
//! as a footer) so freeing coalesces with both neighbors in constant
//! time, and free blocks are kept on thirteen doubly-linked lists
//! partitioned by size class, searched first-fit. Every address the
//! allocator hands out is a byte offset into its heap; payload bytes
//! are reached through [`Allocator::payload`] and
//! [`Allocator::payload_mut`].
//!
//! The allocator is single-threaded; [`SharedAllocator`] adds a spin
//! lock for shared use. [`Allocator::check_heap`] and
//! [`Allocator::validate`] sweep the whole heap for structural
//! corruption, down to cycles in the free lists; the `selfcheck`
//! cargo feature runs the sweep after every operation.
//!
//! ## The cache
//!
//! [`Cache`] is a bounded LRU store of opaque objects keyed by
//! `(host, uri)`, built for a forwarding HTTP proxy. Any number of
//! threads may read and write concurrently; readers are preferred, and
//! a read hit promotes its entry to most recently used. See
//! [`cache`] for the protocol.

pub mod alloc;
pub mod block;
pub mod cache;
pub mod check;
pub mod heap;

pub use crate::alloc::{Allocator, SharedAllocator};
pub use crate::cache::{Cache, RejectReason};
pub use crate::check::{HeapStats, Validity};
pub use crate::heap::{HeapError, HeapSource, VecHeap};

#[cfg(feature = "use_libc")]
pub use crate::heap::MmapHeap;
