//! A bounded, concurrent LRU object cache.
//!
//! Built for a forwarding proxy: opaque response bodies keyed by
//! `(host, uri)`, held in an MRU-first linked list with
//! least-recently-used eviction, behind a readers-preferring
//! reader/writer protocol. The forwarder calls [`Cache::read`] before
//! contacting an origin and [`Cache::write`] once a small-enough
//! response has been accumulated; everything else lives in here.

mod rw;
mod store;

pub use rw::{Cache, RejectReason};
