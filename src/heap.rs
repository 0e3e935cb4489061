//! The heap primitive: a contiguous, monotonically growable byte region.
//!
//! The allocator never talks to the OS directly. It sits on top of a
//! [`HeapSource`], which models an `sbrk`-style "extend by N bytes"
//! operation over a single contiguous region. All addresses handed
//! around by the allocator are *byte offsets* from the base of that
//! region; offset 0 is reserved for the free-list root area, so 0 can
//! double as the null link.
//!
//! Two sources are provided:
//!
//! - [`VecHeap`], a `Vec<u8>`-backed region with an optional byte limit.
//!   This is the default heap, and the one the tests run on.
//! - `MmapHeap` (feature `use_libc`), which reserves a fixed contiguous
//!   mapping from the OS up front and grows into it.

use thiserror::Error;

/// Error returned when a heap cannot grow any further.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// The source has a hard byte limit and the request would cross it.
    #[error("heap exhausted: requested {requested} bytes, {available} available")]
    Exhausted { requested: usize, available: usize },
}

/// A contiguous byte region that can only grow.
///
/// Implementors must guarantee that `extend` appends to the end of the
/// region and that previously handed-out offsets stay valid: the region
/// never shrinks and never moves *logically* (the backing buffer may be
/// reallocated, but offsets are stable).
pub trait HeapSource {
    /// Grow the region by exactly `nbytes` and return the offset of the
    /// first new byte (the old size). New bytes are zeroed.
    fn extend(&mut self, nbytes: usize) -> Result<usize, HeapError>;

    /// Current size of the region in bytes. The valid offset range is
    /// `0..size()`.
    fn size(&self) -> usize;

    /// The whole region as a slice.
    fn bytes(&self) -> &[u8];

    /// The whole region as a mutable slice.
    fn bytes_mut(&mut self) -> &mut [u8];
}

/// A `Vec<u8>`-backed heap, optionally bounded.
///
/// An unbounded `VecHeap` never fails to extend (short of the process
/// running out of memory). A bounded one reports [`HeapError::Exhausted`]
/// once the limit is reached, which is how the tests exercise the
/// allocator's out-of-memory paths.
pub struct VecHeap {
    bytes: Vec<u8>,
    limit: Option<usize>,
}

impl VecHeap {
    /// An unbounded heap.
    pub fn new() -> VecHeap {
        VecHeap {
            bytes: Vec::new(),
            limit: None,
        }
    }

    /// A heap that refuses to grow past `limit` bytes.
    pub fn with_limit(limit: usize) -> VecHeap {
        VecHeap {
            bytes: Vec::with_capacity(limit),
            limit: Some(limit),
        }
    }
}

impl Default for VecHeap {
    fn default() -> Self {
        VecHeap::new()
    }
}

impl HeapSource for VecHeap {
    fn extend(&mut self, nbytes: usize) -> Result<usize, HeapError> {
        let old = self.bytes.len();
        if let Some(limit) = self.limit {
            if old + nbytes > limit {
                return Err(HeapError::Exhausted {
                    requested: nbytes,
                    available: limit - old,
                });
            }
        }
        self.bytes.resize(old + nbytes, 0);
        Ok(old)
    }

    fn size(&self) -> usize {
        self.bytes.len()
    }

    fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

#[cfg(feature = "use_libc")]
pub use self::os::MmapHeap;

#[cfg(feature = "use_libc")]
mod os {
    use super::{HeapError, HeapSource};
    use core::ptr::null_mut;

    /// A heap carved out of one anonymous private mapping.
    ///
    /// The whole reservation is mapped read/write at construction time
    /// and the heap grows by bumping the in-use length, so the region is
    /// contiguous and offsets are trivially stable. Rounds the
    /// reservation up to the page size.
    pub struct MmapHeap {
        base: *mut u8,
        reserved: usize,
        used: usize,
    }

    // The mapping is owned exclusively by this struct.
    unsafe impl Send for MmapHeap {}

    impl MmapHeap {
        /// Reserve `capacity` bytes (rounded up to the page size).
        pub fn with_capacity(capacity: usize) -> Result<MmapHeap, errno::Errno> {
            let pagesize = sysconf::page::pagesize();
            let reserved = capacity.div_ceil(pagesize) * pagesize;

            let ptr = unsafe {
                libc::mmap(
                    null_mut(),
                    reserved,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_ANON | libc::MAP_PRIVATE,
                    -1,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(errno::errno());
            }

            Ok(MmapHeap {
                base: ptr as *mut u8,
                reserved,
                used: 0,
            })
        }
    }

    impl Drop for MmapHeap {
        fn drop(&mut self) {
            unsafe {
                libc::munmap(self.base as *mut libc::c_void, self.reserved);
            }
        }
    }

    impl HeapSource for MmapHeap {
        fn extend(&mut self, nbytes: usize) -> Result<usize, HeapError> {
            if self.used + nbytes > self.reserved {
                return Err(HeapError::Exhausted {
                    requested: nbytes,
                    available: self.reserved - self.used,
                });
            }
            let old = self.used;
            self.used += nbytes;
            Ok(old)
        }

        fn size(&self) -> usize {
            self.used
        }

        fn bytes(&self) -> &[u8] {
            unsafe { core::slice::from_raw_parts(self.base, self.used) }
        }

        fn bytes_mut(&mut self) -> &mut [u8] {
            unsafe { core::slice::from_raw_parts_mut(self.base, self.used) }
        }
    }
}
