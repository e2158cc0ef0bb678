//! Page-aligned heap buffers.
//!
//! DMA segments and `O_DIRECT` transfers both need memory whose address is a multiple of the
//! device alignment. `Vec<u8>` gives no such guarantee, so these buffers go straight to the
//! global allocator with an explicit `Layout`.

use std::alloc::{self, Layout};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the buffer exclusively owns its allocation; access goes through &/&mut.
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocates `size` zeroed bytes aligned to `alignment` (a power of two).
    ///
    /// Panics if `size` is zero or the layout is invalid; both are caller bugs.
    pub fn zeroed(size: usize, alignment: usize) -> Self {
        assert!(size > 0, "aligned buffer must not be empty");
        let layout = Layout::from_size_align(size, alignment)
            .unwrap_or_else(|e| panic!("invalid layout {}@{}: {}", size, alignment, e));
        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).unwrap_or_else(|| alloc::handle_alloc_error(layout));
        Self { ptr, layout }
    }

    /// Allocates an aligned copy of `data`.
    pub fn copy_from(data: &[u8], alignment: usize) -> Self {
        let mut buf = Self::zeroed(data.len(), alignment);
        buf.copy_from_slice(data);
        buf
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn alignment(&self) -> usize {
        self.layout.align()
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }
}

impl Deref for AlignedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: ptr is valid for layout.size() initialized bytes for the lifetime of self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl DerefMut for AlignedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with exactly this layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.layout.size())
            .field("align", &self.layout.align())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_and_zeroing() {
        let buf = AlignedBuffer::zeroed(8192, 4096);
        assert_eq!(buf.len(), 8192);
        assert_eq!(buf.as_ptr() as usize % 4096, 0);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_copy_from() {
        let buf = AlignedBuffer::copy_from(b"hello", 512);
        assert_eq!(&buf[..], b"hello");
        assert_eq!(buf.alignment(), 512);
    }

    #[test]
    #[should_panic]
    fn test_empty_buffer_rejected() {
        let _ = AlignedBuffer::zeroed(0, 4096);
    }
}
