use std::fmt;

use log::debug;
use parking_lot::Mutex;

use crate::common::aligned::AlignedBuffer;
use crate::common::config::DEFAULT_PAGE_SIZE;

/// One page-aligned staging buffer handed to the controller for DMA.
pub struct DmaSegment {
    buf: AlignedBuffer,
}

impl DmaSegment {
    pub fn new(size: usize) -> Self {
        Self {
            buf: AlignedBuffer::zeroed(size, DEFAULT_PAGE_SIZE),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Stable identity of the underlying memory.
    pub fn addr(&self) -> usize {
        self.buf.as_ptr() as usize
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl fmt::Debug for DmaSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DmaSegment({:#x}, {})", self.addr(), self.len())
    }
}

/// Copies `src` into consecutive segments, starting at the first byte of the first one.
pub fn copy_into_segments(segs: &mut [DmaSegment], src: &[u8]) {
    let mut copied = 0;
    for seg in segs.iter_mut() {
        if copied == src.len() {
            break;
        }
        let n = seg.len().min(src.len() - copied);
        seg.as_mut_slice()[..n].copy_from_slice(&src[copied..copied + n]);
        copied += n;
    }
    assert_eq!(copied, src.len(), "segments too small for {} bytes", src.len());
}

/// Copies `out.len()` bytes starting `off` bytes into the segment chain.
pub fn copy_from_segments(segs: &[DmaSegment], mut off: usize, out: &mut [u8]) {
    let mut copied = 0;
    for seg in segs {
        if copied == out.len() {
            break;
        }
        if off >= seg.len() {
            off -= seg.len();
            continue;
        }
        let n = (seg.len() - off).min(out.len() - copied);
        out[copied..copied + n].copy_from_slice(&seg.as_slice()[off..off + n]);
        copied += n;
        off = 0;
    }
    assert_eq!(copied, out.len(), "segments too small for {} bytes", out.len());
}

/// Fixed set of DMA segments owned by one submission queue.
///
/// Allocation is all-or-nothing and never blocks: a request for more segments than are free
/// is refused and the pool is left untouched, so the caller can poll completions and retry.
pub struct BufferSegmentPool {
    free: Mutex<Vec<DmaSegment>>,
    capacity: usize,
    segment_size: usize,
}

impl BufferSegmentPool {
    pub fn new(segment_size: usize, capacity: usize) -> Self {
        let free = (0..capacity).map(|_| DmaSegment::new(segment_size)).collect();
        debug!(
            "allocated {} DMA segments of {} bytes",
            capacity, segment_size
        );
        Self {
            free: Mutex::new(free),
            capacity,
            segment_size,
        }
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    pub fn in_use(&self) -> usize {
        self.capacity - self.free_count()
    }

    /// Segments needed to stage `len` bytes.
    pub fn segments_for(&self, len: u64) -> usize {
        len.div_ceil(self.segment_size as u64) as usize
    }

    pub fn allocate(&self, n: usize) -> Option<Vec<DmaSegment>> {
        let mut free = self.free.lock();
        if n > free.len() {
            return None;
        }
        let at = free.len() - n;
        Some(free.split_off(at))
    }

    pub fn release(&self, segs: Vec<DmaSegment>) {
        if segs.is_empty() {
            return;
        }
        let mut free = self.free.lock();
        free.extend(segs);
        assert!(free.len() <= self.capacity, "released more segments than the pool owns");
    }
}

impl fmt::Debug for BufferSegmentPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferSegmentPool")
            .field("segment_size", &self.segment_size)
            .field("capacity", &self.capacity)
            .field("free", &self.free_count())
            .finish()
    }
}
