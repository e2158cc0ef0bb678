//! Splitting of byte ranges into hardware-sized tasks.
//!
//! ```text
//!   +--------------------------+--------------------------+--------------------------+
//!   |//// head ////|           |                          |        |//// tail //////|
//!   +--------------------------+--------------------------+--------------------------+
//!   ^              ^                                               ^                 ^
//!   aligned_off    orig_off                                        orig_end          aligned_end
//! ```
//!
//! Read chunks tile the aligned range; each chunk's fill closure copies only the part that
//! overlaps `orig_off~orig_len` into the caller buffer.

use std::sync::Arc;

use crate::blk::io_buffer::IoBuffer;
use crate::blk::nvme::buffer_pool::{copy_from_segments, DmaSegment};
use crate::blk::nvme::task::{IoCommand, PrimaryLink, PrimaryRead, PrimaryRef, Task};
use crate::common::config::DEFAULT_CHUNK_SIZE;

#[derive(Debug, Clone, Copy)]
pub struct RequestSplitter {
    chunk_size: u64,
}

impl Default for RequestSplitter {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl RequestSplitter {
    pub fn new(chunk_size: u64) -> Self {
        assert!(chunk_size > 0, "chunk size must be non-zero");
        Self { chunk_size }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// One write task per chunk, each referencing its slice of `data`.
    pub fn split_write(&self, off: u64, data: Arc<[u8]>) -> Vec<Task> {
        let len = data.len() as u64;
        let mut tasks = Vec::with_capacity(len.div_ceil(self.chunk_size) as usize);
        let mut begin = 0u64;
        while begin < len {
            let write_size = (len - begin).min(self.chunk_size);
            tasks.push(Task::write(
                off + begin,
                Arc::clone(&data),
                begin as usize,
                write_size,
            ));
            begin += write_size;
        }
        tasks
    }

    /// Read tasks covering `aligned_off~aligned_len`, delivering `orig_off~orig_len` into
    /// `buf` starting at byte 0.
    ///
    /// With a primary and a range that fits one chunk, the single task stands for the primary
    /// itself; otherwise every chunk takes a counted reference on it.
    pub fn make_read_tasks(
        &self,
        aligned_off: u64,
        aligned_len: u64,
        buf: &IoBuffer,
        primary: Option<&Arc<PrimaryRead>>,
        orig_off: u64,
        orig_len: u64,
    ) -> Vec<Task> {
        assert!(orig_off >= aligned_off, "requested range starts before the aligned range");
        assert!(
            orig_off + orig_len <= aligned_off + aligned_len,
            "requested range ends after the aligned range"
        );

        let aligned_end = aligned_off + aligned_len;
        let orig_end = orig_off + orig_len;
        let single = aligned_len <= self.chunk_size;
        let mut tasks = Vec::with_capacity(aligned_len.div_ceil(self.chunk_size) as usize);

        let mut begin = aligned_off;
        while begin < aligned_end {
            let read_size = (aligned_end - begin).min(self.chunk_size);
            let mut t = Task::new(IoCommand::Read, begin, read_size);
            t.primary = match primary {
                Some(p) if single => PrimaryLink::Itself(Arc::clone(p)),
                Some(p) => PrimaryLink::Chunk(PrimaryRef::new(p)),
                None => PrimaryLink::None,
            };

            let copy_start = begin.max(orig_off);
            let copy_end = (begin + read_size).min(orig_end);
            if copy_start < copy_end {
                let src_off = (copy_start - begin) as usize;
                let dst_off = (copy_start - orig_off) as usize;
                let copy_len = (copy_end - copy_start) as usize;
                let buf = buf.clone();
                t.fill = Some(Box::new(move |segs: &[DmaSegment]| {
                    buf.with_slice_mut(dst_off, copy_len, |out| copy_from_segments(segs, src_off, out));
                }));
            }

            tasks.push(t);
            begin += read_size;
        }
        tasks
    }
}
