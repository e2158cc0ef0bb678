//! Hardware-sized units of work and the primary-read protocol.
//!
//! A synchronous read that splits into several chunks shares one [`PrimaryRead`]. Each chunk
//! holds a [`PrimaryRef`]; the read settles exactly once, when the last reference goes away.
//! A failed chunk poisons the read with its error code and the first error wins.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::blk::io_context::IOContext;
use crate::blk::nvme::buffer_pool::{copy_into_segments, DmaSegment};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoCommand {
    Read,
    Write,
    Flush,
}

/// Fill closure run when a read chunk completes; receives the chunk's DMA segments.
pub type FillFn = Box<dyn FnOnce(&[DmaSegment]) + Send>;

pub struct PrimaryRead {
    return_code: AtomicI32,
    refs: AtomicUsize,
    settled: AtomicBool,
}

impl PrimaryRead {
    /// Return code of a read that has not settled yet.
    pub const PENDING: i32 = 1;

    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            return_code: AtomicI32::new(Self::PENDING),
            refs: AtomicUsize::new(0),
            settled: AtomicBool::new(false),
        })
    }

    /// `PENDING` until settled, then 0 or the first recorded error.
    pub fn return_code(&self) -> i32 {
        self.return_code.load(Ordering::SeqCst)
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    /// Chunks still holding a reference.
    pub fn outstanding(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    pub(crate) fn poison(&self, r: i32) {
        debug_assert!(r < 0);
        let _ = self.return_code.compare_exchange(
            Self::PENDING,
            r,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub(crate) fn settle(&self) {
        let already = self.settled.swap(true, Ordering::SeqCst);
        assert!(!already, "primary read settled twice");
        let _ = self
            .return_code
            .compare_exchange(Self::PENDING, 0, Ordering::SeqCst, Ordering::SeqCst);
    }
}

/// Counted link from a chunk to its primary read.
pub struct PrimaryRef {
    primary: Arc<PrimaryRead>,
}

impl PrimaryRef {
    pub fn new(primary: &Arc<PrimaryRead>) -> Self {
        assert!(!primary.is_settled(), "reference taken on a settled primary read");
        primary.refs.fetch_add(1, Ordering::SeqCst);
        Self {
            primary: Arc::clone(primary),
        }
    }

    pub fn primary(&self) -> &Arc<PrimaryRead> {
        &self.primary
    }
}

impl Drop for PrimaryRef {
    fn drop(&mut self) {
        if self.primary.refs.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.primary.settle();
        }
    }
}

pub enum PrimaryLink {
    None,
    /// The task is the whole read.
    Itself(Arc<PrimaryRead>),
    /// The task is one chunk of a larger read.
    Chunk(PrimaryRef),
}

impl PrimaryLink {
    pub fn primary(&self) -> Option<&Arc<PrimaryRead>> {
        match self {
            PrimaryLink::None => None,
            PrimaryLink::Itself(p) => Some(p),
            PrimaryLink::Chunk(r) => Some(r.primary()),
        }
    }
}

pub struct Task {
    pub command: IoCommand,
    pub offset: u64,
    pub len: u64,
    /// Bound when the queue takes the task, to keep the context free of self references.
    pub(crate) ctx: Option<Arc<IOContext>>,
    pub(crate) write_src: Option<(Arc<[u8]>, usize)>,
    pub(crate) fill: Option<FillFn>,
    pub(crate) primary: PrimaryLink,
    pub(crate) segs: Vec<DmaSegment>,
    pub return_code: i32,
}

impl Task {
    pub fn new(command: IoCommand, offset: u64, len: u64) -> Self {
        Self {
            command,
            offset,
            len,
            ctx: None,
            write_src: None,
            fill: None,
            primary: PrimaryLink::None,
            segs: Vec::new(),
            return_code: 0,
        }
    }

    pub fn write(offset: u64, src: Arc<[u8]>, start: usize, len: u64) -> Self {
        let mut t = Self::new(IoCommand::Write, offset, len);
        t.write_src = Some((src, start));
        t
    }

    pub fn flush() -> Self {
        Self::new(IoCommand::Flush, 0, 0)
    }

    pub fn primary(&self) -> Option<&Arc<PrimaryRead>> {
        self.primary.primary()
    }

    pub fn nseg(&self) -> usize {
        self.segs.len()
    }

    /// Copies the write payload into freshly allocated segments.
    pub(crate) fn stage_write(&mut self) {
        if let Some((src, start)) = &self.write_src {
            let end = start + self.len as usize;
            copy_into_segments(&mut self.segs, &src[*start..end]);
        }
    }

    /// Runs the fill closure against the completed segments.
    pub(crate) fn fill(&mut self) {
        if let Some(fill) = self.fill.take() {
            fill(&self.segs);
        }
    }

    /// Records a failure on the task and its primary read.
    pub(crate) fn fail(&mut self, r: i32) {
        self.return_code = r;
        if let Some(primary) = self.primary.primary() {
            primary.poison(r);
        }
    }

    /// Drops the primary link, settling the read when this was the last holder.
    pub(crate) fn settle_primary(&mut self) {
        match std::mem::replace(&mut self.primary, PrimaryLink::None) {
            PrimaryLink::None => {}
            PrimaryLink::Itself(p) => p.settle(),
            PrimaryLink::Chunk(r) => drop(r),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("command", &self.command)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("nseg", &self.segs.len())
            .field("return_code", &self.return_code)
            .finish()
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert!(self.segs.is_empty(), "task dropped holding {} DMA segments", self.segs.len());
        }
    }
}
