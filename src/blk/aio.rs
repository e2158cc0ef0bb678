use std::fmt;
use std::sync::Arc;

use crate::blk::io_buffer::IoBuffer;
use crate::blk::io_context::IOContext;
use crate::common::aligned::AlignedBuffer;

/// Direction and payload of one kernel aio.
pub enum AioOp {
    /// Data lands in `dest` at byte 0 once the reaper picks the record up.
    Read { dest: IoBuffer },
    Write { data: Arc<[u8]> },
}

/// One positional I/O handed to an [`crate::blk::io_queue::IoQueue`].
pub struct Aio {
    pub offset: u64,
    pub length: u64,
    pub op: AioOp,
    /// Owning context, set at submission and taken back by the reaper.
    pub(crate) ioc: Option<Arc<IOContext>>,
    /// Bytes transferred, or a negative errno.
    pub(crate) rval: i64,
    /// Aligned staging memory used by the I/O worker.
    pub(crate) staging: Option<AlignedBuffer>,
}

impl Aio {
    pub fn read(offset: u64, length: u64, dest: IoBuffer) -> Self {
        Self::new(offset, length, AioOp::Read { dest })
    }

    pub fn write(offset: u64, data: Arc<[u8]>) -> Self {
        let length = data.len() as u64;
        Self::new(offset, length, AioOp::Write { data })
    }

    fn new(offset: u64, length: u64, op: AioOp) -> Self {
        Self {
            offset,
            length,
            op,
            ioc: None,
            rval: -1000,
            staging: None,
        }
    }

    pub fn is_read(&self) -> bool {
        matches!(self.op, AioOp::Read { .. })
    }

    pub fn get_return_value(&self) -> i64 {
        self.rval
    }
}

impl fmt::Debug for Aio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aio")
            .field("op", &if self.is_read() { "read" } else { "write" })
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("rval", &self.rval)
            .finish()
    }
}

/// `EIO`-class failures a context with `allow_eio` may absorb instead of treating as fatal.
pub fn is_expected_ioerr(r: i32) -> bool {
    r == -libc::EOPNOTSUPP
        || r == -libc::ETIMEDOUT
        || r == -libc::ENOSPC
        || r == -libc::ENOLINK
        || r == -libc::EREMOTEIO
        || r == -libc::EAGAIN
        || r == -libc::EIO
        || r == -libc::ENODATA
        || r == -libc::EILSEQ
        || r == -libc::ENOMEM
}
