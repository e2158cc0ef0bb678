//! Per-thread submission queue: one hardware queue pair, its DMA pool, and the drain loop.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, trace};

use crate::blk::io_context::{AioCallback, IOContext};
use crate::blk::nvme::buffer_pool::BufferSegmentPool;
use crate::blk::nvme::driver::SharedDriverData;
use crate::blk::nvme::hw::{Completion, NvmeCommand, QueuePair};
use crate::blk::nvme::task::{IoCommand, Task};
use crate::common::config::{BlkConfig, CommandId};
use crate::common::exception::BlkError;
use crate::common::util::cpp_strerror;

pub struct SubmissionQueue {
    qpair: Box<dyn QueuePair>,
    pool: BufferSegmentPool,
    inflight: HashMap<CommandId, Task>,
    next_cid: CommandId,
    block_size: u64,
    current_queue_depth: u32,
    max_queue_depth: u32,
    io_sleep: Duration,
    max_io_completions: u32,
    callback: Option<AioCallback>,
    // statistics
    queue_op_seq: u64,
    completed_op_seq: u64,
}

impl SubmissionQueue {
    pub fn new(
        driver: &SharedDriverData,
        config: &BlkConfig,
        callback: Option<AioCallback>,
    ) -> Result<Self, BlkError> {
        let qpair = driver.alloc_qpair()?;
        // one slot stays free so the hardware queue never overflows
        let mut max_queue_depth = qpair.io_queue_size().saturating_sub(1).max(1);
        if let Some(cap) = config.max_queue_depth {
            max_queue_depth = max_queue_depth.min(cap);
        }
        let pool = BufferSegmentPool::new(config.data_buffer_size, config.data_buffer_num);
        // a chunk that can never be staged would stall the drain loop forever
        assert!(
            pool.segments_for(config.chunk_size) <= pool.capacity(),
            "data buffer pool ({} x {}) cannot hold one {} byte chunk",
            config.data_buffer_num,
            config.data_buffer_size,
            config.chunk_size
        );
        debug!(
            "queue on {}: max depth {} pool {} x {}",
            driver.trid(),
            max_queue_depth,
            config.data_buffer_num,
            config.data_buffer_size
        );
        Ok(Self {
            qpair,
            pool,
            inflight: HashMap::new(),
            next_cid: 0,
            block_size: driver.get_block_size() as u64,
            current_queue_depth: 0,
            max_queue_depth,
            io_sleep: config.io_sleep(),
            max_io_completions: config.max_io_completions,
            callback,
            queue_op_seq: 0,
            completed_op_seq: 0,
        })
    }

    pub fn max_queue_depth(&self) -> u32 {
        self.max_queue_depth
    }

    pub fn current_queue_depth(&self) -> u32 {
        self.current_queue_depth
    }

    pub fn pool(&self) -> &BufferSegmentPool {
        &self.pool
    }

    /// Commands issued and completed over the queue's lifetime.
    pub fn op_seqs(&self) -> (u64, u64) {
        (self.queue_op_seq, self.completed_op_seq)
    }

    /// Issues `tasks` for `ioc` and polls until the context has nothing running.
    ///
    /// Pool exhaustion and a full queue only pause submission; completions free room and the
    /// loop picks up where it stopped.
    pub fn aio_handle(&mut self, ioc: &Arc<IOContext>, mut tasks: VecDeque<Task>) {
        for t in tasks.iter_mut() {
            t.ctx = Some(Arc::clone(ioc));
        }
        trace!("aio_handle start: {} tasks", tasks.len());

        while ioc.num_running() > 0 {
            if self.current_queue_depth > 0 {
                let reaped = self.poll();
                if reaped == 0 {
                    thread::sleep(self.io_sleep);
                }
            }

            while let Some(mut t) = tasks.pop_front() {
                if self.current_queue_depth == self.max_queue_depth {
                    tasks.push_front(t);
                    break;
                }
                if !self.alloc_buf_from_pool(&mut t) {
                    tasks.push_front(t);
                    break;
                }
                self.issue(t);
            }
        }
        trace!("aio_handle end");
    }

    /// Stages the task's payload in DMA segments. False when the pool is short.
    fn alloc_buf_from_pool(&mut self, t: &mut Task) -> bool {
        if t.command == IoCommand::Flush {
            return true;
        }
        let count = self.pool.segments_for(t.len);
        let Some(segs) = self.pool.allocate(count) else {
            trace!("pool exhausted: need {} have {}", count, self.pool.free_count());
            return false;
        };
        t.segs = segs;
        if let Some(ctx) = &t.ctx {
            ctx.total_nseg.fetch_add(count as i32, Ordering::SeqCst);
        }
        if t.command == IoCommand::Write {
            t.stage_write();
        }
        true
    }

    fn release_segs(&self, t: &mut Task) {
        let segs = std::mem::take(&mut t.segs);
        if let Some(ctx) = &t.ctx {
            ctx.total_nseg.fetch_sub(segs.len() as i32, Ordering::SeqCst);
        }
        self.pool.release(segs);
    }

    fn next_command_id(&mut self) -> CommandId {
        loop {
            let cid = self.next_cid;
            self.next_cid = self.next_cid.wrapping_add(1);
            if !self.inflight.contains_key(&cid) {
                return cid;
            }
        }
    }

    fn issue(&mut self, mut t: Task) {
        let lba = t.offset / self.block_size;
        let lba_count = (t.len / self.block_size) as u32;
        let cmd = match t.command {
            IoCommand::Read => NvmeCommand::Read {
                lba,
                lba_count,
                sgl: std::mem::take(&mut t.segs),
            },
            IoCommand::Write => NvmeCommand::Write {
                lba,
                lba_count,
                sgl: std::mem::take(&mut t.segs),
            },
            IoCommand::Flush => NvmeCommand::Flush,
        };
        trace!("{:?} command issued", cmd);

        let cid = self.next_command_id();
        match self.qpair.submit(cmd, cid) {
            Ok(()) => {
                self.inflight.insert(cid, t);
                self.current_queue_depth += 1;
                self.queue_op_seq += 1;
            }
            Err(e) => {
                t.segs = e.sgl;
                self.release_segs(&mut t);
                let command = t.command;
                drop(t);
                error!("failed to issue {:?} command: {}", command, cpp_strerror(e.errno));
                panic!("failed to issue {:?} command: {}", command, cpp_strerror(e.errno));
            }
        }
    }

    /// Reaps completions; returns how many were handled.
    fn poll(&mut self) -> usize {
        let completions = match self.qpair.process_completions(self.max_io_completions) {
            Ok(c) => c,
            Err(r) => {
                error!("process_completions failed: {}", cpp_strerror(r));
                panic!("queue pair polling failed: {}", cpp_strerror(r));
            }
        };
        let n = completions.len();
        for c in completions {
            self.io_complete(c);
        }
        n
    }

    fn io_complete(&mut self, c: Completion) {
        let Some(mut t) = self.inflight.remove(&c.cid) else {
            panic!("completion for unknown command id {}", c.cid);
        };
        t.segs = c.sgl;
        self.current_queue_depth -= 1;
        self.completed_op_seq += 1;

        let Some(ctx) = t.ctx.clone() else {
            panic!("completed {:?} has no owning context", t);
        };

        if c.status == 0 {
            trace!(
                "{:?} op successful, {} left",
                t.command,
                self.queue_op_seq - self.completed_op_seq
            );
            if t.command == IoCommand::Read {
                t.fill();
            }
        } else {
            error!(
                "{:?} {:#x}~{:#x} failed: {}",
                t.command,
                t.offset,
                t.len,
                cpp_strerror(c.status)
            );
            t.fail(c.status);
            ctx.record_error(c.status);
        }

        self.release_segs(&mut t);
        t.settle_primary();
        t.ctx = None;
        drop(t);

        ctx.complete_one(self.callback.as_ref());
    }
}

impl Drop for SubmissionQueue {
    fn drop(&mut self) {
        if !self.inflight.is_empty() && !thread::panicking() {
            error!("submission queue dropped with {} commands in flight", self.inflight.len());
        }
        for (_, mut t) in self.inflight.drain() {
            // the queue pair still owns their segments; nothing to return to the pool
            t.segs.clear();
        }
    }
}
