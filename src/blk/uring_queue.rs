//! io_uring engine for kernel-device aios.
//!
//! Records are parked in a slot table keyed by SQE `user_data` while the kernel owns their
//! staging memory. Submitters push under the slot lock; the reaper waits on the ring with a
//! timeout and then drains CQEs under its own lock.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use io_uring::{opcode, squeue, types, IoUring};
use log::{debug, error, trace, warn};
use parking_lot::Mutex;

use crate::blk::aio::{Aio, AioOp};
use crate::blk::io_queue::{submit_with_backoff, IoQueue, Push};
use crate::common::aligned::AlignedBuffer;
use crate::common::config::DEFAULT_PAGE_SIZE;
use crate::common::exception::BlkError;

const MAX_RING_ENTRIES: usize = 4096;

struct Slots {
    aios: Vec<Option<Aio>>,
    free: Vec<usize>,
}

pub struct UringQueue {
    ring: IoUring,
    depth: usize,
    alignment: usize,
    file: Option<Arc<File>>,
    slots: Mutex<Slots>,
    reap_lock: Mutex<()>,
    closed: AtomicBool,
    in_flight: AtomicUsize,
}

impl UringQueue {
    /// Sets up a ring with room for `max_iodepth` records, capped at 4096.
    ///
    /// Fails when the kernel refuses io_uring or lacks timed completion waits.
    pub fn new(max_iodepth: usize) -> Result<Self, BlkError> {
        let depth = max_iodepth.clamp(1, MAX_RING_ENTRIES);
        let ring = IoUring::new(depth.next_power_of_two() as u32)?;
        if !ring.params().is_feature_ext_arg() {
            return Err(BlkError::Unsupported("io_uring timed completion waits"));
        }
        Ok(Self {
            ring,
            depth,
            alignment: DEFAULT_PAGE_SIZE,
            file: None,
            slots: Mutex::new(Slots {
                aios: (0..depth).map(|_| None).collect(),
                free: (0..depth).rev().collect(),
            }),
            reap_lock: Mutex::new(()),
            closed: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
        })
    }

    pub fn max_iodepth(&self) -> usize {
        self.depth
    }

    /// Stages `aio` and builds its SQE. The entry points into `aio.staging`.
    fn prepare(&self, fd: i32, aio: &mut Aio, slot: usize) -> squeue::Entry {
        let len = aio.length as usize;
        assert!(len <= u32::MAX as usize, "aio of {:#x} bytes exceeds one SQE", len);
        let entry = match &aio.op {
            AioOp::Read { .. } => {
                let mut staging = AlignedBuffer::zeroed(len, self.alignment);
                let ptr = staging.as_mut_ptr();
                aio.staging = Some(staging);
                opcode::Read::new(types::Fd(fd), ptr, len as u32)
                    .offset(aio.offset)
                    .build()
            }
            AioOp::Write { data } => {
                let staging = AlignedBuffer::copy_from(&data[..len], self.alignment);
                let ptr = staging.as_ptr();
                aio.staging = Some(staging);
                opcode::Write::new(types::Fd(fd), ptr, len as u32)
                    .offset(aio.offset)
                    .build()
            }
        };
        entry.user_data(slot as u64)
    }

    fn push(&self, fd: i32, mut aio: Aio) -> Push {
        if self.closed.load(Ordering::SeqCst) {
            return Push::Closed(aio);
        }
        let mut slots = self.slots.lock();
        let Some(slot) = slots.free.pop() else {
            drop(slots);
            self.kick();
            return Push::Full(aio);
        };
        let entry = self.prepare(fd, &mut aio, slot);

        // SAFETY: pushes are serialized by the slot lock. The staging buffer lives in the
        // slot table until its CQE is reaped, and Drop drains the ring before freeing slots.
        let pushed = unsafe {
            let mut sq = self.ring.submission_shared();
            sq.push(&entry).is_ok()
        };
        if !pushed {
            slots.free.push(slot);
            aio.staging = None;
            drop(slots);
            self.kick();
            return Push::Full(aio);
        }
        trace!("slot {} <- {:?}", slot, aio);
        slots.aios[slot] = Some(aio);
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Push::Queued
    }

    /// Hands queued SQEs to the kernel.
    fn kick(&self) {
        let _slots = self.slots.lock();
        if let Err(e) = self.ring.submitter().submit() {
            if e.raw_os_error() != Some(libc::EBUSY) {
                error!("io_uring submit failed: {}", e);
            }
        }
    }

    fn wait(&self, timeout: Duration) {
        let ts = types::Timespec::new()
            .sec(timeout.as_secs())
            .nsec(timeout.subsec_nanos());
        let args = types::SubmitArgs::new().timespec(&ts);
        match self.ring.submitter().submit_with_args(1, &args) {
            Ok(_) => {}
            Err(e) if matches!(e.raw_os_error(), Some(libc::ETIME) | Some(libc::EINTR) | Some(libc::EBUSY)) => {}
            Err(e) => error!("io_uring wait failed: {}", e),
        }
    }

    /// Pops up to `max` CQEs as `(slot, result)` pairs.
    fn pop_completions(&self, max: usize) -> Vec<(usize, i32)> {
        let _guard = self.reap_lock.lock();
        // SAFETY: CQ access is serialized by `reap_lock`.
        let mut cq = unsafe { self.ring.completion_shared() };
        cq.by_ref()
            .take(max)
            .map(|cqe| (cqe.user_data() as usize, cqe.result()))
            .collect()
    }

    fn take_completed(&self, max: usize) -> Vec<Aio> {
        let cqes = self.pop_completions(max);
        if cqes.is_empty() {
            return Vec::new();
        }
        let mut slots = self.slots.lock();
        let mut done = Vec::with_capacity(cqes.len());
        for (slot, result) in cqes {
            let Some(mut aio) = slots.aios.get_mut(slot).and_then(Option::take) else {
                error!("io_uring completion for unknown slot {}", slot);
                continue;
            };
            slots.free.push(slot);
            aio.rval = result as i64;
            if !aio.is_read() {
                aio.staging = None;
            }
            done.push(aio);
        }
        drop(slots);
        self.in_flight.fetch_sub(done.len(), Ordering::SeqCst);
        done
    }

    fn drain(&self) {
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            if let Err(e) = self.ring.submit_and_wait(1) {
                if e.raw_os_error() != Some(libc::EINTR) {
                    error!("io_uring drain failed: {}, leaking in-flight buffers", e);
                    // the kernel may still write into them
                    std::mem::forget(std::mem::take(&mut self.slots.lock().aios));
                    return;
                }
            }
            for aio in self.take_completed(self.depth) {
                warn!("dropping unreaped {:?}", aio);
            }
        }
    }

    fn fd(&self) -> Option<i32> {
        self.file.as_ref().map(|f| f.as_raw_fd())
    }
}

impl IoQueue for UringQueue {
    fn init(&mut self, file: Arc<File>) -> Result<(), BlkError> {
        assert!(self.file.is_none(), "aio queue initialized twice");
        self.file = Some(file);
        self.closed.store(false, Ordering::SeqCst);
        debug!("io_uring queue started: max iodepth {}", self.depth);
        Ok(())
    }

    fn shutdown(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.drain();
    }

    fn submit_batch(&self, aios: Vec<Aio>) -> Result<u32, (i32, Vec<Aio>)> {
        let Some(fd) = self.fd() else {
            return Err((-libc::ESHUTDOWN, aios));
        };
        let result = submit_with_backoff(aios, |aio| self.push(fd, aio));
        self.kick();
        result
    }

    fn get_next_completed(&self, timeout: Duration, max: usize) -> Vec<Aio> {
        let done = self.take_completed(max);
        if !done.is_empty() {
            return done;
        }
        self.wait(timeout);
        self.take_completed(max)
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn engine(&self) -> &'static str {
        "io_uring"
    }
}

impl Drop for UringQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blk::io_buffer::IoBuffer;
    use std::io::Write;
    use std::os::unix::fs::FileExt;
    use tempfile::NamedTempFile;

    /// None when the sandbox refuses io_uring; the thread engine covers those hosts.
    fn queue_over(contents: &[u8], depth: usize) -> Option<(NamedTempFile, UringQueue)> {
        let mut queue = match UringQueue::new(depth) {
            Ok(queue) => queue,
            Err(e) => {
                eprintln!("skipping io_uring test: {}", e);
                return None;
            }
        };
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(contents).unwrap();
        tmp.flush().unwrap();
        queue.init(Arc::new(tmp.reopen().unwrap())).unwrap();
        Some((tmp, queue))
    }

    fn collect(queue: &UringQueue, n: usize) -> Vec<Aio> {
        let mut out = Vec::new();
        while out.len() < n {
            out.extend(queue.get_next_completed(Duration::from_millis(100), n));
        }
        out
    }

    #[test]
    fn test_read_lands_in_staging() {
        let data: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
        let Some((_tmp, queue)) = queue_over(&data, 8) else { return };

        queue.submit_batch(vec![Aio::read(4096, 4096, IoBuffer::new(4096))]).unwrap();
        let done = collect(&queue, 1);
        assert_eq!(done[0].get_return_value(), 4096);
        assert_eq!(&done[0].staging.as_ref().unwrap()[..], &data[4096..]);
        assert_eq!(queue.in_flight(), 0);
        assert_eq!(queue.engine(), "io_uring");
    }

    #[test]
    fn test_more_writes_than_slots() {
        let Some((tmp, queue)) = queue_over(&vec![0u8; 64 * 512], 4) else { return };
        let queue = Arc::new(queue);

        let reaper = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || collect(&queue, 64))
        };
        let aios: Vec<Aio> = (0..64u64)
            .map(|i| Aio::write(i * 512, Arc::from(vec![i as u8; 512])))
            .collect();
        queue.submit_batch(aios).unwrap();

        let done = reaper.join().unwrap();
        assert_eq!(done.len(), 64);
        assert!(done.iter().all(|a| a.get_return_value() == 512 && a.staging.is_none()));

        let file = tmp.reopen().unwrap();
        let mut buf = [0u8; 512];
        file.read_at(&mut buf, 63 * 512).unwrap();
        assert!(buf.iter().all(|&b| b == 63));
    }

    #[test]
    fn test_timed_wait_returns_empty() {
        let Some((_tmp, queue)) = queue_over(&[0u8; 512], 4) else { return };
        assert!(queue.get_next_completed(Duration::from_millis(5), 4).is_empty());
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let Some((_tmp, mut queue)) = queue_over(&[0u8; 512], 4) else { return };
        queue.shutdown();
        let err = queue
            .submit_batch(vec![Aio::read(0, 512, IoBuffer::new(512))])
            .unwrap_err();
        assert_eq!(err.0, -libc::ESHUTDOWN);
        assert_eq!(err.1.len(), 1);
    }
}
