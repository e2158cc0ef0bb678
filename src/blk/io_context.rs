//! In-flight I/O tracking for one caller-visible batch of requests.
//!
//! Counters follow a two-stage lifecycle:
//!
//! ```text
//!   aio_read / aio_write          aio_submit                 completion
//!   ───────────────────► pending ───────────► running ──────────────────► drained
//!      num_pending += 1      num_running += pending      try_wake / device callback
//! ```
//!
//! Synchronous callers (no `priv` tag) block in [`IOContext::wait`]; asynchronous callers get
//! the device-level callback exactly once, when `num_running` drops to zero.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use log::{debug, trace};
use parking_lot::{Condvar, Mutex};

use crate::blk::aio::Aio;
use crate::blk::nvme::task::Task;

/// Opaque tag identifying an asynchronous caller.
pub type AioPriv = Arc<dyn Any + Send + Sync>;

/// Device-level completion callback, invoked once per drained asynchronous context.
pub type AioCallback = Arc<dyn Fn(&IOContext) + Send + Sync>;

pub struct IOContext {
    lock: Mutex<()>,
    cond: Condvar,
    r: AtomicI32,
    priv_: Option<AioPriv>,
    allow_eio: bool,
    flags: u32,

    /// Not yet submitted NVMe tasks, in submission order.
    nvme_tasks: Mutex<VecDeque<Task>>,
    /// DMA segments currently held by this context's tasks.
    pub(crate) total_nseg: AtomicI32,

    /// Kernel aios not yet submitted.
    pending_aios: Mutex<Vec<Aio>>,
    /// Completed kernel aios, kept until `release_running_aios`.
    running_aios: Mutex<Vec<Aio>>,

    pub(crate) num_pending: AtomicI32,
    pub(crate) num_running: AtomicI32,
}

impl IOContext {
    pub const FLAG_DONT_CACHE: u32 = 1;

    pub fn new(priv_: Option<AioPriv>, allow_eio: bool) -> Self {
        Self {
            lock: Mutex::new(()),
            cond: Condvar::new(),
            r: AtomicI32::new(0),
            priv_,
            allow_eio,
            flags: 0,
            nvme_tasks: Mutex::new(VecDeque::new()),
            total_nseg: AtomicI32::new(0),
            pending_aios: Mutex::new(Vec::new()),
            running_aios: Mutex::new(Vec::new()),
            num_pending: AtomicI32::new(0),
            num_running: AtomicI32::new(0),
        }
    }

    /// Context for a caller that blocks in [`IOContext::wait`].
    pub fn new_sync() -> Arc<Self> {
        Arc::new(Self::new(None, false))
    }

    /// Context for a caller notified through the device callback.
    pub fn new_async(priv_: AioPriv) -> Arc<Self> {
        Arc::new(Self::new(Some(priv_), false))
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn priv_data(&self) -> Option<&AioPriv> {
        self.priv_.as_ref()
    }

    pub fn is_async(&self) -> bool {
        self.priv_.is_some()
    }

    pub fn allow_eio(&self) -> bool {
        self.allow_eio
    }

    pub fn skip_cache(&self) -> bool {
        self.flags & Self::FLAG_DONT_CACHE != 0
    }

    pub fn has_pending(&self) -> bool {
        self.num_pending.load(Ordering::SeqCst) > 0
    }

    pub fn num_pending(&self) -> i32 {
        self.num_pending.load(Ordering::SeqCst)
    }

    pub fn num_running(&self) -> i32 {
        self.num_running.load(Ordering::SeqCst)
    }

    pub fn set_return_value(&self, r: i32) {
        self.r.store(r, Ordering::SeqCst);
    }

    pub fn get_return_value(&self) -> i32 {
        self.r.load(Ordering::SeqCst)
    }

    /// Records a failure unless an earlier one is already stored.
    pub(crate) fn record_error(&self, r: i32) {
        let _ = self
            .r
            .compare_exchange(0, r, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// Cost estimate: queued kernel aios plus DMA segments in use.
    pub fn get_num_ios(&self) -> u64 {
        let aios = self.pending_aios.lock().len() as u64;
        let segs = self.total_nseg.load(Ordering::SeqCst).max(0) as u64;
        aios + segs
    }

    /// Called from completion paths of synchronous contexts.
    ///
    /// Only the 1 -> 0 transition notifies. A submitter may bump `num_running` again between
    /// the decrement and the notify, so waiters must re-check the count themselves.
    pub fn try_wake(&self) {
        assert!(
            self.num_running.load(Ordering::SeqCst) >= 1,
            "try_wake on a context with nothing running"
        );
        let _guard = self.lock.lock();
        if self.num_running.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.cond.notify_all();
        }
    }

    /// Blocks until `num_running` reaches zero.
    pub fn wait(&self) {
        let mut guard = self.lock.lock();
        while self.num_running.load(Ordering::SeqCst) > 0 {
            debug!(
                "IOContext {:p} waiting for {} aios to complete",
                self,
                self.num_running.load(Ordering::SeqCst)
            );
            self.cond.wait(&mut guard);
        }
        debug!("IOContext {:p} done", self);
    }

    /// Frees completion records held by the kernel backend. Requires a drained context.
    pub fn release_running_aios(&self) {
        assert_eq!(
            self.num_running.load(Ordering::SeqCst),
            0,
            "release_running_aios with aios in flight"
        );
        self.running_aios.lock().clear();
    }

    /// Retires one running operation: device callback for asynchronous contexts, `try_wake`
    /// for synchronous ones.
    pub(crate) fn complete_one(&self, callback: Option<&AioCallback>) {
        if self.priv_.is_some() {
            let _guard = self.lock.lock();
            if self.num_running.fetch_sub(1, Ordering::SeqCst) == 1 {
                self.cond.notify_all();
                drop(_guard);
                match callback {
                    Some(cb) => cb(self),
                    None => trace!("IOContext {:p} drained without a device callback", self),
                }
            }
        } else {
            self.try_wake();
        }
    }

    /// Moves every pending operation to running; returns how many moved.
    pub(crate) fn start_running(&self) -> i32 {
        let pending = self.num_pending.load(Ordering::SeqCst);
        if pending > 0 {
            self.num_running.fetch_add(pending, Ordering::SeqCst);
            let prev = self.num_pending.fetch_sub(pending, Ordering::SeqCst);
            // the submitting thread is the only one touching num_pending
            assert_eq!(prev, pending, "concurrent submission on one IOContext");
        }
        pending
    }

    pub(crate) fn append_task(&self, task: Task) {
        self.nvme_tasks.lock().push_back(task);
        self.num_pending.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn take_tasks(&self) -> VecDeque<Task> {
        std::mem::take(&mut *self.nvme_tasks.lock())
    }

    /// Offsets and lengths of the not yet submitted NVMe tasks.
    pub fn pending_task_ranges(&self) -> Vec<(u64, u64)> {
        self.nvme_tasks
            .lock()
            .iter()
            .map(|t| (t.offset, t.len))
            .collect()
    }

    pub(crate) fn append_aio(&self, aio: Aio) {
        self.pending_aios.lock().push(aio);
        self.num_pending.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn take_pending_aios(&self) -> Vec<Aio> {
        std::mem::take(&mut *self.pending_aios.lock())
    }

    pub(crate) fn park_running_aio(&self, aio: Aio) {
        self.running_aios.lock().push(aio);
    }

    pub fn num_running_aios(&self) -> usize {
        self.running_aios.lock().len()
    }
}

impl fmt::Debug for IOContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IOContext")
            .field("async", &self.priv_.is_some())
            .field("num_pending", &self.num_pending.load(Ordering::Relaxed))
            .field("num_running", &self.num_running.load(Ordering::Relaxed))
            .field("r", &self.r.load(Ordering::Relaxed))
            .field("flags", &self.flags)
            .finish()
    }
}

impl Drop for IOContext {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert_eq!(*self.num_pending.get_mut(), 0, "IOContext dropped with pending I/O");
            debug_assert_eq!(*self.num_running.get_mut(), 0, "IOContext dropped with running I/O");
        }
    }
}
