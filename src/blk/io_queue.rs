//! Submission/completion queues for kernel-device aios.
//!
//! On Linux the kernel backend hands records to io_uring ([`crate::blk::uring_queue`]).
//! [`AioQueue`] is the portable engine: it emulates an `io_submit`/`io_getevents` pair in
//! user space, a bounded crossbeam channel feeding a pool of I/O threads doing positional
//! reads and writes, with finished records coming back on a completion channel drained by
//! the device reaper.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{debug, error, trace, warn};

use crate::blk::aio::{Aio, AioOp};
use crate::common::aligned::AlignedBuffer;
use crate::common::config::{AioEngine, BlkConfig, DEFAULT_PAGE_SIZE, WORKER_STACK_SIZE};
use crate::common::exception::BlkError;
use crate::common::thread::spawn_named;

const SUBMIT_ATTEMPTS: u32 = 16;
const SUBMIT_INITIAL_DELAY_US: u64 = 125;

pub trait IoQueue: Send + Sync {
    /// Starts serving I/O against `file`.
    fn init(&mut self, file: Arc<File>) -> Result<(), BlkError>;

    /// Stops the I/O threads. Records still queued are executed first.
    fn shutdown(&mut self);

    /// Queues every aio in `aios`, retrying with backoff while the queue is full.
    ///
    /// Returns how many retries were needed. On failure the unsubmitted records are returned
    /// together with a negative errno.
    fn submit_batch(&self, aios: Vec<Aio>) -> Result<u32, (i32, Vec<Aio>)>;

    /// Waits up to `timeout` for completions and returns at most `max` of them.
    fn get_next_completed(&self, timeout: Duration, max: usize) -> Vec<Aio>;

    /// Aios submitted and not yet returned by `get_next_completed`.
    fn in_flight(&self) -> usize;

    /// Short engine name for logs and device metadata.
    fn engine(&self) -> &'static str;
}

/// Outcome of handing one record to an engine.
pub(crate) enum Push {
    Queued,
    Full(Aio),
    Closed(Aio),
}

/// Pushes every record in order, sleeping with exponential backoff while the engine is full.
///
/// The attempt budget resets after each record that goes through.
pub(crate) fn submit_with_backoff(
    aios: Vec<Aio>,
    mut push: impl FnMut(Aio) -> Push,
) -> Result<u32, (i32, Vec<Aio>)> {
    let mut retries = 0;
    let mut attempts = SUBMIT_ATTEMPTS;
    let mut delay = SUBMIT_INITIAL_DELAY_US;
    let mut iter = aios.into_iter();
    let mut next = iter.next();

    while let Some(aio) = next.take() {
        match push(aio) {
            Push::Queued => {
                attempts = SUBMIT_ATTEMPTS;
                delay = SUBMIT_INITIAL_DELAY_US;
                next = iter.next();
            }
            Push::Full(aio) => {
                if attempts == 0 {
                    let mut rest = vec![aio];
                    rest.extend(iter);
                    return Err((-libc::EAGAIN, rest));
                }
                attempts -= 1;
                retries += 1;
                thread::sleep(Duration::from_micros(delay));
                delay *= 2;
                next = Some(aio);
            }
            Push::Closed(aio) => {
                let mut rest = vec![aio];
                rest.extend(iter);
                return Err((-libc::ESHUTDOWN, rest));
            }
        }
    }
    if retries > 0 {
        warn!("aio submit needed {} retries", retries);
    }
    Ok(retries)
}

/// Builds the engine `config.aio_engine` asks for; `Auto` falls back to threads.
pub fn create_queue(config: &BlkConfig) -> Result<Box<dyn IoQueue>, BlkError> {
    let depth = config.aio_max_queue_depth;
    match config.aio_engine {
        AioEngine::Threads => Ok(Box::new(AioQueue::new(depth, config.aio_threads))),
        AioEngine::Uring => uring_queue(depth),
        AioEngine::Auto => match uring_queue(depth) {
            Ok(queue) => Ok(queue),
            Err(e) => {
                warn!("io_uring unavailable ({}), using {} aio threads", e, config.aio_threads);
                Ok(Box::new(AioQueue::new(depth, config.aio_threads)))
            }
        },
    }
}

#[cfg(target_os = "linux")]
fn uring_queue(depth: usize) -> Result<Box<dyn IoQueue>, BlkError> {
    Ok(Box::new(crate::blk::uring_queue::UringQueue::new(depth)?))
}

#[cfg(not(target_os = "linux"))]
fn uring_queue(_depth: usize) -> Result<Box<dyn IoQueue>, BlkError> {
    Err(BlkError::Unsupported("io_uring"))
}

pub struct AioQueue {
    max_iodepth: usize,
    num_threads: usize,
    alignment: usize,
    submit_tx: Option<Sender<Aio>>,
    submit_rx: Receiver<Aio>,
    completed_tx: Sender<Aio>,
    completed_rx: Receiver<Aio>,
    workers: Vec<JoinHandle<()>>,
    in_flight: Arc<AtomicUsize>,
}

impl AioQueue {
    pub fn new(max_iodepth: usize, num_threads: usize) -> Self {
        let (submit_tx, submit_rx) = bounded(max_iodepth);
        let (completed_tx, completed_rx) = unbounded();
        Self {
            max_iodepth,
            num_threads,
            alignment: DEFAULT_PAGE_SIZE,
            submit_tx: Some(submit_tx),
            submit_rx,
            completed_tx,
            completed_rx,
            workers: Vec::new(),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn max_iodepth(&self) -> usize {
        self.max_iodepth
    }

    fn execute(file: &File, alignment: usize, aio: &mut Aio) {
        let len = aio.length as usize;
        let mut staging = AlignedBuffer::zeroed(len, alignment);
        let result = match &aio.op {
            AioOp::Read { .. } => read_full_at(file, &mut staging, aio.offset),
            AioOp::Write { data } => {
                staging.copy_from_slice(&data[..len]);
                file.write_all_at(&staging, aio.offset).map(|_| len)
            }
        };
        aio.rval = match result {
            Ok(n) => n as i64,
            Err(e) => -(e.raw_os_error().unwrap_or(libc::EIO) as i64),
        };
        if aio.is_read() {
            aio.staging = Some(staging);
        }
    }
}

/// Reads until `buf` is full or EOF; returns the number of bytes read.
pub(crate) fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match file.read_at(&mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}

impl IoQueue for AioQueue {
    fn init(&mut self, file: Arc<File>) -> Result<(), BlkError> {
        assert!(self.workers.is_empty(), "aio queue initialized twice");
        for i in 0..self.num_threads {
            let rx = self.submit_rx.clone();
            let tx = self.completed_tx.clone();
            let file = Arc::clone(&file);
            let alignment = self.alignment;
            let handle = spawn_named(&format!("aio-io-{}", i), WORKER_STACK_SIZE, move || {
                while let Ok(mut aio) = rx.recv() {
                    trace!("executing {:?}", aio);
                    Self::execute(&file, alignment, &mut aio);
                    if tx.send(aio).is_err() {
                        break;
                    }
                }
                debug!("aio worker exiting");
            })?;
            self.workers.push(handle);
        }
        debug!(
            "aio queue started: {} threads, max iodepth {}",
            self.num_threads, self.max_iodepth
        );
        Ok(())
    }

    fn shutdown(&mut self) {
        // closing the submit side ends every worker's recv loop
        self.submit_tx.take();
        for handle in self.workers.drain(..) {
            if let Err(e) = handle.join() {
                error!("Failed to join aio worker: {:?}", e);
            }
        }
    }

    fn submit_batch(&self, aios: Vec<Aio>) -> Result<u32, (i32, Vec<Aio>)> {
        let Some(tx) = self.submit_tx.as_ref() else {
            return Err((-libc::ESHUTDOWN, aios));
        };
        submit_with_backoff(aios, |aio| {
            // counted before the send so a fast reaper never sees it go negative
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            match tx.try_send(aio) {
                Ok(()) => Push::Queued,
                Err(TrySendError::Full(aio)) => {
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                    Push::Full(aio)
                }
                Err(TrySendError::Disconnected(aio)) => {
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                    Push::Closed(aio)
                }
            }
        })
    }

    fn get_next_completed(&self, timeout: Duration, max: usize) -> Vec<Aio> {
        let mut done = Vec::new();
        match self.completed_rx.recv_timeout(timeout) {
            Ok(aio) => done.push(aio),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return done,
        }
        while done.len() < max {
            match self.completed_rx.try_recv() {
                Ok(aio) => done.push(aio),
                Err(_) => break,
            }
        }
        self.in_flight.fetch_sub(done.len(), Ordering::SeqCst);
        done
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn engine(&self) -> &'static str {
        "threads"
    }
}

impl Drop for AioQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
