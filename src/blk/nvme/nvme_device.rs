use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use log::{debug, error, info, trace};
use parking_lot::Mutex;

use crate::blk::block_device::{BlockDevice, DeviceGeometry};
use crate::blk::io_buffer::IoBuffer;
use crate::blk::io_context::{AioCallback, IOContext};
use crate::blk::nvme::driver::SharedDriverData;
use crate::blk::nvme::driver_queue::SubmissionQueue;
use crate::blk::nvme::manager::NvmeManager;
use crate::blk::nvme::splitter::RequestSplitter;
use crate::blk::nvme::task::{PrimaryRead, Task};
use crate::blk::nvme::transport::TransportId;
use crate::common::config::{BlkConfig, DeviceId, SPDK_PREFIX};
use crate::common::exception::{check_return_code, BlkError};
use crate::common::util::{p2align, p2roundup};

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

type QueueMap = Mutex<HashMap<ThreadId, Arc<Mutex<SubmissionQueue>>>>;

thread_local! {
    /// Queues this thread created, one per open device. Dropped with the thread.
    static QUEUE_LEASES: RefCell<Vec<QueueLease>> = const { RefCell::new(Vec::new()) };
}

/// Removes a thread's queue from its device when the thread exits, which returns the queue
/// pair to the controller and frees the DMA pool.
struct QueueLease {
    queues: Weak<QueueMap>,
    tid: ThreadId,
}

impl QueueLease {
    fn is_live(&self) -> bool {
        self.queues.strong_count() > 0
    }
}

impl Drop for QueueLease {
    fn drop(&mut self) {
        if let Some(queues) = self.queues.upgrade() {
            queues.lock().remove(&self.tid);
        }
    }
}

struct OpenState {
    driver: Arc<SharedDriverData>,
    device_id: DeviceId,
}

/// Block device served by a user-space NVMe controller.
///
/// The path is a symlink whose target basename starts with `spdk:`; the target file holds
/// the controller's transport id on its first line, e.g. `trtype:PCIe traddr:0000:04:00.0`.
pub struct NvmeDevice {
    config: BlkConfig,
    callback: Option<AioCallback>,
    manager: Arc<NvmeManager>,
    splitter: RequestSplitter,
    geometry: DeviceGeometry,
    name: String,
    state: Option<OpenState>,
    queues: Arc<QueueMap>,
}

impl NvmeDevice {
    pub fn new(config: BlkConfig, callback: Option<AioCallback>) -> Self {
        Self::with_manager(NvmeManager::global(), config, callback)
    }

    pub fn with_manager(manager: Arc<NvmeManager>, config: BlkConfig, callback: Option<AioCallback>) -> Self {
        let splitter = RequestSplitter::new(config.chunk_size);
        Self {
            config,
            callback,
            manager,
            splitter,
            geometry: DeviceGeometry::default(),
            name: String::new(),
            state: None,
            queues: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// True when `path` is a symlink to an `spdk:` target.
    pub fn support(path: &Path) -> bool {
        let Ok(target) = fs::read_link(path) else {
            return false;
        };
        target
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(SPDK_PREFIX))
    }

    /// Transport address of the attached controller; empty while closed.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn driver(&self) -> Option<&Arc<SharedDriverData>> {
        self.state.as_ref().map(|s| &s.driver)
    }

    /// Live submission queues, one per thread that has submitted and not yet exited.
    pub fn num_queues(&self) -> usize {
        self.queues.lock().len()
    }

    fn state(&self) -> Result<&OpenState, BlkError> {
        self.state.as_ref().ok_or(BlkError::NotOpen)
    }

    fn queue_for_current_thread(&self) -> Result<Arc<Mutex<SubmissionQueue>>, BlkError> {
        let state = self.state()?;
        let tid = thread::current().id();
        let queue = {
            let mut queues = self.queues.lock();
            if let Some(queue) = queues.get(&tid) {
                return Ok(Arc::clone(queue));
            }
            let queue = SubmissionQueue::new(&state.driver, &self.config, self.callback.clone())?;
            debug!("{}: new submission queue for {:?}", self.name, tid);
            let queue = Arc::new(Mutex::new(queue));
            queues.insert(tid, Arc::clone(&queue));
            queue
        };

        let lease = QueueLease {
            queues: Arc::downgrade(&self.queues),
            tid,
        };
        let registered = QUEUE_LEASES.try_with(|leases| {
            let mut leases = leases.borrow_mut();
            leases.retain(QueueLease::is_live);
            leases.push(lease);
        });
        if registered.is_err() {
            // thread is exiting; close() reclaims the queue
            trace!("{}: no lease for {:?}", self.name, tid);
        }
        Ok(queue)
    }

    /// Submits tasks on a private synchronous context and waits for them.
    fn run_sync(&self, tasks: Vec<Task>) -> Arc<IOContext> {
        let ioc = IOContext::new_sync();
        for t in tasks {
            ioc.append_task(t);
        }
        self.aio_submit(&ioc);
        ioc.wait();
        ioc
    }

    /// Reads `aligned_off~aligned_len` and returns the `off~out.len()` part in `out`.
    fn read_covering(&self, aligned_off: u64, aligned_len: u64, off: u64, out: &mut [u8]) -> Result<(), BlkError> {
        self.state()?;
        let buf = IoBuffer::new(out.len());
        let primary = PrimaryRead::new();
        let tasks = self.splitter.make_read_tasks(
            aligned_off,
            aligned_len,
            &buf,
            Some(&primary),
            off,
            out.len() as u64,
        );
        self.run_sync(tasks);

        let r = primary.return_code();
        if r == PrimaryRead::PENDING {
            error!("read {:#x}~{:#x} drained without settling", off, out.len());
            return Err(BlkError::from_errno(-libc::EIO));
        }
        check_return_code(r)?;
        buf.copy_to(out);
        Ok(())
    }
}

impl BlockDevice for NvmeDevice {
    fn geometry(&self) -> &DeviceGeometry {
        &self.geometry
    }

    fn collect_metadata(&self, prefix: &str, pm: &mut BTreeMap<String, String>) -> Result<(), BlkError> {
        let mut put = |k: &str, v: String| {
            pm.insert(format!("{}{}", prefix, k), v);
        };
        put("rotational", "0".to_string());
        put("size", self.get_size().to_string());
        put("block_size", self.get_block_size().to_string());
        put("driver", "NVMEDevice".to_string());
        put("type", "nvme".to_string());
        put("access_mode", "spdk".to_string());
        put("nvme_serial_number", self.name.clone());
        Ok(())
    }

    fn read(&self, off: u64, out: &mut [u8], buffered: bool) -> Result<(), BlkError> {
        let len = out.len() as u64;
        trace!("read {:#x}~{:#x} buffered {}", off, len, buffered);
        assert!(self.is_valid_io(off, len));
        self.read_covering(off, len, off, out)
    }

    fn read_random(&self, off: u64, out: &mut [u8], buffered: bool) -> Result<(), BlkError> {
        let len = out.len() as u64;
        assert!(len > 0);
        assert!(off < self.geometry.size);
        assert!(off + len <= self.geometry.size);

        let bs = self.geometry.block_size;
        let aligned_off = p2align(off, bs);
        let aligned_len = p2roundup(off + len, bs) - aligned_off;
        trace!(
            "read_random {:#x}~{:#x} aligned {:#x}~{:#x} buffered {}",
            off,
            len,
            aligned_off,
            aligned_len,
            buffered
        );
        self.read_covering(aligned_off, aligned_len, off, out)
    }

    fn aio_read(&self, off: u64, len: u64, buf: &IoBuffer, ioc: &Arc<IOContext>) -> Result<(), BlkError> {
        trace!("aio_read {:#x}~{:#x} ioc {:p}", off, len, Arc::as_ptr(ioc));
        assert!(self.is_valid_io(off, len));
        assert!(buf.len() as u64 >= len, "read buffer smaller than {:#x}", len);
        self.state()?;
        for t in self.splitter.make_read_tasks(off, len, buf, None, off, len) {
            ioc.append_task(t);
        }
        Ok(())
    }

    fn write(&self, off: u64, data: &[u8], buffered: bool) -> Result<(), BlkError> {
        let len = data.len() as u64;
        trace!("write {:#x}~{:#x} buffered {}", off, len, buffered);
        assert!(self.is_valid_io(off, len));
        self.state()?;
        let ioc = self.run_sync(self.splitter.split_write(off, Arc::from(data)));
        check_return_code(ioc.get_return_value())
    }

    fn aio_write(
        &self,
        off: u64,
        data: Arc<[u8]>,
        ioc: &Arc<IOContext>,
        buffered: bool,
    ) -> Result<(), BlkError> {
        let len = data.len() as u64;
        trace!("aio_write {:#x}~{:#x} ioc {:p} buffered {}", off, len, Arc::as_ptr(ioc), buffered);
        assert!(self.is_valid_io(off, len));
        self.state()?;
        for t in self.splitter.split_write(off, data) {
            ioc.append_task(t);
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), BlkError> {
        self.state()?;
        let ioc = self.run_sync(vec![Task::flush()]);
        check_return_code(ioc.get_return_value())
    }

    fn invalidate_cache(&self, off: u64, len: u64) -> Result<(), BlkError> {
        trace!("invalidate_cache {:#x}~{:#x}", off, len);
        Ok(())
    }

    fn supported_bdev_label(&self) -> bool {
        false
    }

    fn open(&mut self, path: &Path) -> Result<(), BlkError> {
        assert!(self.state.is_none(), "{} is already open", self.name);
        info!("open path {}", path.display());
        self.config.validate()?;

        let contents = fs::read_to_string(path).map_err(|e| {
            error!("unable to open {}: {}", path.display(), e);
            BlkError::from(e)
        })?;
        let line = contents.lines().next().unwrap_or_default();
        let trid = TransportId::parse(line.trim()).map_err(|e| {
            error!("unable to read {}: {}", path.display(), e);
            e
        })?;

        let driver = self.manager.try_get(&trid)?;
        let device_id = NEXT_DEVICE_ID.fetch_add(1, Ordering::SeqCst);
        driver.register_device(device_id);

        let block_size = driver.get_block_size() as u64;
        self.geometry = DeviceGeometry {
            // round size down to an even block
            size: p2align(driver.get_size(), block_size),
            block_size,
            rotational: false,
            ..DeviceGeometry::default()
        };
        self.name = trid.traddr.clone();
        self.state = Some(OpenState { driver, device_id });

        info!(
            "open size {:#x} block_size {} on {}",
            self.geometry.size, block_size, self.name
        );
        Ok(())
    }

    fn close(&mut self) {
        let Some(state) = self.state.take() else {
            return;
        };
        debug!("close {}", self.name);
        // leases still held by other threads point at the old map and go inert
        self.queues = Arc::new(Mutex::new(HashMap::new()));
        state.driver.remove_device(state.device_id);
        self.name.clear();
    }

    fn aio_submit(&self, ioc: &Arc<IOContext>) {
        let pending = ioc.num_pending();
        trace!(
            "aio_submit ioc {:p} pending {} running {}",
            Arc::as_ptr(ioc),
            pending,
            ioc.num_running()
        );
        if pending == 0 {
            return;
        }
        let tasks = ioc.take_tasks();
        if tasks.is_empty() {
            return;
        }
        ioc.start_running();

        let queue = match self.queue_for_current_thread() {
            Ok(queue) => queue,
            Err(e) => panic!("aio_submit on {}: no submission queue: {}", self.name, e),
        };
        queue.lock().aio_handle(ioc, tasks);
    }
}

impl Drop for NvmeDevice {
    fn drop(&mut self) {
        self.close();
    }
}
