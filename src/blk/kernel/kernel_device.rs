use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::{FileExt, FileTypeExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, error, info, trace, warn};

use crate::blk::aio::{is_expected_ioerr, Aio, AioOp};
use crate::blk::block_device::{BlockDevice, DeviceGeometry};
use crate::blk::io_buffer::IoBuffer;
use crate::blk::io_context::{AioCallback, IOContext};
use crate::blk::io_queue::{create_queue, read_full_at, IoQueue};
use crate::blk::kernel::direct_io::{self, DirectIoConfig};
use crate::common::aligned::AlignedBuffer;
use crate::common::config::{BlkConfig, WORKER_STACK_SIZE};
use crate::common::exception::BlkError;
use crate::common::thread::spawn_named;
use crate::common::util::{cpp_strerror, p2align, p2roundup};

/// Handles and threads that only exist while the device is open.
struct OpenState {
    fd_direct: Arc<File>,
    fd_buffered: File,
    queue: Arc<dyn IoQueue>,
    reaper: Option<JoinHandle<()>>,
    reaper_stop: Arc<AtomicBool>,
}

/// Block device backed by a kernel file or block special file.
pub struct KernelDevice {
    config: BlkConfig,
    callback: Option<AioCallback>,
    path: PathBuf,
    geometry: DeviceGeometry,
    devname: Option<String>,
    numa_node: Option<i32>,
    is_block: bool,
    state: Option<OpenState>,
}

impl KernelDevice {
    pub fn new(config: BlkConfig, callback: Option<AioCallback>) -> Self {
        Self {
            config,
            callback,
            path: PathBuf::new(),
            geometry: DeviceGeometry::default(),
            devname: None,
            numa_node: None,
            is_block: false,
            state: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn state(&self) -> Result<&OpenState, BlkError> {
        self.state.as_ref().ok_or(BlkError::NotOpen)
    }

    fn alignment(&self) -> usize {
        self.geometry.block_size as usize
    }

    fn sysfs_attr(devname: &str, attr: &str) -> Option<String> {
        // partitions keep their queue attributes on the parent disk
        let candidates = [
            format!("/sys/class/block/{}/{}", devname, attr),
            format!("/sys/class/block/{}/../{}", devname, attr),
        ];
        candidates
            .iter()
            .find_map(|p| fs::read_to_string(p).ok())
            .map(|s| s.trim().to_string())
    }

    fn load_block_attributes(&mut self, canonical: &Path) {
        let Some(devname) = canonical.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            return;
        };
        if let Some(v) = Self::sysfs_attr(&devname, "queue/rotational") {
            self.geometry.rotational = v != "0";
        }
        if let Some(v) = Self::sysfs_attr(&devname, "queue/discard_granularity") {
            self.geometry.support_discard = v.parse::<u64>().map(|g| g > 0).unwrap_or(false);
        }
        if let Some(v) = Self::sysfs_attr(&devname, "queue/optimal_io_size") {
            self.geometry.optimal_io_size = v.parse().unwrap_or(0);
        }
        self.numa_node = Self::sysfs_attr(&devname, "device/numa_node")
            .and_then(|v| v.parse::<i32>().ok())
            .filter(|&n| n >= 0);
        self.devname = Some(devname);
    }

    fn start_reaper(&self, queue: Arc<dyn IoQueue>, stop: Arc<AtomicBool>) -> Result<JoinHandle<()>, BlkError> {
        let callback = self.callback.clone();
        let timeout = self.config.aio_reap_timeout();
        let max = self.config.aio_reap_max.max(1);
        let handle = spawn_named("aio-reaper", WORKER_STACK_SIZE, move || {
            reap_loop(queue.as_ref(), &stop, callback.as_ref(), timeout, max)
        })?;
        Ok(handle)
    }

    /// Positional read honoring direct-I/O alignment through a staging buffer.
    fn pread(&self, file: &File, off: u64, out: &mut [u8], direct: bool) -> Result<(), BlkError> {
        let n = if direct {
            let mut staging = AlignedBuffer::zeroed(out.len(), self.alignment());
            let n = read_full_at(file, &mut staging, off)?;
            out.copy_from_slice(&staging);
            n
        } else {
            read_full_at(file, out, off)?
        };
        if n != out.len() {
            error!(
                "short read {:#x}~{:#x} from {}: got {:#x}",
                off,
                out.len(),
                self.path.display(),
                n
            );
            return Err(BlkError::from_errno(-libc::EIO));
        }
        Ok(())
    }

    fn pwrite(&self, file: &File, off: u64, data: &[u8], direct: bool) -> Result<(), BlkError> {
        if direct {
            let staging = AlignedBuffer::copy_from(data, self.alignment());
            file.write_all_at(&staging, off)?;
        } else {
            file.write_all_at(data, off)?;
        }
        Ok(())
    }
}

fn flag(b: bool) -> String {
    (if b { "1" } else { "0" }).to_string()
}

fn reap_loop(
    queue: &dyn IoQueue,
    stop: &AtomicBool,
    callback: Option<&AioCallback>,
    timeout: Duration,
    max: usize,
) {
    debug!("aio reaper started");
    loop {
        let completed = queue.get_next_completed(timeout, max);
        if completed.is_empty() {
            if stop.load(Ordering::SeqCst) && queue.in_flight() == 0 {
                break;
            }
            continue;
        }
        trace!("reaped {} aios", completed.len());
        for aio in completed {
            complete_aio(aio, callback);
        }
    }
    debug!("aio reaper finished");
}

fn complete_aio(mut aio: Aio, callback: Option<&AioCallback>) {
    let Some(ioc) = aio.ioc.take() else {
        error!("completed {:?} has no owning context", aio);
        return;
    };

    let r = aio.get_return_value();
    if r < 0 {
        let r = r as i32;
        if ioc.allow_eio() && is_expected_ioerr(r) {
            warn!("{:?} failed: {}, reporting EIO", aio, cpp_strerror(r));
            ioc.record_error(-libc::EIO);
        } else {
            error!("{:?} got unexpected error: {}", aio, cpp_strerror(r));
            ioc.record_error(r);
        }
    } else if r as u64 != aio.length {
        error!("{:?} transferred only {:#x} bytes", aio, r);
        ioc.record_error(-libc::EIO);
    } else if let (AioOp::Read { dest }, Some(staging)) = (&aio.op, aio.staging.as_ref()) {
        dest.write_at(0, staging);
    }
    aio.staging = None;

    ioc.park_running_aio(aio);
    ioc.complete_one(callback);
}

impl BlockDevice for KernelDevice {
    fn geometry(&self) -> &DeviceGeometry {
        &self.geometry
    }

    fn get_devname(&self) -> Option<String> {
        self.devname.clone()
    }

    fn get_numa_node(&self) -> Result<i32, BlkError> {
        self.numa_node.ok_or(BlkError::Unsupported("numa node"))
    }

    fn collect_metadata(&self, prefix: &str, pm: &mut BTreeMap<String, String>) -> Result<(), BlkError> {
        let mut put = |k: &str, v: String| {
            pm.insert(format!("{}{}", prefix, k), v);
        };
        put("driver", "KernelDevice".to_string());
        put("path", self.path.display().to_string());
        put("size", self.geometry.size.to_string());
        put("block_size", self.geometry.block_size.to_string());
        put("optimal_io_size", self.geometry.optimal_io_size.to_string());
        put("rotational", flag(self.geometry.rotational));
        put("support_discard", flag(self.geometry.support_discard));
        put("type", (if self.geometry.rotational { "hdd" } else { "ssd" }).to_string());
        put("access_mode", (if self.is_block { "blk" } else { "file" }).to_string());
        if let Some(state) = &self.state {
            put("aio_engine", state.queue.engine().to_string());
        }
        if let Some(devname) = &self.devname {
            put("devname", devname.clone());
        }
        if let Some(node) = self.numa_node {
            put("numa_node", node.to_string());
        }
        Ok(())
    }

    fn read(&self, off: u64, out: &mut [u8], buffered: bool) -> Result<(), BlkError> {
        trace!("read {:#x}~{:#x} buffered {}", off, out.len(), buffered);
        assert!(self.is_valid_io(off, out.len() as u64));
        let state = self.state()?;
        if buffered {
            self.pread(&state.fd_buffered, off, out, false)
        } else {
            self.pread(&state.fd_direct, off, out, true)
        }
    }

    fn read_random(&self, off: u64, out: &mut [u8], buffered: bool) -> Result<(), BlkError> {
        let len = out.len() as u64;
        trace!("read_random {:#x}~{:#x} buffered {}", off, len, buffered);
        assert!(len > 0);
        assert!(off < self.geometry.size);
        assert!(off + len <= self.geometry.size);
        let state = self.state()?;

        if buffered {
            return self.pread(&state.fd_buffered, off, out, false);
        }

        let bs = self.geometry.block_size;
        let aligned_off = p2align(off, bs);
        let aligned_len = p2roundup(off + len, bs) - aligned_off;
        let mut staging = vec![0u8; aligned_len as usize];
        self.pread(&state.fd_direct, aligned_off, &mut staging, true)?;
        let head = (off - aligned_off) as usize;
        out.copy_from_slice(&staging[head..head + out.len()]);
        Ok(())
    }

    fn aio_read(&self, off: u64, len: u64, buf: &IoBuffer, ioc: &Arc<IOContext>) -> Result<(), BlkError> {
        trace!("aio_read {:#x}~{:#x} ioc {:p}", off, len, Arc::as_ptr(ioc));
        assert!(self.is_valid_io(off, len));
        assert!(buf.len() as u64 >= len, "read buffer smaller than {:#x}", len);
        self.state()?;
        ioc.append_aio(Aio::read(off, len, buf.clone()));
        Ok(())
    }

    fn write(&self, off: u64, data: &[u8], buffered: bool) -> Result<(), BlkError> {
        trace!("write {:#x}~{:#x} buffered {}", off, data.len(), buffered);
        assert!(self.is_valid_io(off, data.len() as u64));
        let state = self.state()?;
        if buffered {
            self.pwrite(&state.fd_buffered, off, data, false)
        } else {
            self.pwrite(&state.fd_direct, off, data, true)
        }
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
        if buffered {
            // page cache writes complete synchronously
            return self.write(off, &data, true);
        }
        self.state()?;
        ioc.append_aio(Aio::write(off, data));
        Ok(())
    }

    fn flush(&self) -> Result<(), BlkError> {
        let state = self.state()?;
        direct_io::sync_data(&state.fd_direct)?;
        Ok(())
    }

    fn invalidate_cache(&self, off: u64, len: u64) -> Result<(), BlkError> {
        trace!("invalidate_cache {:#x}~{:#x}", off, len);
        let bs = self.geometry.block_size;
        assert!(off % bs == 0 && len % bs == 0);
        let state = self.state()?;
        direct_io::drop_cache(&state.fd_buffered, off, len).map_err(|e| {
            error!("invalidate_cache {:#x}~{:#x} failed: {}", off, len, e);
            BlkError::from(e)
        })
    }

    fn open(&mut self, path: &Path) -> Result<(), BlkError> {
        assert!(self.state.is_none(), "{} is already open", self.path.display());
        info!("open path {}", path.display());
        self.config.validate()?;

        let block_size = self.config.block_size;
        let direct_config = DirectIoConfig {
            enabled: self.config.direct_io,
            alignment: block_size as usize,
        };
        let mut fd_direct = direct_io::open_direct_io(path, &direct_config)?;
        let fd_buffered = direct_io::open_buffered(path)?;

        self.is_block = fd_direct.metadata()?.file_type().is_block_device();
        let raw_size = fd_direct.seek(SeekFrom::End(0))?;

        self.path = path.to_path_buf();
        self.geometry = DeviceGeometry {
            size: p2align(raw_size, block_size),
            block_size,
            ..DeviceGeometry::default()
        };
        self.devname = None;
        self.numa_node = None;
        if self.is_block {
            let canonical = fs::canonicalize(path)?;
            self.load_block_attributes(&canonical);
        }

        let fd_direct = Arc::new(fd_direct);
        let mut queue = create_queue(&self.config)?;
        queue.init(Arc::clone(&fd_direct))?;
        let queue: Arc<dyn IoQueue> = Arc::from(queue);
        let reaper_stop = Arc::new(AtomicBool::new(false));
        let reaper = self.start_reaper(Arc::clone(&queue), Arc::clone(&reaper_stop))?;

        self.state = Some(OpenState {
            fd_direct,
            fd_buffered,
            queue,
            reaper: Some(reaper),
            reaper_stop,
        });

        info!(
            "open size {:#x} block_size {} {} discard {} engine {}",
            self.geometry.size,
            block_size,
            if self.geometry.rotational { "rotational" } else { "non-rotational" },
            self.geometry.support_discard,
            self.state.as_ref().map_or("none", |s| s.queue.engine())
        );
        Ok(())
    }

    fn close(&mut self) {
        let Some(mut state) = self.state.take() else {
            return;
        };
        debug!("close {}", self.path.display());
        state.reaper_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = state.reaper.take() {
            if let Err(e) = handle.join() {
                error!("Failed to join aio reaper: {:?}", e);
            }
        }
        // the last queue reference shuts the I/O threads down
        drop(state);
        self.devname = None;
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
        let state = match self.state() {
            Ok(state) => state,
            Err(_) => panic!("aio_submit on closed device {}", self.path.display()),
        };

        let mut aios = ioc.take_pending_aios();
        for aio in aios.iter_mut() {
            aio.ioc = Some(Arc::clone(ioc));
        }
        ioc.start_running();

        match state.queue.submit_batch(aios) {
            Ok(retries) if retries > 0 => debug!("aio_submit retries {}", retries),
            Ok(_) => {}
            Err((r, _unsubmitted)) => panic!("aio_submit failed: {}", cpp_strerror(r)),
        }
    }
}

impl Drop for KernelDevice {
    fn drop(&mut self) {
        self.close();
    }
}
