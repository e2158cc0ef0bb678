//! In-process NVMe controllers.
//!
//! Controllers live in a [`ControllerCatalog`] and are served by [`EmulatedEnvironment`]. A
//! queue pair holds submitted commands until polled, then executes them against the
//! namespace backing store in FIFO or LIFO order, which lets tests reorder completions and
//! fail selected LBA ranges.

use std::collections::VecDeque;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use log::{debug, info, trace, warn};
use parking_lot::Mutex;

use crate::blk::nvme::buffer_pool::{copy_from_segments, copy_into_segments, DmaSegment};
use crate::blk::nvme::hw::{
    AttachFn, Completion, ControllerOptions, EnvOptions, Namespace, NvmeCommand, NvmeController,
    NvmeEnvironment, ProbeFn, QueuePair, SubmitError,
};
use crate::blk::nvme::transport::{TransportId, TransportType};
use crate::common::config::CommandId;
use crate::common::exception::BlkError;

enum Backing {
    Memory(Vec<u8>),
    File(File),
}

pub struct EmulatedNamespace {
    id: u32,
    sector_size: u32,
    size: u64,
    backing: Mutex<Backing>,
}

impl EmulatedNamespace {
    pub fn in_memory(id: u32, sector_size: u32, size: u64) -> Self {
        Self {
            id,
            sector_size,
            size,
            backing: Mutex::new(Backing::Memory(vec![0u8; size as usize])),
        }
    }

    /// Namespace over an existing file; the capacity is the file length.
    pub fn file_backed(id: u32, sector_size: u32, file: File) -> io::Result<Self> {
        let size = file.metadata()?.len();
        Ok(Self {
            id,
            sector_size,
            size,
            backing: Mutex::new(Backing::File(file)),
        })
    }

    fn read_into(&self, off: u64, len: usize, sgl: &mut [DmaSegment]) -> Result<(), i32> {
        let backing = self.backing.lock();
        match &*backing {
            Backing::Memory(mem) => {
                let off = off as usize;
                copy_into_segments(sgl, &mem[off..off + len]);
            }
            Backing::File(file) => {
                let mut tmp = vec![0u8; len];
                file.read_exact_at(&mut tmp, off).map_err(errno_of)?;
                copy_into_segments(sgl, &tmp);
            }
        }
        Ok(())
    }

    fn write_from(&self, off: u64, len: usize, sgl: &[DmaSegment]) -> Result<(), i32> {
        let mut tmp = vec![0u8; len];
        copy_from_segments(sgl, 0, &mut tmp);
        let mut backing = self.backing.lock();
        match &mut *backing {
            Backing::Memory(mem) => {
                let off = off as usize;
                mem[off..off + len].copy_from_slice(&tmp);
            }
            Backing::File(file) => file.write_all_at(&tmp, off).map_err(errno_of)?,
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), i32> {
        match &*self.backing.lock() {
            Backing::Memory(_) => Ok(()),
            Backing::File(file) => file.sync_data().map_err(errno_of),
        }
    }
}

fn errno_of(e: io::Error) -> i32 {
    -e.raw_os_error().unwrap_or(libc::EIO)
}

impl Namespace for EmulatedNamespace {
    fn id(&self) -> u32 {
        self.id
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn size(&self) -> u64 {
        self.size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOrder {
    Fifo,
    Lifo,
}

/// Knobs for how queue pairs of one controller behave.
#[derive(Debug, Clone)]
pub struct EmulationSettings {
    pub completion_order: CompletionOrder,
    /// Completions returned per poll; 0 returns everything outstanding.
    pub completions_per_poll: usize,
    /// Largest queue the controller supports, like MQES on real hardware.
    pub max_io_queue_size: u32,
    /// Commands touching `[start, end)` LBAs complete with `fail_status`.
    pub fail_lba_range: Option<(u64, u64)>,
    pub fail_status: i32,
    /// Every submission is refused with `-EIO`.
    pub reject_submissions: bool,
}

impl Default for EmulationSettings {
    fn default() -> Self {
        Self {
            completion_order: CompletionOrder::Fifo,
            completions_per_poll: 0,
            max_io_queue_size: 1024,
            fail_lba_range: None,
            fail_status: -libc::EIO,
            reject_submissions: false,
        }
    }
}

struct ControllerShared {
    namespaces: Vec<Arc<EmulatedNamespace>>,
    settings: Mutex<EmulationSettings>,
    commands_executed: AtomicUsize,
    qpairs_in_use: AtomicU32,
}

impl ControllerShared {
    fn execute(&self, cmd: &mut NvmeCommand) -> i32 {
        self.commands_executed.fetch_add(1, Ordering::Relaxed);
        let Some(ns) = self.namespaces.first() else {
            return -libc::ENXIO;
        };
        let (fail_range, fail_status) = {
            let settings = self.settings.lock();
            (settings.fail_lba_range, settings.fail_status)
        };

        let (is_read, lba, lba_count, sgl) = match cmd {
            NvmeCommand::Read { lba, lba_count, sgl } => (true, *lba, *lba_count, sgl),
            NvmeCommand::Write { lba, lba_count, sgl } => (false, *lba, *lba_count, sgl),
            NvmeCommand::Flush => return ns.flush().err().unwrap_or(0),
        };

        let sector = ns.sector_size() as u64;
        let off = lba * sector;
        let len = lba_count as u64 * sector;
        if lba_count == 0 || off + len > ns.size() {
            return -libc::EINVAL;
        }
        if let Some((start, end)) = fail_range {
            if lba < end && start < lba + lba_count as u64 {
                return fail_status;
            }
        }

        let result = if is_read {
            ns.read_into(off, len as usize, sgl)
        } else {
            ns.write_from(off, len as usize, sgl)
        };
        result.err().unwrap_or(0)
    }
}

pub struct EmulatedController {
    trid: TransportId,
    shared: Arc<ControllerShared>,
    opts: Mutex<ControllerOptions>,
    attached: AtomicBool,
    attach_count: AtomicUsize,
}

impl EmulatedController {
    pub fn new(trid: TransportId, namespaces: Vec<EmulatedNamespace>) -> Arc<Self> {
        Arc::new(Self {
            trid,
            shared: Arc::new(ControllerShared {
                namespaces: namespaces.into_iter().map(Arc::new).collect(),
                settings: Mutex::new(EmulationSettings::default()),
                commands_executed: AtomicUsize::new(0),
                qpairs_in_use: AtomicU32::new(0),
            }),
            opts: Mutex::new(ControllerOptions::default()),
            attached: AtomicBool::new(false),
            attach_count: AtomicUsize::new(0),
        })
    }

    /// Single-namespace controller backed by memory.
    pub fn in_memory(trid: TransportId, sector_size: u32, size: u64) -> Arc<Self> {
        Self::new(trid, vec![EmulatedNamespace::in_memory(1, sector_size, size)])
    }

    pub fn settings(&self) -> EmulationSettings {
        self.shared.settings.lock().clone()
    }

    pub fn set_settings(&self, settings: EmulationSettings) {
        *self.shared.settings.lock() = settings;
    }

    pub fn update_settings(&self, f: impl FnOnce(&mut EmulationSettings)) {
        f(&mut self.shared.settings.lock());
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    pub fn attach_count(&self) -> usize {
        self.attach_count.load(Ordering::SeqCst)
    }

    /// Queue pairs currently held; dropping one frees its slot.
    pub fn qpairs_allocated(&self) -> u32 {
        self.shared.qpairs_in_use.load(Ordering::SeqCst)
    }

    pub fn commands_executed(&self) -> usize {
        self.shared.commands_executed.load(Ordering::Relaxed)
    }

    pub(crate) fn attach(&self, opts: ControllerOptions) {
        *self.opts.lock() = opts;
        self.attached.store(true, Ordering::SeqCst);
        self.attach_count.fetch_add(1, Ordering::SeqCst);
    }
}

impl NvmeController for EmulatedController {
    fn trid(&self) -> &TransportId {
        &self.trid
    }

    fn num_namespaces(&self) -> u32 {
        self.shared.namespaces.len() as u32
    }

    fn namespace(&self, nsid: u32) -> Option<Arc<dyn Namespace>> {
        let idx = nsid.checked_sub(1)? as usize;
        self.shared
            .namespaces
            .get(idx)
            .map(|ns| Arc::clone(ns) as Arc<dyn Namespace>)
    }

    fn options(&self) -> ControllerOptions {
        *self.opts.lock()
    }

    fn alloc_io_qpair(&self) -> Result<Box<dyn QueuePair>, BlkError> {
        let opts = self.options();
        let allocated = self.shared.qpairs_in_use.fetch_add(1, Ordering::SeqCst);
        if allocated >= opts.num_io_queues {
            self.shared.qpairs_in_use.fetch_sub(1, Ordering::SeqCst);
            return Err(BlkError::from_errno(-libc::ENOSPC));
        }
        let size = opts
            .io_queue_size
            .min(self.shared.settings.lock().max_io_queue_size)
            .max(2);
        debug!("{}: allocated io qpair {} with {} entries", self.trid, allocated + 1, size);
        Ok(Box::new(EmulatedQueuePair {
            shared: Arc::clone(&self.shared),
            size,
            submitted: VecDeque::new(),
        }))
    }
}

struct EmulatedQueuePair {
    shared: Arc<ControllerShared>,
    size: u32,
    submitted: VecDeque<(CommandId, NvmeCommand)>,
}

impl Drop for EmulatedQueuePair {
    fn drop(&mut self) {
        self.shared.qpairs_in_use.fetch_sub(1, Ordering::SeqCst);
    }
}

impl QueuePair for EmulatedQueuePair {
    fn io_queue_size(&self) -> u32 {
        self.size
    }

    fn submit(&mut self, cmd: NvmeCommand, cid: CommandId) -> Result<(), SubmitError> {
        if self.shared.settings.lock().reject_submissions {
            return Err(SubmitError {
                errno: -libc::EIO,
                sgl: cmd.into_sgl(),
            });
        }
        if self.submitted.len() >= self.size as usize {
            return Err(SubmitError {
                errno: -libc::ENOMEM,
                sgl: cmd.into_sgl(),
            });
        }
        trace!("cid {} submitted: {:?}", cid, cmd);
        self.submitted.push_back((cid, cmd));
        Ok(())
    }

    fn process_completions(&mut self, max: u32) -> Result<Vec<Completion>, i32> {
        let (order, per_poll) = {
            let settings = self.shared.settings.lock();
            (settings.completion_order, settings.completions_per_poll)
        };
        let mut n = self.submitted.len();
        if per_poll > 0 {
            n = n.min(per_poll);
        }
        if max > 0 {
            n = n.min(max as usize);
        }

        let mut done = Vec::with_capacity(n);
        for _ in 0..n {
            let next = match order {
                CompletionOrder::Fifo => self.submitted.pop_front(),
                CompletionOrder::Lifo => self.submitted.pop_back(),
            };
            let Some((cid, mut cmd)) = next else { break };
            let status = self.shared.execute(&mut cmd);
            done.push(Completion {
                cid,
                status,
                sgl: cmd.into_sgl(),
            });
        }
        Ok(done)
    }
}

/// Controllers visible to an [`EmulatedEnvironment`].
#[derive(Default)]
pub struct ControllerCatalog {
    controllers: Mutex<Vec<Arc<EmulatedController>>>,
}

impl ControllerCatalog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Catalog served by [`crate::blk::nvme::NvmeManager::global`].
    pub fn global() -> Arc<ControllerCatalog> {
        static GLOBAL: OnceLock<Arc<ControllerCatalog>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(ControllerCatalog::new))
    }

    pub fn plug(&self, controller: Arc<EmulatedController>) {
        info!("plugged emulated controller {}", controller.trid());
        self.controllers.lock().push(controller);
    }

    pub fn unplug(&self, trid: &TransportId) -> Option<Arc<EmulatedController>> {
        let mut controllers = self.controllers.lock();
        let idx = controllers.iter().position(|c| c.trid().same_controller(trid))?;
        Some(controllers.remove(idx))
    }

    pub fn find(&self, trid: &TransportId) -> Option<Arc<EmulatedController>> {
        self.controllers
            .lock()
            .iter()
            .find(|c| c.trid().same_controller(trid))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.controllers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Arc<EmulatedController>> {
        self.controllers.lock().clone()
    }
}

/// Driver environment serving the controllers of one catalog.
pub struct EmulatedEnvironment {
    catalog: Arc<ControllerCatalog>,
    env_opts: Mutex<Option<EnvOptions>>,
    init_count: AtomicUsize,
}

impl EmulatedEnvironment {
    pub fn new(catalog: Arc<ControllerCatalog>) -> Self {
        Self {
            catalog,
            env_opts: Mutex::new(None),
            init_count: AtomicUsize::new(0),
        }
    }

    pub fn catalog(&self) -> &Arc<ControllerCatalog> {
        &self.catalog
    }

    /// Options of the most recent `init`.
    pub fn env_options(&self) -> Option<EnvOptions> {
        self.env_opts.lock().clone()
    }

    pub fn init_count(&self) -> usize {
        self.init_count.load(Ordering::SeqCst)
    }
}

impl NvmeEnvironment for EmulatedEnvironment {
    fn init(&self, opts: &EnvOptions) -> Result<(), BlkError> {
        info!(
            "{}: core mask {} main core {} mem {}MB",
            opts.name, opts.core_mask, opts.main_core, opts.mem_size_mb
        );
        *self.env_opts.lock() = Some(opts.clone());
        self.init_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn probe(
        &self,
        trid: Option<&TransportId>,
        probe_cb: &mut ProbeFn<'_>,
        attach_cb: &mut AttachFn<'_>,
    ) -> Result<(), BlkError> {
        let allowed = self
            .env_opts
            .lock()
            .as_ref()
            .map(|o| o.pci_allowed.clone())
            .unwrap_or_default();

        let candidates: Vec<Arc<EmulatedController>> = match trid {
            None => self
                .catalog
                .snapshot()
                .into_iter()
                .filter(|c| c.trid().trtype == TransportType::Pcie)
                .filter(|c| {
                    allowed.is_empty()
                        || c.trid()
                            .local_pci_device()
                            .is_some_and(|addr| allowed.contains(&addr))
                })
                .collect(),
            Some(trid) => {
                let found = self.catalog.find(trid);
                match found {
                    Some(c) => vec![c],
                    None => {
                        warn!("no controller reachable at {}", trid);
                        return Err(BlkError::from_errno(-libc::ENODEV));
                    }
                }
            }
        };

        for controller in candidates {
            if controller.is_attached() {
                continue;
            }
            let mut opts = controller.options();
            if probe_cb(controller.trid(), &mut opts) {
                controller.attach(opts);
                let handle: Arc<dyn NvmeController> = controller.clone();
                attach_cb(controller.trid(), handle, &opts);
            }
        }
        Ok(())
    }
}
