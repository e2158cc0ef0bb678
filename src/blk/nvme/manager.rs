//! Discovery and attachment of NVMe controllers.
//!
//! The driver environment must be initialized and probed from one dedicated thread. Callers
//! of [`NvmeManager::try_get`] queue a probe request and block until that thread reports
//! back; the attached controller is registered while the caller still holds the registry
//! lock, so concurrent callers for the same address attach it exactly once.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;

use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::blk::nvme::driver::SharedDriverData;
use crate::blk::nvme::emulated::{ControllerCatalog, EmulatedEnvironment};
use crate::blk::nvme::hw::{ControllerOptions, EnvOptions, NvmeController, NvmeEnvironment};
use crate::blk::nvme::transport::{TransportId, TransportType};
use crate::common::config::{BlkConfig, DeviceId, WORKER_STACK_SIZE};
use crate::common::exception::BlkError;
use crate::common::thread::{spawn_named, try_pin_current_thread};
use crate::common::util::find_first_bitset;

const MANAGER_THREAD_NAME: &str = "nvme-device-manager";

type Attached = Option<Arc<dyn NvmeController>>;

struct ProbeRequest {
    id: u64,
    trid: TransportId,
}

#[derive(Default)]
struct ProbeQueue {
    stopping: bool,
    next_id: u64,
    pending: VecDeque<ProbeRequest>,
    finished: HashMap<u64, Attached>,
}

#[derive(Default)]
struct ProbeShared {
    queue: Mutex<ProbeQueue>,
    cond: Condvar,
}

#[derive(Default)]
struct Registry {
    drivers: Vec<Arc<SharedDriverData>>,
    worker: Option<JoinHandle<()>>,
}

/// Options applied to every controller the manager attaches.
#[derive(Debug, Clone, Copy)]
struct Tuning {
    num_io_queues: u32,
    keep_alive_timeout_ms: u32,
}

pub struct NvmeManager {
    env: Arc<dyn NvmeEnvironment>,
    config: BlkConfig,
    registry: Mutex<Registry>,
    probe: Arc<ProbeShared>,
    worker_starts: AtomicUsize,
}

impl NvmeManager {
    pub fn new(env: Arc<dyn NvmeEnvironment>, config: BlkConfig) -> Self {
        Self {
            env,
            config,
            registry: Mutex::new(Registry::default()),
            probe: Arc::new(ProbeShared::default()),
            worker_starts: AtomicUsize::new(0),
        }
    }

    /// Manager over an emulated environment serving `catalog`.
    pub fn emulated(catalog: Arc<ControllerCatalog>, config: BlkConfig) -> Self {
        Self::new(Arc::new(EmulatedEnvironment::new(catalog)), config)
    }

    /// Process-wide manager used by devices opened through the factory.
    pub fn global() -> Arc<NvmeManager> {
        static GLOBAL: OnceLock<Arc<NvmeManager>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| {
            Arc::new(NvmeManager::emulated(
                ControllerCatalog::global(),
                BlkConfig::default(),
            ))
        }))
    }

    /// How many times the manager thread has been started.
    pub fn workers_started(&self) -> usize {
        self.worker_starts.load(Ordering::SeqCst)
    }

    pub fn drivers(&self) -> Vec<Arc<SharedDriverData>> {
        self.registry.lock().drivers.clone()
    }

    /// Returns the driver for `trid`, attaching the controller on first use.
    pub fn try_get(&self, trid: &TransportId) -> Result<Arc<SharedDriverData>, BlkError> {
        debug!("try_get {}", trid);

        let mut registry = self.registry.lock();
        if let Some(driver) = registry.drivers.iter().find(|d| d.is_equal(trid)) {
            return Ok(Arc::clone(driver));
        }

        let main_core = match find_first_bitset(&self.config.spdk_coremask) {
            Ok(pos) if pos > 0 => pos - 1,
            _ => {
                error!(
                    "invalid spdk_coremask '{}', at least one core is needed",
                    self.config.spdk_coremask
                );
                return Err(BlkError::InvalidConfig(format!(
                    "spdk_coremask '{}' selects no core",
                    self.config.spdk_coremask
                )));
            }
        };

        if registry.worker.is_none() {
            registry.worker = Some(self.start_worker(trid, main_core)?);
        }

        let attached = self.probe_and_wait(trid);
        let Some(controller) = attached else {
            error!("failed to get nvme device with transport address {}", trid);
            return Err(BlkError::NoDriver(trid.to_string()));
        };
        self.register_ctrlr(&mut registry, trid, controller)
    }

    fn start_worker(&self, trid: &TransportId, main_core: u32) -> Result<JoinHandle<()>, BlkError> {
        let local_pci = trid.local_pci_device();
        let env_opts = EnvOptions {
            name: MANAGER_THREAD_NAME.to_string(),
            core_mask: self.config.spdk_coremask.clone(),
            main_core,
            mem_size_mb: self.config.spdk_mem_mb,
            pci_allowed: local_pci.into_iter().collect(),
        };
        let tuning = Tuning {
            num_io_queues: self.config.num_io_queues,
            keep_alive_timeout_ms: self.config.keep_alive_timeout_ms,
        };
        let env = Arc::clone(&self.env);
        let probe = Arc::clone(&self.probe);
        probe.queue.lock().stopping = false;

        let handle = spawn_named(MANAGER_THREAD_NAME, WORKER_STACK_SIZE, move || {
            manager_loop(env.as_ref(), &probe, &env_opts, local_pci.is_some(), tuning)
        })?;
        let starts = self.worker_starts.fetch_add(1, Ordering::SeqCst) + 1;
        info!("{} thread started ({})", MANAGER_THREAD_NAME, starts);
        Ok(handle)
    }

    fn probe_and_wait(&self, trid: &TransportId) -> Attached {
        let mut queue = self.probe.queue.lock();
        if queue.stopping {
            return None;
        }
        let id = queue.next_id;
        queue.next_id += 1;
        queue.pending.push_back(ProbeRequest {
            id,
            trid: trid.clone(),
        });
        self.probe.cond.notify_all();

        loop {
            if let Some(result) = queue.finished.remove(&id) {
                return result;
            }
            debug!("waiting for probe of {}", trid);
            self.probe.cond.wait(&mut queue);
        }
    }

    fn register_ctrlr(
        &self,
        registry: &mut MutexGuard<'_, Registry>,
        trid: &TransportId,
        controller: Arc<dyn NvmeController>,
    ) -> Result<Arc<SharedDriverData>, BlkError> {
        assert!(
            registry.drivers.is_empty(),
            "only one nvme controller per process is supported, {} already attached",
            registry.drivers[0].trid()
        );
        // id 0 is reserved for the main thread
        let id = registry.drivers.len() as DeviceId + 1;
        let driver = Arc::new(SharedDriverData::new(id, trid.clone(), controller)?);
        info!("successfully attached nvme device at {}", trid);
        registry.drivers.push(Arc::clone(&driver));
        Ok(driver)
    }

    /// Stops the manager thread. Queued probes complete without a controller.
    pub fn shutdown(&self) {
        let worker = self.registry.lock().worker.take();
        let Some(worker) = worker else {
            return;
        };
        {
            let mut queue = self.probe.queue.lock();
            queue.stopping = true;
            self.probe.cond.notify_all();
        }
        if let Err(e) = worker.join() {
            error!("Failed to join {} thread: {:?}", MANAGER_THREAD_NAME, e);
        }
    }
}

impl Drop for NvmeManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn manager_loop(
    env: &dyn NvmeEnvironment,
    probe: &ProbeShared,
    env_opts: &EnvOptions,
    local_pci: bool,
    tuning: Tuning,
) {
    let env_ready = match env.init(env_opts) {
        Ok(()) => true,
        Err(e) => {
            error!("failed to initialize nvme environment: {}", e);
            false
        }
    };
    // probing happens here, but I/O threads must not inherit the manager's core mask
    try_pin_current_thread(&[]);

    let mut queue = probe.queue.lock();
    while !queue.stopping {
        let Some(req) = queue.pending.pop_front() else {
            debug!("{} thread is going to wait", MANAGER_THREAD_NAME);
            probe.cond.wait(&mut queue);
            continue;
        };
        let attached = if env_ready {
            MutexGuard::unlocked(&mut queue, || probe_one(env, &req.trid, local_pci, tuning))
        } else {
            None
        };
        queue.finished.insert(req.id, attached);
        probe.cond.notify_all();
    }

    let abandoned: Vec<ProbeRequest> = queue.pending.drain(..).collect();
    for req in abandoned {
        warn!("probe of {} abandoned at shutdown", req.trid);
        queue.finished.insert(req.id, None);
    }
    probe.cond.notify_all();
}

fn probe_one(env: &dyn NvmeEnvironment, want: &TransportId, local_pci: bool, tuning: Tuning) -> Attached {
    let mut attached: Attached = None;
    let scope = if local_pci { None } else { Some(want) };
    let r = env.probe(
        scope,
        &mut |offered: &TransportId, opts: &mut ControllerOptions| should_attach(want, offered, opts, tuning),
        &mut |offered: &TransportId, controller: Arc<dyn NvmeController>, _opts: &ControllerOptions| {
            debug!("attach {}", offered);
            attached = Some(controller);
        },
    );
    if let Err(e) = r {
        error!("device probe nvme failed: {}", e);
    }
    attached
}

fn should_attach(want: &TransportId, offered: &TransportId, opts: &mut ControllerOptions, tuning: Tuning) -> bool {
    debug!("probe want {} got {}", want.traddr, offered.traddr);

    let do_attach = want.same_controller(offered);
    if !do_attach {
        if offered.trtype == TransportType::Pcie {
            debug!("device traddr ({}) does not match {}", want.traddr, offered.traddr);
        } else {
            // fabrics targets are probed by exact address
            error!("probe of {} offered unrelated target {}", want, offered);
        }
        return false;
    }

    info!("found device at {}", offered);
    opts.num_io_queues = tuning.num_io_queues;
    opts.io_queue_size = u16::MAX as u32;
    opts.io_queue_requests = u16::MAX as u32;
    opts.keep_alive_timeout_ms = tuning.keep_alive_timeout_ms;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blk::nvme::emulated::EmulatedController;

    fn pcie(addr: &str) -> TransportId {
        TransportId::parse(&format!("trtype:PCIe traddr:{}", addr)).unwrap()
    }

    fn manager_with(ctrls: &[Arc<EmulatedController>]) -> NvmeManager {
        let catalog = ControllerCatalog::new();
        for c in ctrls {
            catalog.plug(Arc::clone(c));
        }
        NvmeManager::emulated(catalog, BlkConfig::default())
    }

    #[test]
    fn test_attach_applies_tuning() {
        let ctrl = EmulatedController::in_memory(pcie("0000:04:00.0"), 512, 1 << 20);
        let manager = manager_with(&[Arc::clone(&ctrl)]);

        let driver = manager.try_get(&pcie("04:00.0")).unwrap();
        assert_eq!(driver.id(), 1);
        assert_eq!(driver.get_block_size(), 512);

        let opts = ctrl.options();
        assert_eq!(opts.num_io_queues, 96);
        assert_eq!(opts.io_queue_size, 65535);
        assert_eq!(opts.io_queue_requests, 65535);
        assert_eq!(opts.keep_alive_timeout_ms, 10_000);
    }

    #[test]
    fn test_fast_path_returns_same_driver() {
        let ctrl = EmulatedController::in_memory(pcie("0000:04:00.0"), 512, 1 << 20);
        let manager = manager_with(&[Arc::clone(&ctrl)]);
        let a = manager.try_get(&pcie("0000:04:00.0")).unwrap();
        let b = manager.try_get(&pcie("0000:04:00.0")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(ctrl.attach_count(), 1);
        assert_eq!(manager.workers_started(), 1);
    }

    #[test]
    fn test_missing_controller() {
        let manager = manager_with(&[]);
        assert!(matches!(
            manager.try_get(&pcie("0000:09:00.0")),
            Err(BlkError::NoDriver(_))
        ));
    }

    #[test]
    fn test_empty_coremask_rejected() {
        let catalog = ControllerCatalog::new();
        let config = BlkConfig {
            spdk_coremask: "0x0".to_string(),
            ..BlkConfig::default()
        };
        let manager = NvmeManager::emulated(catalog, config);
        assert!(matches!(
            manager.try_get(&pcie("0000:04:00.0")),
            Err(BlkError::InvalidConfig(_))
        ));
        assert_eq!(manager.workers_started(), 0);
    }

    #[test]
    fn test_main_core_from_mask() {
        let env = Arc::new(EmulatedEnvironment::new(ControllerCatalog::new()));
        env.catalog()
            .plug(EmulatedController::in_memory(pcie("0000:04:00.0"), 512, 1 << 20));
        let config = BlkConfig {
            spdk_coremask: "0xc".to_string(),
            ..BlkConfig::default()
        };
        let manager = NvmeManager::new(env.clone(), config);
        manager.try_get(&pcie("0000:04:00.0")).unwrap();

        let opts = env.env_options().unwrap();
        assert_eq!(opts.main_core, 2);
        assert_eq!(opts.name, "nvme-device-manager");
        assert_eq!(opts.pci_allowed.len(), 1);
    }

    #[test]
    #[should_panic(expected = "only one nvme controller")]
    fn test_second_controller_panics() {
        let tcp = |addr: &str| {
            TransportId::parse(&format!("trtype:TCP adrfam:IPv4 traddr:{} trsvcid:4420", addr)).unwrap()
        };
        let manager = manager_with(&[
            EmulatedController::in_memory(tcp("10.0.0.1"), 512, 1 << 20),
            EmulatedController::in_memory(tcp("10.0.0.2"), 512, 1 << 20),
        ]);
        manager.try_get(&tcp("10.0.0.1")).unwrap();
        let _ = manager.try_get(&tcp("10.0.0.2"));
    }

    #[test]
    fn test_shutdown_then_restart() {
        let manager = manager_with(&[EmulatedController::in_memory(
            pcie("0000:04:00.0"),
            512,
            1 << 20,
        )]);
        manager.shutdown();
        manager.try_get(&pcie("0000:04:00.0")).unwrap();
        manager.shutdown();
        manager.shutdown();
        assert_eq!(manager.workers_started(), 1);
    }
}
