use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::blk::nvme::hw::{Namespace, NvmeController, QueuePair};
use crate::blk::nvme::transport::TransportId;
use crate::common::config::DeviceId;
use crate::common::exception::BlkError;

/// One attached controller, shared by every device opened on it.
pub struct SharedDriverData {
    id: DeviceId,
    trid: TransportId,
    controller: Arc<dyn NvmeController>,
    namespace: Arc<dyn Namespace>,
    block_size: u32,
    size: u64,
    registered_devices: Mutex<Vec<DeviceId>>,
    queues_allocated: AtomicU32,
}

impl SharedDriverData {
    /// Binds namespace 1 of `controller`. Extra namespaces are ignored.
    pub fn new(id: DeviceId, trid: TransportId, controller: Arc<dyn NvmeController>) -> Result<Self, BlkError> {
        let num_ns = controller.num_namespaces();
        if num_ns == 0 {
            return Err(BlkError::NoDriver(format!("{} exposes no namespaces", trid)));
        }
        if num_ns > 1 {
            warn!(
                "{} has {} namespaces, only namespace 1 is used",
                trid, num_ns
            );
        }
        let namespace = controller
            .namespace(1)
            .ok_or_else(|| BlkError::NoDriver(format!("{}: failed to get namespace 1", trid)))?;

        let block_size = namespace.sector_size();
        let size = namespace.size();
        Ok(Self {
            id,
            trid,
            controller,
            namespace,
            block_size,
            size,
            registered_devices: Mutex::new(Vec::new()),
            queues_allocated: AtomicU32::new(0),
        })
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn trid(&self) -> &TransportId {
        &self.trid
    }

    pub fn is_equal(&self, trid: &TransportId) -> bool {
        self.trid.same_controller(trid)
    }

    pub fn controller(&self) -> &Arc<dyn NvmeController> {
        &self.controller
    }

    pub fn namespace(&self) -> &Arc<dyn Namespace> {
        &self.namespace
    }

    pub fn get_block_size(&self) -> u32 {
        self.block_size
    }

    pub fn get_size(&self) -> u64 {
        self.size
    }

    pub fn register_device(&self, device: DeviceId) {
        self.registered_devices.lock().push(device);
    }

    pub fn remove_device(&self, device: DeviceId) {
        self.registered_devices.lock().retain(|&d| d != device);
    }

    pub fn registered_devices(&self) -> Vec<DeviceId> {
        self.registered_devices.lock().clone()
    }

    pub fn queues_allocated(&self) -> u32 {
        self.queues_allocated.load(Ordering::SeqCst)
    }

    pub(crate) fn alloc_qpair(&self) -> Result<Box<dyn QueuePair>, BlkError> {
        let qpair = self.controller.alloc_io_qpair()?;
        let n = self.queues_allocated.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("{}: {} queue pairs allocated", self.trid, n);
        Ok(qpair)
    }
}
