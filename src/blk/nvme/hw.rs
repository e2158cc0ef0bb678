//! Boundary to the user-space NVMe driver.
//!
//! Everything the block layer needs from the driver is expressed by these traits. Commands
//! take ownership of their scatter-gather segments and hand them back on completion, so a
//! segment is never reachable from both the host and an in-flight command.

use std::fmt;
use std::sync::Arc;

use crate::blk::nvme::buffer_pool::DmaSegment;
use crate::blk::nvme::transport::{PciAddress, TransportId};
use crate::common::config::CommandId;
use crate::common::exception::BlkError;

/// Process-wide driver environment options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvOptions {
    pub name: String,
    pub core_mask: String,
    pub main_core: u32,
    pub mem_size_mb: u32,
    /// Restricts PCIe enumeration when non-empty.
    pub pci_allowed: Vec<PciAddress>,
}

/// Per-controller options negotiated during probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerOptions {
    pub num_io_queues: u32,
    pub io_queue_size: u32,
    pub io_queue_requests: u32,
    pub keep_alive_timeout_ms: u32,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            num_io_queues: 1024,
            io_queue_size: 256,
            io_queue_requests: 512,
            keep_alive_timeout_ms: 10_000,
        }
    }
}

pub enum NvmeCommand {
    Read {
        lba: u64,
        lba_count: u32,
        sgl: Vec<DmaSegment>,
    },
    Write {
        lba: u64,
        lba_count: u32,
        sgl: Vec<DmaSegment>,
    },
    Flush,
}

impl NvmeCommand {
    pub fn name(&self) -> &'static str {
        match self {
            NvmeCommand::Read { .. } => "read",
            NvmeCommand::Write { .. } => "write",
            NvmeCommand::Flush => "flush",
        }
    }

    /// Gives the scatter-gather list back, e.g. after a rejected submission.
    pub fn into_sgl(self) -> Vec<DmaSegment> {
        match self {
            NvmeCommand::Read { sgl, .. } | NvmeCommand::Write { sgl, .. } => sgl,
            NvmeCommand::Flush => Vec::new(),
        }
    }
}

impl fmt::Debug for NvmeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NvmeCommand::Read { lba, lba_count, sgl } | NvmeCommand::Write { lba, lba_count, sgl } => {
                write!(f, "{} lba {}~{} nseg {}", self.name(), lba, lba_count, sgl.len())
            }
            NvmeCommand::Flush => f.write_str("flush"),
        }
    }
}

/// A finished command. `status` is 0 or a negative errno.
#[derive(Debug)]
pub struct Completion {
    pub cid: CommandId,
    pub status: i32,
    pub sgl: Vec<DmaSegment>,
}

/// A command the queue pair refused to accept.
#[derive(Debug)]
pub struct SubmitError {
    pub errno: i32,
    pub sgl: Vec<DmaSegment>,
}

pub trait QueuePair: Send {
    /// Entries in the hardware submission queue.
    fn io_queue_size(&self) -> u32;

    fn submit(&mut self, cmd: NvmeCommand, cid: CommandId) -> Result<(), SubmitError>;

    /// Reaps up to `max` completions (0 means no limit). Errors are negative errnos.
    fn process_completions(&mut self, max: u32) -> Result<Vec<Completion>, i32>;
}

pub trait Namespace: Send + Sync {
    fn id(&self) -> u32;

    /// Extended sector size in bytes.
    fn sector_size(&self) -> u32;

    /// Capacity in bytes.
    fn size(&self) -> u64;
}

pub trait NvmeController: Send + Sync {
    fn trid(&self) -> &TransportId;

    fn num_namespaces(&self) -> u32;

    /// Namespace ids start at 1.
    fn namespace(&self, nsid: u32) -> Option<Arc<dyn Namespace>>;

    fn options(&self) -> ControllerOptions;

    fn alloc_io_qpair(&self) -> Result<Box<dyn QueuePair>, BlkError>;
}

/// Decides whether to attach the offered controller, possibly adjusting its options.
pub type ProbeFn<'a> = dyn FnMut(&TransportId, &mut ControllerOptions) -> bool + 'a;

/// Receives a controller accepted by the probe callback.
pub type AttachFn<'a> = dyn FnMut(&TransportId, Arc<dyn NvmeController>, &ControllerOptions) + 'a;

pub trait NvmeEnvironment: Send + Sync {
    /// Initializes the driver environment. Called once, from the manager worker.
    fn init(&self, opts: &EnvOptions) -> Result<(), BlkError>;

    /// Enumerates controllers. `None` enumerates the local PCIe bus.
    fn probe(
        &self,
        trid: Option<&TransportId>,
        probe_cb: &mut ProbeFn<'_>,
        attach_cb: &mut AttachFn<'_>,
    ) -> Result<(), BlkError>;
}
