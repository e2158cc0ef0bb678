//! User-space NVMe backend.
//!
//! [`NvmeManager`] discovers and attaches controllers through an [`hw::NvmeEnvironment`],
//! [`NvmeDevice`] splits requests into [`task::Task`]s, and each submitting thread drives
//! its own [`driver_queue::SubmissionQueue`].

pub mod buffer_pool;
pub mod driver;
pub mod driver_queue;
pub mod emulated;
pub mod hw;
pub mod manager;
pub mod nvme_device;
pub mod splitter;
pub mod task;
pub mod transport;

pub use manager::NvmeManager;
pub use nvme_device::NvmeDevice;
