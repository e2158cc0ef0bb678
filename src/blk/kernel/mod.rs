//! Kernel-file backend: direct and buffered handles plus a user-space aio queue.

pub mod direct_io;
pub mod kernel_device;

pub use kernel_device::KernelDevice;
