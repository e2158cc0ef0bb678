pub mod aio;
pub mod block_device;
pub mod io_buffer;
pub mod io_context;
pub mod io_queue;
pub mod kernel;
pub mod nvme;
#[cfg(target_os = "linux")]
pub mod uring_queue;

pub use block_device::{create, open_device, BlockDevice, DeviceGeometry};
pub use io_buffer::IoBuffer;
pub use io_context::{AioCallback, IOContext};
