//! Backend-neutral block device interface and the factory that picks a backend for a path.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use log::{debug, error, info};

use crate::blk::io_buffer::IoBuffer;
use crate::blk::io_context::{AioCallback, IOContext};
use crate::blk::kernel::KernelDevice;
use crate::blk::nvme::NvmeDevice;
use crate::common::config::{BlkConfig, BDEV_TYPE_AIO, BDEV_TYPE_SPDK};
use crate::common::exception::BlkError;

/// Shape of an opened device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceGeometry {
    pub size: u64,
    pub block_size: u64,
    pub optimal_io_size: u64,
    pub rotational: bool,
    pub support_discard: bool,
    /// HM-SMR only.
    pub zone_size: u64,
    pub conventional_region_size: u64,
}

impl Default for DeviceGeometry {
    fn default() -> Self {
        Self {
            size: 0,
            block_size: 0,
            optimal_io_size: 0,
            rotational: true,
            support_discard: false,
            zone_size: 0,
            conventional_region_size: 0,
        }
    }
}

impl DeviceGeometry {
    /// Checks block alignment and bounds of `off~len`, logging the rejected range.
    pub fn is_valid_io(&self, off: u64, len: u64) -> bool {
        let bs = self.block_size;
        let ok = bs > 0
            && off % bs == 0
            && len % bs == 0
            && len > 0
            && off < self.size
            && off.checked_add(len).is_some_and(|end| end <= self.size);
        if !ok {
            error!(
                "is_valid_io {:#x}~{:#x} rejected: block_size {:#x} size {:#x}",
                off, len, bs, self.size
            );
        }
        ok
    }
}

pub trait BlockDevice: Send + Sync {
    fn geometry(&self) -> &DeviceGeometry;

    fn get_size(&self) -> u64 {
        self.geometry().size
    }

    fn get_block_size(&self) -> u64 {
        self.geometry().block_size
    }

    fn get_optimal_io_size(&self) -> u64 {
        self.geometry().optimal_io_size
    }

    fn is_rotational(&self) -> bool {
        self.geometry().rotational
    }

    fn supports_discard(&self) -> bool {
        self.geometry().support_discard
    }

    fn is_smr(&self) -> bool {
        false
    }

    fn get_zone_size(&self) -> u64 {
        assert!(self.is_smr(), "zone size requested from a non-SMR device");
        self.geometry().zone_size
    }

    fn get_conventional_region_size(&self) -> u64 {
        assert!(self.is_smr(), "conventional region requested from a non-SMR device");
        self.geometry().conventional_region_size
    }

    fn reset_all_zones(&self) -> Result<(), BlkError> {
        assert!(self.is_smr(), "zone reset on a non-SMR device");
        Ok(())
    }

    fn reset_zone(&self, zone: u64) -> Result<(), BlkError> {
        assert!(self.is_smr(), "reset of zone {} on a non-SMR device", zone);
        Ok(())
    }

    fn get_zones(&self) -> Vec<u64> {
        assert!(self.is_smr(), "zone listing on a non-SMR device");
        Vec::new()
    }

    fn is_valid_io(&self, off: u64, len: u64) -> bool {
        self.geometry().is_valid_io(off, len)
    }

    fn get_devname(&self) -> Option<String> {
        None
    }

    /// Underlying kernel device names, e.g. the partition's parent disk.
    fn get_devices(&self) -> BTreeSet<String> {
        self.get_devname().into_iter().collect()
    }

    fn get_numa_node(&self) -> Result<i32, BlkError> {
        Err(BlkError::Unsupported("numa node"))
    }

    fn collect_metadata(&self, prefix: &str, pm: &mut BTreeMap<String, String>) -> Result<(), BlkError>;

    fn supported_bdev_label(&self) -> bool {
        true
    }

    /// Reads `out.len()` bytes at `off`; both must be block aligned.
    fn read(&self, off: u64, out: &mut [u8], buffered: bool) -> Result<(), BlkError>;

    /// Reads an arbitrary byte range.
    fn read_random(&self, off: u64, out: &mut [u8], buffered: bool) -> Result<(), BlkError>;

    /// Queues a read of `off~len` into `buf` on `ioc`. Nothing is issued before `aio_submit`.
    fn aio_read(&self, off: u64, len: u64, buf: &IoBuffer, ioc: &Arc<IOContext>) -> Result<(), BlkError>;

    fn write(&self, off: u64, data: &[u8], buffered: bool) -> Result<(), BlkError>;

    fn aio_write(
        &self,
        off: u64,
        data: Arc<[u8]>,
        ioc: &Arc<IOContext>,
        buffered: bool,
    ) -> Result<(), BlkError>;

    fn flush(&self) -> Result<(), BlkError>;

    fn invalidate_cache(&self, off: u64, len: u64) -> Result<(), BlkError>;

    fn open(&mut self, path: &Path) -> Result<(), BlkError>;

    fn close(&mut self);

    /// Issues everything queued on `ioc`.
    fn aio_submit(&self, ioc: &Arc<IOContext>);
}

/// Picks the backend for `path`: NVMe for `spdk:` symlinks, kernel AIO otherwise.
pub fn detect_device_type(path: &Path) -> &'static str {
    if NvmeDevice::support(path) {
        return BDEV_TYPE_SPDK;
    }
    if cfg!(unix) {
        return BDEV_TYPE_AIO;
    }
    panic!("no block device backend supports {}", path.display());
}

/// Builds an unopened device. `type_name` of `""` probes `path`.
///
/// Unknown backend names are a programming error and abort.
pub fn create(
    type_name: &str,
    path: &Path,
    config: &BlkConfig,
    callback: Option<AioCallback>,
) -> Box<dyn BlockDevice> {
    let device_type = if type_name.is_empty() {
        detect_device_type(path)
    } else {
        type_name
    };
    debug!("create {} device for {}", device_type, path.display());

    match device_type {
        BDEV_TYPE_AIO => Box::new(KernelDevice::new(config.clone(), callback)),
        BDEV_TYPE_SPDK => Box::new(NvmeDevice::new(config.clone(), callback)),
        other => panic!("unknown block device type '{}' for {}", other, path.display()),
    }
}

/// [`create`] followed by `open`.
pub fn open_device(
    type_name: &str,
    path: &Path,
    config: &BlkConfig,
    callback: Option<AioCallback>,
) -> Result<Box<dyn BlockDevice>, BlkError> {
    let mut device = create(type_name, path, config, callback);
    device.open(path)?;
    info!(
        "opened {} size {:#x} block_size {}",
        path.display(),
        device.get_size(),
        device.get_block_size()
    );
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(size: u64, block_size: u64) -> DeviceGeometry {
        DeviceGeometry {
            size,
            block_size,
            ..DeviceGeometry::default()
        }
    }

    #[test]
    fn test_is_valid_io() {
        let g = geometry(1 << 20, 4096);
        assert!(g.is_valid_io(0, 4096));
        assert!(g.is_valid_io((1 << 20) - 4096, 4096));
        assert!(!g.is_valid_io(100, 4096));
        assert!(!g.is_valid_io(0, 100));
        assert!(!g.is_valid_io(0, 0));
        assert!(!g.is_valid_io(1 << 20, 4096));
        assert!(!g.is_valid_io((1 << 20) - 4096, 8192));
        assert!(!g.is_valid_io(u64::MAX - 4095, 4096));
    }

    #[test]
    fn test_detect_plain_file_is_aio() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(detect_device_type(tmp.path()), BDEV_TYPE_AIO);
    }

    #[test]
    #[should_panic(expected = "unknown block device type")]
    fn test_unknown_type_panics() {
        let _ = create("pmem", Path::new("/dev/null"), &BlkConfig::default(), None);
    }
}
