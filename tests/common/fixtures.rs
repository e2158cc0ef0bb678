use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use ferrite_blk::blk::nvme::emulated::{ControllerCatalog, EmulatedController};
use ferrite_blk::blk::nvme::transport::TransportId;
use ferrite_blk::blk::nvme::NvmeManager;
use ferrite_blk::common::config::BlkConfig;
use tempfile::{NamedTempFile, TempDir};

/// Zero-filled regular file of `len` bytes.
pub fn temp_device_file(len: usize) -> NamedTempFile {
    let mut tmp = NamedTempFile::new().expect("create temp device");
    tmp.write_all(&vec![0u8; len]).expect("fill temp device");
    tmp.flush().expect("flush temp device");
    tmp
}

/// Kernel backend config that works on tmpfs and keeps the reaper responsive.
pub fn kernel_config() -> BlkConfig {
    BlkConfig {
        block_size: 512,
        direct_io: false,
        aio_threads: 2,
        aio_reap_timeout_ms: 10,
        ..BlkConfig::default()
    }
}

/// A `spdk:` symlink whose target names `trid`, as laid out next to an OSD data dir.
pub struct SpdkLink {
    pub dir: TempDir,
    pub link: PathBuf,
}

pub fn spdk_link(trid: &str) -> SpdkLink {
    let dir = TempDir::new().expect("create temp dir");
    let target = dir.path().join("spdk:nvme0");
    fs::write(&target, format!("{}\n", trid)).expect("write transport id");
    let link = dir.path().join("block");
    std::os::unix::fs::symlink(&target, &link).expect("create spdk symlink");
    SpdkLink { dir, link }
}

/// Private manager over a catalog holding one in-memory controller.
pub struct EmulatedNvme {
    pub ctrl: Arc<EmulatedController>,
    pub catalog: Arc<ControllerCatalog>,
    pub manager: Arc<NvmeManager>,
}

pub fn emulated_nvme(trid: &str, sector_size: u32, size: u64) -> EmulatedNvme {
    emulated_nvme_with(trid, sector_size, size, BlkConfig::default())
}

pub fn emulated_nvme_with(trid: &str, sector_size: u32, size: u64, config: BlkConfig) -> EmulatedNvme {
    let trid = TransportId::parse(trid).expect("valid transport id");
    let ctrl = EmulatedController::in_memory(trid, sector_size, size);
    let catalog = ControllerCatalog::new();
    catalog.plug(Arc::clone(&ctrl));
    let manager = Arc::new(NvmeManager::emulated(Arc::clone(&catalog), config));
    EmulatedNvme {
        ctrl,
        catalog,
        manager,
    }
}

/// Deterministic pattern so mismatches point at the offending offset.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add((i % 251) as u8)).collect()
}
