use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use ferrite_blk::blk::block_device::detect_device_type;
use ferrite_blk::blk::nvme::emulated::{ControllerCatalog, EmulatedController};
use ferrite_blk::blk::nvme::transport::TransportId;
use ferrite_blk::blk::nvme::NvmeManager;
use ferrite_blk::blk::{create, open_device};
use ferrite_blk::common::config::{BlkConfig, BDEV_TYPE_AIO, BDEV_TYPE_SPDK};
use ferrite_blk::common::exception::BlkError;

use crate::common::fixtures::{kernel_config, pattern, spdk_link, temp_device_file};
use crate::common::logger::init_test_logger;
use crate::{assert_blk_err, assert_ok};

// The process-wide manager attaches a single controller, so every test going through it
// uses this address.
const GLOBAL_TRID: &str = "trtype:PCIe traddr:0000:0a:00.0";

fn plug_global_controller() {
    let trid = TransportId::parse(GLOBAL_TRID).unwrap();
    let catalog = ControllerCatalog::global();
    if catalog.find(&trid).is_none() {
        catalog.plug(EmulatedController::in_memory(trid, 512, 8 << 20));
    }
}

#[test]
fn test_detects_backend_from_path() {
    init_test_logger();
    let tmp = temp_device_file(4096);
    assert_eq!(detect_device_type(tmp.path()), BDEV_TYPE_AIO);

    let link = spdk_link(GLOBAL_TRID);
    assert_eq!(detect_device_type(&link.link), BDEV_TYPE_SPDK);
    // the target itself is an ordinary file
    assert_eq!(detect_device_type(&link.dir.path().join("spdk:nvme0")), BDEV_TYPE_AIO);
}

#[test]
fn test_open_kernel_device_by_probe() {
    init_test_logger();
    let tmp = temp_device_file(64 * 1024);
    let dev = assert_ok!(open_device("", tmp.path(), &kernel_config(), None));
    assert_eq!(dev.get_size(), 64 * 1024);

    let data = pattern(4096, 8);
    assert_ok!(dev.write(0, &data, false));
    let mut out = vec![0u8; 4096];
    assert_ok!(dev.read(0, &mut out, false));
    assert_eq!(out, data);

    let mut pm = BTreeMap::new();
    assert_ok!(dev.collect_metadata("", &mut pm));
    assert_eq!(pm.get("driver").map(String::as_str), Some("KernelDevice"));
}

#[test]
fn test_open_nvme_device_through_global_manager() {
    init_test_logger();
    plug_global_controller();
    let link = spdk_link(GLOBAL_TRID);

    let mut first = assert_ok!(open_device("", &link.link, &BlkConfig::default(), None));
    let second = assert_ok!(open_device(BDEV_TYPE_SPDK, &link.link, &BlkConfig::default(), None));
    assert!(!first.is_rotational());
    assert_eq!(first.get_size(), 8 << 20);

    let data = pattern(200 * 1024, 4);
    assert_ok!(first.write(1 << 20, &data, false));
    let mut out = vec![0u8; data.len()];
    assert_ok!(second.read(1 << 20, &mut out, false));
    assert_eq!(out, data);

    let manager: Arc<NvmeManager> = NvmeManager::global();
    assert_eq!(manager.drivers().len(), 1);
    assert_eq!(manager.workers_started(), 1);
    first.close();
    assert_eq!(manager.drivers()[0].registered_devices().len(), 1);
}

#[test]
fn test_open_missing_path() {
    init_test_logger();
    assert_blk_err!(
        open_device(BDEV_TYPE_AIO, Path::new("/nonexistent/ferrite-blk/dev"), &kernel_config(), None),
        BlkError::Io(_)
    );
}

#[test]
#[should_panic(expected = "unknown block device type")]
fn test_unknown_backend_is_fatal() {
    let _ = create("zns", Path::new("/dev/null"), &BlkConfig::default(), None);
}

#[test]
fn test_invalid_config_rejected_by_either_backend() {
    init_test_logger();
    let bad = BlkConfig {
        data_buffer_num: 1,
        ..kernel_config()
    };
    let tmp = temp_device_file(4096);
    assert_blk_err!(open_device(BDEV_TYPE_AIO, tmp.path(), &bad, None), BlkError::InvalidConfig(_));

    let link = spdk_link(GLOBAL_TRID);
    assert_blk_err!(open_device(BDEV_TYPE_SPDK, &link.link, &bad, None), BlkError::InvalidConfig(_));
}
