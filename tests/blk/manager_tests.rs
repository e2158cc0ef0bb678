use std::sync::{Arc, Barrier};
use std::thread;

use ferrite_blk::blk::nvme::emulated::EmulatedController;
use ferrite_blk::blk::nvme::transport::TransportId;
use ferrite_blk::blk::nvme::NvmeManager;
use ferrite_blk::common::config::BlkConfig;
use ferrite_blk::common::exception::BlkError;

use crate::common::fixtures::emulated_nvme;
use crate::common::logger::init_test_logger;
use crate::{assert_blk_err, assert_ok};

const PCIE: &str = "trtype:PCIe traddr:0000:3b:00.0";

#[test]
fn test_concurrent_try_get_attaches_once() {
    init_test_logger();
    let nvme = emulated_nvme(PCIE, 4096, 1 << 24);
    let trid = TransportId::parse(PCIE).unwrap();
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let manager = Arc::clone(&nvme.manager);
            let barrier = Arc::clone(&barrier);
            let trid = trid.clone();
            thread::spawn(move || {
                barrier.wait();
                manager.try_get(&trid).unwrap()
            })
        })
        .collect();
    let drivers: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(drivers.iter().all(|d| Arc::ptr_eq(d, &drivers[0])));
    assert_eq!(nvme.manager.workers_started(), 1);
    assert_eq!(nvme.ctrl.attach_count(), 1);
    assert_eq!(nvme.manager.drivers().len(), 1);
    assert_eq!(drivers[0].id(), 1);
    assert_eq!(drivers[0].get_block_size(), 4096);
}

#[test]
fn test_equivalent_pci_spellings_share_driver() {
    init_test_logger();
    let nvme = emulated_nvme(PCIE, 512, 1 << 20);
    let a = assert_ok!(nvme.manager.try_get(&TransportId::parse(PCIE).unwrap()));
    let b = assert_ok!(nvme
        .manager
        .try_get(&TransportId::parse("trtype:pcie traddr:3b:00.0").unwrap()));
    assert!(Arc::ptr_eq(&a, &b));
}

#[test]
fn test_unplugged_controller_is_no_driver() {
    init_test_logger();
    let nvme = emulated_nvme(PCIE, 512, 1 << 20);
    let trid = TransportId::parse(PCIE).unwrap();
    assert!(nvme.catalog.unplug(&trid).is_some());
    assert_blk_err!(nvme.manager.try_get(&trid), BlkError::NoDriver(_));
    // the worker stays up for later requests
    assert_eq!(nvme.manager.workers_started(), 1);

    nvme.catalog.plug(EmulatedController::in_memory(trid.clone(), 512, 1 << 20));
    assert_ok!(nvme.manager.try_get(&trid));
    assert_eq!(nvme.manager.workers_started(), 1);
}

#[test]
fn test_fabrics_target_probed_directly() {
    init_test_logger();
    let tcp = "trtype:TCP adrfam:IPv4 traddr:192.168.10.4 trsvcid:4420 subnqn:nqn.2016-06.io.spdk:cnode1";
    let nvme = emulated_nvme(tcp, 512, 1 << 20);
    let driver = assert_ok!(nvme.manager.try_get(&TransportId::parse(tcp).unwrap()));
    assert_eq!(driver.trid().traddr, "192.168.10.4");

    let other = TransportId::parse("trtype:TCP adrfam:IPv4 traddr:192.168.10.5 trsvcid:4420").unwrap();
    assert_blk_err!(nvme.manager.try_get(&other), BlkError::NoDriver(_));
}

#[test]
fn test_bad_coremask() {
    init_test_logger();
    let nvme = crate::common::fixtures::emulated_nvme_with(
        PCIE,
        512,
        1 << 20,
        BlkConfig {
            spdk_coremask: "0xzz".to_string(),
            ..BlkConfig::default()
        },
    );
    assert_blk_err!(
        nvme.manager.try_get(&TransportId::parse(PCIE).unwrap()),
        BlkError::InvalidConfig(_)
    );
}

#[test]
fn test_shutdown_joins_worker() {
    init_test_logger();
    let nvme = emulated_nvme(PCIE, 512, 1 << 20);
    assert_ok!(nvme.manager.try_get(&TransportId::parse(PCIE).unwrap()));
    nvme.manager.shutdown();
    // registered drivers survive the worker
    assert_eq!(nvme.manager.drivers().len(), 1);
    let manager: Arc<NvmeManager> = nvme.manager;
    drop(manager);
}
