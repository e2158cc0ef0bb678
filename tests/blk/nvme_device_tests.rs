use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use ferrite_blk::blk::nvme::emulated::CompletionOrder;
use ferrite_blk::blk::nvme::NvmeDevice;
use ferrite_blk::blk::{AioCallback, BlockDevice, IOContext, IoBuffer};
use ferrite_blk::common::config::BlkConfig;
use ferrite_blk::common::exception::BlkError;

use crate::common::fixtures::{emulated_nvme, emulated_nvme_with, pattern, spdk_link, EmulatedNvme, SpdkLink};
use crate::common::logger::init_test_logger;
use crate::{assert_blk_err, assert_ok};

const TRID: &str = "trtype:PCIe traddr:0000:5e:00.0";

fn open_nvme(
    nvme: &EmulatedNvme,
    config: BlkConfig,
    callback: Option<AioCallback>,
) -> (SpdkLink, NvmeDevice) {
    init_test_logger();
    let link = spdk_link(TRID);
    let mut dev = NvmeDevice::with_manager(Arc::clone(&nvme.manager), config, callback);
    assert_ok!(dev.open(&link.link));
    (link, dev)
}

#[test]
fn test_round_trip_with_reordered_completions() {
    let nvme = emulated_nvme(TRID, 512, 4 << 20);
    nvme.ctrl.update_settings(|s| {
        s.completion_order = CompletionOrder::Lifo;
        s.completions_per_poll = 1;
    });
    let (_link, dev) = open_nvme(&nvme, BlkConfig::default(), None);

    let data = pattern(1 << 20, 5);
    assert_ok!(dev.write(512 * 1024, &data, false));
    let mut out = vec![0u8; data.len()];
    assert_ok!(dev.read(512 * 1024, &mut out, false));
    assert_eq!(out, data);
}

#[test]
fn test_small_pool_and_depth_still_drain() {
    let nvme = emulated_nvme(TRID, 512, 4 << 20);
    let config = BlkConfig {
        chunk_size: 16 * 1024,
        max_queue_depth: Some(2),
        data_buffer_num: 4,
        ..BlkConfig::default()
    };
    let (_link, dev) = open_nvme(&nvme, config, None);

    let ioc = IOContext::new_sync();
    let data = pattern(256 * 1024, 1);
    assert_ok!(dev.aio_write(0, Arc::from(data.clone()), &ioc, false));
    assert_eq!(ioc.num_pending(), 16);
    dev.aio_submit(&ioc);
    ioc.wait();
    assert_eq!(ioc.num_running(), 0);
    assert_eq!(ioc.get_return_value(), 0);

    let mut out = vec![0u8; data.len()];
    assert_ok!(dev.read(0, &mut out, false));
    assert_eq!(out, data);
}

#[test]
fn test_read_random_unaligned_ranges() {
    let nvme = emulated_nvme(TRID, 512, 1 << 20);
    let (_link, dev) = open_nvme(&nvme, BlkConfig::default(), None);
    let data = pattern(1 << 20, 11);
    assert_ok!(dev.write(0, &data, false));

    for (off, len) in [(100usize, 50usize), (511, 2), (1000, 200_000), (131_000, 1000), ((1 << 20) - 7, 7)] {
        let mut out = vec![0u8; len];
        assert_ok!(dev.read_random(off as u64, &mut out, false));
        assert_eq!(&out[..], &data[off..off + len], "read_random {}~{}", off, len);
    }
}

#[test]
fn test_async_read_error_recorded_on_context() {
    let nvme = emulated_nvme(TRID, 512, 1 << 20);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let cb: AioCallback = Arc::new(move |_ioc: &IOContext| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let (_link, dev) = open_nvme(&nvme, BlkConfig::default(), Some(cb));
    nvme.ctrl.update_settings(|s| {
        s.fail_lba_range = Some((0, 8));
        s.fail_status = -libc::ENODATA;
    });

    let ioc = IOContext::new_async(Arc::new(()));
    let buf = IoBuffer::new(256 * 1024);
    assert_ok!(dev.aio_read(0, 256 * 1024, &buf, &ioc));
    dev.aio_submit(&ioc);

    assert_eq!(ioc.get_return_value(), -libc::ENODATA);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_sync_write_error_surfaces() {
    let nvme = emulated_nvme(TRID, 512, 1 << 20);
    let (_link, dev) = open_nvme(&nvme, BlkConfig::default(), None);
    nvme.ctrl.update_settings(|s| s.fail_lba_range = Some((1024, 1025)));
    let err = assert_blk_err!(dev.write(512 * 1024, &[0u8; 4096], false), BlkError::Errno(_));
    assert_eq!(err.errno(), -libc::EIO);
}

#[test]
fn test_threads_get_private_queues() {
    let nvme = emulated_nvme(TRID, 512, 8 << 20);
    let (_link, dev) = open_nvme(&nvme, BlkConfig::default(), None);
    let dev = Arc::new(dev);
    let barrier = Arc::new(Barrier::new(4));

    let handles: Vec<_> = (0..4u64)
        .map(|worker| {
            let dev = Arc::clone(&dev);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let base = worker << 21;
                let data = pattern(300 * 1024, worker as u8);
                dev.write(base, &data, false).unwrap();
                let mut out = vec![0u8; data.len()];
                dev.read(base, &mut out, false).unwrap();
                assert_eq!(out, data);
                barrier.wait();
                // every worker holds its own queue until it exits
                assert_eq!(dev.num_queues(), 4);
                barrier.wait();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(dev.num_queues(), 0);
    assert_eq!(nvme.ctrl.qpairs_allocated(), 0);
}

#[test]
fn test_queue_depth_follows_controller_queue_size() {
    let nvme = emulated_nvme(TRID, 512, 1 << 20);
    nvme.ctrl.update_settings(|s| s.max_io_queue_size = 4);
    let (_link, dev) = open_nvme(&nvme, BlkConfig::default(), None);

    // 8 chunks through a 3-deep queue
    let data = pattern(1 << 20, 42);
    assert_ok!(dev.write(0, &data, false));
    let mut out = vec![0u8; data.len()];
    assert_ok!(dev.read(0, &mut out, false));
    assert_eq!(out, data);
}

#[test]
fn test_reopen_keeps_data_and_controller() {
    let nvme = emulated_nvme(TRID, 4096, 1 << 20);
    let (link, mut dev) = open_nvme(&nvme, BlkConfig::default(), None);
    assert_eq!(dev.get_block_size(), 4096);
    assert_ok!(dev.write(4096, &pattern(8192, 2), false));
    dev.close();

    let mut again = NvmeDevice::with_manager(Arc::clone(&nvme.manager), BlkConfig::default(), None);
    assert_ok!(again.open(&link.link));
    let mut out = vec![0u8; 8192];
    assert_ok!(again.read(4096, &mut out, false));
    assert_eq!(out, pattern(8192, 2));
    assert_eq!(nvme.ctrl.attach_count(), 1);
}

#[test]
fn test_missing_controller_fails_open() {
    init_test_logger();
    let nvme = emulated_nvme_with("trtype:PCIe traddr:0000:77:00.0", 512, 1 << 20, BlkConfig::default());
    let link = spdk_link(TRID);
    let mut dev = NvmeDevice::with_manager(Arc::clone(&nvme.manager), BlkConfig::default(), None);
    assert_blk_err!(dev.open(&link.link), BlkError::NoDriver(_));
    assert!(dev.name().is_empty());
}

#[test]
fn test_exited_threads_return_their_queue_pairs() {
    let nvme = emulated_nvme(TRID, 512, 1 << 20);
    let (_link, dev) = open_nvme(&nvme, BlkConfig::default(), None);
    let dev = Arc::new(dev);

    // more short-lived submitters than the controller has io queues
    for i in 0..(BlkConfig::default().num_io_queues as u64 + 8) {
        let dev = Arc::clone(&dev);
        thread::spawn(move || {
            dev.write((i % 256) * 4096, &pattern(4096, i as u8), false).unwrap();
        })
        .join()
        .unwrap();
        assert_eq!(nvme.ctrl.qpairs_allocated(), 0, "after thread {}", i);
    }
    assert_eq!(dev.num_queues(), 0);
}

#[test]
fn test_open_close_cycles_release_queue_pairs() {
    let nvme = emulated_nvme(TRID, 512, 1 << 20);
    let link = spdk_link(TRID);
    init_test_logger();

    for i in 0..(BlkConfig::default().num_io_queues + 8) {
        let mut dev = NvmeDevice::with_manager(Arc::clone(&nvme.manager), BlkConfig::default(), None);
        assert_ok!(dev.open(&link.link));
        assert_ok!(dev.write(0, &pattern(4096, i as u8), false));
        assert_eq!(nvme.ctrl.qpairs_allocated(), 1);
        dev.close();
        assert_eq!(nvme.ctrl.qpairs_allocated(), 0, "after cycle {}", i);
    }
    assert_eq!(nvme.ctrl.attach_count(), 1);
}

#[test]
fn test_pool_smaller_than_chunk_rejected_at_open() {
    init_test_logger();
    let nvme = emulated_nvme(TRID, 512, 1 << 20);
    let link = spdk_link(TRID);
    let config = BlkConfig {
        data_buffer_num: 8,
        ..BlkConfig::default()
    };
    let mut dev = NvmeDevice::with_manager(Arc::clone(&nvme.manager), config, None);
    assert_blk_err!(dev.open(&link.link), BlkError::InvalidConfig(_));
    assert!(dev.driver().is_none());
    assert_eq!(nvme.ctrl.attach_count(), 0);
}

#[test]
fn test_no_bdev_label_support() {
    let nvme = emulated_nvme(TRID, 512, 1 << 20);
    let (_link, dev) = open_nvme(&nvme, BlkConfig::default(), None);
    assert!(!dev.supported_bdev_label());
}
