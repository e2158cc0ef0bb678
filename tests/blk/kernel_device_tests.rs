use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use ferrite_blk::blk::kernel::KernelDevice;
use ferrite_blk::blk::{AioCallback, BlockDevice, IOContext, IoBuffer};
use ferrite_blk::common::config::{AioEngine, BlkConfig};
use rand::Rng;

use crate::assert_ok;
use crate::common::fixtures::{kernel_config, pattern, temp_device_file};
use crate::common::logger::init_test_logger;

fn open_kernel(len: usize, callback: Option<AioCallback>) -> (tempfile::NamedTempFile, KernelDevice) {
    init_test_logger();
    let tmp = temp_device_file(len);
    let mut dev = KernelDevice::new(kernel_config(), callback);
    assert_ok!(dev.open(tmp.path()));
    (tmp, dev)
}

#[test]
fn test_sync_and_aio_paths_agree() {
    let (_tmp, dev) = open_kernel(1 << 20, None);
    let data = pattern(64 * 1024, 3);
    assert_ok!(dev.write(8192, &data, false));

    let buf = IoBuffer::new(data.len());
    let ioc = IOContext::new_sync();
    assert_ok!(dev.aio_read(8192, data.len() as u64, &buf, &ioc));
    dev.aio_submit(&ioc);
    ioc.wait();
    ioc.release_running_aios();
    assert_eq!(buf.to_vec(), data);
}

#[test]
fn test_drained_context_after_wait() {
    let (_tmp, dev) = open_kernel(1 << 20, None);
    let ioc = IOContext::new_sync();
    for i in 0..32u64 {
        assert_ok!(dev.aio_write(i * 4096, Arc::from(pattern(4096, i as u8)), &ioc, false));
    }
    assert!(ioc.has_pending());
    dev.aio_submit(&ioc);
    ioc.wait();

    assert_eq!(ioc.num_running(), 0);
    assert_eq!(ioc.num_pending(), 0);
    assert_eq!(ioc.get_return_value(), 0);
    assert_eq!(ioc.num_running_aios(), 32);
    ioc.release_running_aios();
    assert_eq!(ioc.num_running_aios(), 0);

    let mut out = vec![0u8; 4096];
    assert_ok!(dev.read(31 * 4096, &mut out, false));
    assert_eq!(out, pattern(4096, 31));
}

#[test]
fn test_async_callback_once_per_drain() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let cb: AioCallback = Arc::new(move |ioc: &IOContext| {
        assert_eq!(ioc.num_running(), 0);
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let (_tmp, dev) = open_kernel(1 << 20, Some(cb));

    let ioc = IOContext::new_async(Arc::new("txc"));
    for i in 0..8u64 {
        assert_ok!(dev.aio_write(i * 8192, Arc::from(vec![0x11u8; 8192]), &ioc, false));
    }
    dev.aio_submit(&ioc);
    // completions land on the reaper thread
    ioc.wait();
    while calls.load(Ordering::SeqCst) == 0 {
        thread::yield_now();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_concurrent_submitters() {
    let (_tmp, dev) = open_kernel(4 << 20, None);
    let dev = Arc::new(dev);

    let handles: Vec<_> = (0..4u64)
        .map(|worker| {
            let dev = Arc::clone(&dev);
            thread::spawn(move || {
                let base = worker << 20;
                let ioc = IOContext::new_sync();
                for i in 0..16u64 {
                    let data = Arc::from(pattern(4096, (worker * 16 + i) as u8));
                    dev.aio_write(base + i * 4096, data, &ioc, false).unwrap();
                }
                dev.aio_submit(&ioc);
                ioc.wait();
                assert_eq!(ioc.get_return_value(), 0);
                ioc.release_running_aios();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    for worker in 0..4u64 {
        let mut out = vec![0u8; 4096];
        dev.read((worker << 20) + 15 * 4096, &mut out, false).unwrap();
        assert_eq!(out, pattern(4096, (worker * 16 + 15) as u8));
    }
}

#[test]
fn test_read_random_matches_written_bytes() {
    let (_tmp, dev) = open_kernel(256 * 1024, None);
    let data = pattern(256 * 1024, 9);
    assert_ok!(dev.write(0, &data, false));

    let mut rng = rand::thread_rng();
    for _ in 0..50 {
        let off = rng.gen_range(0..data.len() - 1);
        let len = rng.gen_range(1..=(data.len() - off).min(10_000));
        let mut out = vec![0u8; len];
        assert_ok!(dev.read_random(off as u64, &mut out, false));
        assert_eq!(&out[..], &data[off..off + len], "read_random {}~{}", off, len);
    }
}

#[test]
fn test_buffered_paths() {
    let (_tmp, dev) = open_kernel(64 * 1024, None);
    let data = pattern(4096, 77);
    let ioc = IOContext::new_sync();
    // buffered aio writes complete inline
    assert_ok!(dev.aio_write(4096, Arc::from(data.clone()), &ioc, true));
    assert!(!ioc.has_pending());

    let mut out = vec![0u8; 4096];
    assert_ok!(dev.read(4096, &mut out, true));
    assert_eq!(out, data);
    assert_ok!(dev.invalidate_cache(0, 8192));
    assert_ok!(dev.flush());
}

#[test]
#[should_panic(expected = "non-SMR")]
fn test_zone_ops_require_smr() {
    let (_tmp, dev) = open_kernel(64 * 1024, None);
    assert!(!dev.is_smr());
    let _ = dev.reset_all_zones();
}

#[test]
#[should_panic]
fn test_unaligned_write_is_fatal() {
    let (_tmp, dev) = open_kernel(64 * 1024, None);
    let _ = dev.write(100, &[0u8; 512], false);
}

#[test]
fn test_both_engines_serve_the_same_workload() {
    init_test_logger();
    for engine in [AioEngine::Threads, AioEngine::Uring] {
        let tmp = temp_device_file(1 << 20);
        let config = BlkConfig {
            aio_engine: engine,
            aio_max_queue_depth: 8,
            ..kernel_config()
        };
        let mut dev = KernelDevice::new(config, None);
        if let Err(e) = dev.open(tmp.path()) {
            assert_eq!(engine, AioEngine::Uring, "thread engine must always open: {}", e);
            eprintln!("io_uring unavailable here: {}", e);
            continue;
        }

        let ioc = IOContext::new_sync();
        for i in 0..64u64 {
            assert_ok!(dev.aio_write(i * 8192, Arc::from(pattern(8192, i as u8)), &ioc, false));
        }
        dev.aio_submit(&ioc);
        ioc.wait();
        assert_eq!(ioc.get_return_value(), 0, "{:?}", engine);

        let buf = IoBuffer::new(64 * 8192);
        let rioc = IOContext::new_sync();
        assert_ok!(dev.aio_read(0, 64 * 8192, &buf, &rioc));
        dev.aio_submit(&rioc);
        rioc.wait();
        let got = buf.to_vec();
        for i in 0..64usize {
            assert_eq!(&got[i * 8192..(i + 1) * 8192], &pattern(8192, i as u8)[..], "{:?} block {}", engine, i);
        }
        dev.close();
    }
}
