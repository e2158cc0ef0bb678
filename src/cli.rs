use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use log::{error, info, warn};
use rand::Rng;

use crate::blk::block_device::{detect_device_type, open_device, BlockDevice};
use crate::blk::io_buffer::IoBuffer;
use crate::blk::io_context::IOContext;
use crate::blk::nvme::emulated::{ControllerCatalog, EmulatedController};
use crate::blk::nvme::transport::TransportId;
use crate::common::config::{BlkConfig, BDEV_TYPE_SPDK, WORKER_STACK_SIZE};
use crate::common::exception::{check_return_code, BlkError};
use crate::common::logger::initialize_logger;
use crate::common::thread::spawn_named;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Device path; a symlink to an `spdk:` file selects the NVMe backend.
    path: PathBuf,

    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Backend override: `aio` or `spdk`.
    #[arg(short, long)]
    bdev_type: Option<String>,

    #[arg(short, long, default_value_t = 2)]
    threads: usize,

    /// Write/verify rounds per thread.
    #[arg(short, long, default_value_t = 64)]
    ops: usize,

    /// Bytes per write, rounded up to the block size.
    #[arg(short, long, default_value_t = 64 * 1024)]
    io_size: u64,

    /// Plug an in-memory controller of this many MiB for the path's transport id.
    #[arg(short, long)]
    emulate_mb: Option<u64>,
}

#[derive(Debug, Default)]
struct LoadReport {
    ops: u64,
    bytes: u64,
    mismatches: u64,
}

fn load_config(args: &Args) -> Result<BlkConfig, BlkError> {
    let mut config = match &args.config {
        Some(path) => BlkConfig::load(path)?,
        None => BlkConfig::default(),
    };
    if let Some(bdev_type) = &args.bdev_type {
        config.bdev_type = bdev_type.clone();
    }
    config.validate()?;
    Ok(config)
}

fn plug_emulated_controller(path: &Path, size_mb: u64) -> Result<(), BlkError> {
    let contents = fs::read_to_string(path)?;
    let trid = TransportId::parse(contents.lines().next().unwrap_or_default().trim())?;
    if ControllerCatalog::global().find(&trid).is_some() {
        warn!("controller {} already plugged", trid);
        return Ok(());
    }
    ControllerCatalog::global().plug(EmulatedController::in_memory(trid, 512, size_mb << 20));
    Ok(())
}

/// Writes a per-thread pattern to a private region and reads it back, alternating
/// synchronous reads with batched asynchronous ones.
fn run_load(device: &dyn BlockDevice, worker: usize, ops: usize, io_size: u64, region: u64) -> Result<LoadReport, BlkError> {
    let mut rng = rand::thread_rng();
    let mut report = LoadReport::default();
    let base = region * worker as u64;
    let slots = (region / io_size).max(1);

    for round in 0..ops {
        let off = base + rng.gen_range(0..slots) * io_size;
        let seed = (worker * 31 + round) as u8;
        let data: Arc<[u8]> = (0..io_size).map(|i| seed.wrapping_add(i as u8)).collect();

        device.write(off, &data, false)?;

        let got = if round % 2 == 0 {
            let mut out = vec![0u8; io_size as usize];
            device.read(off, &mut out, false)?;
            out
        } else {
            let buf = IoBuffer::new(io_size as usize);
            let ioc = IOContext::new_sync();
            device.aio_read(off, io_size, &buf, &ioc)?;
            device.aio_submit(&ioc);
            ioc.wait();
            ioc.release_running_aios();
            check_return_code(ioc.get_return_value())?;
            buf.to_vec()
        };

        if got[..] != data[..] {
            error!("worker {} mismatch at {:#x}~{:#x}", worker, off, io_size);
            report.mismatches += 1;
        }
        report.ops += 1;
        report.bytes += 2 * io_size;
    }
    Ok(report)
}

pub fn run_cli() -> Result<(), Box<dyn Error>> {
    initialize_logger();
    let args = Args::parse();
    let config = load_config(&args)?;

    let bdev_type = if config.bdev_type.is_empty() {
        detect_device_type(&args.path).to_string()
    } else {
        config.bdev_type.clone()
    };
    if let Some(size_mb) = args.emulate_mb {
        if bdev_type == BDEV_TYPE_SPDK {
            plug_emulated_controller(&args.path, size_mb)?;
        } else {
            warn!("--emulate-mb ignored for {} devices", bdev_type);
        }
    }

    let device: Arc<dyn BlockDevice> = Arc::from(open_device(&bdev_type, &args.path, &config, None)?);
    let bs = device.get_block_size();
    let io_size = args.io_size.div_ceil(bs) * bs;
    let threads = args.threads.max(1);
    let region = (device.get_size() / threads as u64) / bs * bs;
    if region < io_size {
        return Err(format!(
            "device of {:#x} bytes too small for {} threads of {:#x} byte writes",
            device.get_size(),
            threads,
            io_size
        )
        .into());
    }

    info!(
        "running {} threads x {} ops of {:#x} bytes on {} ({})",
        threads,
        args.ops,
        io_size,
        args.path.display(),
        bdev_type
    );
    let start = Instant::now();
    let mut handles = Vec::with_capacity(threads);
    for worker in 0..threads {
        let device = Arc::clone(&device);
        let ops = args.ops;
        let name = format!("blk-load-{}", worker);
        handles.push(spawn_named(&name, WORKER_STACK_SIZE, move || {
            run_load(device.as_ref(), worker, ops, io_size, region)
        })?);
    }

    let mut total = LoadReport::default();
    for handle in handles {
        match handle.join() {
            Ok(Ok(report)) => {
                total.ops += report.ops;
                total.bytes += report.bytes;
                total.mismatches += report.mismatches;
            }
            Ok(Err(e)) => return Err(Box::new(e)),
            Err(_) => return Err("load thread panicked".into()),
        }
    }

    device.flush()?;
    let elapsed = start.elapsed();
    info!(
        "{} ops, {} MiB in {:.2?} ({:.1} MiB/s), {} mismatches",
        total.ops,
        total.bytes >> 20,
        elapsed,
        (total.bytes as f64 / (1 << 20) as f64) / elapsed.as_secs_f64().max(f64::EPSILON),
        total.mismatches
    );
    if total.mismatches > 0 {
        return Err(format!("{} verification mismatches", total.mismatches).into());
    }
    Ok(())
}
