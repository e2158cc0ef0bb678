//! Named thread creation and CPU pinning.

use std::io;
use std::thread::{self, JoinHandle};

use log::{debug, warn};

/// Spawns a named thread with a bounded stack.
///
/// Linux truncates thread names to 15 bytes, so longer names are cut before handing them over.
pub fn spawn_named<F, T>(name: &str, stack_size: usize, f: F) -> io::Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let name: String = name.chars().take(15).collect();
    debug!("Spawning thread {} (stack {} bytes)", name, stack_size);
    thread::Builder::new()
        .name(name)
        .stack_size(stack_size)
        .spawn(f)
}

/// Pins the calling thread to `cores`. An empty slice allows every online core.
#[cfg(target_os = "linux")]
pub fn set_cpu_affinity(cores: &[usize]) -> io::Result<()> {
    // SAFETY: cpu_set_t is plain data; the CPU_* helpers only touch the set we own.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        if cores.is_empty() {
            let online = libc::sysconf(libc::_SC_NPROCESSORS_ONLN).max(1) as usize;
            for core in 0..online {
                libc::CPU_SET(core, &mut set);
            }
        } else {
            for &core in cores {
                libc::CPU_SET(core, &mut set);
            }
        }
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn set_cpu_affinity(cores: &[usize]) -> io::Result<()> {
    warn!("CPU affinity is not supported on this platform, ignoring {:?}", cores);
    Ok(())
}

/// Name of the calling thread, or `"<unnamed>"`.
pub fn current_thread_name() -> String {
    thread::current().name().unwrap_or("<unnamed>").to_string()
}

/// Pins the calling thread, logging instead of failing.
pub fn try_pin_current_thread(cores: &[usize]) {
    if let Err(e) = set_cpu_affinity(cores) {
        warn!(
            "Failed to set affinity of thread {} to {:?}: {}",
            current_thread_name(),
            cores,
            e
        );
    }
}
