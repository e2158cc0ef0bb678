//! Platform-specific file handles for the kernel backend.
//!
//! The direct handle bypasses the page cache where the platform allows it; the buffered
//! handle serves `buffered = true` requests and cache invalidation.

use std::fs::{File, OpenOptions};
use std::io::Result as IoResult;
use std::path::Path;

use log::{debug, warn};

/// How to open the direct handle.
#[derive(Debug, Clone)]
pub struct DirectIoConfig {
    pub enabled: bool,
    pub alignment: usize,
}

impl Default for DirectIoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            alignment: 4096,
        }
    }
}

fn base_options() -> OpenOptions {
    let mut options = OpenOptions::new();
    options.read(true).write(true);
    options
}

/// Opens `path` for direct I/O.
///
/// Filesystems such as tmpfs refuse `O_DIRECT` with `EINVAL`; the handle then falls back to
/// buffered I/O with a warning.
pub fn open_direct_io(path: &Path, config: &DirectIoConfig) -> IoResult<File> {
    if !config.enabled {
        debug!("Opening {} with buffered I/O", path.display());
        return base_options().open(path);
    }

    debug!("Opening {} with direct I/O", path.display());

    #[cfg(target_os = "linux")]
    {
        use std::os::unix::fs::OpenOptionsExt;
        let mut options = base_options();
        options.custom_flags(libc::O_DIRECT);
        match options.open(path) {
            Ok(file) => Ok(file),
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
                warn!(
                    "{} does not support O_DIRECT, falling back to buffered I/O",
                    path.display()
                );
                base_options().open(path)
            }
            Err(e) => Err(e),
        }
    }

    #[cfg(target_os = "macos")]
    {
        use std::os::unix::io::AsRawFd;
        let file = base_options().open(path)?;
        // SAFETY: fd is valid for the lifetime of `file`.
        let r = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1) };
        if r == -1 {
            warn!("Failed to set F_NOCACHE on {}, continuing with buffered I/O", path.display());
        }
        Ok(file)
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        warn!("Direct I/O not supported on this platform, falling back to buffered I/O");
        base_options().open(path)
    }
}

/// Opens `path` through the page cache.
pub fn open_buffered(path: &Path) -> IoResult<File> {
    base_options().open(path)
}

/// Check if a buffer is properly aligned for direct I/O
pub fn is_aligned(buffer: &[u8], alignment: usize) -> bool {
    buffer.as_ptr() as usize % alignment == 0
}

/// Durability barrier for file data (`fdatasync`).
pub fn sync_data(file: &File) -> IoResult<()> {
    debug!("Performing fdatasync");
    file.sync_data()
}

/// Drops cached pages for `off~len` from the page cache.
#[cfg(target_os = "linux")]
pub fn drop_cache(file: &File, off: u64, len: u64) -> IoResult<()> {
    use std::os::unix::io::AsRawFd;
    // SAFETY: fd is valid for the lifetime of `file`.
    let r = unsafe {
        libc::posix_fadvise(
            file.as_raw_fd(),
            off as libc::off_t,
            len as libc::off_t,
            libc::POSIX_FADV_DONTNEED,
        )
    };
    if r != 0 {
        return Err(std::io::Error::from_raw_os_error(r));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn drop_cache(_file: &File, _off: u64, _len: u64) -> IoResult<()> {
    Ok(())
}
