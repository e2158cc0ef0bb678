use thiserror::Error;

use crate::common::util::cpp_strerror;

#[derive(Error, Debug)]
pub enum BlkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("I/O failed with {}", cpp_strerror(*.0))]
    Errno(i32),
    #[error("no nvme driver attached for transport {0}")]
    NoDriver(String),
    #[error("invalid transport id: {0}")]
    InvalidTransport(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
    #[error("device is not open")]
    NotOpen,
}

impl BlkError {
    /// Wraps a negative errno style return code.
    pub fn from_errno(r: i32) -> Self {
        debug_assert!(r < 0, "errno codes are negative, got {}", r);
        BlkError::Errno(r)
    }

    /// Negative errno equivalent, used when the error has to be stored in a return code slot.
    pub fn errno(&self) -> i32 {
        match self {
            BlkError::Io(e) => -e.raw_os_error().unwrap_or(libc::EIO),
            BlkError::Errno(r) => *r,
            BlkError::NoDriver(_) => -libc::ENODEV,
            BlkError::InvalidTransport(_) | BlkError::InvalidConfig(_) => -libc::EINVAL,
            BlkError::Unsupported(_) => -libc::EOPNOTSUPP,
            BlkError::NotOpen => -libc::EBADF,
        }
    }
}

/// Converts a return code (`0` or negative errno) into a `Result`.
pub fn check_return_code(r: i32) -> Result<(), BlkError> {
    if r < 0 {
        Err(BlkError::from_errno(r))
    } else {
        Ok(())
    }
}
